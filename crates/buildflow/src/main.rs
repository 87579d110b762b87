mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;

#[derive(Parser)]
#[command(name = "buildflow")]
#[command(about = "プラグインのフェーズでコンテナイメージをビルドする", long_about = None)]
struct Cli {
    /// デバッグログを表示
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// イメージをビルド
    Build(commands::build::BuildArgs),
    /// ビルドコンテナの中でビルド（build.json を入力プラグインで読み込む）
    #[command(name = "inside-build")]
    InsideBuild(commands::inside_build::InsideBuildArgs),
    /// バージョン情報を表示
    Version,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(default.into()))
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Versionコマンドは設定ファイル不要
    if matches!(cli.command, Commands::Version) {
        println!("buildflow {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = buildflow_config::BuildflowConfig::load()?;
    tracing::debug!("Configuration: {:?}", config);

    match cli.command {
        Commands::Build(args) => commands::build::handle(config, args).await,
        Commands::InsideBuild(args) => commands::inside_build::handle(config, args).await,
        Commands::Version => unreachable!("Version is handled before config loading"),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
