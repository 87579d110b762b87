use buildflow_build::{
    BuildEnv, BuildrootPush, build_image_here, build_image_in_privileged_container, build_image_using_hosts_docker,
    prepare_build_json,
};
use buildflow_config::BuildflowConfig;
use buildflow_core::SourceSpec;
use clap::{Args, ValueEnum};
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Method {
    /// このプロセスの中でビルド
    Here,
    /// 特権コンテナの中でビルド
    Privileged,
    /// ホストの Docker を使うコンテナの中でビルド
    Hostdocker,
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// ビルド方法
    #[arg(long, value_enum, default_value_t = Method::Here)]
    pub method: Method,
    /// ビルドするイメージ名
    #[arg(long)]
    pub image: String,
    /// ソースの Git リポジトリ
    #[arg(long, conflicts_with = "path", required_unless_present = "path")]
    pub git_url: Option<String>,
    /// チェックアウトするコミット
    #[arg(long, requires = "git_url")]
    pub git_commit: Option<String>,
    /// ソースのローカルディレクトリ
    #[arg(long)]
    pub path: Option<PathBuf>,
    /// ソース内の Dockerfile のパス
    #[arg(long)]
    pub dockerfile_path: Option<String>,
    /// ビルドルートイメージ（設定ファイルの build_image を上書き）
    #[arg(long)]
    pub build_image: Option<String>,
    /// 親イメージを取得するレジストリ
    #[arg(long)]
    pub parent_registry: Option<String>,
    /// プッシュ先のレジストリ
    #[arg(long, num_args = 1..)]
    pub target_registries: Vec<String>,
    #[arg(long)]
    pub parent_registry_insecure: bool,
    #[arg(long)]
    pub target_registries_insecure: bool,
    /// 親イメージをプルしない
    #[arg(long)]
    pub dont_pull_base_image: bool,
    /// ビルド後のビルドルートをこのレジストリにプッシュ
    #[arg(long)]
    pub push_buildroot_to: Option<String>,
}

impl BuildArgs {
    fn source(&self) -> anyhow::Result<SourceSpec> {
        let mut source = match (&self.git_url, &self.path) {
            (Some(url), _) => {
                let mut source = SourceSpec::git(url);
                if let Some(commit) = &self.git_commit {
                    source
                        .provider_params
                        .insert("git_commit".to_string(), json!(commit));
                }
                source
            }
            (None, Some(path)) => SourceSpec::path(std::path::absolute(path)?.display().to_string()),
            (None, None) => anyhow::bail!("--git-url か --path のどちらかを指定してください"),
        };
        source.dockerfile_path = self.dockerfile_path.clone();
        Ok(source)
    }
}

pub async fn handle(config: BuildflowConfig, args: BuildArgs) -> anyhow::Result<()> {
    let build_json = prepare_build_json(
        &args.image,
        args.source()?,
        args.parent_registry.as_deref(),
        &args.target_registries,
        args.parent_registry_insecure,
        args.target_registries_insecure,
        args.dont_pull_base_image,
    );
    let build_image = args
        .build_image
        .clone()
        .unwrap_or_else(|| config.build_image.clone());
    let push_buildroot = args.push_buildroot_to.clone().map(|registry| BuildrootPush {
        registry,
        insecure: args.target_registries_insecure,
    });

    println!("{} {}", "Building".blue(), args.image.cyan());
    let env = BuildEnv::connect(config)?;

    let result = match args.method {
        Method::Here => build_image_here(&env, build_json).await?,
        Method::Privileged => {
            build_image_in_privileged_container(&env, &build_json, &build_image, push_buildroot.as_ref()).await?
        }
        Method::Hostdocker => {
            build_image_using_hosts_docker(&env, &build_json, &build_image, push_buildroot.as_ref()).await?
        }
    };
    super::report(&result)
}
