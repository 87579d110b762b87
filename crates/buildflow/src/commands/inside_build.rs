use buildflow_build::{BuildEnv, build_inside};
use buildflow_config::BuildflowConfig;
use buildflow_core::parse_key_values;
use clap::Args;
use serde_json::{Map, Value};
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct InsideBuildArgs {
    /// 入力プラグイン（path, env, auto）
    #[arg(long, default_value = "auto")]
    pub input: String,
    /// 入力プラグインの引数 (key=value)
    #[arg(long = "input-arg", value_name = "KEY=VALUE")]
    pub input_args: Vec<String>,
    /// build.json の置換 (key=value)
    #[arg(long = "substitute", value_name = "KEY=VALUE")]
    pub substitutions: Vec<String>,
    /// results.json を書き出すディレクトリ
    #[arg(long)]
    pub results_dir: Option<PathBuf>,
}

impl InsideBuildArgs {
    fn input_args(&self) -> anyhow::Result<Map<String, Value>> {
        Ok(parse_key_values(&self.input_args)?
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect())
    }
}

pub async fn handle(config: BuildflowConfig, args: InsideBuildArgs) -> anyhow::Result<()> {
    let input_args = args.input_args()?;
    let substitutions = parse_key_values(&args.substitutions)?;
    let env = BuildEnv::connect(config)?;

    let result = build_inside(
        &env,
        &args.input,
        input_args,
        &substitutions,
        args.results_dir.as_deref(),
    )
    .await?;
    super::report(&result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: InsideBuildArgs,
    }

    #[test]
    fn test_input_args() {
        let wrapper = Wrapper::try_parse_from([
            "inside-build",
            "--input",
            "path",
            "--input-arg",
            "path=/tmp/build.json",
            "--substitute",
            "image=app:2",
        ])
        .unwrap();
        let args = wrapper.args;
        assert_eq!(args.input, "path");
        assert_eq!(args.input_args().unwrap()["path"], "/tmp/build.json");
        assert_eq!(args.substitutions, vec!["image=app:2"]);
        assert!(args.results_dir.is_none());
    }

    #[test]
    fn test_invalid_input_arg() {
        let wrapper = Wrapper::try_parse_from(["inside-build", "--input-arg", "novalue"]).unwrap();
        assert_eq!(wrapper.args.input, "auto");
        assert!(wrapper.args.input_args().is_err());
    }
}
