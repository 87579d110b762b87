//! 組み込みプラグイン

pub mod docker_api;
pub mod input_env;
pub mod input_path;
pub mod orchestrate_build;
pub mod pre_sleep;
pub mod pull_base_image;
pub mod remove_built_image;
pub mod tag_and_push;

use crate::registry::PluginRegistry;
use buildflow_core::Phase;
use serde_json::{Map, Value};

/// 組み込みプラグインを登録
pub fn register_builtin(registry: &mut PluginRegistry) {
    registry.register_input(
        input_path::KEY,
        input_path::PathInputPlugin::create,
        input_path::PathInputPlugin::is_autousable,
    );
    registry.register_input(
        input_env::KEY,
        input_env::EnvInputPlugin::create,
        input_env::EnvInputPlugin::is_autousable,
    );

    registry.register(
        Phase::PreBuild,
        pull_base_image::KEY,
        pull_base_image::PullBaseImagePlugin::create,
    );
    registry.register(Phase::PreBuild, pre_sleep::KEY, pre_sleep::PreSleepPlugin::create);

    registry.register_buildstep(docker_api::KEY, docker_api::DockerApiPlugin::create);
    registry.register_buildstep(
        orchestrate_build::KEY,
        orchestrate_build::OrchestrateBuildPlugin::create,
    );

    registry.register(
        Phase::PostBuild,
        tag_and_push::KEY,
        tag_and_push::TagAndPushPlugin::create,
    );

    registry.register(
        Phase::Exit,
        remove_built_image::KEY,
        remove_built_image::RemoveBuiltImagePlugin::create,
    );
}

/// 入力プラグイン引数の `substitutions` を `key=value` の組に変換
///
/// 文字列以外の値は JSON 表現のまま渡す。
pub(crate) fn substitutions_from_args(args: &Map<String, Value>) -> Vec<(String, String)> {
    args.get("substitutions")
        .and_then(Value::as_object)
        .map(|subs| {
            subs.iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        Value::Null => "none".to_string(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}
