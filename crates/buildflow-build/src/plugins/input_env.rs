//! 環境変数から build.json を読み込む入力プラグイン

use super::substitutions_from_args;
use crate::error::{PluginError, PluginResult};
use crate::plugin::{InputPlugin, parse_args};
use async_trait::async_trait;
use buildflow_core::apply_substitutions;
use buildflow_core::constants::BUILD_JSON_ENV;
use serde::Deserialize;
use serde_json::{Map, Value};

pub const KEY: &str = "env";

fn default_env_name() -> String {
    BUILD_JSON_ENV.to_string()
}

#[derive(Debug, Deserialize)]
struct EnvInputArgs {
    #[serde(default = "default_env_name")]
    env_name: String,
}

pub struct EnvInputPlugin {
    env_name: String,
    substitutions: Vec<(String, String)>,
}

impl EnvInputPlugin {
    pub fn create(args: &Map<String, Value>) -> PluginResult<Box<dyn InputPlugin>> {
        let parsed: EnvInputArgs = parse_args(KEY, args)?;
        Ok(Box::new(Self {
            env_name: parsed.env_name,
            substitutions: substitutions_from_args(args),
        }))
    }

    pub fn is_autousable() -> bool {
        std::env::var_os(BUILD_JSON_ENV).is_some()
    }
}

#[async_trait]
impl InputPlugin for EnvInputPlugin {
    fn key(&self) -> &str {
        KEY
    }

    async fn run(&mut self) -> PluginResult<Value> {
        let raw = std::env::var(&self.env_name).map_err(|_| {
            PluginError::failed(format!("environment variable {} is not set", self.env_name))
        })?;
        let mut build_json: Value = serde_json::from_str(&raw)?;
        apply_substitutions(&mut build_json, &self.substitutions)?;
        Ok(build_json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    #[tokio::test]
    #[serial]
    async fn test_reads_default_variable() {
        let raw = r#"{"image": "app:1", "source": {"provider": "git", "uri": "https://example.com/app.git"}}"#;
        let mut plugin = EnvInputPlugin::create(&Map::new()).unwrap();
        let value = temp_env::async_with_vars([(BUILD_JSON_ENV, Some(raw))], plugin.run())
            .await
            .unwrap();
        assert_eq!(value["image"], "app:1");
    }

    #[tokio::test]
    #[serial]
    async fn test_custom_variable_and_substitutions() {
        let raw = r#"{"image": "app:1", "source": {"provider": "git", "uri": "x"}}"#;
        let args = json!({"env_name": "MY_BUILD", "substitutions": {"source.uri": "y"}});
        let mut plugin = EnvInputPlugin::create(args.as_object().unwrap()).unwrap();
        let value = temp_env::async_with_vars([("MY_BUILD", Some(raw))], plugin.run())
            .await
            .unwrap();
        assert_eq!(value["source"]["uri"], "y");
    }

    #[test]
    #[serial]
    fn test_autousable_follows_variable() {
        temp_env::with_var_unset(BUILD_JSON_ENV, || {
            assert!(!EnvInputPlugin::is_autousable());
        });
        temp_env::with_var(BUILD_JSON_ENV, Some("{}"), || {
            assert!(EnvInputPlugin::is_autousable());
        });
    }

    #[tokio::test]
    #[serial]
    async fn test_unset_variable() {
        let mut plugin = EnvInputPlugin::create(&Map::new()).unwrap();
        let err = temp_env::async_with_vars([(BUILD_JSON_ENV, None::<&str>)], plugin.run())
            .await
            .unwrap_err();
        assert!(err.to_string().contains(BUILD_JSON_ENV));
    }
}
