//! ファイルから build.json を読み込む入力プラグイン

use super::substitutions_from_args;
use crate::error::{PluginError, PluginResult};
use crate::plugin::{InputPlugin, parse_args};
use async_trait::async_trait;
use buildflow_core::apply_substitutions;
use buildflow_core::constants::CONTAINER_BUILD_JSON_PATH;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const KEY: &str = "path";

fn default_path() -> PathBuf {
    PathBuf::from(CONTAINER_BUILD_JSON_PATH)
}

#[derive(Debug, Deserialize)]
struct PathInputArgs {
    #[serde(default = "default_path")]
    path: PathBuf,
}

pub struct PathInputPlugin {
    path: PathBuf,
    substitutions: Vec<(String, String)>,
}

impl PathInputPlugin {
    pub fn create(args: &Map<String, Value>) -> PluginResult<Box<dyn InputPlugin>> {
        let parsed: PathInputArgs = parse_args(KEY, args)?;
        Ok(Box::new(Self {
            path: parsed.path,
            substitutions: substitutions_from_args(args),
        }))
    }

    /// ビルドコンテナ内の既定パスに build.json があれば使える
    pub fn is_autousable() -> bool {
        Path::new(CONTAINER_BUILD_JSON_PATH).is_file()
    }
}

#[async_trait]
impl InputPlugin for PathInputPlugin {
    fn key(&self) -> &str {
        KEY
    }

    async fn run(&mut self) -> PluginResult<Value> {
        tracing::debug!("Reading build json from {}", self.path.display());
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            PluginError::failed(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        let mut build_json: Value = serde_json::from_str(&content)?;
        apply_substitutions(&mut build_json, &self.substitutions)?;
        Ok(build_json)
    }
}
