use super::phase::Phase;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

/// プラグイン記述子
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConf {
    /// レジストリ上のプラグインキー
    #[serde(rename = "name", alias = "key")]
    pub key: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
    /// false の場合、未登録でも警告だけで続行する
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub required: bool,
    /// Exit フェーズでのみ有効な失敗許容の上書き
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_allowed_to_fail: Option<bool>,
}

impl PluginConf {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            args: Map::new(),
            required: true,
            is_allowed_to_fail: None,
        }
    }

    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.args.insert(name.into(), value);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// ソースの取得方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceProvider {
    Git,
    Path,
}

/// ビルドソースの指定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub provider: SourceProvider,
    pub uri: String,
    /// ソースルートから Dockerfile のあるディレクトリ（またはファイル）への相対パス
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_path: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub provider_params: Map<String, Value>,
}

impl SourceSpec {
    pub fn git(uri: impl Into<String>) -> Self {
        Self {
            provider: SourceProvider::Git,
            uri: uri.into(),
            dockerfile_path: None,
            provider_params: Map::new(),
        }
    }

    pub fn path(uri: impl Into<String>) -> Self {
        Self {
            provider: SourceProvider::Path,
            uri: uri.into(),
            dockerfile_path: None,
            provider_params: Map::new(),
        }
    }

    /// git の場合の取得対象 commit / branch
    pub fn git_commit(&self) -> Option<&str> {
        self.provider_params.get("git_commit").and_then(Value::as_str)
    }
}

/// ビルド設定（build.json）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub image: String,
    pub source: SourceSpec,
    #[serde(default)]
    pub prebuild_plugins: Vec<PluginConf>,
    #[serde(default)]
    pub buildstep_plugins: Vec<PluginConf>,
    #[serde(default)]
    pub prepublish_plugins: Vec<PluginConf>,
    #[serde(default)]
    pub postbuild_plugins: Vec<PluginConf>,
    #[serde(default)]
    pub exit_plugins: Vec<PluginConf>,
    /// 上記以外のキー（プラグインが独自に参照する）
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BuildConfig {
    pub fn new(image: impl Into<String>, source: SourceSpec) -> Self {
        Self {
            image: image.into(),
            source,
            prebuild_plugins: Vec::new(),
            buildstep_plugins: Vec::new(),
            prepublish_plugins: Vec::new(),
            postbuild_plugins: Vec::new(),
            exit_plugins: Vec::new(),
            extra: Map::new(),
        }
    }

    /// フェーズのプラグイン一覧（Input は build.json に含まれない）
    pub fn plugins(&self, phase: Phase) -> &[PluginConf] {
        match phase {
            Phase::Input => &[],
            Phase::PreBuild => &self.prebuild_plugins,
            Phase::BuildStep => &self.buildstep_plugins,
            Phase::PrePublish => &self.prepublish_plugins,
            Phase::PostBuild => &self.postbuild_plugins,
            Phase::Exit => &self.exit_plugins,
        }
    }

    pub fn plugins_mut(&mut self, phase: Phase) -> Option<&mut Vec<PluginConf>> {
        match phase {
            Phase::Input => None,
            Phase::PreBuild => Some(&mut self.prebuild_plugins),
            Phase::BuildStep => Some(&mut self.buildstep_plugins),
            Phase::PrePublish => Some(&mut self.prepublish_plugins),
            Phase::PostBuild => Some(&mut self.postbuild_plugins),
            Phase::Exit => Some(&mut self.exit_plugins),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(CoreError::InvalidConfig("image が指定されていません".to_string()));
        }
        if self.source.uri.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "source.uri が指定されていません".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_build_json() {
        let value = json!({
            "image": "app:1",
            "source": {"provider": "git", "uri": "https://example.com/app.git",
                       "provider_params": {"git_commit": "main"}},
            "prebuild_plugins": [
                {"name": "pull_base_image", "args": {"parent_registry": "mirror.local"}}
            ],
            "exit_plugins": [
                {"name": "remove_built_image", "required": false, "is_allowed_to_fail": false}
            ],
            "openshift_build_selflink": "/builds/app-1"
        });
        let config = BuildConfig::from_value(value).unwrap();
        assert_eq!(config.source.git_commit(), Some("main"));
        assert_eq!(config.plugins(Phase::PreBuild)[0].key, "pull_base_image");
        assert!(config.plugins(Phase::PreBuild)[0].required);
        assert!(!config.plugins(Phase::Exit)[0].required);
        assert_eq!(config.plugins(Phase::Exit)[0].is_allowed_to_fail, Some(false));
        assert!(config.plugins(Phase::Input).is_empty());
        assert_eq!(config.extra["openshift_build_selflink"], "/builds/app-1");
    }

    #[test]
    fn test_plugin_conf_accepts_key_alias() {
        let conf: PluginConf = serde_json::from_value(json!({"key": "tag_and_push"})).unwrap();
        assert_eq!(conf.key, "tag_and_push");
        let out = serde_json::to_value(&conf).unwrap();
        assert_eq!(out, json!({"name": "tag_and_push"}));
    }

    #[test]
    fn test_missing_image_is_rejected() {
        let value = json!({"image": "", "source": {"provider": "path", "uri": "/src"}});
        assert!(BuildConfig::from_value(value).is_err());
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.json");
        let mut config = BuildConfig::new("app:1", SourceSpec::path("file:///src"));
        config
            .prebuild_plugins
            .push(PluginConf::new("pre_sleep").with_arg("seconds", json!(0)));
        config.write_to(&path).unwrap();

        let loaded = BuildConfig::from_path(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
