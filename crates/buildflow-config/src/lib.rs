pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 設定ファイル名
pub const CONFIG_FILENAME: &str = "buildflow.yaml";
/// 設定ファイルのパスを直接指定する環境変数
pub const CONFIG_ENV: &str = "BUILDFLOW_CONFIG";
/// ビルドルートイメージの既定値
pub const DEFAULT_BUILD_IMAGE: &str = "buildroot";

/// エンジン呼び出しのリトライ設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// 初回を除いた再試行回数
    pub times: u32,
    pub backoff_factor_ms: u64,
    /// 5xx に加えてリトライするステータス
    pub statuses: Vec<u16>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            times: 3,
            backoff_factor_ms: 1000,
            statuses: vec![408, 409, 429],
        }
    }
}

impl RetrySettings {
    pub fn backoff_factor(&self) -> Duration {
        Duration::from_millis(self.backoff_factor_ms)
    }
}

/// プロセス全体の設定
///
/// 起動時に一度だけ読み込み、エンジンやワークフローに明示的に渡す。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildflowConfig {
    /// 未指定なら DOCKER_HOST / ローカルソケット
    pub docker_url: Option<String>,
    pub timeout_secs: u64,
    pub retry: RetrySettings,
    /// privileged / hostdocker ビルドで使うビルドルートイメージ
    pub build_image: String,
    /// レジストリ認証情報（docker config.json）のディレクトリ
    pub dockercfg_path: Option<PathBuf>,
}

impl Default for BuildflowConfig {
    fn default() -> Self {
        Self {
            docker_url: None,
            timeout_secs: 120,
            retry: RetrySettings::default(),
            build_image: DEFAULT_BUILD_IMAGE.to_string(),
            dockercfg_path: None,
        }
    }
}

impl BuildflowConfig {
    /// 設定ファイルを探して読み込む（見つからなければ既定値）
    pub fn load() -> Result<Self> {
        match find_config_file()? {
            Some(path) => Self::from_path(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeout_secs は 1 以上である必要があります".to_string(),
            ));
        }
        if self.build_image.trim().is_empty() {
            return Err(ConfigError::Invalid("build_image が空です".to_string()));
        }
        if let Some(status) = self
            .retry
            .statuses
            .iter()
            .find(|s| !(100..600).contains(*s))
        {
            return Err(ConfigError::Invalid(format!(
                "retry.statuses に不正なステータスがあります: {}",
                status
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Buildflow の設定ディレクトリ（`~/.config/buildflow`）
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("buildflow"))
}

/// 設定ファイルを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 BUILDFLOW_CONFIG（存在しなければエラー）
/// 2. ./buildflow.yaml
/// 3. ./.buildflow/buildflow.yaml
/// 4. ~/.config/buildflow/buildflow.yaml
pub fn find_config_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if !path.is_file() {
            return Err(ConfigError::EnvConfigNotFound(path));
        }
        return Ok(Some(path));
    }

    let current_dir = std::env::current_dir()?;
    let mut candidates = vec![
        current_dir.join(CONFIG_FILENAME),
        current_dir.join(".buildflow").join(CONFIG_FILENAME),
    ];
    if let Some(config_dir) = dirs::config_dir() {
        candidates.push(config_dir.join("buildflow").join(CONFIG_FILENAME));
    }

    Ok(candidates.into_iter().find(|p| p.is_file()))
}
