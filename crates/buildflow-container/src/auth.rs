//! レジストリ認証
//!
//! docker の設定ファイルから認証情報を読み、Bollard の DockerCredentials に変換します。
//! 対応する形式:
//! - `config.json`（`{"auths": {...}, "credsStore": "..."}`）
//! - 旧形式の `.dockercfg`（トップレベルがレジストリ -> エントリの対応表）

use crate::error::{EngineError, Result};
use base64::Engine;
use bollard::auth::DockerCredentials;
use buildflow_core::ImageName;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// レジストリ未指定のイメージが属するレジストリ
pub const DEFAULT_REGISTRY: &str = "docker.io";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(default)]
    creds_store: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    /// Base64 の "username:password"
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialResponse {
    username: String,
    secret: String,
}

/// レジストリ認証情報の読み出し
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    config_path: PathBuf,
}

impl Default for RegistryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryAuth {
    /// `$DOCKER_CONFIG/config.json`（未設定なら `~/.docker/config.json`）を使う
    pub fn new() -> Self {
        let config_path = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            })
            .join("config.json");
        Self { config_path }
    }

    pub fn with_config_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// シークレットディレクトリから設定ファイルを探す（`config.json` → `.dockercfg`）
    pub fn from_dockercfg_dir(dir: &Path) -> Self {
        let candidates = [dir.join("config.json"), dir.join(".dockercfg")];
        let config_path = candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .unwrap_or_else(|| dir.join("config.json"));
        Self { config_path }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// イメージのレジストリ用の認証情報
    ///
    /// 設定ファイルが無い、またはエントリが無い場合は `Ok(None)`。
    pub fn get_credentials(&self, image: &ImageName) -> Result<Option<DockerCredentials>> {
        let registry = registry_of(image);
        if !self.config_path.exists() {
            tracing::debug!("Docker config not found at {:?}", self.config_path);
            return Ok(None);
        }
        let config = self.load_docker_config(registry)?;

        if let Some(entry) = lookup_entry(&config.auths, registry)
            && let Some(creds) = decode_entry(entry, registry)?
        {
            tracing::debug!("Found credentials in auths for {}", registry);
            return Ok(Some(creds));
        }

        if let Some(helper) = &config.creds_store {
            tracing::debug!("Trying credential helper: {}", helper);
            match get_from_helper(helper, registry) {
                Ok(Some(creds)) => return Ok(Some(creds)),
                Ok(None) => {}
                Err(e) => tracing::debug!("Credential helper failed: {}", e),
            }
        }

        tracing::debug!("No credentials found for {}", registry);
        Ok(None)
    }

    fn load_docker_config(&self, registry: &str) -> Result<DockerConfig> {
        let content = std::fs::read_to_string(&self.config_path).map_err(|e| EngineError::Auth {
            registry: registry.to_string(),
            message: format!("{} を読み込めません: {}", self.config_path.display(), e),
        })?;
        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| EngineError::Auth {
                registry: registry.to_string(),
                message: format!("{} を解析できません: {}", self.config_path.display(), e),
            })?;

        // 旧形式はトップレベルがそのまま auths
        let is_legacy = value.get("auths").is_none() && value.get("credsStore").is_none();
        if is_legacy {
            let auths = serde_json::from_value(value).unwrap_or_default();
            return Ok(DockerConfig {
                auths,
                creds_store: None,
            });
        }
        serde_json::from_value(value).map_err(|e| EngineError::Auth {
            registry: registry.to_string(),
            message: format!("{} を解析できません: {}", self.config_path.display(), e),
        })
    }
}

/// イメージ名からレジストリを決める（未指定は Docker Hub）
pub fn registry_of(image: &ImageName) -> &str {
    image.registry.as_deref().unwrap_or(DEFAULT_REGISTRY)
}

fn lookup_entry<'a>(auths: &'a HashMap<String, AuthEntry>, registry: &str) -> Option<&'a AuthEntry> {
    if let Some(entry) = auths.get(registry) {
        return Some(entry);
    }
    // `https://registry/v1/` のようにスキームやパス付きで登録されている場合
    auths
        .iter()
        .find(|(key, _)| buildflow_core::registry_hostname(key) == registry)
        .map(|(_, entry)| entry)
}

fn decode_entry(entry: &AuthEntry, registry: &str) -> Result<Option<DockerCredentials>> {
    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Ok(Some(credentials(username, password, registry)));
    }
    let Some(auth_b64) = &entry.auth else {
        return Ok(None);
    };

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth_b64)
        .map_err(|e| EngineError::Auth {
            registry: registry.to_string(),
            message: format!("auth をデコードできません: {}", e),
        })?;
    let auth_str = String::from_utf8(decoded).map_err(|e| EngineError::Auth {
        registry: registry.to_string(),
        message: format!("auth が UTF-8 ではありません: {}", e),
    })?;

    Ok(auth_str
        .split_once(':')
        .map(|(username, password)| credentials(username, password, registry)))
}

fn credentials(username: &str, password: &str, registry: &str) -> DockerCredentials {
    DockerCredentials {
        username: Some(username.to_string()),
        password: Some(password.to_string()),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    }
}

fn get_from_helper(helper: &str, registry: &str) -> Result<Option<DockerCredentials>> {
    let helper_cmd = format!("docker-credential-{}", helper);
    let mut child = Command::new(&helper_cmd)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| EngineError::Auth {
            registry: registry.to_string(),
            message: format!("{} を実行できません: {}", helper_cmd, e),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(registry.as_bytes()).ok();
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        tracing::debug!(
            "Credential helper returned error for {}: {}",
            registry,
            String::from_utf8_lossy(&output.stderr)
        );
        return Ok(None);
    }

    let response: CredentialResponse = serde_json::from_slice(&output.stdout)?;
    Ok(Some(credentials(&response.username, &response.secret, registry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn image(name: &str) -> ImageName {
        ImageName::parse(name).unwrap()
    }

    fn encoded(user_pass: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(user_pass)
    }

    #[test]
    fn test_registry_of() {
        assert_eq!(registry_of(&image("ghcr.io/org/app:v1")), "ghcr.io");
        assert_eq!(registry_of(&image("myuser/app")), "docker.io");
        assert_eq!(registry_of(&image("localhost:5000/app")), "localhost:5000");
    }

    #[test]
    fn test_config_json_auths() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!(
            r#"{{"auths": {{"https://registry.local/v1/": {{"auth": "{}"}}}}}}"#,
            encoded("builder:s3cret")
        );
        fs::write(dir.path().join("config.json"), content).unwrap();

        let auth = RegistryAuth::from_dockercfg_dir(dir.path());
        let creds = auth
            .get_credentials(&image("registry.local/org/app:1"))
            .unwrap()
            .unwrap();
        assert_eq!(creds.username.as_deref(), Some("builder"));
        assert_eq!(creds.password.as_deref(), Some("s3cret"));
        assert_eq!(creds.serveraddress.as_deref(), Some("registry.local"));

        assert!(
            auth.get_credentials(&image("quay.io/org/app"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_legacy_dockercfg() {
        let dir = tempfile::tempdir().unwrap();
        let content = r#"{"registry.local": {"username": "u", "password": "p"}}"#;
        fs::write(dir.path().join(".dockercfg"), content).unwrap();

        let auth = RegistryAuth::from_dockercfg_dir(dir.path());
        assert!(auth.config_path().ends_with(".dockercfg"));
        let creds = auth
            .get_credentials(&image("registry.local/app"))
            .unwrap()
            .unwrap();
        assert_eq!(creds.username.as_deref(), Some("u"));
    }

    #[test]
    fn test_missing_config_is_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let auth = RegistryAuth::from_dockercfg_dir(dir.path());
        assert!(auth.get_credentials(&image("app")).unwrap().is_none());
    }

    #[test]
    fn test_invalid_base64_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{"auths": {"docker.io": {"auth": "!!!"}}}"#,
        )
        .unwrap();
        let auth = RegistryAuth::from_dockercfg_dir(dir.path());
        assert!(matches!(
            auth.get_credentials(&image("app")),
            Err(EngineError::Auth { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_docker_config_env() {
        let dir = tempfile::tempdir().unwrap();
        temp_env::with_var("DOCKER_CONFIG", Some(dir.path()), || {
            let auth = RegistryAuth::new();
            assert_eq!(auth.config_path(), dir.path().join("config.json"));
        });
    }
}
