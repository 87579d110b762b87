use crate::error::{CoreError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// プッシュ先レジストリ1つ分の記録
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerRegistry {
    pub uri: String,
    #[serde(default)]
    pub insecure: bool,
    /// タグ付きイメージ名 -> マニフェストダイジェスト
    #[serde(default)]
    pub digests: IndexMap<String, String>,
}

impl DockerRegistry {
    pub fn hostname(&self) -> &str {
        registry_hostname(&self.uri)
    }
}

/// プッシュ先レジストリと、そこへプッシュした結果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushConf {
    #[serde(default)]
    registries: IndexMap<String, DockerRegistry>,
}

impl PushConf {
    /// レジストリを追加（ホスト名で一意。既存ならそれを返す）
    pub fn add_docker_registry(&mut self, uri: &str, insecure: bool) -> Result<&mut DockerRegistry> {
        let hostname = registry_hostname(uri);
        if hostname.is_empty() {
            return Err(CoreError::InvalidConfig(format!(
                "レジストリ URI が不正です: '{}'",
                uri
            )));
        }
        let registry = self
            .registries
            .entry(hostname.to_string())
            .or_insert_with(|| DockerRegistry {
                uri: uri.to_string(),
                insecure,
                digests: IndexMap::new(),
            });
        Ok(registry)
    }

    pub fn registry(&self, hostname: &str) -> Option<&DockerRegistry> {
        self.registries.get(hostname)
    }

    pub fn registry_mut(&mut self, hostname: &str) -> Option<&mut DockerRegistry> {
        self.registries.get_mut(hostname)
    }

    pub fn registries(&self) -> impl Iterator<Item = &DockerRegistry> {
        self.registries.values()
    }

    pub fn has_some_docker_registry(&self) -> bool {
        !self.registries.is_empty()
    }
}

/// `https://host:port/v2` のような URI からホスト名部分を取り出す
pub fn registry_hostname(uri: &str) -> &str {
    let without_scheme = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(uri);
    without_scheme.split('/').next().unwrap_or_default()
}
