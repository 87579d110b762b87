//! イメージ参照
//!
//! `registry/namespace/repo:tag` 形式の文字列を分解・再構成します。

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// コンテナイメージへの参照
///
/// # Examples
/// - `fedora` -> repo = `fedora`
/// - `fedora:31` -> repo = `fedora`, tag = `31`
/// - `quay.io/org/app:v1` -> registry = `quay.io`, namespace = `org`, repo = `app`
/// - `app@sha256:abcd` -> repo = `app`, tag = `sha256:abcd`（ダイジェスト）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageName {
    pub registry: Option<String>,
    pub namespace: Option<String>,
    pub repo: String,
    pub tag: Option<String>,
}

impl ImageName {
    pub fn parse(image: &str) -> Result<Self> {
        let image = image.trim();
        if image.is_empty() {
            return Err(CoreError::InvalidImageName(image.to_string()));
        }

        let mut result = ImageName::default();
        let parts: Vec<&str> = image.splitn(3, '/').collect();
        let remainder = match parts.as_slice() {
            [repo] => *repo,
            [first, repo] => {
                // `.` か `:` を含む先頭要素はレジストリ
                if first.contains('.') || first.contains(':') || *first == "localhost" {
                    result.registry = Some(first.to_string());
                } else {
                    result.namespace = Some(first.to_string());
                }
                *repo
            }
            [registry, namespace, repo] => {
                result.registry = Some(registry.to_string());
                result.namespace = Some(namespace.to_string());
                *repo
            }
            _ => return Err(CoreError::InvalidImageName(image.to_string())),
        };

        // ダイジェスト指定を優先
        let (repo, tag) = if let Some((repo, digest)) = remainder.split_once('@') {
            (repo, Some(digest))
        } else if let Some((repo, tag)) = remainder.rsplit_once(':') {
            (repo, Some(tag))
        } else {
            (remainder, None)
        };

        if repo.is_empty() || tag.is_some_and(str::is_empty) {
            return Err(CoreError::InvalidImageName(image.to_string()));
        }
        result.repo = repo.to_string();
        result.tag = tag.map(str::to_string);
        Ok(result)
    }

    /// 文字列表現を組み立てる
    ///
    /// `explicit_tag` が true の場合、タグ未指定なら `latest` を補う。
    pub fn to_str(&self, registry: bool, tag: bool, explicit_tag: bool) -> String {
        let mut out = String::new();
        if registry && let Some(reg) = &self.registry {
            out.push_str(reg);
            out.push('/');
        }
        out.push_str(&self.repository());

        if tag {
            match &self.tag {
                Some(t) if t.contains(':') => {
                    out.push('@');
                    out.push_str(t);
                }
                Some(t) => {
                    out.push(':');
                    out.push_str(t);
                }
                None if explicit_tag => out.push_str(":latest"),
                None => {}
            }
        }
        out
    }

    /// レジストリとタグを除いたリポジトリ名（`namespace/repo`）
    pub fn repository(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.repo),
            None => self.repo.clone(),
        }
    }

    /// レジストリを差し替えたコピー
    pub fn with_registry(&self, registry: Option<&str>) -> Self {
        Self {
            registry: registry.map(str::to_string),
            ..self.clone()
        }
    }

    /// タグを差し替えたコピー
    pub fn with_tag(&self, tag: Option<&str>) -> Self {
        Self {
            tag: tag.map(str::to_string),
            ..self.clone()
        }
    }

    /// タグ（未指定なら `latest`）
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    pub fn is_digest(&self) -> bool {
        self.tag.as_deref().is_some_and(|t| t.contains(':'))
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str(true, true, false))
    }
}

impl FromStr for ImageName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ImageName> for String {
    fn from(value: ImageName) -> Self {
        value.to_string()
    }
}
