use crate::constants::REMOTE_IMAGE;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// ビルドステップの結果
///
/// 失敗理由・イメージID・リモートイメージ番兵のうち、高々1つだけを持ちます。
/// 失敗理由は空文字列にできません。
#[derive(Debug, Clone, PartialEq)]
pub struct BuildResult {
    logs: Vec<String>,
    fail_reason: Option<String>,
    image_id: Option<String>,
    annotations: Map<String, Value>,
    labels: BTreeMap<String, String>,
    skip_layer_squash: bool,
}

const GENERIC_FAIL_REASON: &str = "build failed without a reason";

impl BuildResult {
    pub fn builder() -> BuildResultBuilder {
        BuildResultBuilder::default()
    }

    /// 成功したローカルビルド
    pub fn success(image_id: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            logs,
            fail_reason: None,
            image_id: Some(image_id.into()),
            annotations: Map::new(),
            labels: BTreeMap::new(),
            skip_layer_squash: false,
        }
    }

    /// 失敗したビルド
    ///
    /// 空の理由は汎用メッセージに置き換える。
    pub fn failed(reason: impl Into<String>, logs: Vec<String>) -> Self {
        let reason = reason.into();
        let reason = if reason.trim().is_empty() {
            GENERIC_FAIL_REASON.to_string()
        } else {
            reason
        };
        Self {
            logs,
            fail_reason: Some(reason),
            image_id: None,
            annotations: Map::new(),
            labels: BTreeMap::new(),
            skip_layer_squash: false,
        }
    }

    /// リモートで作られたイメージ
    pub fn remote_image(annotations: Map<String, Value>, labels: BTreeMap<String, String>) -> Self {
        Self {
            logs: Vec::new(),
            fail_reason: None,
            image_id: Some(REMOTE_IMAGE.to_string()),
            annotations,
            labels,
            skip_layer_squash: false,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.fail_reason.is_some()
    }

    pub fn is_image_available(&self) -> bool {
        self.image_id
            .as_deref()
            .is_some_and(|id| id != REMOTE_IMAGE)
    }

    pub fn is_remote(&self) -> bool {
        self.image_id.as_deref() == Some(REMOTE_IMAGE)
    }

    pub fn fail_reason(&self) -> Option<&str> {
        self.fail_reason.as_deref()
    }

    /// ローカルのイメージID（リモートの場合は None）
    pub fn image_id(&self) -> Option<&str> {
        self.image_id.as_deref().filter(|id| *id != REMOTE_IMAGE)
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn annotations(&self) -> &Map<String, Value> {
        &self.annotations
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn skip_layer_squash(&self) -> bool {
        self.skip_layer_squash
    }

    pub fn push_log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    pub fn insert_annotation(&mut self, key: impl Into<String>, value: Value) {
        self.annotations.insert(key.into(), value);
    }
}

#[derive(Debug, Default)]
pub struct BuildResultBuilder {
    logs: Vec<String>,
    fail_reason: Option<String>,
    image_id: Option<String>,
    remote_image: bool,
    annotations: Map<String, Value>,
    labels: BTreeMap<String, String>,
    skip_layer_squash: bool,
}

impl BuildResultBuilder {
    pub fn logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }

    pub fn fail_reason(mut self, reason: impl Into<String>) -> Self {
        self.fail_reason = Some(reason.into());
        self
    }

    pub fn image_id(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }

    pub fn remote_image(mut self) -> Self {
        self.remote_image = true;
        self
    }

    pub fn annotations(mut self, annotations: Map<String, Value>) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn skip_layer_squash(mut self, skip: bool) -> Self {
        self.skip_layer_squash = skip;
        self
    }

    pub fn build(self) -> Result<BuildResult> {
        if self.remote_image && self.image_id.is_some() {
            return Err(CoreError::InvalidBuildResult(
                "image_id and remote_image are mutually exclusive".to_string(),
            ));
        }
        let image_id = if self.remote_image {
            Some(REMOTE_IMAGE.to_string())
        } else {
            self.image_id
        };
        let repr = BuildResultRepr {
            logs: self.logs,
            fail_reason: self.fail_reason,
            image_id,
            annotations: self.annotations,
            labels: self.labels,
            skip_layer_squash: self.skip_layer_squash,
        };
        BuildResult::from_repr(repr)
    }
}

/// シリアライズ用の表現（検証前）
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BuildResultRepr {
    #[serde(default)]
    logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fail_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    annotations: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    skip_layer_squash: bool,
}

impl BuildResult {
    fn from_repr(repr: BuildResultRepr) -> Result<Self> {
        if let Some(reason) = &repr.fail_reason {
            if reason.trim().is_empty() {
                return Err(CoreError::InvalidBuildResult(
                    "fail_reason must not be empty".to_string(),
                ));
            }
            if repr.image_id.is_some() {
                return Err(CoreError::InvalidBuildResult(
                    "fail_reason and image_id are mutually exclusive".to_string(),
                ));
            }
        }
        Ok(Self {
            logs: repr.logs,
            fail_reason: repr.fail_reason,
            image_id: repr.image_id,
            annotations: repr.annotations,
            labels: repr.labels,
            skip_layer_squash: repr.skip_layer_squash,
        })
    }
}

impl Serialize for BuildResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        BuildResultRepr {
            logs: self.logs.clone(),
            fail_reason: self.fail_reason.clone(),
            image_id: self.image_id.clone(),
            annotations: self.annotations.clone(),
            labels: self.labels.clone(),
            skip_layer_squash: self.skip_layer_squash,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BuildResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = BuildResultRepr::deserialize(deserializer)?;
        BuildResult::from_repr(repr).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_rejects_conflicts() {
        assert!(
            BuildResult::builder()
                .fail_reason("boom")
                .image_id("sha256:1")
                .build()
                .is_err()
        );
        assert!(
            BuildResult::builder()
                .fail_reason("boom")
                .remote_image()
                .build()
                .is_err()
        );
        assert!(
            BuildResult::builder()
                .image_id("sha256:1")
                .remote_image()
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_builder_rejects_empty_reason() {
        let err = BuildResult::builder().fail_reason("").build().unwrap_err();
        assert!(matches!(err, CoreError::InvalidBuildResult(_)));
    }

    #[test]
    fn test_failed_never_has_empty_reason() {
        let result = BuildResult::failed("", vec![]);
        assert!(result.is_failed());
        assert!(!result.fail_reason().unwrap().is_empty());

        let result = BuildResult::failed(" \n\t", vec![]);
        assert!(!result.fail_reason().unwrap().trim().is_empty());
    }

    #[test]
    fn test_whitespace_reason_is_rejected() {
        let err = BuildResult::builder().fail_reason("  \n").build().unwrap_err();
        assert!(matches!(err, CoreError::InvalidBuildResult(_)));

        let blank = json!({"fail_reason": "   ", "logs": []});
        assert!(serde_json::from_value::<BuildResult>(blank).is_err());
    }

    #[test]
    fn test_remote_image() {
        let mut annotations = Map::new();
        annotations.insert("worker-builds".to_string(), json!({"x86_64": {}}));
        let result = BuildResult::remote_image(annotations, BTreeMap::new());
        assert!(result.is_remote());
        assert!(!result.is_failed());
        assert!(!result.is_image_available());
        assert_eq!(result.image_id(), None);
    }

    #[test]
    fn test_success() {
        let result = BuildResult::success("sha256:abc", vec!["Step 1".to_string()]);
        assert!(result.is_image_available());
        assert_eq!(result.image_id(), Some("sha256:abc"));
        assert_eq!(result.logs(), ["Step 1"]);
    }

    #[test]
    fn test_deserialize_validates() {
        let bad = json!({"fail_reason": "x", "image_id": "sha256:1"});
        assert!(serde_json::from_value::<BuildResult>(bad).is_err());

        let good = json!({"fail_reason": "dockerfile missing", "logs": ["a"]});
        let result: BuildResult = serde_json::from_value(good).unwrap();
        assert_eq!(result.fail_reason(), Some("dockerfile missing"));

        let serialized = serde_json::to_value(&result).unwrap();
        assert_eq!(serialized["fail_reason"], "dockerfile missing");
        assert!(serialized.get("image_id").is_none());
    }
}
