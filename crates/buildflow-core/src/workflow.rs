//! ワークフロー状態
//!
//! 1回のビルドにつき1つ作られ、全プラグインが順番に読み書きする共有状態です。
//! ロックを持たないため、同時に複数のプラグインから変更してはいけません。

use crate::constants::{BUILD_DOCKERFILE_PATH, BUILD_SOURCE_PATH, BUILT_IMAGE_ID};
use crate::dockerfile::{DockerfileImages, ParsedDockerfile, parse_dockerfile_path};
use crate::error::{CoreError, Result};
use crate::image::ImageName;
use crate::model::{BuildConfig, BuildResult, Phase, PushConf, TagConf};
use crate::source::Source;
use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// プラグイン1つ分の実行結果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginOutput {
    /// `run()` の戻り値
    Value(Value),
    /// 失敗が許容されたプラグインのエラー
    Error(String),
}

impl PluginOutput {
    pub fn is_error(&self) -> bool {
        matches!(self, PluginOutput::Error(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            PluginOutput::Value(v) => Some(v),
            PluginOutput::Error(_) => None,
        }
    }
}

/// フェーズごとの結果（挿入順 = 実行順）
pub type PhaseResults = IndexMap<String, PluginOutput>;

#[derive(Debug)]
pub struct WorkflowData {
    pub config: BuildConfig,
    pub image: ImageName,
    pub source: Source,
    pub dockerfile_path: Option<PathBuf>,
    pub build_dir: Option<PathBuf>,
    pub dockerfile: Option<ParsedDockerfile>,
    pub dockerfile_images: DockerfileImages,
    pub tag_conf: TagConf,
    pub push_conf: PushConf,

    pub prebuild_results: PhaseResults,
    pub prepublish_results: PhaseResults,
    pub postbuild_results: PhaseResults,
    pub exit_results: PhaseResults,
    pub build_result: Option<BuildResult>,

    /// ビルドされたイメージの ID（ビルドステップ成功後に設定）
    pub image_id: Option<String>,
    pub built_image_inspect: Option<Value>,
    /// プルしたイメージ（Exit フェーズでの削除候補）
    pub pulled_base_images: IndexSet<String>,
    /// プラグイン間で受け渡す任意データ（キーはプラグイン名）
    pub plugin_workspace: Map<String, Value>,

    pub plugins_timestamps: IndexMap<String, DateTime<Utc>>,
    pub plugins_durations: IndexMap<String, f64>,
    pub plugins_errors: IndexMap<String, String>,
    pub plugin_failed: bool,
    pub build_canceled: bool,

    // drop 時にクローン先ごと削除される
    _workdir: TempDir,
}

impl WorkflowData {
    pub fn new(config: BuildConfig) -> Result<Self> {
        let image = ImageName::parse(&config.image)?;
        let workdir = tempfile::Builder::new().prefix("buildflow-").tempdir()?;
        let source = Source::new(config.source.clone(), workdir.path());
        tracing::debug!("Workflow work directory: {}", workdir.path().display());

        Ok(Self {
            config,
            image,
            source,
            dockerfile_path: None,
            build_dir: None,
            dockerfile: None,
            dockerfile_images: DockerfileImages::default(),
            tag_conf: TagConf::default(),
            push_conf: PushConf::default(),
            prebuild_results: PhaseResults::new(),
            prepublish_results: PhaseResults::new(),
            postbuild_results: PhaseResults::new(),
            exit_results: PhaseResults::new(),
            build_result: None,
            image_id: None,
            built_image_inspect: None,
            pulled_base_images: IndexSet::new(),
            plugin_workspace: Map::new(),
            plugins_timestamps: IndexMap::new(),
            plugins_durations: IndexMap::new(),
            plugins_errors: IndexMap::new(),
            plugin_failed: false,
            build_canceled: false,
            _workdir: workdir,
        })
    }

    pub fn workdir(&self) -> &Path {
        self._workdir.path()
    }

    /// ソースを取得し、Dockerfile のステージグラフを作る
    pub async fn prepare_source(&mut self) -> Result<()> {
        self.source.get().await?;
        let (dockerfile, build_dir) = self.source.dockerfile_path()?;
        let parsed = parse_dockerfile_path(&dockerfile)?;
        tracing::info!(
            "Dockerfile {} has {} stage(s), parent images: {:?}",
            dockerfile.display(),
            parsed.stages.len(),
            parsed.parent_images
        );
        self.dockerfile_images = parsed.dockerfile_images();
        self.dockerfile = Some(parsed);
        self.dockerfile_path = Some(dockerfile);
        self.build_dir = Some(build_dir);
        Ok(())
    }

    pub fn results(&self, phase: Phase) -> Option<&PhaseResults> {
        match phase {
            Phase::PreBuild => Some(&self.prebuild_results),
            Phase::PrePublish => Some(&self.prepublish_results),
            Phase::PostBuild => Some(&self.postbuild_results),
            Phase::Exit => Some(&self.exit_results),
            Phase::Input | Phase::BuildStep => None,
        }
    }

    pub fn results_mut(&mut self, phase: Phase) -> Option<&mut PhaseResults> {
        match phase {
            Phase::PreBuild => Some(&mut self.prebuild_results),
            Phase::PrePublish => Some(&mut self.prepublish_results),
            Phase::PostBuild => Some(&mut self.postbuild_results),
            Phase::Exit => Some(&mut self.exit_results),
            Phase::Input | Phase::BuildStep => None,
        }
    }

    /// ビルドステップの結果が失敗（またはまだ無い）
    pub fn build_failed(&self) -> bool {
        self.build_result.as_ref().is_none_or(BuildResult::is_failed)
    }

    /// ビルドプロセス全体として失敗したか
    pub fn build_process_failed(&self) -> bool {
        self.build_failed() || self.plugin_failed || self.build_canceled
    }

    /// ビルドステップの結果を記録（成功時はイメージ ID も更新）
    pub fn set_build_result(&mut self, result: BuildResult) {
        if let Some(id) = result.image_id() {
            self.image_id = Some(id.to_string());
        }
        self.build_result = Some(result);
    }

    pub fn record_plugin_start(&mut self, key: &str) {
        self.plugins_timestamps.insert(key.to_string(), Utc::now());
    }

    pub fn record_plugin_duration(&mut self, key: &str, seconds: f64) {
        self.plugins_durations.insert(key.to_string(), seconds);
    }

    pub fn record_plugin_error(&mut self, key: &str, message: &str) {
        self.plugins_errors.insert(key.to_string(), message.to_string());
    }

    /// プラグイン引数中の特殊値を実行時の値に置き換える（配列・オブジェクトは再帰）
    pub fn translate_special_values(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.translate_special_values(v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.translate_special_values(v))
                    .collect(),
            ),
            Value::String(s) => match s.as_str() {
                BUILT_IMAGE_ID => opt_string(self.image_id.clone()),
                BUILD_DOCKERFILE_PATH => opt_string(
                    self.dockerfile_path
                        .as_ref()
                        .map(|p| p.display().to_string()),
                ),
                BUILD_SOURCE_PATH => Value::String(self.source.path().display().to_string()),
                _ => value.clone(),
            },
            _ => value.clone(),
        }
    }

    /// 親イメージが全て解決済みであることを確認
    pub fn ensure_parents_resolved(&self) -> Result<()> {
        match self.dockerfile_images.unresolved().first() {
            Some(parent) => Err(CoreError::UnknownParentImage(parent.to_string())),
            None => Ok(()),
        }
    }
}

fn opt_string(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceSpec;
    use serde_json::json;

    fn path_workflow(dockerfile: &str) -> (TempDir, WorkflowData) {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("Dockerfile"), dockerfile).unwrap();
        let config = BuildConfig::new(
            "registry.local/app:1",
            SourceSpec::path(src.path().display().to_string()),
        );
        let workflow = WorkflowData::new(config).unwrap();
        (src, workflow)
    }

    #[tokio::test]
    async fn test_prepare_source_builds_image_graph() {
        let (_src, mut workflow) = path_workflow("FROM golang AS b\nFROM fedora:39\n");
        workflow.prepare_source().await.unwrap();
        let parents: Vec<&str> = workflow.dockerfile_images.original_parents().collect();
        assert_eq!(parents, vec!["golang", "fedora:39"]);
        assert_eq!(workflow.dockerfile_images.base_image(), Some("fedora:39"));
        assert!(workflow.ensure_parents_resolved().is_err());
    }

    #[tokio::test]
    async fn test_prepare_source_rejects_unknown_stage() {
        let (_src, mut workflow) = path_workflow("FROM alpine\nCOPY --from=missing /a /b\n");
        assert!(matches!(
            workflow.prepare_source().await,
            Err(CoreError::UnknownStage { .. })
        ));
    }

    #[tokio::test]
    async fn test_translate_special_values() {
        let (src, mut workflow) = path_workflow("FROM alpine\n");
        workflow.prepare_source().await.unwrap();
        workflow.set_build_result(BuildResult::success("sha256:beef", vec![]));

        let args = json!({
            "image": "BUILT_IMAGE_ID",
            "nested": {"paths": ["BUILD_SOURCE_PATH", "BUILD_DOCKERFILE_PATH", "other"]},
            "count": 3
        });
        let translated = workflow.translate_special_values(&args);
        assert_eq!(translated["image"], "sha256:beef");
        assert_eq!(
            translated["nested"]["paths"][0],
            src.path().display().to_string()
        );
        assert_eq!(
            translated["nested"]["paths"][1],
            src.path().join("Dockerfile").display().to_string()
        );
        assert_eq!(translated["nested"]["paths"][2], "other");
        assert_eq!(translated["count"], 3);
    }

    #[test]
    fn test_build_failed_flags() {
        let (_src, mut workflow) = path_workflow("FROM alpine\n");
        assert!(workflow.build_failed());
        workflow.set_build_result(BuildResult::success("sha256:1", vec![]));
        assert!(!workflow.build_failed());
        assert!(!workflow.build_process_failed());
        workflow.plugin_failed = true;
        assert!(workflow.build_process_failed());
    }

    #[test]
    fn test_workdir_removed_on_drop() {
        let (_src, workflow) = path_workflow("FROM alpine\n");
        let workdir = workflow.workdir().to_path_buf();
        assert!(workdir.exists());
        drop(workflow);
        assert!(!workdir.exists());
    }
}
