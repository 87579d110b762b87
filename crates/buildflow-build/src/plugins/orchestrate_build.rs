//! プラットフォームごとのワーカービルドへの振り分け
//!
//! 各プラットフォームのワーカービルドを順に開始し、全ての完了を待ってから
//! 結果を1つのリモートイメージの [`BuildResult`] にまとめます。
//! ビルド自体はこのプロセスの外で並行に進み、ここでは待機だけを並行に行います。
//!
//! どれか1つがキャンセルされるか待機に失敗した場合、残りのビルドもキャンセルします。

use crate::error::PluginResult;
use crate::plugin::{BuildStepOutcome, BuildStepPlugin, CleanupTasks, PluginServices, parse_args};
use async_trait::async_trait;
use buildflow_container::ContainerTasker;
use buildflow_core::{BuildResult, WorkflowData};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const KEY: &str = "orchestrate_build";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerBuildState {
    Succeeded,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerRepositories {
    pub unique: Vec<String>,
    pub primary: Vec<String>,
}

/// 完了したワーカービルドの状態
#[derive(Debug, Clone)]
pub struct WorkerBuildStatus {
    pub state: WorkerBuildState,
    pub digests: Vec<Value>,
    /// ワーカー側のプラグインメタデータ（`errors` にプラグインごとの失敗理由）
    pub plugins_metadata: Map<String, Value>,
    pub repositories: WorkerRepositories,
    pub koji_build_id: Option<String>,
}

impl WorkerBuildStatus {
    pub fn new(state: WorkerBuildState) -> Self {
        Self {
            state,
            digests: Vec::new(),
            plugins_metadata: Map::new(),
            repositories: WorkerRepositories::default(),
            koji_build_id: None,
        }
    }
}

/// リモートのワーカービルドを扱うコラボレータ
#[async_trait]
pub trait WorkerBuilder: Send + Sync {
    /// ビルドを開始し、ビルド名を返す
    async fn start(&self, platform: &str, params: &Map<String, Value>) -> PluginResult<String>;

    /// 完了まで待つ
    async fn wait(&self, build_name: &str) -> PluginResult<WorkerBuildStatus>;

    async fn cancel(&self, build_name: &str) -> PluginResult<()>;
}

#[derive(Debug, Default, Deserialize)]
struct OrchestrateArgs {
    #[serde(default)]
    platforms: Vec<String>,
    /// ワーカービルドにそのまま渡す引数
    #[serde(default)]
    build_kwargs: Map<String, Value>,
}

struct WorkerBuild {
    platform: String,
    name: Option<String>,
    status: Option<WorkerBuildStatus>,
    monitor_error: Option<String>,
}

impl WorkerBuild {
    fn is_succeeded(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.state == WorkerBuildState::Succeeded)
    }

    fn annotations(&self, name: &str) -> Value {
        let (digests, metadata) = match &self.status {
            Some(status) => (
                Value::Array(status.digests.clone()),
                Value::Object(status.plugins_metadata.clone()),
            ),
            None => (json!([]), json!({})),
        };
        json!({
            "build": { "build-name": name },
            "digests": digests,
            "plugins-metadata": metadata,
        })
    }

    fn fail_reason(&self) -> Value {
        if self.name.is_none() {
            return json!({ "general": "build not started" });
        }
        let mut reason = self
            .status
            .as_ref()
            .and_then(|s| s.plugins_metadata.get("errors"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if let Some(err) = &self.monitor_error {
            reason.insert("general".to_string(), Value::String(err.clone()));
        }
        Value::Object(reason)
    }
}

/// 途中で破棄された場合に、まだ終わっていないワーカービルドをキャンセルする
///
/// キャンセルは [`CleanupTasks`] に登録され、ワークフローが exit フェーズの前に待つ。
struct CancelOnDrop {
    builder: Arc<dyn WorkerBuilder>,
    cleanup: CleanupTasks,
    pending: Vec<String>,
}

impl CancelOnDrop {
    fn finish(&mut self, name: &str) {
        self.pending.retain(|n| n != name);
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Cannot cancel worker builds {:?}: no runtime", self.pending);
            return;
        };
        tracing::info!("Build cancelled, cancelling worker builds");
        let builder = self.builder.clone();
        let pending = std::mem::take(&mut self.pending);
        self.cleanup.spawn(&handle, async move {
            for name in pending {
                if let Err(e) = builder.cancel(&name).await {
                    tracing::warn!("Failed to cancel worker build {}: {}", name, e);
                }
            }
        });
    }
}

pub struct OrchestrateBuildPlugin {
    args: OrchestrateArgs,
    builder: Option<Arc<dyn WorkerBuilder>>,
    cleanup: CleanupTasks,
}

impl OrchestrateBuildPlugin {
    pub fn create(
        args: &Map<String, Value>,
        services: &PluginServices,
    ) -> PluginResult<Box<dyn BuildStepPlugin>> {
        Ok(Box::new(Self {
            args: parse_args(KEY, args)?,
            builder: services.worker_builder.clone(),
            cleanup: services.cleanup.clone(),
        }))
    }

    fn worker_params(&self, workflow: &WorkflowData, platform: &str) -> PluginResult<Map<String, Value>> {
        let mut params = self.args.build_kwargs.clone();
        params.insert("platform".to_string(), json!(platform));
        params.insert("image".to_string(), json!(workflow.image.to_str(true, true, true)));
        params.insert("source".to_string(), serde_json::to_value(&workflow.config.source)?);
        Ok(params)
    }

    async fn start_all(
        &self,
        builder: &Arc<dyn WorkerBuilder>,
        workflow: &WorkflowData,
    ) -> PluginResult<Vec<WorkerBuild>> {
        let mut builds = Vec::with_capacity(self.args.platforms.len());
        for platform in &self.args.platforms {
            let params = self.worker_params(workflow, platform)?;
            let name = match builder.start(platform, &params).await {
                Ok(name) => {
                    tracing::info!("{} - created build {}", platform, name);
                    Some(name)
                }
                Err(e) => {
                    tracing::error!("{} - failed to create worker build: {}", platform, e);
                    None
                }
            };
            builds.push(WorkerBuild {
                platform: platform.clone(),
                name,
                status: None,
                monitor_error: None,
            });
        }
        Ok(builds)
    }

    async fn wait_all(&self, builder: &Arc<dyn WorkerBuilder>, builds: &mut [WorkerBuild]) {
        let mut guard = CancelOnDrop {
            builder: builder.clone(),
            cleanup: self.cleanup.clone(),
            pending: builds.iter().filter_map(|b| b.name.clone()).collect(),
        };

        let mut waits: FuturesUnordered<_> = builds
            .iter()
            .enumerate()
            .filter_map(|(idx, build)| {
                let name = build.name.clone()?;
                let builder = builder.clone();
                Some(async move {
                    let result = builder.wait(&name).await;
                    (idx, name, result)
                })
            })
            .collect();

        let mut cancelling = false;
        while let Some((idx, name, result)) = waits.next().await {
            guard.finish(&name);
            let build = &mut builds[idx];
            let stop_others = match result {
                Ok(status) => {
                    tracing::info!("{} - build {} finished: {:?}", build.platform, name, status.state);
                    let canceled = status.state == WorkerBuildState::Canceled;
                    build.status = Some(status);
                    canceled
                }
                Err(e) => {
                    tracing::error!("{} - failed to monitor worker build: {}", build.platform, e);
                    build.monitor_error = Some(e.to_string());
                    true
                }
            };

            if stop_others && !cancelling {
                cancelling = true;
                for other in guard.pending.clone() {
                    tracing::info!("Cancelling worker build {}", other);
                    if let Err(e) = builder.cancel(&other).await {
                        tracing::warn!("Failed to cancel worker build {}: {}", other, e);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BuildStepPlugin for OrchestrateBuildPlugin {
    fn key(&self) -> &str {
        KEY
    }

    async fn run(
        &mut self,
        _tasker: &ContainerTasker,
        workflow: &mut WorkflowData,
    ) -> PluginResult<BuildStepOutcome> {
        let Some(builder) = self.builder.clone() else {
            return Ok(BuildStepOutcome::Inappropriate(
                "no worker builder available".to_string(),
            ));
        };
        if self.args.platforms.is_empty() {
            return Ok(BuildStepOutcome::Inappropriate(
                "no platforms to build for".to_string(),
            ));
        }

        let mut builds = self.start_all(&builder, workflow).await?;
        self.wait_all(&builder, &mut builds).await;

        let mut worker_builds = Map::new();
        let mut unique = BTreeSet::new();
        let mut primary = BTreeSet::new();
        let mut koji_build_ids = BTreeSet::new();
        for build in &builds {
            let Some(name) = &build.name else { continue };
            worker_builds.insert(build.platform.clone(), build.annotations(name));
            if let Some(status) = &build.status {
                unique.extend(status.repositories.unique.iter().cloned());
                primary.extend(status.repositories.primary.iter().cloned());
                koji_build_ids.extend(status.koji_build_id.iter().cloned());
            }
        }

        let mut annotations = Map::new();
        annotations.insert("worker-builds".to_string(), Value::Object(worker_builds));
        if !unique.is_empty() || !primary.is_empty() {
            annotations.insert(
                "repositories".to_string(),
                json!({ "unique": unique, "primary": primary }),
            );
        }

        let mut labels = BTreeMap::new();
        if koji_build_ids.len() > 1 {
            tracing::debug!("All koji-build-ids: {:?}", koji_build_ids);
        }
        if let Some(id) = koji_build_ids.into_iter().next() {
            labels.insert("koji-build-id".to_string(), id);
        }

        let fail_reasons: Map<String, Value> = builds
            .iter()
            .filter(|b| !b.is_succeeded())
            .map(|b| (b.platform.clone(), b.fail_reason()))
            .collect();

        let result = if fail_reasons.is_empty() {
            BuildResult::remote_image(annotations, labels)
        } else {
            BuildResult::builder()
                .fail_reason(Value::Object(fail_reasons).to_string())
                .annotations(annotations)
                .labels(labels)
                .build()?
        };
        Ok(BuildStepOutcome::Built(result))
    }
}
