//! プラグインのインターフェース
//!
//! フェーズごとに実装するトレイトが分かれています。
//! - [`InputPlugin`]: build.json を読み込む
//! - [`BuildPlugin`]: prebuild / prepublish / postbuild / exit
//! - [`BuildStepPlugin`]: 実際にイメージを作る（1ビルドにつき1つだけ採用）
//!
//! プラグインはすべて1本の論理タスク上で順番に実行され、`run()` を抜けた後に
//! 動き続けるタスクを残してはいけません。中断時の後始末だけは例外で、
//! [`CleanupTasks`] に登録すればワークフローが完了を待ちます。

use crate::error::{PluginError, PluginResult};
use crate::plugins::orchestrate_build::WorkerBuilder;
use async_trait::async_trait;
use buildflow_container::ContainerTasker;
use buildflow_core::{BuildResult, Phase, WorkflowData};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// プラグインが宣言する失敗時の扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// フェーズの既定に従う（postbuild / exit は許容、それ以外は致命的）
    #[default]
    PhaseDefault,
    Fatal,
    AllowedToFail,
}

impl FailurePolicy {
    pub fn from_flag(allowed_to_fail: bool) -> Self {
        if allowed_to_fail {
            FailurePolicy::AllowedToFail
        } else {
            FailurePolicy::Fatal
        }
    }

    pub fn allows_failure(&self, phase: Phase) -> bool {
        match self {
            FailurePolicy::PhaseDefault => phase.allows_failure_by_default(),
            FailurePolicy::Fatal => false,
            FailurePolicy::AllowedToFail => true,
        }
    }
}

/// プラグイン1回分の実行結果の分類
#[derive(Debug)]
pub enum PluginOutcome {
    Ok(Value),
    /// 失敗が許容されている。結果として記録してフェーズを続ける
    Recoverable(PluginError),
    /// フェーズを中断する（exit フェーズでは集約して最後に返す）
    Fatal(PluginError),
}

impl PluginOutcome {
    pub fn classify(result: PluginResult<Value>, allowed_to_fail: bool) -> Self {
        match result {
            Ok(value) => PluginOutcome::Ok(value),
            Err(err) if allowed_to_fail => PluginOutcome::Recoverable(err),
            Err(err) => PluginOutcome::Fatal(err),
        }
    }
}

/// ビルドステッププラグインの結果
#[derive(Debug)]
pub enum BuildStepOutcome {
    /// このプラグインがビルドを担当した（失敗したビルドも含む）
    Built(BuildResult),
    /// このビルドには適用できない。次のビルドステッププラグインを試す
    Inappropriate(String),
}

#[async_trait]
pub trait InputPlugin: Send {
    fn key(&self) -> &str;

    /// build.json の内容を返す
    async fn run(&mut self) -> PluginResult<Value>;
}

#[async_trait]
pub trait BuildPlugin: Send {
    fn key(&self) -> &str;

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::PhaseDefault
    }

    /// 戻り値はフェーズの結果表に `key` で記録される
    async fn run(&mut self, tasker: &ContainerTasker, workflow: &mut WorkflowData) -> PluginResult<Value>;
}

#[async_trait]
pub trait BuildStepPlugin: Send {
    fn key(&self) -> &str;

    async fn run(
        &mut self,
        tasker: &ContainerTasker,
        workflow: &mut WorkflowData,
    ) -> PluginResult<BuildStepOutcome>;
}

/// プラグインが使う外部コラボレータ
#[derive(Clone, Default)]
pub struct PluginServices {
    /// リモートのワーカービルド（orchestrate_build が使う）
    pub worker_builder: Option<Arc<dyn WorkerBuilder>>,
    pub cleanup: CleanupTasks,
}

impl std::fmt::Debug for PluginServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginServices")
            .field("worker_builder", &self.worker_builder.is_some())
            .field("cleanup", &self.cleanup.len())
            .finish()
    }
}

/// 中断で drop されたプラグインが起動した後始末のタスク
///
/// ワークフローは exit フェーズの前にこれらを全て待つ。
#[derive(Clone, Default)]
pub struct CleanupTasks {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CleanupTasks {
    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn spawn<F>(&self, runtime: &Handle, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = runtime.spawn(task);
        self.handles().push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 登録済みのタスクが全て終わるまで待つ
    pub async fn join_all(&self) {
        let handles = std::mem::take(&mut *self.handles());
        if handles.is_empty() {
            return;
        }
        tracing::debug!("Waiting for {} cleanup task(s)", handles.len());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Cleanup task failed: {}", e);
            }
        }
    }
}

/// プラグイン引数を型付きの構造体に変換
///
/// 知らない引数は無視される。
pub fn parse_args<T: DeserializeOwned>(key: &str, args: &Map<String, Value>) -> PluginResult<T> {
    serde_json::from_value(Value::Object(args.clone()))
        .map_err(|e| PluginError::Args(format!("{}: {}", key, e)))
}
