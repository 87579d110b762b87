//! ビルドワークフロー
//!
//! フェーズを決まった順に実行します:
//! prebuild → buildstep → (ビルド成功時のみ) prepublish → postbuild → exit
//!
//! exit フェーズは、途中のフェーズが失敗しても、ビルドが中断されても必ず実行されます。

use crate::env::BuildEnv;
use crate::error::{Result, WorkflowError};
use crate::registry::PluginRegistry;
use crate::runner::{BuildStepRunner, PhaseRunner, run_input};
use buildflow_container::ContainerTasker;
use buildflow_core::constants::{REMOTE_IMAGE, RESULTS_JSON};
use buildflow_core::{BuildConfig, BuildResult, Phase, WorkflowData};
use serde_json::{Map, Value};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

pub struct BuildWorkflow {
    pub data: WorkflowData,
    tasker: ContainerTasker,
    registry: Arc<PluginRegistry>,
}

impl BuildWorkflow {
    pub fn new(config: BuildConfig, env: &BuildEnv) -> Result<Self> {
        Ok(Self {
            data: WorkflowData::new(config)?,
            tasker: env.tasker.clone(),
            registry: env.registry.clone(),
        })
    }

    /// ビルドを実行（Ctrl-C で中断）
    ///
    /// ビルドステップの失敗はエラーではなく、失敗した [`BuildResult`] として返る。
    /// プラグインの致命的な失敗は、exit フェーズを実行した後にエラーとして返る。
    pub async fn build_docker_image(&mut self) -> Result<BuildResult> {
        self.build_docker_image_until(interrupted()).await
    }

    /// `cancel` が完了した時点でビルドを中断する
    pub async fn build_docker_image_until<F>(&mut self, cancel: F) -> Result<BuildResult>
    where
        F: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            result = run_build_phases(&mut self.data, &self.tasker, &self.registry) => Some(result),
            _ = cancel => None,
        };

        let outcome = match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(err)) => {
                if self.data.build_result.is_none() {
                    self.data.build_result = Some(BuildResult::failed(err.to_string(), Vec::new()));
                }
                Err(err)
            }
            None => {
                tracing::warn!("Build canceled, running exit plugins");
                self.data.build_canceled = true;
                self.data
                    .set_build_result(BuildResult::failed("build canceled", Vec::new()));
                Ok(())
            }
        };

        // 中断で drop されたプラグインの後始末（ワーカービルドのキャンセルなど）
        self.registry.services().cleanup.join_all().await;

        let exit = PhaseRunner::new(Phase::Exit, &self.registry, &self.tasker)
            .run(&mut self.data)
            .await;

        match (outcome, exit) {
            (Err(first), Err(exit)) => {
                tracing::error!("Exit plugins also failed: {}", exit);
                Err(first)
            }
            (Err(first), Ok(())) => Err(first),
            (Ok(()), Err(exit)) => Err(exit),
            (Ok(()), Ok(())) => self
                .data
                .build_result
                .clone()
                .ok_or(WorkflowError::NoBuildStep),
        }
    }
}

async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for interrupts: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run_build_phases(
    data: &mut WorkflowData,
    tasker: &ContainerTasker,
    registry: &PluginRegistry,
) -> Result<()> {
    data.prepare_source().await?;

    PhaseRunner::new(Phase::PreBuild, registry, tasker)
        .run(data)
        .await?;

    let unresolved = data.dockerfile_images.fill_unresolved_with_originals()?;
    if !unresolved.is_empty() {
        tracing::info!("Using parent images as written in Dockerfile: {:?}", unresolved);
    }
    data.ensure_parents_resolved()?;

    let result = BuildStepRunner::new(registry, tasker).run(data).await?;
    data.set_build_result(result);
    if data.build_failed() {
        tracing::info!("Build failed, skipping prepublish and postbuild plugins");
        return Ok(());
    }

    if let Some(image_id) = data.image_id.clone()
        && image_id != REMOTE_IMAGE
        && data.built_image_inspect.is_none()
    {
        match tasker.inspect_image(&image_id).await {
            Ok(inspect) => data.built_image_inspect = Some(inspect),
            Err(e) => tracing::warn!("Failed to inspect built image {}: {}", image_id, e),
        }
    }

    PhaseRunner::new(Phase::PrePublish, registry, tasker)
        .run(data)
        .await?;
    PhaseRunner::new(Phase::PostBuild, registry, tasker)
        .run(data)
        .await?;
    Ok(())
}

/// ビルド結果を `<dir>/results.json` に書き出す
pub fn write_results(dir: &Path, result: &BuildResult) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(RESULTS_JSON);
    std::fs::write(&path, serde_json::to_string_pretty(result)?)?;
    tracing::debug!("Results written to {}", path.display());
    Ok(())
}

/// ビルドコンテナの中でのビルド
///
/// 入力プラグインで build.json を読み込み、ワークフローを実行します。
/// `results_dir` が指定されていれば、失敗時も含めて results.json を書き出します。
pub async fn build_inside(
    env: &BuildEnv,
    input: &str,
    input_args: Map<String, Value>,
    substitutions: &[(String, String)],
    results_dir: Option<&Path>,
) -> Result<BuildResult> {
    let mut args = input_args;
    if !substitutions.is_empty() {
        let subs: Map<String, Value> = substitutions
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        args.insert("substitutions".to_string(), Value::Object(subs));
    }

    let outcome = run_inside(env, input, &args).await;
    if let Some(dir) = results_dir {
        let result = match &outcome {
            Ok(result) => result.clone(),
            Err(err) => BuildResult::failed(err.to_string(), Vec::new()),
        };
        write_results(dir, &result)?;
    }

    let result = outcome?;
    match result.fail_reason() {
        Some(reason) => Err(WorkflowError::BuildFailed(reason.to_string())),
        None => Ok(result),
    }
}

async fn run_inside(env: &BuildEnv, input: &str, args: &Map<String, Value>) -> Result<BuildResult> {
    let build_json = run_input(&env.registry, input, args).await?;
    let config = BuildConfig::from_value(build_json)?;
    let mut workflow = BuildWorkflow::new(config, env)?;
    workflow.build_docker_image().await
}
