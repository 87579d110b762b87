//! Docker API を直接使うビルドステップ
//!
//! ビルドのログストリームを最後まで読み切り、エラー行があればビルド失敗の
//! [`BuildResult`] を返します。成功時はビルドしたイメージを inspect して ID を得ます。

use crate::error::{PluginError, PluginResult};
use crate::plugin::{BuildStepOutcome, BuildStepPlugin, PluginServices, parse_args};
use async_trait::async_trait;
use buildflow_container::{BuildRequest, ContainerTasker, wait_for_command};
use buildflow_core::{BuildResult, WorkflowData};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

pub const KEY: &str = "docker_api";

#[derive(Debug, Default, Deserialize)]
struct DockerApiArgs {
    #[serde(default)]
    build_args: HashMap<String, String>,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    no_cache: bool,
}

pub struct DockerApiPlugin {
    args: DockerApiArgs,
}

impl DockerApiPlugin {
    pub fn create(
        args: &Map<String, Value>,
        _services: &PluginServices,
    ) -> PluginResult<Box<dyn BuildStepPlugin>> {
        Ok(Box::new(Self {
            args: parse_args(KEY, args)?,
        }))
    }
}

#[async_trait]
impl BuildStepPlugin for DockerApiPlugin {
    fn key(&self) -> &str {
        KEY
    }

    async fn run(
        &mut self,
        tasker: &ContainerTasker,
        workflow: &mut WorkflowData,
    ) -> PluginResult<BuildStepOutcome> {
        let (Some(context_dir), Some(dockerfile)) =
            (workflow.build_dir.clone(), workflow.dockerfile_path.clone())
        else {
            return Err(PluginError::failed("source has not been prepared"));
        };

        let request = BuildRequest {
            context_dir,
            dockerfile,
            tag: workflow.image.to_str(true, true, true),
            build_args: self.args.build_args.clone(),
            labels: self.args.labels.clone(),
            target: self.args.target.clone(),
            no_cache: self.args.no_cache,
        };

        let stream = tasker.build_image_from_path(&request).await?;
        let command = wait_for_command(stream).await?;
        if let Some(message) = command.error_message() {
            tracing::error!("Image build failed: {}", message);
            return Ok(BuildStepOutcome::Built(BuildResult::failed(
                message,
                command.into_logs(),
            )));
        }

        let inspect = tasker.inspect_image(&request.tag).await?;
        let image_id = inspect
            .get("Id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PluginError::failed(format!("image {} has no Id", request.tag)))?;
        tracing::info!("Image {} built: {}", request.tag, image_id);
        workflow.built_image_inspect = Some(inspect);

        Ok(BuildStepOutcome::Built(BuildResult::success(
            image_id,
            command.into_logs(),
        )))
    }
}
