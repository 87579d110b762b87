//! ビルド後のローカルイメージの削除
//!
//! 削除対象:
//! - 他のプラグインが登録したタグ（`images_to_remove`）
//! - ビルドしたイメージ
//! - プルした親イメージ（`remove_pulled_base_images` が true の場合）
//!
//! 既に存在しないイメージなど 4xx のエラーは警告だけで続行します。

use crate::error::PluginResult;
use crate::plugin::{BuildPlugin, PluginServices, parse_args};
use async_trait::async_trait;
use buildflow_container::ContainerTasker;
use buildflow_core::WorkflowData;
use buildflow_core::constants::REMOTE_IMAGE;
use serde::Deserialize;
use serde_json::{Map, Value, json};

pub const KEY: &str = "remove_built_image";

const IMAGES_TO_REMOVE: &str = "images_to_remove";

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RemoveBuiltImageArgs {
    #[serde(default = "default_true")]
    remove_pulled_base_images: bool,
}

/// Exit フェーズで削除するイメージを登録
pub fn defer_removal(workflow: &mut WorkflowData, image: &str) {
    let slot = workflow
        .plugin_workspace
        .entry(KEY.to_string())
        .or_insert_with(|| json!({}));
    if !slot.is_object() {
        *slot = json!({});
    }
    if let Some(map) = slot.as_object_mut() {
        let list = map
            .entry(IMAGES_TO_REMOVE.to_string())
            .or_insert_with(|| json!([]));
        if let Some(items) = list.as_array_mut()
            && !items.iter().any(|i| i == image)
        {
            items.push(json!(image));
        }
    }
}

fn deferred_images(workflow: &WorkflowData) -> Vec<String> {
    workflow
        .plugin_workspace
        .get(KEY)
        .and_then(|v| v.get(IMAGES_TO_REMOVE))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub struct RemoveBuiltImagePlugin {
    remove_pulled_base_images: bool,
}

impl RemoveBuiltImagePlugin {
    pub fn create(args: &Map<String, Value>, _services: &PluginServices) -> PluginResult<Box<dyn BuildPlugin>> {
        let parsed: RemoveBuiltImageArgs = parse_args(KEY, args)?;
        Ok(Box::new(Self {
            remove_pulled_base_images: parsed.remove_pulled_base_images,
        }))
    }

    /// 削除できたら true
    async fn remove(&self, tasker: &ContainerTasker, image: &str, force: bool) -> PluginResult<bool> {
        match tasker.remove_image(image, force, false).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_client_error() => {
                tracing::warn!("Failed to remove image {}: {}", image, e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BuildPlugin for RemoveBuiltImagePlugin {
    fn key(&self) -> &str {
        KEY
    }

    async fn run(&mut self, tasker: &ContainerTasker, workflow: &mut WorkflowData) -> PluginResult<Value> {
        let mut targets: Vec<(String, bool)> = deferred_images(workflow)
            .into_iter()
            .map(|image| (image, true))
            .collect();
        if let Some(image_id) = workflow.image_id.as_deref()
            && image_id != REMOTE_IMAGE
        {
            targets.push((image_id.to_string(), true));
        }
        if self.remove_pulled_base_images {
            targets.extend(
                workflow
                    .pulled_base_images
                    .iter()
                    .map(|image| (image.clone(), false)),
            );
        }

        let mut removed = Vec::new();
        for (image, force) in targets {
            if self.remove(tasker, &image, force).await? {
                removed.push(image);
            }
        }
        Ok(json!({ "removed": removed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildflow_container::{EngineError, RetryPolicy, testing::FakeEngine};
    use buildflow_core::{BuildConfig, BuildResult, SourceSpec};
    use std::sync::Arc;

    fn plugin(args: Value) -> Box<dyn BuildPlugin> {
        RemoveBuiltImagePlugin::create(args.as_object().unwrap(), &PluginServices::default()).unwrap()
    }

    fn workflow() -> WorkflowData {
        WorkflowData::new(BuildConfig::new("app:1", SourceSpec::path("/src"))).unwrap()
    }

    #[test]
    fn test_defer_removal_deduplicates() {
        let mut workflow = workflow();
        defer_removal(&mut workflow, "quay.io/app:1");
        defer_removal(&mut workflow, "quay.io/app:1");
        defer_removal(&mut workflow, "quay.io/app:latest");
        assert_eq!(deferred_images(&workflow), vec!["quay.io/app:1", "quay.io/app:latest"]);
    }

    #[tokio::test]
    async fn test_removes_built_deferred_and_pulled_images() {
        let engine = Arc::new(FakeEngine::new());
        engine.add_image("app:1", "sha256:built");
        engine.add_image("quay.io/app:1", "sha256:built");
        engine.add_image("fedora:39", "sha256:base");
        let tasker = ContainerTasker::new(engine.clone(), RetryPolicy::none());

        let mut workflow = workflow();
        workflow.set_build_result(BuildResult::success("sha256:built", vec![]));
        workflow.pulled_base_images.insert("fedora:39".to_string());
        defer_removal(&mut workflow, "quay.io/app:1");

        let result = plugin(json!({})).run(&tasker, &mut workflow).await.unwrap();
        assert_eq!(
            result["removed"],
            json!(["quay.io/app:1", "sha256:built", "fedora:39"])
        );
        assert!(!engine.has_image("app:1"));
        assert!(!engine.has_image("fedora:39"));
    }

    #[tokio::test]
    async fn test_keeps_pulled_images_when_asked() {
        let engine = Arc::new(FakeEngine::new());
        engine.add_image("fedora:39", "sha256:base");
        let tasker = ContainerTasker::new(engine.clone(), RetryPolicy::none());

        let mut workflow = workflow();
        workflow.pulled_base_images.insert("fedora:39".to_string());
        let result = plugin(json!({"remove_pulled_base_images": false}))
            .run(&tasker, &mut workflow)
            .await
            .unwrap();
        assert_eq!(result["removed"], json!([]));
        assert!(engine.has_image("fedora:39"));
    }

    #[tokio::test]
    async fn test_client_errors_are_ignored() {
        let engine = Arc::new(FakeEngine::new());
        engine.add_image("fedora:39", "sha256:base");
        engine.fail_next(
            "remove_image",
            EngineError::Api {
                status: 409,
                message: "image is being used by running container".to_string(),
            },
        );
        let tasker = ContainerTasker::new(engine.clone(), RetryPolicy::none());

        let mut workflow = workflow();
        workflow.set_build_result(BuildResult::success("sha256:gone", vec![]));
        workflow.pulled_base_images.insert("fedora:39".to_string());

        let result = plugin(json!({})).run(&tasker, &mut workflow).await.unwrap();
        assert_eq!(result["removed"], json!(["fedora:39"]));
    }

    #[tokio::test]
    async fn test_server_errors_fail_the_plugin() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_next(
            "remove_image",
            EngineError::Api {
                status: 500,
                message: "driver failure".to_string(),
            },
        );
        let tasker = ContainerTasker::new(engine.clone(), RetryPolicy::none());

        let mut workflow = workflow();
        workflow.set_build_result(BuildResult::success("sha256:built", vec![]));
        assert!(plugin(json!({})).run(&tasker, &mut workflow).await.is_err());
    }
}
