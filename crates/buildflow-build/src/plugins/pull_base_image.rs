//! 親イメージのプル
//!
//! Dockerfile の未解決の親イメージを全てプルし、Dockerfile に書かれた名前で
//! タグ付けし直します。`parent_registry` が指定されている場合、レジストリ無しの
//! 親イメージはそのレジストリから取得し、別のレジストリが明記された親イメージは
//! エラーにします。

use crate::error::{PluginError, PluginResult};
use crate::plugin::{BuildPlugin, FailurePolicy, PluginServices, parse_args};
use async_trait::async_trait;
use buildflow_container::{ContainerTasker, RegistryOptions};
use buildflow_core::{ImageName, WorkflowData};
use serde::Deserialize;
use serde_json::{Map, Value, json};

pub const KEY: &str = "pull_base_image";

#[derive(Debug, Deserialize)]
struct PullBaseImageArgs {
    #[serde(default)]
    parent_registry: Option<String>,
    #[serde(default)]
    parent_registry_insecure: bool,
}

pub struct PullBaseImagePlugin {
    parent_registry: Option<String>,
    registry_options: RegistryOptions,
}

impl PullBaseImagePlugin {
    pub fn create(args: &Map<String, Value>, _services: &PluginServices) -> PluginResult<Box<dyn BuildPlugin>> {
        let parsed: PullBaseImageArgs = parse_args(KEY, args)?;
        Ok(Box::new(Self {
            parent_registry: parsed.parent_registry.filter(|r| !r.is_empty()),
            registry_options: RegistryOptions {
                insecure: parsed.parent_registry_insecure,
                ..Default::default()
            },
        }))
    }

    /// プル元のレジストリを決める
    fn source_registry(&self, image: &ImageName) -> PluginResult<Option<String>> {
        match (&image.registry, &self.parent_registry) {
            (Some(found), Some(expected)) if found != expected => Err(PluginError::failed(format!(
                "registry specified in Dockerfile doesn't match provided one. Dockerfile: '{}', provided: '{}'",
                found, expected
            ))),
            (Some(found), _) => Ok(Some(found.clone())),
            (None, expected) => Ok(expected.clone()),
        }
    }

    /// プルし、見つからなければ `library/` 名前空間で再試行する
    async fn pull(&self, tasker: &ContainerTasker, image: &ImageName) -> PluginResult<ImageName> {
        match tasker.pull_image(image, &self.registry_options).await {
            Ok(_) => Ok(image.clone()),
            Err(err) if image.namespace.is_none() && image.registry.is_some() => {
                let library = ImageName {
                    namespace: Some("library".to_string()),
                    ..image.clone()
                };
                tracing::info!(
                    "Pulling {} failed ({}), trying {}",
                    image,
                    err,
                    library.to_str(true, true, true)
                );
                match tasker.pull_image(&library, &self.registry_options).await {
                    Ok(_) => Ok(library),
                    Err(_) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl BuildPlugin for PullBaseImagePlugin {
    fn key(&self) -> &str {
        KEY
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Fatal
    }

    async fn run(&mut self, tasker: &ContainerTasker, workflow: &mut WorkflowData) -> PluginResult<Value> {
        let pending: Vec<String> = workflow
            .dockerfile_images
            .unresolved()
            .into_iter()
            .map(str::to_string)
            .collect();
        if pending.is_empty() {
            tracing::info!("No parent images to pull");
            return Ok(json!({ "pulled": [] }));
        }

        let mut pulled = Vec::new();
        for original in pending {
            let image = ImageName::parse(&original)?;
            let registry = self.source_registry(&image)?;
            let source = image.with_registry(registry.as_deref());

            let pulled_image = self.pull(tasker, &source).await?;
            let pulled_name = pulled_image.to_str(true, true, true);

            // Dockerfile の FROM がそのまま解決できるように元の名前でもタグ付け
            if image.registry.is_none() {
                tasker.tag_image(&pulled_name, &image, true).await?;
            }

            workflow
                .dockerfile_images
                .set_resolved(&original, pulled_image)?;
            workflow.pulled_base_images.insert(pulled_name.clone());
            pulled.push(pulled_name);
        }

        Ok(json!({ "pulled": pulled }))
    }
}
