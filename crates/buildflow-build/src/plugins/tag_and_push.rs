//! ビルドしたイメージのタグ付けとプッシュ
//!
//! タグ設定の全イメージを、設定された全レジストリへプッシュします。
//! タグ設定が空の場合はワークフローのイメージ名を使います。
//! プッシュしたタグは Exit フェーズの `remove_built_image` が削除できるように
//! プラグイン間ワークスペースへ登録します。

use super::remove_built_image;
use crate::error::{PluginError, PluginResult};
use crate::plugin::{BuildPlugin, FailurePolicy, PluginServices, parse_args};
use async_trait::async_trait;
use buildflow_container::{ContainerTasker, RegistryOptions};
use buildflow_core::{WorkflowData, registry_hostname};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::path::PathBuf;

pub const KEY: &str = "tag_and_push";

#[derive(Debug, Default, Clone, Deserialize)]
struct RegistryArgs {
    #[serde(default)]
    insecure: bool,
    #[serde(default)]
    secret: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct TagAndPushArgs {
    /// レジストリ URI -> 接続設定
    #[serde(default)]
    registries: IndexMap<String, RegistryArgs>,
}

pub struct TagAndPushPlugin {
    registries: IndexMap<String, RegistryArgs>,
}

impl TagAndPushPlugin {
    pub fn create(args: &Map<String, Value>, _services: &PluginServices) -> PluginResult<Box<dyn BuildPlugin>> {
        let parsed: TagAndPushArgs = parse_args(KEY, args)?;
        Ok(Box::new(Self {
            registries: parsed.registries,
        }))
    }
}

/// プッシュのステータス行からマニフェストダイジェストを取り出す
///
/// 例: `1: digest: sha256:abcd... size: 1234`
pub fn extract_digest(lines: &[String]) -> Option<String> {
    lines.iter().rev().find_map(|line| {
        let (_, rest) = line.split_once("digest: ")?;
        let digest = rest.split_whitespace().next()?;
        digest.starts_with("sha256:").then(|| digest.to_string())
    })
}

#[async_trait]
impl BuildPlugin for TagAndPushPlugin {
    fn key(&self) -> &str {
        KEY
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Fatal
    }

    async fn run(&mut self, tasker: &ContainerTasker, workflow: &mut WorkflowData) -> PluginResult<Value> {
        let image_id = workflow
            .image_id
            .clone()
            .ok_or_else(|| PluginError::failed("there is no built image to push"))?;
        if workflow.build_result.as_ref().is_some_and(|r| r.is_remote()) {
            return Err(PluginError::failed("remote images are pushed by their workers"));
        }

        if workflow.tag_conf.unique_images.is_empty() {
            let image = workflow.image.to_str(true, true, true);
            workflow.tag_conf.add_unique_image(&image)?;
        }
        let images: Vec<_> = workflow.tag_conf.images().into_iter().cloned().collect();

        let mut pushed = Vec::new();
        for (uri, conf) in &self.registries {
            let hostname = registry_hostname(uri).to_string();
            workflow.push_conf.add_docker_registry(uri, conf.insecure)?;
            let options = RegistryOptions {
                insecure: conf.insecure,
                dockercfg_path: conf.secret.clone(),
            };

            for image in &images {
                let target = image.with_registry(Some(&hostname));
                let command = tasker
                    .tag_and_push_image(&image_id, &target, &options, true)
                    .await?;
                let target_name = target.to_str(true, true, true);

                match extract_digest(command.logs()) {
                    Some(digest) => {
                        tracing::info!("Pushed {} ({})", target_name, digest);
                        if let Some(registry) = workflow.push_conf.registry_mut(&hostname) {
                            registry.digests.insert(target.to_str(false, true, false), digest);
                        }
                    }
                    None => tracing::warn!("No digest reported for {}", target_name),
                }

                remove_built_image::defer_removal(workflow, &target_name);
                pushed.push(target_name);
            }
        }

        Ok(json!(pushed))
    }
}
