//! 公開 API
//!
//! build.json の組み立てと、3通りのビルド方法の入口です。

use crate::env::BuildEnv;
use crate::error::Result;
use crate::outer::{BuildManager, BuildMethod};
use crate::plugins::{docker_api, pull_base_image, tag_and_push};
use crate::workflow::BuildWorkflow;
use buildflow_core::{BuildConfig, BuildResult, PluginConf, SourceSpec};
use serde_json::{Map, Value, json};

/// 標準のプラグイン構成で build.json を組み立てる
pub fn prepare_build_json(
    image: &str,
    source: SourceSpec,
    parent_registry: Option<&str>,
    target_registries: &[String],
    parent_registry_insecure: bool,
    target_registries_insecure: bool,
    dont_pull_base_image: bool,
) -> BuildConfig {
    let mut config = BuildConfig::new(image, source);

    if !dont_pull_base_image {
        let mut pull = PluginConf::new(pull_base_image::KEY);
        if let Some(registry) = parent_registry {
            pull = pull
                .with_arg("parent_registry", json!(registry))
                .with_arg("parent_registry_insecure", json!(parent_registry_insecure));
        }
        config.prebuild_plugins.push(pull);
    }

    config.buildstep_plugins.push(PluginConf::new(docker_api::KEY));

    if !target_registries.is_empty() {
        let registries: Map<String, Value> = target_registries
            .iter()
            .map(|uri| (uri.clone(), json!({ "insecure": target_registries_insecure })))
            .collect();
        config
            .postbuild_plugins
            .push(PluginConf::new(tag_and_push::KEY).with_arg("registries", Value::Object(registries)));
    }

    config
}

/// ビルドルートイメージを保存してプッシュする先
#[derive(Debug, Clone)]
pub struct BuildrootPush {
    pub registry: String,
    pub insecure: bool,
}

/// このプロセスの中でビルド
pub async fn build_image_here(env: &BuildEnv, config: BuildConfig) -> Result<BuildResult> {
    let mut workflow = BuildWorkflow::new(config, env)?;
    workflow.build_docker_image().await
}

/// 特権コンテナの中でビルド
pub async fn build_image_in_privileged_container(
    env: &BuildEnv,
    config: &BuildConfig,
    build_image: &str,
    push_buildroot_to: Option<&BuildrootPush>,
) -> Result<BuildResult> {
    build_in_container(env, BuildMethod::Privileged, config, build_image, push_buildroot_to).await
}

/// ホストのエンジンを使うコンテナの中でビルド
pub async fn build_image_using_hosts_docker(
    env: &BuildEnv,
    config: &BuildConfig,
    build_image: &str,
    push_buildroot_to: Option<&BuildrootPush>,
) -> Result<BuildResult> {
    build_in_container(env, BuildMethod::HostDocker, config, build_image, push_buildroot_to).await
}

async fn build_in_container(
    env: &BuildEnv,
    method: BuildMethod,
    config: &BuildConfig,
    build_image: &str,
    push_buildroot_to: Option<&BuildrootPush>,
) -> Result<BuildResult> {
    let manager = BuildManager::new(env, method, build_image);
    let outer = manager.build(config).await?;

    // 中断されたコンテナは削除済み
    if outer.exit_code.is_some() {
        if let Some(target) = push_buildroot_to {
            let pushed = push_buildroot(&manager, &outer.container_id, config, target).await;
            if let Err(e) = pushed {
                manager.remove_container(&outer.container_id).await;
                return Err(e);
            }
        }
        manager.remove_container(&outer.container_id).await;
    }

    Ok(outer.result)
}

async fn push_buildroot(
    manager: &BuildManager<'_>,
    container_id: &str,
    config: &BuildConfig,
    target: &BuildrootPush,
) -> Result<()> {
    let buildroot = manager.commit_buildroot(container_id, config).await?;
    let pushed = manager
        .push_buildroot(&buildroot, &target.registry, target.insecure)
        .await?;
    tracing::info!("Buildroot pushed to {}", pushed);
    Ok(())
}
