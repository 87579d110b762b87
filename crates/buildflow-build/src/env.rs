//! ビルド実行環境
//!
//! 起動時に一度だけ作り、ワークフローやビルドマネージャに明示的に渡します。

use crate::error::Result;
use crate::plugin::PluginServices;
use crate::registry::PluginRegistry;
use buildflow_config::BuildflowConfig;
use buildflow_container::{ContainerEngine, ContainerTasker, DockerEngine, RegistryAuth, RetryPolicy};
use std::sync::Arc;

#[derive(Clone)]
pub struct BuildEnv {
    pub config: BuildflowConfig,
    pub tasker: ContainerTasker,
    pub registry: Arc<PluginRegistry>,
}

impl BuildEnv {
    /// 設定に従ってコンテナエンジンへ接続
    pub fn connect(config: BuildflowConfig) -> Result<Self> {
        let mut engine = DockerEngine::connect(config.docker_url.as_deref(), config.timeout())?;
        if let Some(dir) = &config.dockercfg_path {
            engine = engine.with_auth(RegistryAuth::from_dockercfg_dir(dir));
        }
        tracing::debug!("Connected to container engine (docker_url = {:?})", config.docker_url);
        Ok(Self::new(config, Arc::new(engine)))
    }

    /// 任意のエンジンで環境を作る（テストではインメモリのエンジンを渡す）
    pub fn new(config: BuildflowConfig, engine: Arc<dyn ContainerEngine>) -> Self {
        let retry = RetryPolicy::new(
            config.retry.times,
            config.retry.backoff_factor(),
            config.retry.statuses.clone(),
        );
        Self {
            config,
            tasker: ContainerTasker::new(engine, retry),
            registry: Arc::new(PluginRegistry::builtin()),
        }
    }

    pub fn with_registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// 組み込みプラグインに外部コラボレータを渡す
    pub fn with_services(self, services: PluginServices) -> Self {
        let registry = (*self.registry).clone().with_services(services);
        self.with_registry(registry)
    }
}

impl std::fmt::Debug for BuildEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildEnv")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
