use async_trait::async_trait;
use buildflow_build::{
    BuildEnv, BuildPlugin, BuildStepOutcome, BuildStepPlugin, FailurePolicy, PluginError, PluginRegistry,
    PluginResult, PluginServices,
};
use buildflow_config::BuildflowConfig;
use buildflow_container::ContainerTasker;
use buildflow_container::testing::FakeEngine;
use buildflow_core::{BuildConfig, BuildResult, Phase, SourceSpec, WorkflowData};
use serde_json::{Map, Value};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

/// Dockerfile 入りのソースディレクトリ
pub struct TestSource {
    pub root: TempDir,
}

impl TestSource {
    pub fn new(dockerfile: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("Dockerfile"), dockerfile).unwrap();
        Self { root }
    }

    pub fn config(&self, image: &str) -> BuildConfig {
        BuildConfig::new(image, SourceSpec::path(self.root.path().display().to_string()))
    }
}

/// 引数 `value` を返すか、`error` があれば失敗するプラグイン
///
/// `fatal: true` で致命的な失敗として宣言する。
pub struct EchoPlugin {
    args: Map<String, Value>,
}

pub const ECHO: &str = "echo";

impl EchoPlugin {
    pub fn create(args: &Map<String, Value>, _services: &PluginServices) -> PluginResult<Box<dyn BuildPlugin>> {
        Ok(Box::new(Self { args: args.clone() }))
    }
}

#[async_trait]
impl BuildPlugin for EchoPlugin {
    fn key(&self) -> &str {
        ECHO
    }

    fn failure_policy(&self) -> FailurePolicy {
        match self.args.get("fatal").and_then(Value::as_bool) {
            Some(fatal) => FailurePolicy::from_flag(!fatal),
            None => FailurePolicy::PhaseDefault,
        }
    }

    async fn run(&mut self, _tasker: &ContainerTasker, _workflow: &mut WorkflowData) -> PluginResult<Value> {
        if let Some(message) = self.args.get("error").and_then(Value::as_str) {
            return Err(PluginError::failed(message));
        }
        Ok(self.args.get("value").cloned().unwrap_or(Value::Null))
    }
}

/// 引数で決まった結果を返すビルドステップ
pub struct FixedBuildStep {
    args: Map<String, Value>,
}

pub const FIXED_BUILD: &str = "fixed_build";

impl FixedBuildStep {
    pub fn create(args: &Map<String, Value>, _services: &PluginServices) -> PluginResult<Box<dyn BuildStepPlugin>> {
        Ok(Box::new(Self { args: args.clone() }))
    }
}

#[async_trait]
impl BuildStepPlugin for FixedBuildStep {
    fn key(&self) -> &str {
        FIXED_BUILD
    }

    async fn run(&mut self, _tasker: &ContainerTasker, _workflow: &mut WorkflowData) -> PluginResult<BuildStepOutcome> {
        let logs = vec!["fixed build".to_string()];
        if let Some(reason) = self.args.get("fail_reason").and_then(Value::as_str) {
            return Ok(BuildStepOutcome::Built(BuildResult::failed(reason, logs)));
        }
        let image_id = self.args.get("image_id").and_then(Value::as_str).unwrap_or("sha256:fixed");
        Ok(BuildStepOutcome::Built(BuildResult::success(image_id, logs)))
    }
}

pub fn registry() -> PluginRegistry {
    let mut registry = PluginRegistry::builtin();
    for phase in [Phase::PreBuild, Phase::PrePublish, Phase::PostBuild, Phase::Exit] {
        registry.register(phase, ECHO, EchoPlugin::create);
    }
    registry.register_buildstep(FIXED_BUILD, FixedBuildStep::create);
    registry
}

pub fn env() -> (Arc<FakeEngine>, BuildEnv) {
    let engine = Arc::new(FakeEngine::new());
    let env = BuildEnv::new(BuildflowConfig::default(), engine.clone()).with_registry(registry());
    (engine, env)
}
