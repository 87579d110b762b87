//! フェーズランナー
//!
//! 1フェーズ分のプラグイン設定を先頭から順に実行し、結果を
//! [`WorkflowData`] のフェーズ別結果表に記録します。
//!
//! - 必須プラグインのキーが未登録、または同じキーが2回設定されていれば、
//!   どのプラグインも実行せずに設定エラーで中断する
//! - 失敗が許容されたプラグインのエラーは結果として記録して続行する
//! - 致命的な失敗はそのプラグインとフェーズ名を付けて即座に中断する
//! - exit フェーズだけは全プラグインを実行し、失敗をまとめて最後に返す

use crate::error::{Result, WorkflowError};
use crate::plugin::{BuildStepOutcome, PluginOutcome};
use crate::registry::{BuildPluginFactory, PluginRegistry};
use buildflow_container::ContainerTasker;
use buildflow_core::{BuildResult, Phase, PluginConf, PluginOutput, WorkflowData};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::Instant;

/// ビルドステップが1つも設定されていない場合に使うプラグイン
pub const DEFAULT_BUILDSTEP: &str = "docker_api";

/// 入力フェーズで「使えるものを自動で選ぶ」指定
pub const AUTO_INPUT: &str = "auto";

/// 同一フェーズ内の重複キーを検出
pub fn check_duplicate_keys(phase: Phase, confs: &[PluginConf]) -> Result<()> {
    let mut seen = HashSet::new();
    for conf in confs {
        if !seen.insert(conf.key.as_str()) {
            return Err(WorkflowError::Config(format!(
                "plugin '{}' is configured more than once in {} phase",
                conf.key, phase
            )));
        }
    }
    Ok(())
}

fn translate_args(workflow: &WorkflowData, args: &Map<String, Value>) -> Map<String, Value> {
    match workflow.translate_special_values(&Value::Object(args.clone())) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

struct PlannedPlugin {
    key: String,
    factory: BuildPluginFactory,
    args: Map<String, Value>,
    allowed_to_fail_override: Option<bool>,
}

/// prebuild / prepublish / postbuild / exit のランナー
pub struct PhaseRunner<'a> {
    phase: Phase,
    registry: &'a PluginRegistry,
    tasker: &'a ContainerTasker,
}

impl<'a> PhaseRunner<'a> {
    pub fn new(phase: Phase, registry: &'a PluginRegistry, tasker: &'a ContainerTasker) -> Self {
        Self {
            phase,
            registry,
            tasker,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub async fn run(&self, workflow: &mut WorkflowData) -> Result<()> {
        if matches!(self.phase, Phase::Input | Phase::BuildStep) {
            return Err(WorkflowError::Config(format!(
                "{} phase has its own runner",
                self.phase
            )));
        }

        let confs = workflow.config.plugins(self.phase).to_vec();
        if confs.is_empty() {
            tracing::debug!("No {} plugins configured", self.phase);
            return Ok(());
        }
        tracing::info!("Running {} plugins", self.phase);

        let planned = match self.plan(&confs) {
            Ok(planned) => planned,
            Err(err) => {
                workflow.plugin_failed = true;
                tracing::error!("{}", err);
                return Err(err);
            }
        };

        let keep_going = self.phase == Phase::Exit;
        let mut failures = Vec::new();

        for plan in planned {
            let key = plan.key;
            tracing::info!("Running plugin '{}'", key);
            let started = Instant::now();
            workflow.record_plugin_start(&key);

            let args = translate_args(workflow, &plan.args);
            tracing::debug!("Plugin '{}' args: {}", key, serde_json::Value::Object(args.clone()));

            let (result, allowed_to_fail) = match (plan.factory)(&args, self.registry.services()) {
                Ok(mut plugin) => {
                    let allowed = self.resolve_allowed_to_fail(
                        plugin.failure_policy().allows_failure(self.phase),
                        plan.allowed_to_fail_override,
                    );
                    (plugin.run(self.tasker, workflow).await, allowed)
                }
                // 引数エラーはプラグイン自身の宣言を待たずに致命的扱い
                Err(err) => (
                    Err(err),
                    self.resolve_allowed_to_fail(false, plan.allowed_to_fail_override),
                ),
            };

            let seconds = started.elapsed().as_secs_f64();
            tracing::debug!("Plugin '{}' finished in {:.2}s", key, seconds);
            workflow.record_plugin_duration(&key, seconds);

            match PluginOutcome::classify(result, allowed_to_fail) {
                PluginOutcome::Ok(value) => {
                    record(workflow, self.phase, &key, PluginOutput::Value(value));
                }
                PluginOutcome::Recoverable(err) => {
                    tracing::warn!(
                        "Plugin '{}' raised an error, error is not fatal, continuing: {}",
                        key,
                        err
                    );
                    record(workflow, self.phase, &key, PluginOutput::Error(err.to_string()));
                }
                PluginOutcome::Fatal(err) => {
                    workflow.plugin_failed = true;
                    workflow.record_plugin_error(&key, &err.to_string());
                    let wrapped = WorkflowError::plugin(self.phase, &key, &err);
                    if !keep_going {
                        tracing::error!("{}", wrapped);
                        return Err(wrapped);
                    }
                    tracing::warn!("{}; continuing with remaining exit plugins", wrapped);
                    record(workflow, self.phase, &key, PluginOutput::Error(err.to_string()));
                    failures.push(wrapped);
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::ExitPlugins(failures))
        }
    }

    /// 実行前に全設定を検証し、実行可能なプラグインを並べる
    fn plan(&self, confs: &[PluginConf]) -> Result<Vec<PlannedPlugin>> {
        check_duplicate_keys(self.phase, confs)?;

        let mut planned = Vec::with_capacity(confs.len());
        for conf in confs {
            let Some(factory) = self.registry.build_plugin(self.phase, &conf.key) else {
                if conf.required {
                    return Err(WorkflowError::Config(format!(
                        "no such plugin: '{}', did you set the correct plugin type? (phase: {})",
                        conf.key, self.phase
                    )));
                }
                tracing::warn!("Plugin '{}' requested but not available", conf.key);
                continue;
            };

            if conf.is_allowed_to_fail.is_some() && self.phase != Phase::Exit {
                tracing::warn!(
                    "is_allowed_to_fail of '{}' is ignored outside the exit phase",
                    conf.key
                );
            }
            planned.push(PlannedPlugin {
                key: conf.key.clone(),
                factory,
                args: conf.args.clone(),
                allowed_to_fail_override: conf.is_allowed_to_fail,
            });
        }
        Ok(planned)
    }

    fn resolve_allowed_to_fail(&self, declared: bool, override_flag: Option<bool>) -> bool {
        match override_flag {
            Some(flag) if self.phase == Phase::Exit => flag,
            _ => declared,
        }
    }
}

fn record(workflow: &mut WorkflowData, phase: Phase, key: &str, output: PluginOutput) {
    if let Some(results) = workflow.results_mut(phase) {
        results.insert(key.to_string(), output);
    }
}

/// ビルドステップのランナー
///
/// 設定順に試し、最初にビルドを担当したプラグインの結果を返す。
/// 未登録のキーは警告して飛ばし、失敗は常に致命的。
pub struct BuildStepRunner<'a> {
    registry: &'a PluginRegistry,
    tasker: &'a ContainerTasker,
}

impl<'a> BuildStepRunner<'a> {
    pub fn new(registry: &'a PluginRegistry, tasker: &'a ContainerTasker) -> Self {
        Self { registry, tasker }
    }

    pub async fn run(&self, workflow: &mut WorkflowData) -> Result<BuildResult> {
        let mut confs = workflow.config.plugins(Phase::BuildStep).to_vec();
        if confs.is_empty() {
            tracing::debug!("No build step configured, using '{}'", DEFAULT_BUILDSTEP);
            confs.push(PluginConf::new(DEFAULT_BUILDSTEP));
        }
        check_duplicate_keys(Phase::BuildStep, &confs).inspect_err(|_| {
            workflow.plugin_failed = true;
        })?;

        tracing::info!("Building image {} inside current environment", workflow.image);
        if let Some(path) = &workflow.dockerfile_path {
            tracing::debug!("Using Dockerfile {}", path.display());
        }

        for conf in confs {
            let key = conf.key;
            if conf.is_allowed_to_fail == Some(true) {
                tracing::warn!("Build step plugin '{}' is never allowed to fail", key);
            }
            let Some(factory) = self.registry.buildstep(&key) else {
                tracing::warn!("Build step plugin '{}' requested but not available", key);
                continue;
            };

            tracing::info!("Running plugin '{}'", key);
            let started = Instant::now();
            workflow.record_plugin_start(&key);
            let args = translate_args(workflow, &conf.args);

            let outcome = match factory(&args, self.registry.services()) {
                Ok(mut plugin) => plugin.run(self.tasker, workflow).await,
                Err(err) => Err(err),
            };

            let seconds = started.elapsed().as_secs_f64();
            tracing::debug!("Plugin '{}' finished in {:.2}s", key, seconds);
            workflow.record_plugin_duration(&key, seconds);

            match outcome {
                Ok(BuildStepOutcome::Built(result)) => {
                    if let Some(reason) = result.fail_reason() {
                        tracing::error!("Build step plugin '{}' failed: {}", key, reason);
                        workflow.plugin_failed = true;
                        workflow.record_plugin_error(&key, reason);
                    }
                    return Ok(result);
                }
                Ok(BuildStepOutcome::Inappropriate(reason)) => {
                    tracing::debug!("Build step '{}' is not appropriate: {}", key, reason);
                }
                Err(err) => {
                    workflow.plugin_failed = true;
                    workflow.record_plugin_error(&key, &err.to_string());
                    let wrapped = WorkflowError::plugin(Phase::BuildStep, &key, &err);
                    tracing::error!("{}", wrapped);
                    return Err(wrapped);
                }
            }
        }

        workflow.plugin_failed = true;
        workflow.record_plugin_error(Phase::BuildStep.as_str(), "no appropriate build step");
        Err(WorkflowError::NoBuildStep)
    }
}

/// 入力プラグインを1つ実行して build.json の内容を得る
///
/// `key` が `auto` の場合は、現在の環境で使える最初の入力プラグインを選ぶ。
pub async fn run_input(registry: &PluginRegistry, key: &str, args: &Map<String, Value>) -> Result<Value> {
    let (key, entry) = if key == AUTO_INPUT {
        registry
            .autousable_input()
            .ok_or_else(|| WorkflowError::Config("no autousable input plugin".to_string()))?
    } else {
        let entry = registry
            .input(key)
            .ok_or_else(|| WorkflowError::Config(format!("no such input plugin: '{}'", key)))?;
        (key, entry)
    };

    tracing::info!("Running input plugin '{}'", key);
    let mut plugin = (entry.factory)(args).map_err(|e| WorkflowError::plugin(Phase::Input, key, &e))?;
    let value = plugin
        .run()
        .await
        .map_err(|e| WorkflowError::plugin(Phase::Input, key, &e))?;
    tracing::debug!("Build json: {}", value);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PluginError, PluginResult};
    use crate::plugin::{BuildPlugin, BuildStepPlugin, FailurePolicy, PluginServices};
    use async_trait::async_trait;
    use buildflow_container::{RetryPolicy, testing::FakeEngine};
    use buildflow_core::{BuildConfig, SourceSpec};
    use serde_json::json;
    use std::sync::Arc;

    /// 引数に従って成功・失敗し、実行順を plugin_workspace に残すテスト用プラグイン
    struct Recorder {
        key: String,
        fail: bool,
        policy: FailurePolicy,
    }

    #[async_trait]
    impl BuildPlugin for Recorder {
        fn key(&self) -> &str {
            &self.key
        }

        fn failure_policy(&self) -> FailurePolicy {
            self.policy
        }

        async fn run(&mut self, _tasker: &ContainerTasker, workflow: &mut WorkflowData) -> PluginResult<Value> {
            let seen: Vec<Value> = workflow
                .plugin_workspace
                .get("order")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let mut order = seen.clone();
            order.push(json!(self.key));
            workflow
                .plugin_workspace
                .insert("order".to_string(), Value::Array(order));
            if self.fail {
                return Err(PluginError::failed(format!("{} exploded", self.key)));
            }
            Ok(json!({ "seen": seen }))
        }
    }

    fn recorder(args: &Map<String, Value>, _services: &PluginServices) -> PluginResult<Box<dyn BuildPlugin>> {
        let key = args
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("recorder")
            .to_string();
        let policy = match args.get("allowed_to_fail").and_then(Value::as_bool) {
            Some(flag) => FailurePolicy::from_flag(flag),
            None => FailurePolicy::PhaseDefault,
        };
        Ok(Box::new(Recorder {
            key,
            fail: args.get("fail").and_then(Value::as_bool).unwrap_or(false),
            policy,
        }))
    }

    struct FixedBuild(Option<&'static str>);

    #[async_trait]
    impl BuildStepPlugin for FixedBuild {
        fn key(&self) -> &str {
            "fixed"
        }

        async fn run(&mut self, _t: &ContainerTasker, _w: &mut WorkflowData) -> PluginResult<BuildStepOutcome> {
            Ok(match self.0 {
                Some(id) => BuildStepOutcome::Built(BuildResult::success(id, vec![])),
                None => BuildStepOutcome::Inappropriate("not for this build".to_string()),
            })
        }
    }

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        for phase in [Phase::PreBuild, Phase::PostBuild, Phase::Exit] {
            for key in ["a", "b", "c"] {
                registry.register(phase, key, recorder);
            }
        }
        registry.register_buildstep("skip", |_, _| Ok(Box::new(FixedBuild(None))));
        registry.register_buildstep("fixed", |_, _| Ok(Box::new(FixedBuild(Some("sha256:abc123")))));
        registry.register_buildstep("broken", |_, _| Err(PluginError::Args("bad".to_string())));
        registry
    }

    fn tasker() -> ContainerTasker {
        ContainerTasker::new(Arc::new(FakeEngine::new()), RetryPolicy::none())
    }

    fn conf(key: &str, extra: Value) -> PluginConf {
        let mut args = extra.as_object().cloned().unwrap_or_default();
        args.insert("name".to_string(), json!(key));
        PluginConf::new(key).with_args(args)
    }

    fn workflow(phase: Phase, plugins: Vec<PluginConf>) -> (tempfile::TempDir, WorkflowData) {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        let mut config = BuildConfig::new(
            "app:1",
            SourceSpec::path(src.path().display().to_string()),
        );
        if let Some(list) = config.plugins_mut(phase) {
            *list = plugins;
        }
        (src, WorkflowData::new(config).unwrap())
    }

    fn keys(workflow: &WorkflowData, phase: Phase) -> Vec<String> {
        workflow.results(phase).unwrap().keys().cloned().collect()
    }

    #[tokio::test]
    async fn test_allowed_to_fail_plugin_continues() {
        let (_src, mut wf) = workflow(
            Phase::PreBuild,
            vec![
                conf("a", json!({})),
                conf("b", json!({"fail": true, "allowed_to_fail": true})),
                conf("c", json!({})),
            ],
        );
        let (registry, tasker) = (registry(), tasker());
        PhaseRunner::new(Phase::PreBuild, &registry, &tasker)
            .run(&mut wf)
            .await
            .unwrap();

        assert_eq!(keys(&wf, Phase::PreBuild), vec!["a", "b", "c"]);
        assert!(wf.prebuild_results["b"].is_error());
        // c は a の変更を観測している
        assert_eq!(
            wf.prebuild_results["c"].value().unwrap()["seen"],
            json!(["a", "b"])
        );
        assert!(!wf.plugin_failed);
    }

    #[tokio::test]
    async fn test_fatal_plugin_aborts_phase() {
        let (_src, mut wf) = workflow(
            Phase::PreBuild,
            vec![
                conf("a", json!({})),
                conf("b", json!({"fail": true})),
                conf("c", json!({})),
            ],
        );
        let (registry, tasker) = (registry(), tasker());
        let err = PhaseRunner::new(Phase::PreBuild, &registry, &tasker)
            .run(&mut wf)
            .await
            .unwrap_err();

        assert_eq!(keys(&wf, Phase::PreBuild), vec!["a"]);
        match err {
            WorkflowError::Plugin { phase, key, message } => {
                assert_eq!(phase, Phase::PreBuild);
                assert_eq!(key, "b");
                assert!(message.contains("b exploded"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(wf.plugin_failed);
        assert!(wf.plugins_errors.contains_key("b"));
    }

    #[tokio::test]
    async fn test_exit_phase_runs_every_plugin() {
        let (_src, mut wf) = workflow(
            Phase::Exit,
            vec![
                conf("a", json!({})),
                conf("b", json!({"fail": true, "allowed_to_fail": false})),
                conf("c", json!({})),
            ],
        );
        let (registry, tasker) = (registry(), tasker());
        let err = PhaseRunner::new(Phase::Exit, &registry, &tasker)
            .run(&mut wf)
            .await
            .unwrap_err();

        assert_eq!(keys(&wf, Phase::Exit), vec!["a", "b", "c"]);
        match &err {
            WorkflowError::ExitPlugins(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(err.plugin_key(), Some("b"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exit_override_is_honoured() {
        let mut failing = conf("b", json!({"fail": true, "allowed_to_fail": false}));
        failing.is_allowed_to_fail = Some(true);
        let (_src, mut wf) = workflow(Phase::Exit, vec![conf("a", json!({})), failing]);
        let (registry, tasker) = (registry(), tasker());
        PhaseRunner::new(Phase::Exit, &registry, &tasker)
            .run(&mut wf)
            .await
            .unwrap();
        assert!(wf.exit_results["b"].is_error());
    }

    #[tokio::test]
    async fn test_override_ignored_outside_exit() {
        let mut failing = conf("b", json!({"fail": true}));
        failing.is_allowed_to_fail = Some(true);
        let (_src, mut wf) = workflow(Phase::PreBuild, vec![failing]);
        let (registry, tasker) = (registry(), tasker());
        assert!(
            PhaseRunner::new(Phase::PreBuild, &registry, &tasker)
                .run(&mut wf)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_duplicate_keys_rejected_before_running() {
        let (_src, mut wf) = workflow(
            Phase::PostBuild,
            vec![conf("a", json!({})), conf("b", json!({})), conf("a", json!({}))],
        );
        let (registry, tasker) = (registry(), tasker());
        let err = PhaseRunner::new(Phase::PostBuild, &registry, &tasker)
            .run(&mut wf)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Config(m) if m.contains("'a'")));
        assert!(wf.postbuild_results.is_empty());
        assert!(wf.plugin_workspace.get("order").is_none());
    }

    #[tokio::test]
    async fn test_unknown_plugin() {
        let (registry, tasker) = (registry(), tasker());

        let (_src, mut wf) = workflow(Phase::PreBuild, vec![conf("a", json!({})), conf("nope", json!({}))]);
        let err = PhaseRunner::new(Phase::PreBuild, &registry, &tasker)
            .run(&mut wf)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Config(m) if m.contains("nope")));
        // 検証は実行前に行われる
        assert!(wf.prebuild_results.is_empty());

        let (_src, mut wf) = workflow(
            Phase::PreBuild,
            vec![conf("nope", json!({})).optional(), conf("a", json!({}))],
        );
        PhaseRunner::new(Phase::PreBuild, &registry, &tasker)
            .run(&mut wf)
            .await
            .unwrap();
        assert_eq!(keys(&wf, Phase::PreBuild), vec!["a"]);
    }

    #[tokio::test]
    async fn test_special_values_are_translated() {
        let (_src, mut wf) = workflow(
            Phase::PostBuild,
            vec![conf("a", json!({"image": "BUILT_IMAGE_ID"}))],
        );
        wf.set_build_result(BuildResult::success("sha256:feed", vec![]));

        let mut registry = PluginRegistry::new();
        registry.register(Phase::PostBuild, "a", |args, _| {
            let image = args.get("image").cloned().unwrap_or(Value::Null);
            struct Echo(Value);
            #[async_trait]
            impl BuildPlugin for Echo {
                fn key(&self) -> &str {
                    "a"
                }
                async fn run(&mut self, _t: &ContainerTasker, _w: &mut WorkflowData) -> PluginResult<Value> {
                    Ok(self.0.clone())
                }
            }
            Ok(Box::new(Echo(image)))
        });
        let tasker = tasker();
        PhaseRunner::new(Phase::PostBuild, &registry, &tasker)
            .run(&mut wf)
            .await
            .unwrap();
        assert_eq!(wf.postbuild_results["a"], PluginOutput::Value(json!("sha256:feed")));
    }

    #[tokio::test]
    async fn test_buildstep_picks_first_appropriate() {
        let (registry, tasker) = (registry(), tasker());
        let (_src, mut wf) = workflow(
            Phase::BuildStep,
            vec![
                PluginConf::new("missing"),
                PluginConf::new("skip"),
                PluginConf::new("fixed"),
                PluginConf::new("broken"),
            ],
        );
        let result = BuildStepRunner::new(&registry, &tasker).run(&mut wf).await.unwrap();
        assert_eq!(result.image_id(), Some("sha256:abc123"));
        assert!(wf.plugins_durations.contains_key("fixed"));
        assert!(!wf.plugins_durations.contains_key("broken"));
    }

    #[tokio::test]
    async fn test_buildstep_without_appropriate_plugin() {
        let (registry, tasker) = (registry(), tasker());
        let (_src, mut wf) = workflow(Phase::BuildStep, vec![PluginConf::new("skip")]);
        let err = BuildStepRunner::new(&registry, &tasker).run(&mut wf).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NoBuildStep));
        assert!(wf.plugin_failed);

        let (_src, mut wf) = workflow(Phase::BuildStep, vec![PluginConf::new("broken")]);
        let err = BuildStepRunner::new(&registry, &tasker).run(&mut wf).await.unwrap_err();
        assert_eq!(err.plugin_key(), Some("broken"));
    }

    #[tokio::test]
    async fn test_run_input_unknown() {
        let registry = PluginRegistry::builtin();
        let err = run_input(&registry, "carrier-pigeon", &Map::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Config(_)));
    }
}
