//! プラグインレジストリ
//!
//! プラグインキーからコンストラクタへの静的な対応表です。
//! 組み込みプラグインは [`PluginRegistry::builtin`] で登録され、
//! 追加のプラグインは `register_*` で明示的に登録します。

use crate::error::PluginResult;
use crate::plugin::{BuildPlugin, BuildStepPlugin, InputPlugin, PluginServices};
use crate::plugins;
use buildflow_core::Phase;
use indexmap::IndexMap;
use serde_json::{Map, Value};

pub type InputFactory = fn(&Map<String, Value>) -> PluginResult<Box<dyn InputPlugin>>;
pub type BuildPluginFactory =
    fn(&Map<String, Value>, &PluginServices) -> PluginResult<Box<dyn BuildPlugin>>;
pub type BuildStepFactory =
    fn(&Map<String, Value>, &PluginServices) -> PluginResult<Box<dyn BuildStepPlugin>>;

/// `auto` 入力で使えるかどうかの判定
pub type AutousableCheck = fn() -> bool;

#[derive(Clone, Copy)]
pub struct InputEntry {
    pub factory: InputFactory,
    pub is_autousable: AutousableCheck,
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    input: IndexMap<String, InputEntry>,
    build: IndexMap<(Phase, String), BuildPluginFactory>,
    buildstep: IndexMap<String, BuildStepFactory>,
    services: PluginServices,
}

impl PluginRegistry {
    /// 空のレジストリ
    pub fn new() -> Self {
        Self::default()
    }

    /// 組み込みプラグインを登録したレジストリ
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        plugins::register_builtin(&mut registry);
        registry
    }

    pub fn with_services(mut self, services: PluginServices) -> Self {
        self.services = services;
        self
    }

    pub fn services(&self) -> &PluginServices {
        &self.services
    }

    pub fn register_input(&mut self, key: &str, factory: InputFactory, is_autousable: AutousableCheck) {
        self.input.insert(
            key.to_string(),
            InputEntry {
                factory,
                is_autousable,
            },
        );
    }

    /// prebuild / prepublish / postbuild / exit プラグインを登録
    ///
    /// 同じキーでも別フェーズなら別のプラグインとして扱う。
    pub fn register(&mut self, phase: Phase, key: &str, factory: BuildPluginFactory) {
        debug_assert!(!matches!(phase, Phase::Input | Phase::BuildStep));
        self.build.insert((phase, key.to_string()), factory);
    }

    pub fn register_buildstep(&mut self, key: &str, factory: BuildStepFactory) {
        self.buildstep.insert(key.to_string(), factory);
    }

    pub fn input(&self, key: &str) -> Option<&InputEntry> {
        self.input.get(key)
    }

    /// 登録順で最初に `auto` 入力として使えるもの
    pub fn autousable_input(&self) -> Option<(&str, &InputEntry)> {
        self.input
            .iter()
            .find(|(_, entry)| (entry.is_autousable)())
            .map(|(key, entry)| (key.as_str(), entry))
    }

    pub fn build_plugin(&self, phase: Phase, key: &str) -> Option<BuildPluginFactory> {
        self.build.get(&(phase, key.to_string())).copied()
    }

    pub fn buildstep(&self, key: &str) -> Option<BuildStepFactory> {
        self.buildstep.get(key).copied()
    }

    /// フェーズに登録されているプラグインキー
    pub fn keys(&self, phase: Phase) -> Vec<&str> {
        match phase {
            Phase::Input => self.input.keys().map(String::as_str).collect(),
            Phase::BuildStep => self.buildstep.keys().map(String::as_str).collect(),
            _ => self
                .build
                .keys()
                .filter(|(p, _)| *p == phase)
                .map(|(_, k)| k.as_str())
                .collect(),
        }
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("PluginRegistry");
        for phase in Phase::ALL {
            dbg.field(phase.as_str(), &self.keys(phase));
        }
        dbg.finish()
    }
}
