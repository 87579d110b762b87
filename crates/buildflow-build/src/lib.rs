//! Buildflow image build engine
//!
//! This crate runs a container image build as a sequence of plugin phases,
//! either in the current process or inside a buildroot container, and
//! provides the built-in plugins for pulling parents, building, pushing and
//! cleaning up.

pub mod api;
pub mod env;
pub mod error;
pub mod outer;
pub mod plugin;
pub mod plugins;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod workflow;

pub use api::{
    BuildrootPush, build_image_here, build_image_in_privileged_container, build_image_using_hosts_docker,
    prepare_build_json,
};
pub use env::BuildEnv;
pub use error::{PluginError, PluginResult, Result, WorkflowError};
pub use outer::{BuildManager, BuildMethod, OuterBuild};
pub use plugin::{
    BuildPlugin, BuildStepOutcome, BuildStepPlugin, CleanupTasks, FailurePolicy, InputPlugin, PluginOutcome,
    PluginServices,
};
pub use plugins::orchestrate_build::{WorkerBuildState, WorkerBuildStatus, WorkerBuilder, WorkerRepositories};
pub use progress::BuildProgress;
pub use registry::PluginRegistry;
pub use runner::{BuildStepRunner, PhaseRunner};
pub use workflow::{BuildWorkflow, build_inside, write_results};
