use buildflow_container::EngineError;
use buildflow_core::{CoreError, Phase};
use thiserror::Error;

/// Error raised by a single plugin run.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid plugin arguments: {0}")]
    Args(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PluginError {
    pub fn failed(message: impl Into<String>) -> Self {
        PluginError::Failed(message.into())
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("plugin '{key}' failed in {phase} phase: {message}")]
    Plugin {
        phase: Phase,
        key: String,
        message: String,
    },

    #[error("{} exit plugin(s) failed: {}", .0.len(), join_errors(.0))]
    ExitPlugins(Vec<WorkflowError>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No appropriate build step plugin")]
    NoBuildStep,

    #[error("No image built: {0}")]
    BuildFailed(String),

    #[error("Build image doesn't exist: {0}")]
    MissingBuildImage(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkflowError {
    pub fn plugin(phase: Phase, key: &str, err: &PluginError) -> Self {
        WorkflowError::Plugin {
            phase,
            key: key.to_string(),
            message: err.to_string(),
        }
    }

    /// 失敗したプラグインのキー（プラグイン由来のエラーの場合）
    pub fn plugin_key(&self) -> Option<&str> {
        match self {
            WorkflowError::Plugin { key, .. } => Some(key),
            WorkflowError::ExitPlugins(errors) => errors.first().and_then(|e| e.plugin_key()),
            _ => None,
        }
    }
}

fn join_errors(errors: &[WorkflowError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type PluginResult<T> = std::result::Result<T, PluginError>;
pub type Result<T> = std::result::Result<T, WorkflowError>;
