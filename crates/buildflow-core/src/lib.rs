//! Buildflow コアライブラリ
//!
//! イメージ名、Dockerfile のステージグラフ、ビルド設定（build.json）、
//! ビルド結果、そしてプラグインが共有するワークフロー状態を提供します。

pub mod constants;
pub mod dockerfile;
pub mod error;
pub mod image;
pub mod model;
pub mod retry;
pub mod source;
pub mod substitution;
pub mod workflow;

pub use dockerfile::{DockerfileImages, DockerfileStage, ParsedDockerfile, parse_dockerfile};
pub use error::{CoreError, Result};
pub use image::ImageName;
pub use model::*;
pub use retry::{Backoff, RetryFailure};
pub use source::Source;
pub use substitution::{apply_substitutions, parse_key_values};
pub use workflow::{PhaseResults, PluginOutput, WorkflowData};
