pub mod auth;
pub mod command;
pub mod context;
pub mod docker;
pub mod engine;
pub mod error;
pub mod retry;
pub mod tasker;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use auth::*;
pub use command::*;
pub use context::*;
pub use docker::*;
pub use engine::*;
pub use error::*;
pub use retry::*;
pub use tasker::*;
