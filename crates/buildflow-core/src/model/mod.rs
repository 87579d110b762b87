//! モデル定義
//!
//! ビルド設定、ビルド結果、タグ付け・プッシュ設定を定義します。

mod build_config;
mod build_result;
mod phase;
mod push_conf;
mod tag_conf;

// Re-exports
pub use build_config::*;
pub use build_result::*;
pub use phase::*;
pub use push_conf::*;
pub use tag_conf::*;
