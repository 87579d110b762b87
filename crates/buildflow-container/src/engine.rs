//! コンテナエンジンのアダプタインターフェース
//!
//! エンジン実装（bollard / テスト用フェイク）はこのトレイトだけを実装します。
//! リトライ方針はここでは扱わず、[`crate::ContainerTasker`] が持ちます。

use crate::error::Result;
use async_trait::async_trait;
use buildflow_core::ImageName;
use futures_util::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

/// build / pull / push が返す JSON 行の遅延ストリーム
///
/// 一度しか読めず、終端に達したことだけが操作完了の合図になる。
pub type JsonStream = BoxStream<'static, Result<Value>>;

/// コンテナログの遅延ストリーム
pub type TextStream = BoxStream<'static, Result<String>>;

/// イメージビルドの入力
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    /// ビルドコンテキストのディレクトリ
    pub context_dir: PathBuf,
    pub dockerfile: PathBuf,
    pub tag: String,
    pub build_args: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub target: Option<String>,
    pub no_cache: bool,
}

/// コンテナ起動の設定
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub command: Option<Vec<String>>,
    pub env: Vec<String>,
    /// `host:container[:mode]` 形式
    pub binds: Vec<String>,
    pub privileged: bool,
    pub name: Option<String>,
}

/// レジストリ接続の設定
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    pub insecure: bool,
    /// docker 設定ファイル（config.json）のあるディレクトリ
    pub dockercfg_path: Option<PathBuf>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn build_image(&self, request: &BuildRequest) -> Result<JsonStream>;

    async fn pull_image(&self, image: &ImageName, registry: &RegistryOptions) -> Result<JsonStream>;

    async fn push_image(&self, image: &ImageName, registry: &RegistryOptions) -> Result<JsonStream>;

    async fn tag_image(&self, image: &str, target: &ImageName, force: bool) -> Result<()>;

    /// イメージのメタデータ（存在しなければ `EngineError::NotFound`）
    async fn inspect_image(&self, image: &str) -> Result<Value>;

    async fn remove_image(&self, image: &str, force: bool, noprune: bool) -> Result<()>;

    /// コンテナを作成・起動して ID を返す
    async fn run_container(&self, image: &str, options: &RunOptions) -> Result<String>;

    /// コンテナの終了を待って終了コードを返す
    async fn wait_container(&self, container_id: &str) -> Result<i64>;

    async fn container_logs(&self, container_id: &str, follow: bool, stderr: bool) -> Result<TextStream>;

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    /// コンテナをイメージ化して ID を返す
    async fn commit_container(
        &self,
        container_id: &str,
        image: Option<&ImageName>,
        message: Option<&str>,
    ) -> Result<String>;

    async fn info(&self) -> Result<Value>;

    async fn version(&self) -> Result<Value>;
}
