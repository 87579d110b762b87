//! リトライ付きのコンテナエンジンクライアント
//!
//! リトライするのは冪等な操作だけです:
//! - リトライする: pull, push, inspect_image, image_exists, remove_image,
//!   remove_container, logs（一括取得）, info, version
//! - リトライしない: build（ストリーム）, tag, run, wait, commit
//!
//! pull / push はストリームを開いてから読み切るまでを1回の試行とします。
//! ストリーム中のエラー行は `CommandFailed` になり、リトライされません。

use crate::command::{CommandResult, wait_for_command};
use crate::engine::{BuildRequest, ContainerEngine, JsonStream, RegistryOptions, RunOptions, TextStream};
use crate::error::Result;
use crate::retry::RetryPolicy;
use buildflow_core::ImageName;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct ContainerTasker {
    engine: Arc<dyn ContainerEngine>,
    retry: RetryPolicy,
}

impl ContainerTasker {
    pub fn new(engine: Arc<dyn ContainerEngine>, retry: RetryPolicy) -> Self {
        Self { engine, retry }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// イメージをビルドし、ログストリームを返す（呼び出し側が読み切る）
    pub async fn build_image_from_path(&self, request: &BuildRequest) -> Result<JsonStream> {
        tracing::info!(
            "Building {} from {}",
            request.tag,
            request.context_dir.display()
        );
        self.engine.build_image(request).await
    }

    /// イメージをプルし、プルしたイメージ名を返す
    pub async fn pull_image(&self, image: &ImageName, registry: &RegistryOptions) -> Result<String> {
        let name = image.to_str(true, true, true);
        tracing::info!("Pulling image {}", name);
        self.retry
            .run("pull_image", &name, move || async move {
                let stream = self.engine.pull_image(image, registry).await?;
                wait_for_command(stream).await?.into_result()
            })
            .await?;
        Ok(name)
    }

    /// イメージをプッシュし、ログと解析済みの行を返す
    pub async fn push_image(&self, image: &ImageName, registry: &RegistryOptions) -> Result<CommandResult> {
        let name = image.to_str(true, true, true);
        tracing::info!("Pushing image {}", name);
        self.retry
            .run("push_image", &name, move || async move {
                let stream = self.engine.push_image(image, registry).await?;
                wait_for_command(stream).await?.into_result()
            })
            .await
    }

    /// ローカルでタグ付けし、付けた名前を返す（同名なら何もしない）
    pub async fn tag_image(&self, image: &str, target: &ImageName, force: bool) -> Result<String> {
        let target_name = target.to_str(true, true, true);
        if image == target_name {
            tracing::debug!("Image {} already has the requested name", image);
            return Ok(target_name);
        }
        tracing::info!("Tagging {} as {}", image, target_name);
        self.engine.tag_image(image, target, force).await?;
        Ok(target_name)
    }

    /// タグ付けしてプッシュ
    pub async fn tag_and_push_image(
        &self,
        image: &str,
        target: &ImageName,
        registry: &RegistryOptions,
        force: bool,
    ) -> Result<CommandResult> {
        self.tag_image(image, target, force).await?;
        self.push_image(target, registry).await
    }

    pub async fn inspect_image(&self, image: &str) -> Result<Value> {
        self.retry
            .run("inspect_image", image, move || self.engine.inspect_image(image))
            .await
    }

    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn remove_image(&self, image: &str, force: bool, noprune: bool) -> Result<()> {
        tracing::info!("Removing image {}", image);
        self.retry
            .run("remove_image", image, move || {
                self.engine.remove_image(image, force, noprune)
            })
            .await
    }

    pub async fn run(&self, image: &str, options: &RunOptions) -> Result<String> {
        self.engine.run_container(image, options).await
    }

    pub async fn wait(&self, container_id: &str) -> Result<i64> {
        self.engine.wait_container(container_id).await
    }

    /// 追従ログのストリーム
    pub async fn logs_stream(&self, container_id: &str, stderr: bool) -> Result<TextStream> {
        self.engine.container_logs(container_id, true, stderr).await
    }

    /// 現時点までのログを行単位で取得
    pub async fn logs(&self, container_id: &str, stderr: bool) -> Result<Vec<String>> {
        self.retry
            .run("logs", container_id, move || async move {
                let mut stream = self.engine.container_logs(container_id, false, stderr).await?;
                let mut lines = Vec::new();
                while let Some(chunk) = stream.next().await {
                    lines.extend(chunk?.lines().map(str::to_string));
                }
                Ok(lines)
            })
            .await
    }

    pub async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        tracing::info!("Removing container {}", container_id);
        self.retry
            .run("remove_container", container_id, move || {
                self.engine.remove_container(container_id, force)
            })
            .await
    }

    pub async fn commit_container(
        &self,
        container_id: &str,
        image: Option<&ImageName>,
        message: Option<&str>,
    ) -> Result<String> {
        self.engine
            .commit_container(container_id, image, message)
            .await
    }

    pub async fn get_info(&self) -> Result<Value> {
        self.retry.run("info", "", move || self.engine.info()).await
    }

    pub async fn get_version(&self) -> Result<Value> {
        self.retry.run("version", "", move || self.engine.version()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::testing::FakeEngine;
    use serde_json::json;
    use std::time::Duration;

    fn tasker(engine: Arc<FakeEngine>, times: u32) -> ContainerTasker {
        ContainerTasker::new(
            engine,
            RetryPolicy::new(times, Duration::from_millis(10), vec![408, 409, 429]),
        )
    }

    fn image(name: &str) -> ImageName {
        ImageName::parse(name).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_retries_transient_errors() {
        let engine = Arc::new(FakeEngine::default());
        engine.fail_next("pull_image", EngineError::Api { status: 502, message: "bad gateway".into() });
        engine.fail_next("pull_image", EngineError::Connection("reset".into()));

        let pulled = tasker(engine.clone(), 3)
            .pull_image(&image("fedora:39"), &RegistryOptions::default())
            .await
            .unwrap();
        assert_eq!(pulled, "fedora:39");
        assert_eq!(engine.calls("pull_image"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_in_band_error_is_not_retried() {
        let engine = Arc::new(FakeEngine::default());
        engine.set_stream(
            "push_image",
            vec![json!({"status": "Preparing"}), json!({"error": "denied: access forbidden"})],
        );

        let err = tasker(engine.clone(), 3)
            .push_image(&image("registry.local/app:1"), &RegistryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CommandFailed(m) if m.contains("denied")));
        assert_eq!(engine.calls("push_image"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inspect_exhaustion() {
        let engine = Arc::new(FakeEngine::default());
        for _ in 0..3 {
            engine.fail_next("inspect_image", EngineError::Api { status: 500, message: "oops".into() });
        }
        let err = tasker(engine.clone(), 2)
            .inspect_image("app:1")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RetryExhausted { attempts: 3, .. }));
        assert_eq!(engine.calls("inspect_image"), 3);
    }

    #[tokio::test]
    async fn test_image_exists() {
        let engine = Arc::new(FakeEngine::default());
        engine.add_image("app:1", "sha256:aaa");
        let tasker = tasker(engine.clone(), 0);
        assert!(tasker.image_exists("app:1").await.unwrap());
        assert!(!tasker.image_exists("app:2").await.unwrap());
    }

    #[tokio::test]
    async fn test_tag_is_not_retried() {
        let engine = Arc::new(FakeEngine::default());
        engine.fail_next("tag_image", EngineError::Api { status: 500, message: "oops".into() });
        let err = tasker(engine.clone(), 3)
            .tag_image("sha256:aaa", &image("app:1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Api { status: 500, .. }));
        assert_eq!(engine.calls("tag_image"), 1);
    }

    #[tokio::test]
    async fn test_tag_and_push() {
        let engine = Arc::new(FakeEngine::default());
        engine.add_image("app:1", "sha256:aaa");
        engine.set_stream(
            "push_image",
            vec![json!({"status": "1: digest: sha256:bbb size: 1234"})],
        );
        let result = tasker(engine.clone(), 0)
            .tag_and_push_image("app:1", &image("registry.local/app:1"), &RegistryOptions::default(), false)
            .await
            .unwrap();
        assert!(!result.is_failed());
        assert!(engine.has_image("registry.local/app:1"));
    }

    #[tokio::test]
    async fn test_logs_collects_lines() {
        let engine = Arc::new(FakeEngine::default());
        engine.set_logs("c1", vec!["line one\nline two\n", "line three\n"]);
        let lines = tasker(engine, 0).logs("c1", true).await.unwrap();
        assert_eq!(lines, vec!["line one", "line two", "line three"]);
    }
}
