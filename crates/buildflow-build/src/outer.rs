//! ビルドルートコンテナを使ったビルド
//!
//! build.json を共有ディレクトリに書き出し、ビルドルートイメージのコンテナに
//! マウントして中でビルドさせます。コンテナは結果を同じディレクトリの
//! results.json に書き出してから終了します。
//!
//! 共有ディレクトリは1回のビルド専用で、成功・失敗・中断のどの経路でも削除されます。

use crate::env::BuildEnv;
use crate::error::{Result, WorkflowError};
use crate::progress::BuildProgress;
use buildflow_container::{ContainerTasker, RegistryOptions, RunOptions};
use buildflow_core::constants::{
    BUILD_JSON, CONTAINER_SHARE_PATH, CONTAINER_SHARE_SOURCE_SUBDIR, DOCKER_SOCKET_PATH, RESULTS_JSON,
};
use buildflow_core::{BuildConfig, BuildResult, ImageName, SourceProvider, registry_hostname};
use futures_util::StreamExt;
use std::future::Future;
use std::path::{Path, PathBuf};

/// ビルドコンテナからエンジンへのアクセス方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMethod {
    /// 特権コンテナの中で独自のエンジンを動かす
    Privileged,
    /// ホストのエンジンのソケットをマウントする
    HostDocker,
}

impl BuildMethod {
    fn binds(&self, share: &Path) -> Vec<String> {
        let mut binds = vec![format!("{}:{}:rw,Z", share.display(), CONTAINER_SHARE_PATH)];
        if *self == BuildMethod::HostDocker {
            binds.push(format!("{0}:{0}:ro", DOCKER_SOCKET_PATH));
        }
        binds
    }
}

/// 外側のビルド1回分の結果
#[derive(Debug)]
pub struct OuterBuild {
    pub result: BuildResult,
    pub container_id: String,
    pub exit_code: Option<i64>,
}

pub struct BuildManager<'a> {
    env: &'a BuildEnv,
    method: BuildMethod,
    build_image: String,
    show_progress: bool,
}

impl<'a> BuildManager<'a> {
    pub fn new(env: &'a BuildEnv, method: BuildMethod, build_image: impl Into<String>) -> Self {
        Self {
            env,
            method,
            build_image: build_image.into(),
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn tasker(&self) -> &ContainerTasker {
        &self.env.tasker
    }

    /// ビルドルートコンテナでビルド（Ctrl-C で中断）
    pub async fn build(&self, config: &BuildConfig) -> Result<OuterBuild> {
        self.build_until(config, interrupted()).await
    }

    pub async fn build_until<F>(&self, config: &BuildConfig, cancel: F) -> Result<OuterBuild>
    where
        F: Future<Output = ()>,
    {
        if !self.tasker().image_exists(&self.build_image).await? {
            return Err(WorkflowError::MissingBuildImage(self.build_image.clone()));
        }

        // drop 時に削除される
        let share = tempfile::Builder::new().prefix("buildflow-share-").tempdir()?;
        stage_build_json(share.path(), config)?;

        let options = RunOptions {
            binds: self.method.binds(share.path()),
            privileged: self.method == BuildMethod::Privileged,
            ..Default::default()
        };
        tracing::info!(
            "Running build container from {} ({:?})",
            self.build_image,
            self.method
        );
        let container_id = self.tasker().run(&self.build_image, &options).await?;
        tracing::debug!("Build container: {}", container_id);

        let progress = if self.show_progress {
            BuildProgress::new(&config.image)
        } else {
            BuildProgress::hidden()
        };

        let mut logs = Vec::new();
        let finished = tokio::select! {
            exit = self.follow(&container_id, &progress, &mut logs) => Some(exit),
            _ = cancel => None,
        };

        // run 以降はどの経路でもコンテナを残さない
        let exit_code = match finished {
            Some(Ok(exit_code)) => exit_code,
            Some(Err(e)) => {
                tracing::error!("Following build container {} failed: {}", container_id, e);
                progress.finish_error(&e.to_string());
                self.remove_container(&container_id).await;
                return Err(e);
            }
            None => {
                tracing::warn!("Build canceled, removing container {}", container_id);
                progress.finish_error("build canceled");
                self.remove_container(&container_id).await;
                return Ok(OuterBuild {
                    result: BuildResult::failed("build canceled", logs),
                    container_id,
                    exit_code: None,
                });
            }
        };
        tracing::info!("Build container exited with {}", exit_code);

        let result = load_results(share.path(), exit_code, logs);
        match result.fail_reason() {
            Some(reason) => progress.finish_error(reason),
            None => progress.finish_success(&config.image),
        }

        Ok(OuterBuild {
            result,
            container_id,
            exit_code: Some(exit_code),
        })
    }

    /// ログを読み切ってから終了コードを待つ
    async fn follow(&self, container_id: &str, progress: &BuildProgress, logs: &mut Vec<String>) -> Result<i64> {
        let mut stream = self.tasker().logs_stream(container_id, true).await?;
        while let Some(chunk) = stream.next().await {
            for line in chunk?.lines() {
                tracing::debug!("[buildroot] {}", line);
                progress.log_line(line);
                logs.push(line.to_string());
            }
        }
        Ok(self.tasker().wait(container_id).await?)
    }

    /// ビルドルートコンテナをイメージとして保存
    ///
    /// 名前は `buildroot-<repo>:<タイムスタンプ>`。
    pub async fn commit_buildroot(&self, container_id: &str, config: &BuildConfig) -> Result<ImageName> {
        let image = ImageName::parse(&config.image)?;
        let buildroot = ImageName {
            registry: None,
            namespace: image.namespace.clone(),
            repo: format!("buildroot-{}", image.repo),
            tag: Some(chrono::Utc::now().format("%Y-%m-%d-%H-%M-%S").to_string()),
        };
        let message = format!("docker build of '{}' ({})", config.image, config.source.uri);
        let image_id = self
            .tasker()
            .commit_container(container_id, Some(&buildroot), Some(&message))
            .await?;
        tracing::info!("Committed build container as {} ({})", buildroot, image_id);
        Ok(buildroot)
    }

    /// 保存したビルドルートイメージをプッシュ
    pub async fn push_buildroot(&self, buildroot: &ImageName, registry: &str, insecure: bool) -> Result<String> {
        let target = buildroot.with_registry(Some(registry_hostname(registry)));
        let options = RegistryOptions {
            insecure,
            dockercfg_path: self.env.config.dockercfg_path.clone(),
        };
        self.tasker()
            .tag_and_push_image(&buildroot.to_str(true, true, true), &target, &options, false)
            .await?;
        Ok(target.to_str(true, true, true))
    }

    pub async fn remove_container(&self, container_id: &str) {
        if let Err(e) = self.tasker().remove_container(container_id, true).await {
            tracing::warn!("Failed to remove build container {}: {}", container_id, e);
        }
    }
}

async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for interrupts: {}", e);
        std::future::pending::<()>().await;
    }
}

/// build.json を共有ディレクトリに書き出す
///
/// ローカルソースは `<share>/source` にコピーし、コンテナ内のパスに書き換える。
pub fn stage_build_json(share: &Path, config: &BuildConfig) -> Result<BuildConfig> {
    let mut staged = config.clone();
    if staged.source.provider == SourceProvider::Path {
        let local = PathBuf::from(
            staged
                .source
                .uri
                .strip_prefix("file://")
                .unwrap_or(&staged.source.uri),
        );
        let dest = share.join(CONTAINER_SHARE_SOURCE_SUBDIR);
        tracing::debug!("Copying {} to {}", local.display(), dest.display());
        copy_dir(&local, &dest)?;
        staged.source.uri = format!("file://{}{}", CONTAINER_SHARE_PATH, CONTAINER_SHARE_SOURCE_SUBDIR);
    }
    staged.write_to(&share.join(BUILD_JSON))?;
    Ok(staged)
}

fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// results.json を読む（無ければコンテナログ付きの失敗結果）
fn load_results(share: &Path, exit_code: i64, logs: Vec<String>) -> BuildResult {
    let path = share.join(RESULTS_JSON);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            tracing::error!("Build container did not write {}: {}", RESULTS_JSON, e);
            return BuildResult::failed(
                format!("build container exited with {} without results", exit_code),
                logs,
            );
        }
    };
    match serde_json::from_str::<BuildResult>(&content) {
        Ok(result) => result,
        Err(e) => BuildResult::failed(format!("invalid {}: {}", RESULTS_JSON, e), logs),
    }
}
