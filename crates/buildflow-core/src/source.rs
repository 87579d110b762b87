//! ビルドソースの取得
//!
//! git リポジトリのクローン、またはローカルパスの参照を行います。

use crate::constants::{DOCKERFILE_FILENAME, GIT_BACKOFF_FACTOR_MS, GIT_MAX_RETRIES};
use crate::error::{CoreError, Result};
use crate::model::{SourceProvider, SourceSpec};
use crate::retry::Backoff;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// 取得済み（または取得予定）のビルドソース
#[derive(Debug, Clone)]
pub struct Source {
    spec: SourceSpec,
    path: PathBuf,
    fetched: bool,
    commit_id: Option<String>,
    backoff: Backoff,
}

impl Source {
    /// `workdir` は git ソースのクローン先の親ディレクトリ
    pub fn new(spec: SourceSpec, workdir: &Path) -> Self {
        let path = match spec.provider {
            SourceProvider::Path => PathBuf::from(strip_file_scheme(&spec.uri)),
            SourceProvider::Git => workdir.join(repo_dir_name(&spec.uri)),
        };
        Self {
            spec,
            path,
            fetched: false,
            commit_id: None,
            backoff: Backoff::new(GIT_MAX_RETRIES, GIT_BACKOFF_FACTOR_MS),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    /// ソースのルートディレクトリ（取得前でも確定している）
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn commit_id(&self) -> Option<&str> {
        self.commit_id.as_deref()
    }

    /// ソースを取得してルートディレクトリを返す（2回目以降は何もしない）
    ///
    /// 途中で drop された場合、実行中の git は kill される。
    pub async fn get(&mut self) -> Result<&Path> {
        if !self.fetched {
            match self.spec.provider {
                SourceProvider::Path => {
                    if !self.path.is_dir() {
                        return Err(self.error(format!(
                            "ディレクトリが存在しません: {}",
                            self.path.display()
                        )));
                    }
                }
                SourceProvider::Git => self.clone_git_repo().await?,
            }
            self.fetched = true;
        }
        Ok(&self.path)
    }

    /// Dockerfile のパスとビルドディレクトリを返す
    pub fn dockerfile_path(&self) -> Result<(PathBuf, PathBuf)> {
        let base = match &self.spec.dockerfile_path {
            Some(rel) => self.path.join(rel),
            None => self.path.clone(),
        };
        if base.is_file() {
            let build_dir = base.parent().map(Path::to_path_buf).unwrap_or_default();
            return Ok((base, build_dir));
        }
        let dockerfile = base.join(DOCKERFILE_FILENAME);
        if dockerfile.is_file() {
            Ok((dockerfile, base))
        } else {
            Err(CoreError::DockerfileNotFound(dockerfile))
        }
    }

    async fn clone_git_repo(&mut self) -> Result<()> {
        let uri = self.spec.uri.clone();
        let target = self.path.clone();
        let dest = target.to_string_lossy().into_owned();
        tracing::info!("Cloning git repository {} into {}", uri, dest);

        let (uri_ref, target_ref, dest_ref) = (uri.as_str(), target.as_path(), dest.as_str());
        self.backoff
            .retry(
                "git clone",
                |_: &CoreError| true,
                move || async move {
                    // 失敗した試行の残骸を消してから再クローン
                    if target_ref.exists() {
                        tokio::fs::remove_dir_all(target_ref).await?;
                    }
                    run_git(None, &["clone", uri_ref, dest_ref], uri_ref).await
                },
            )
            .await
            .map_err(|failure| failure.error)?;

        if let Some(commit) = self.spec.git_commit() {
            run_git(Some(&target), &["reset", "--hard", commit], &uri).await?;
        }
        let head = run_git(Some(&target), &["rev-parse", "HEAD"], &uri).await?;
        tracing::debug!("Checked out commit {}", head);
        self.commit_id = Some(head);
        Ok(())
    }

    fn error(&self, message: String) -> CoreError {
        CoreError::Source {
            uri: self.spec.uri.clone(),
            message,
        }
    }
}

async fn run_git(cwd: Option<&Path>, args: &[&str], uri: &str) -> Result<String> {
    let mut cmd = Command::new("git");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let output = cmd.args(args).kill_on_drop(true).output().await.map_err(|e| CoreError::Source {
        uri: uri.to_string(),
        message: format!("git を実行できません: {}", e),
    })?;
    if !output.status.success() {
        return Err(CoreError::Source {
            uri: uri.to_string(),
            message: format!(
                "git {} が失敗しました: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn strip_file_scheme(uri: &str) -> &str {
    uri.strip_prefix("file://").unwrap_or(uri)
}

/// `https://host/org/app.git` -> `app`
fn repo_dir_name(uri: &str) -> String {
    let name = uri
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git");
    if name.is_empty() {
        "source".to_string()
    } else {
        name.to_string()
    }
}
