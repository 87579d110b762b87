//! bollard による ContainerEngine 実装

// Bollard 0.19.4 の非推奨APIを一時的に使用
#![allow(deprecated)]

use crate::auth::RegistryAuth;
use crate::context::BuildContext;
use crate::engine::{BuildRequest, ContainerEngine, JsonStream, RegistryOptions, RunOptions, TextStream};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{Config, CreateContainerOptions, LogsOptions};
use bollard::image::{BuildImageOptions, CommitContainerOptions, CreateImageOptions, PushImageOptions, TagImageOptions};
use bollard::models::{BuildInfo, HostConfig};
use buildflow_core::ImageName;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use http_body_util::{Either, Full};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::sync::mpsc;

/// ストリーム転送用チャネルの容量
const STREAM_BUFFER: usize = 64;

pub struct DockerEngine {
    docker: Docker,
    auth: RegistryAuth,
}

impl DockerEngine {
    /// エンジンに接続
    ///
    /// `docker_url` 未指定時は DOCKER_HOST / ローカルソケットの既定値を使う。
    pub fn connect(docker_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let secs = timeout.as_secs();
        let docker = match docker_url {
            Some(url) if url.starts_with("unix://") || url.starts_with('/') => {
                Docker::connect_with_socket(url, secs, bollard::API_DEFAULT_VERSION)?
            }
            Some(url) => Docker::connect_with_http(url, secs, bollard::API_DEFAULT_VERSION)?,
            None => Docker::connect_with_local_defaults()?.with_timeout(timeout),
        };
        Ok(Self {
            docker,
            auth: RegistryAuth::new(),
        })
    }

    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = auth;
        self
    }

    fn credentials(&self, image: &ImageName, registry: &RegistryOptions) -> Result<Option<DockerCredentials>> {
        match &registry.dockercfg_path {
            Some(dir) => RegistryAuth::from_dockercfg_dir(dir).get_credentials(image),
            None => self.auth.get_credentials(image),
        }
    }
}

/// bollard のストリームを読み、JSON 行としてチャネルへ流す
///
/// ストリーム中のエラー行（DockerStreamError）は転送エラーではなく `{"error": ...}` 行にする。
async fn forward<S, I, F>(stream: S, tx: mpsc::Sender<Result<Value>>, to_json: F)
where
    S: Stream<Item = std::result::Result<I, bollard::errors::Error>>,
    F: Fn(I) -> Result<Value>,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(item) = stream.next().await {
        let item = match item {
            Ok(info) => to_json(info),
            Err(bollard::errors::Error::DockerStreamError { error }) => {
                Ok(json!({ "error": error, "errorDetail": { "message": error } }))
            }
            Err(e) => Err(EngineError::from(e)),
        };
        if tx.send(item).await.is_err() {
            // 受信側が破棄された
            break;
        }
    }
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// BuildInfo は Serialize を実装しないので、読む側が使うフィールドだけ JSON 行にする
fn build_info_json(info: BuildInfo) -> Result<Value> {
    let mut line = Map::new();
    if let Some(stream) = info.stream {
        line.insert("stream".to_string(), json!(stream));
    }
    if let Some(status) = info.status {
        line.insert("status".to_string(), json!(status));
    }
    if let Some(progress) = info.progress {
        line.insert("progress".to_string(), json!(progress));
    }
    if let Some(error) = info.error {
        line.insert("error".to_string(), json!(error));
    }
    if let Some(detail) = info.error_detail {
        line.insert("errorDetail".to_string(), json!({ "message": detail.message }));
    }
    Ok(Value::Object(line))
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build_image(&self, request: &BuildRequest) -> Result<JsonStream> {
        tracing::info!("Building image: {}", request.tag);
        let context = BuildContext::create(&request.context_dir, &request.dockerfile)?;

        let options = BuildImageOptions::<String> {
            dockerfile: context.dockerfile,
            t: request.tag.clone(),
            buildargs: request.build_args.clone(),
            labels: request.labels.clone(),
            target: request.target.clone().unwrap_or_default(),
            nocache: request.no_cache,
            rm: true,
            forcerm: true,
            ..Default::default()
        };
        tracing::debug!("Build options: {:?}", options);

        let body = Full::new(Bytes::from(context.archive));
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let stream = docker.build_image(options, None, Some(Either::Left(body)));
            forward(stream, tx, build_info_json).await;
        });
        Ok(receiver_stream(rx))
    }

    async fn pull_image(&self, image: &ImageName, registry: &RegistryOptions) -> Result<JsonStream> {
        let credentials = self.credentials(image, registry)?;
        let options = CreateImageOptions::<String> {
            from_image: image.to_str(true, false, false),
            tag: image.tag_or_latest().to_string(),
            ..Default::default()
        };
        tracing::debug!("Pulling {} (insecure = {})", image, registry.insecure);

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let stream = docker.create_image(Some(options), None, credentials);
            forward(stream, tx, |info| to_value(&info)).await;
        });
        Ok(receiver_stream(rx))
    }

    async fn push_image(&self, image: &ImageName, registry: &RegistryOptions) -> Result<JsonStream> {
        let credentials = self.credentials(image, registry)?;
        let name = image.to_str(true, false, false);
        let options = PushImageOptions::<String> {
            tag: image.tag_or_latest().to_string(),
        };
        tracing::debug!("Pushing {} (insecure = {})", image, registry.insecure);

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let stream = docker.push_image(&name, Some(options), credentials);
            forward(stream, tx, |info| to_value(&info)).await;
        });
        Ok(receiver_stream(rx))
    }

    async fn tag_image(&self, image: &str, target: &ImageName, force: bool) -> Result<()> {
        if force {
            tracing::debug!("Tagging always overwrites an existing tag; force is implied");
        }
        let options = TagImageOptions::<String> {
            repo: target.to_str(true, false, false),
            tag: target.tag_or_latest().to_string(),
        };
        self.docker.tag_image(image, Some(options)).await?;
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> Result<Value> {
        let inspect = self.docker.inspect_image(image).await?;
        to_value(&inspect)
    }

    async fn remove_image(&self, image: &str, force: bool, noprune: bool) -> Result<()> {
        let options = bollard::query_parameters::RemoveImageOptions {
            force,
            noprune,
            ..Default::default()
        };
        let removed = self.docker.remove_image(image, Some(options), None).await?;
        tracing::debug!("Removed image {}: {} item(s)", image, removed.len());
        Ok(())
    }

    async fn run_container(&self, image: &str, options: &RunOptions) -> Result<String> {
        let host_config = HostConfig {
            binds: Some(options.binds.clone()),
            privileged: Some(options.privileged),
            ..Default::default()
        };
        let config = Config::<String> {
            image: Some(image.to_string()),
            cmd: options.command.clone(),
            env: Some(options.env.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let create_options = options.name.as_ref().map(|name| CreateContainerOptions::<String> {
            name: name.clone(),
            platform: None,
        });

        let response = self.docker.create_container(create_options, config).await?;
        tracing::info!("Created container {} from {}", response.id, image);
        self.docker
            .start_container(
                &response.id,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await?;
        Ok(response.id)
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        let mut stream = self.docker.wait_container(
            container_id,
            None::<bollard::query_parameters::WaitContainerOptions>,
        );
        let mut exit_code = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(response) => exit_code = response.status_code,
                // 非ゼロ終了は bollard ではエラーとして届く
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    exit_code = code;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(exit_code)
    }

    async fn container_logs(&self, container_id: &str, follow: bool, stderr: bool) -> Result<TextStream> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr,
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let docker = self.docker.clone();
        let id = container_id.to_string();
        tokio::spawn(async move {
            let mut stream = docker.logs(&id, Some(options));
            while let Some(item) = stream.next().await {
                let item = item.map(|output| output.to_string()).map_err(EngineError::from);
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        Ok(receiver_stream(rx))
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                container_id,
                Some(bollard::query_parameters::RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn commit_container(
        &self,
        container_id: &str,
        image: Option<&ImageName>,
        message: Option<&str>,
    ) -> Result<String> {
        let options = CommitContainerOptions::<String> {
            container: container_id.to_string(),
            repo: image.map(|i| i.to_str(true, false, false)).unwrap_or_default(),
            tag: image.map(|i| i.tag_or_latest().to_string()).unwrap_or_default(),
            comment: message.unwrap_or_default().to_string(),
            pause: true,
            ..Default::default()
        };
        let response = self
            .docker
            .commit_container(options, bollard::models::ContainerConfig::default())
            .await?;
        let value = to_value(&response)?;
        value
            .get("Id")
            .or_else(|| value.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::Api {
                status: 500,
                message: format!("commit of {} returned no image id", container_id),
            })
    }

    async fn info(&self) -> Result<Value> {
        to_value(&self.docker.info().await?)
    }

    async fn version(&self) -> Result<Value> {
        to_value(&self.docker.version().await?)
    }
}
