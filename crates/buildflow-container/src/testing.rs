//! テスト用のインメモリエンジン
//!
//! Docker を使わずにビルドワークフローやプラグインを検証するためのフェイクです。
//! 呼び出し回数を記録し、操作ごとに失敗やストリームの内容を差し込めます。

use crate::engine::{BuildRequest, ContainerEngine, JsonStream, RegistryOptions, RunOptions, TextStream};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use buildflow_core::ImageName;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct State {
    /// イメージ名 -> イメージID
    images: HashMap<String, String>,
    calls: HashMap<String, usize>,
    failures: HashMap<String, VecDeque<EngineError>>,
    streams: HashMap<String, Vec<Value>>,
    logs: HashMap<String, Vec<String>>,
    /// ログを流し終えても閉じないコンテナ
    endless_logs: HashSet<String>,
    exit_codes: HashMap<String, i64>,
    builds: Vec<BuildRequest>,
    runs: Vec<(String, RunOptions)>,
    pulled: Vec<String>,
    pushed: Vec<String>,
    removed_images: Vec<String>,
    removed_containers: Vec<String>,
    next_id: usize,
}

/// [`ContainerEngine`] のインメモリ実装
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 呼び出しを記録し、差し込まれた失敗があれば返す
    fn enter(&self, op: &str) -> Result<()> {
        let mut state = self.state();
        *state.calls.entry(op.to_string()).or_default() += 1;
        match state.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn new_id(state: &mut State, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}{:012}", prefix, state.next_id)
    }

    fn lookup(state: &State, image: &str) -> Option<(String, String)> {
        if let Some(id) = state.images.get(image) {
            return Some((image.to_string(), id.clone()));
        }
        let latest = format!("{}:latest", image);
        if let Some(id) = state.images.get(&latest) {
            return Some((latest, id.clone()));
        }
        state
            .images
            .iter()
            .find(|(_, id)| id.as_str() == image)
            .map(|(name, id)| (name.clone(), id.clone()))
    }

    /// 次の `op` 呼び出しを `err` で失敗させる（複数回呼ぶと順に消費）
    pub fn fail_next(&self, op: &str, err: EngineError) {
        self.state()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    /// build_image / pull_image / push_image が流す JSON 行
    pub fn set_stream(&self, op: &str, items: Vec<Value>) {
        self.state().streams.insert(op.to_string(), items);
    }

    pub fn set_logs(&self, container_id: &str, chunks: Vec<&str>) {
        self.state().logs.insert(
            container_id.to_string(),
            chunks.into_iter().map(str::to_string).collect(),
        );
    }

    /// ログを流した後もストリームを開いたままにする（実行中のコンテナ）
    pub fn set_endless_logs(&self, container_id: &str, chunks: Vec<&str>) {
        self.set_logs(container_id, chunks);
        self.state().endless_logs.insert(container_id.to_string());
    }

    /// 次に起動するコンテナの終了コード
    pub fn set_exit_code(&self, container_id: &str, code: i64) {
        self.state().exit_codes.insert(container_id.to_string(), code);
    }

    pub fn add_image(&self, name: &str, id: &str) {
        self.state().images.insert(name.to_string(), id.to_string());
    }

    pub fn has_image(&self, name: &str) -> bool {
        Self::lookup(&self.state(), name).is_some()
    }

    pub fn image_id(&self, name: &str) -> Option<String> {
        Self::lookup(&self.state(), name).map(|(_, id)| id)
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or_default()
    }

    pub fn builds(&self) -> Vec<BuildRequest> {
        self.state().builds.clone()
    }

    pub fn runs(&self) -> Vec<(String, RunOptions)> {
        self.state().runs.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state().pulled.clone()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.state().pushed.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state().removed_images.clone()
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.state().removed_containers.clone()
    }
}

fn json_stream(items: Vec<Value>) -> JsonStream {
    stream::iter(items.into_iter().map(Ok)).boxed()
}

fn has_error_line(items: &[Value]) -> bool {
    items.iter().any(|i| i.get("error").is_some_and(|e| !e.is_null()))
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn build_image(&self, request: &BuildRequest) -> Result<JsonStream> {
        self.enter("build_image")?;
        let mut state = self.state();
        state.builds.push(request.clone());
        let items = state.streams.get("build_image").cloned().unwrap_or_else(|| {
            vec![
                json!({"stream": "Step 1/1 : FROM scratch\n"}),
                json!({"stream": format!("Successfully tagged {}\n", request.tag)}),
            ]
        });
        if !has_error_line(&items) {
            let id = Self::new_id(&mut state, "sha256:b");
            state.images.insert(request.tag.clone(), id);
        }
        Ok(json_stream(items))
    }

    async fn pull_image(&self, image: &ImageName, _registry: &RegistryOptions) -> Result<JsonStream> {
        self.enter("pull_image")?;
        let mut state = self.state();
        let name = image.to_str(true, true, true);
        let items = state
            .streams
            .get("pull_image")
            .cloned()
            .unwrap_or_else(|| vec![json!({"status": format!("Pulling from {}", image.repository())})]);
        if !has_error_line(&items) {
            if !state.images.contains_key(&name) {
                let id = Self::new_id(&mut state, "sha256:p");
                state.images.insert(name.clone(), id);
            }
            state.pulled.push(name);
        }
        Ok(json_stream(items))
    }

    async fn push_image(&self, image: &ImageName, _registry: &RegistryOptions) -> Result<JsonStream> {
        self.enter("push_image")?;
        let mut state = self.state();
        let name = image.to_str(true, true, true);
        let items = state.streams.get("push_image").cloned().unwrap_or_else(|| {
            vec![json!({
                "status": format!("{}: digest: sha256:{:064} size: 1024", image.tag_or_latest(), 0)
            })]
        });
        if !has_error_line(&items) {
            state.pushed.push(name);
        }
        Ok(json_stream(items))
    }

    async fn tag_image(&self, image: &str, target: &ImageName, _force: bool) -> Result<()> {
        self.enter("tag_image")?;
        let mut state = self.state();
        let (_, id) = Self::lookup(&state, image).ok_or_else(|| EngineError::NotFound(image.to_string()))?;
        state.images.insert(target.to_str(true, true, true), id);
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> Result<Value> {
        self.enter("inspect_image")?;
        let state = self.state();
        let (_, id) = Self::lookup(&state, image).ok_or_else(|| EngineError::NotFound(image.to_string()))?;
        let tags: Vec<&String> = state
            .images
            .iter()
            .filter(|(_, v)| **v == id)
            .map(|(k, _)| k)
            .collect();
        Ok(json!({
            "Id": id,
            "RepoTags": tags,
            "Config": { "Labels": {} },
        }))
    }

    async fn remove_image(&self, image: &str, _force: bool, _noprune: bool) -> Result<()> {
        self.enter("remove_image")?;
        let mut state = self.state();
        let (name, id) = Self::lookup(&state, image).ok_or_else(|| EngineError::NotFound(image.to_string()))?;
        if name == id {
            state.images.retain(|_, v| *v != id);
        } else {
            state.images.remove(&name);
        }
        state.removed_images.push(image.to_string());
        Ok(())
    }

    async fn run_container(&self, image: &str, options: &RunOptions) -> Result<String> {
        self.enter("run_container")?;
        let mut state = self.state();
        if Self::lookup(&state, image).is_none() {
            return Err(EngineError::NotFound(image.to_string()));
        }
        let id = options
            .name
            .clone()
            .unwrap_or_else(|| Self::new_id(&mut state, "container-"));
        state.runs.push((image.to_string(), options.clone()));
        Ok(id)
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        self.enter("wait_container")?;
        Ok(self
            .state()
            .exit_codes
            .get(container_id)
            .copied()
            .unwrap_or_default())
    }

    async fn container_logs(&self, container_id: &str, _follow: bool, _stderr: bool) -> Result<TextStream> {
        self.enter("container_logs")?;
        let state = self.state();
        let chunks = state.logs.get(container_id).cloned().unwrap_or_default();
        let lines = stream::iter(chunks.into_iter().map(Ok));
        if state.endless_logs.contains(container_id) {
            Ok(lines.chain(stream::pending()).boxed())
        } else {
            Ok(lines.boxed())
        }
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<()> {
        self.enter("remove_container")?;
        self.state().removed_containers.push(container_id.to_string());
        Ok(())
    }

    async fn commit_container(
        &self,
        _container_id: &str,
        image: Option<&ImageName>,
        _message: Option<&str>,
    ) -> Result<String> {
        self.enter("commit_container")?;
        let mut state = self.state();
        let id = Self::new_id(&mut state, "sha256:c");
        if let Some(image) = image {
            state.images.insert(image.to_str(true, true, true), id.clone());
        } else {
            state.images.insert(id.clone(), id.clone());
        }
        Ok(id)
    }

    async fn info(&self) -> Result<Value> {
        self.enter("info")?;
        Ok(json!({ "Name": "fake", "Driver": "memory" }))
    }

    async fn version(&self) -> Result<Value> {
        self.enter("version")?;
        Ok(json!({ "Version": "0.0.0-fake", "ApiVersion": "1.44" }))
    }
}
