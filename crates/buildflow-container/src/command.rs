//! ログストリームの読み切り
//!
//! エンジンは build / pull / push の完了をストリームの終端でしか伝えないため、
//! 結果を判断する前に必ず最後まで読み切ります。

use crate::engine::JsonStream;
use crate::error::{EngineError, Result};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;

/// ストリーム操作1回分の結果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandResult {
    logs: Vec<String>,
    parsed_logs: Vec<Value>,
    error: Option<String>,
    error_detail: Option<Value>,
}

impl CommandResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// JSON 行を1つ取り込む
    ///
    /// 一度エラー行を見たら、その後の行に関わらず失敗のまま。
    pub fn parse_item(&mut self, item: Value) {
        match &item {
            Value::Object(map) => {
                if let Some(text) = map.get("stream").and_then(Value::as_str) {
                    self.push_text(text);
                }
                if let Some(status) = map.get("status").and_then(Value::as_str) {
                    let line = match map.get("id").and_then(Value::as_str) {
                        Some(id) => format!("{}: {}", id, status),
                        None => status.to_string(),
                    };
                    self.logs.push(line);
                }
                if self.error.is_none() {
                    let detail = map.get("errorDetail").filter(|d| !d.is_null()).cloned();
                    let message = map
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| {
                            detail
                                .as_ref()
                                .and_then(|d| d.get("message"))
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        });
                    if let Some(message) = message {
                        tracing::debug!("Stream reported error: {}", message);
                        self.error_detail =
                            Some(detail.unwrap_or_else(|| serde_json::json!({ "message": message })));
                        self.error = Some(message);
                    }
                }
            }
            Value::String(text) => self.push_text(text),
            _ => {}
        }
        self.parsed_logs.push(item);
    }

    fn push_text(&mut self, text: &str) {
        self.logs.extend(
            text.lines()
                .map(str::trim_end)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        );
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn into_logs(self) -> Vec<String> {
        self.logs
    }

    pub fn parsed_logs(&self) -> &[Value] {
        &self.parsed_logs
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn error_detail(&self) -> Option<&Value> {
        self.error_detail.as_ref()
    }

    /// `errorDetail.message` を優先したエラーメッセージ
    pub fn error_message(&self) -> Option<String> {
        self.error_detail
            .as_ref()
            .and_then(|d| d.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.error.clone())
    }

    /// 失敗していれば `EngineError::CommandFailed` に変換
    pub fn into_result(self) -> Result<Self> {
        match self.error_message() {
            Some(message) => Err(EngineError::CommandFailed(message)),
            None => Ok(self),
        }
    }
}

/// ストリームを最後まで読み切って結果にまとめる
///
/// 転送エラーは即座に返す。ストリーム中のエラー行は結果の失敗として記録する。
pub async fn wait_for_command(mut stream: JsonStream) -> Result<CommandResult> {
    let mut result = CommandResult::new();
    while let Some(item) = stream.next().await {
        result.parse_item(item?);
    }
    tracing::debug!(
        "Command stream finished: {} line(s), failed = {}",
        result.parsed_logs.len(),
        result.is_failed()
    );
    Ok(result)
}
