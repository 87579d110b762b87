//! ビルド前に指定秒数だけ待つ（デバッグ用）

use crate::error::{PluginError, PluginResult};
use crate::plugin::{BuildPlugin, PluginServices};
use async_trait::async_trait;
use buildflow_container::ContainerTasker;
use buildflow_core::WorkflowData;
use serde_json::{Map, Value, json};
use std::time::Duration;

pub const KEY: &str = "pre_sleep";

const DEFAULT_SECONDS: u64 = 60;

pub struct PreSleepPlugin {
    seconds: u64,
}

impl PreSleepPlugin {
    pub fn create(args: &Map<String, Value>, _services: &PluginServices) -> PluginResult<Box<dyn BuildPlugin>> {
        // 置換で渡された値は文字列になる
        let seconds = match args.get("seconds") {
            None | Some(Value::Null) => Some(DEFAULT_SECONDS),
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(_) => None,
        }
        .ok_or_else(|| PluginError::Args(format!("{}: seconds must be a non-negative integer", KEY)))?;
        Ok(Box::new(Self { seconds }))
    }
}

#[async_trait]
impl BuildPlugin for PreSleepPlugin {
    fn key(&self) -> &str {
        KEY
    }

    async fn run(&mut self, _tasker: &ContainerTasker, _workflow: &mut WorkflowData) -> PluginResult<Value> {
        tracing::info!("Sleeping for {} seconds", self.seconds);
        tokio::time::sleep(Duration::from_secs(self.seconds)).await;
        Ok(json!({ "slept": self.seconds }))
    }
}
