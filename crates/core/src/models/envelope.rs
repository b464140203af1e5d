use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::DispatchResult;

/// 任务信封：一次异步调用的完整描述
///
/// 跨节点传输时作为通知负载（JSON），读取时忽略未知字段。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// 已注册任务的完整名称，例如 `dispatch.tasks.system.ping`
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub uuid: String,
    /// 发布时间（Unix秒），仅用于诊断
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_pub: Option<f64>,
}

impl TaskEnvelope {
    pub fn new(task: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            task: task.into(),
            args,
            kwargs,
            uuid: Uuid::new_v4().to_string(),
            time_pub: None,
        }
    }

    /// 无参数的维护任务信封
    pub fn bare(task: impl Into<String>) -> Self {
        Self::new(task, Vec::new(), Map::new())
    }

    pub(crate) fn stamped(mut self) -> Self {
        self.time_pub = Some(Utc::now().timestamp_millis() as f64 / 1000.0);
        self
    }

    pub fn to_payload(&self) -> DispatchResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> DispatchResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// 目标队列：固定名称，或在发布时才求值的闭包
#[derive(Clone)]
pub enum QueueName {
    Named(String),
    Dynamic(Arc<dyn Fn() -> String + Send + Sync>),
}

impl QueueName {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        QueueName::Dynamic(Arc::new(f))
    }

    /// 求出具体的队列名
    pub fn resolve(&self) -> String {
        match self {
            QueueName::Named(name) => name.clone(),
            QueueName::Dynamic(f) => f(),
        }
    }
}

impl fmt::Debug for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueName::Named(name) => f.debug_tuple("Named").field(name).finish(),
            QueueName::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<&str> for QueueName {
    fn from(name: &str) -> Self {
        QueueName::Named(name.to_string())
    }
}

impl From<String> for QueueName {
    fn from(name: String) -> Self {
        QueueName::Named(name)
    }
}
