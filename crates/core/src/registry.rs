//! 任务注册表
//!
//! 只有显式注册过的任务可以通过名称被调用。名称是带命名空间的点分路径，
//! 例如 `dispatch.tasks.system.ping`；注册时路径上的每一级前缀都会成为已知模块，
//! 这样解析失败时可以区分"模块不存在"和"未注册"。

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    models::{QueueName, TaskEnvelope},
    traits::Notifier,
    DispatchError, DispatchResult,
};

/// 任务调用参数
#[derive(Debug, Clone, Default)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// 按位置取参数并反序列化
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("missing positional argument {index}"))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// 按名称取参数，不存在时返回 `None`
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        match self.kwargs.get(name) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

/// 可被分发执行的任务
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, args: TaskArgs) -> anyhow::Result<Value>;
}

/// 把异步函数或闭包包装成 [`TaskHandler`]
pub struct FnTask<F>(F);

pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    FnTask(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnTask<F>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn run(&self, args: TaskArgs) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

/// 任务解析或执行失败；作为值返回，不会让worker循环退出
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum TaskError {
    #[error("{name} is not a valid {namespace} task")]
    InvalidTask { name: String, namespace: String },

    #[error("No module named '{module}'")]
    ModuleNotFound { module: String },

    #[error("{name} is not registered for dispatch")]
    NotRegistered { name: String },

    #[error("{name} failed: {message}")]
    Failed { name: String, message: String },
}

/// 一次任务执行的统一结果
pub type TaskOutcome = Result<Value, TaskError>;

struct RegisteredTask {
    default_queue: Option<QueueName>,
    handler: Arc<dyn TaskHandler>,
}

/// 任务注册表
pub struct TaskRegistry {
    namespace: String,
    tasks: HashMap<String, RegisteredTask>,
    modules: HashSet<String>,
}

impl TaskRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let mut modules = HashSet::new();
        modules.insert(namespace.clone());
        Self {
            namespace,
            tasks: HashMap::new(),
            modules,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// 注册任务，不指定默认队列
    pub fn register<H>(&mut self, name: &str, handler: H) -> DispatchResult<TaskHandle>
    where
        H: TaskHandler + 'static,
    {
        self.insert(name, Arc::new(handler), None)
    }

    /// 注册任务并指定默认队列
    pub fn register_with_queue<H>(
        &mut self,
        name: &str,
        handler: H,
        queue: impl Into<QueueName>,
    ) -> DispatchResult<TaskHandle>
    where
        H: TaskHandler + 'static,
    {
        self.insert(name, Arc::new(handler), Some(queue.into()))
    }

    fn insert(
        &mut self,
        name: &str,
        handler: Arc<dyn TaskHandler>,
        default_queue: Option<QueueName>,
    ) -> DispatchResult<TaskHandle> {
        let prefix = format!("{}.", self.namespace);
        if !name.starts_with(&prefix) || name.split('.').any(|segment| segment.is_empty()) {
            return Err(DispatchError::config(format!(
                "任务名称 {name} 必须是 {} 命名空间下的点分路径",
                self.namespace
            )));
        }
        if self.tasks.contains_key(name) {
            return Err(DispatchError::config(format!("任务 {name} 重复注册")));
        }

        let segments: Vec<&str> = name.split('.').collect();
        for end in 1..segments.len() {
            self.modules.insert(segments[..end].join("."));
        }

        debug!("注册任务 {name}");
        self.tasks.insert(
            name.to_string(),
            RegisteredTask {
                default_queue: default_queue.clone(),
                handler,
            },
        );

        Ok(TaskHandle {
            name: name.to_string(),
            default_queue,
        })
    }

    /// 获取已注册任务的句柄
    pub fn handle(&self, name: &str) -> Option<TaskHandle> {
        self.tasks.get(name).map(|task| TaskHandle {
            name: name.to_string(),
            default_queue: task.default_queue.clone(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// 把名称解析为处理器
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn TaskHandler>, TaskError> {
        let in_namespace =
            name == self.namespace || name.starts_with(&format!("{}.", self.namespace));
        if !in_namespace {
            return Err(TaskError::InvalidTask {
                name: name.to_string(),
                namespace: self.namespace.clone(),
            });
        }

        let segments: Vec<&str> = name.split('.').collect();
        for end in 1..segments.len() {
            let module = segments[..end].join(".");
            if !self.modules.contains(&module) {
                return Err(TaskError::ModuleNotFound { module });
            }
        }

        self.tasks
            .get(name)
            .map(|task| Arc::clone(&task.handler))
            .ok_or_else(|| TaskError::NotRegistered {
                name: name.to_string(),
            })
    }

    /// 解析并执行信封描述的任务
    ///
    /// 任何失败（包括处理器panic）都以 [`TaskError`] 返回。
    pub async fn resolve_and_run(&self, envelope: &TaskEnvelope) -> TaskOutcome {
        let handler = match self.resolve(&envelope.task) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(task = %envelope.task, uuid = %envelope.uuid, "拒绝执行任务: {e}");
                return Err(e);
            }
        };

        let args = TaskArgs::new(envelope.args.clone(), envelope.kwargs.clone());
        let result = AssertUnwindSafe(handler.run(args)).catch_unwind().await;

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TaskError::Failed {
                name: envelope.task.clone(),
                message: format!("{e:#}"),
            }),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "task panicked".to_string());
                Err(TaskError::Failed {
                    name: envelope.task.clone(),
                    message,
                })
            }
        }
    }
}

/// 已注册任务的句柄，用于构造并发布信封
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: String,
    default_queue: Option<QueueName>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 构造信封并确定目标队列，不发送
    ///
    /// 显式队列优先于注册时的默认队列；两者都没有时返回 `QueueRequired`。
    pub fn prepare(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        queue: Option<QueueName>,
    ) -> DispatchResult<(TaskEnvelope, String)> {
        let queue = queue
            .or_else(|| self.default_queue.clone())
            .ok_or_else(|| DispatchError::QueueRequired {
                task: self.name.clone(),
            })?;

        let queue = queue.resolve();
        if queue.trim().is_empty() {
            return Err(DispatchError::QueueRequired {
                task: self.name.clone(),
            });
        }

        Ok((TaskEnvelope::new(&self.name, args, kwargs).stamped(), queue))
    }

    /// 构造信封并发布到目标队列对应的频道
    pub async fn apply_async(
        &self,
        notifier: &dyn Notifier,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        queue: Option<QueueName>,
    ) -> DispatchResult<(TaskEnvelope, String)> {
        let (envelope, queue) = self.prepare(args, kwargs, queue)?;
        notifier.notify(&queue, &envelope.to_payload()?).await?;
        info!(task = %self.name, uuid = %envelope.uuid, queue = %queue, "任务已发布");
        Ok((envelope, queue))
    }
}
