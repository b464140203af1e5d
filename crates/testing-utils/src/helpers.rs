//! 测试任务和等待工具

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dispatch_core::registry::{task_fn, TaskArgs, TaskRegistry};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

pub const ECHO_TASK: &str = "dispatch.tests.echo";
/// 一直阻塞，直到 [`TestTasks::release`] 放行
pub const BLOCK_TASK: &str = "dispatch.tests.block";
pub const FAIL_TASK: &str = "dispatch.tests.fail";
/// 把位置参数记录到 [`TestTasks::recorded`]
pub const RECORD_TASK: &str = "dispatch.tests.record";

/// 测试任务共享的状态
#[derive(Clone)]
pub struct TestTasks {
    gate: Arc<Semaphore>,
    recorded: Arc<Mutex<Vec<Value>>>,
}

impl TestTasks {
    /// 放行 `n` 个被阻塞的任务
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn recorded(&self) -> Vec<Value> {
        self.recorded.lock().unwrap().clone()
    }
}

/// 注册了所有 `dispatch.tests.*` 任务的注册表
pub fn test_registry() -> (TaskRegistry, TestTasks) {
    let tasks = TestTasks {
        gate: Arc::new(Semaphore::new(0)),
        recorded: Arc::new(Mutex::new(Vec::new())),
    };
    let mut registry = TaskRegistry::new("dispatch");

    registry
        .register(
            ECHO_TASK,
            task_fn(|args: TaskArgs| async move { Ok(Value::Array(args.args)) }),
        )
        .expect("echo task registers");

    let gate = Arc::clone(&tasks.gate);
    registry
        .register(
            BLOCK_TASK,
            task_fn(move |_args: TaskArgs| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.acquire().await?.forget();
                    Ok(json!("released"))
                }
            }),
        )
        .expect("block task registers");

    registry
        .register(
            FAIL_TASK,
            task_fn(|_args: TaskArgs| async move {
                Err::<Value, _>(anyhow::anyhow!("task failed on purpose"))
            }),
        )
        .expect("fail task registers");

    let recorded = Arc::clone(&tasks.recorded);
    registry
        .register(
            RECORD_TASK,
            task_fn(move |args: TaskArgs| {
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded.lock().unwrap().extend(args.args);
                    Ok(Value::Null)
                }
            }),
        )
        .expect("record task registers");

    (registry, tasks)
}

/// 反复检查 `condition`，在 `timeout` 内成立返回 true
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
