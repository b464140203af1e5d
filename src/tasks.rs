//! worker 进程内可执行的内置任务

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use dispatch_core::{
    task_fn, AppConfig, ControlCommand, DispatchResult, Instance, TaskArgs, TaskHandler,
    TaskRegistry,
};
use dispatch_dispatcher::{ControlClient, Reaper, ReaperConfig};
use dispatch_infrastructure::{DatabaseManager, PgPubSubConnection, PostgresJobRepository};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::info;

pub const NAMESPACE: &str = "dispatch";
pub const PING_TASK: &str = "dispatch.tasks.system.ping";
pub const REAP_ORPHANS_TASK: &str = "dispatch.tasks.system.reap_orphans";

/// 构造 worker 使用的任务注册表
pub fn build_registry(config: &AppConfig) -> DispatchResult<TaskRegistry> {
    let mut registry = TaskRegistry::new(NAMESPACE);

    let node = config.node.hostname.clone();
    registry.register(
        PING_TASK,
        task_fn(move |_args: TaskArgs| {
            let node = node.clone();
            async move {
                Ok(json!({
                    "node": node,
                    "pid": std::process::id(),
                }))
            }
        }),
    )?;

    registry.register(REAP_ORPHANS_TASK, ReapOrphans::new(config.clone()))?;
    Ok(registry)
}

struct ReapContext {
    db: DatabaseManager,
    reaper: Reaper,
}

/// 回收本节点上已经没有进程在处理的作业
///
/// 先向本节点分发进程查询正在处理的uuid，这些作业不会被回收。
/// 分发进程没有回复时本次什么都不做。
struct ReapOrphans {
    config: AppConfig,
    context: OnceCell<Arc<ReapContext>>,
}

impl ReapOrphans {
    fn new(config: AppConfig) -> Self {
        Self {
            config,
            context: OnceCell::new(),
        }
    }

    async fn context(&self) -> anyhow::Result<Arc<ReapContext>> {
        let context = self
            .context
            .get_or_try_init(|| async {
                let db = DatabaseManager::new(&self.config.database).await?;
                let repo = PostgresJobRepository::new(
                    db.pool().clone(),
                    self.config.database.jobs_table.clone(),
                )?;
                let reaper = Reaper::new(Arc::new(repo), ReaperConfig::from(&self.config.reaper));
                Ok::<_, dispatch_core::DispatchError>(Arc::new(ReapContext { db, reaper }))
            })
            .await?;
        Ok(context.clone())
    }

    async fn running_uuids(&self, context: &ReapContext) -> anyhow::Result<Vec<String>> {
        let conn = PgPubSubConnection::connect(context.db.pool().clone()).await?;
        let timeout = Duration::from_secs(self.config.bus.control_reply_timeout_seconds);
        let mut client = ControlClient::new(conn, timeout);
        let reply = client
            .request(&self.config.node.hostname, ControlCommand::Running)
            .await
            .context("分发进程没有回复running命令，跳过本次回收")?;
        Ok(serde_json::from_value(reply)?)
    }
}

#[async_trait]
impl TaskHandler for ReapOrphans {
    async fn run(&self, _args: TaskArgs) -> anyhow::Result<Value> {
        // 先取参考时间，之后才开始的作业不会被回收
        let ref_time = Utc::now();
        let context = self.context().await?;
        let excluded = self.running_uuids(&context).await?;

        let instance = Instance::new(self.config.node.hostname.clone())
            .with_node_type(self.config.node.node_type);
        let running = context
            .reaper
            .reap(&instance, &excluded, Some(ref_time))
            .await?;
        let waiting = context
            .reaper
            .reap_waiting(&instance, &excluded, Some(ref_time))
            .await?;

        if !running.is_empty() || !waiting.is_empty() {
            info!(
                "回收孤儿作业: running {} 个, waiting {} 个",
                running.len(),
                waiting.len()
            );
        }
        Ok(json!({
            "running": running.len(),
            "waiting": waiting.len(),
            "excluded": excluded.len(),
        }))
    }
}
