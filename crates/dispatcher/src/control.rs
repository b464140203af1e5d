//! 控制命令
//!
//! `{"control": "status"|"running", "reply_to": <频道>}` 发往节点频道，
//! 分发进程把回复发布到 `reply_to`。

use std::time::Duration;

use dispatch_core::{
    models::{ControlCommand, ControlMessage},
    traits::PubSubConnection,
    DispatchError, DispatchResult,
};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::periodic::SchedulerSnapshot;
use crate::pool::PoolSnapshot;

/// `status` 命令的回复
#[derive(Debug, Clone, Serialize)]
pub struct StatusReply {
    pub node: String,
    pub pool: PoolSnapshot,
    pub scheduler: SchedulerSnapshot,
}

/// 按命令构造回复负载
pub fn build_reply(
    command: ControlCommand,
    node: &str,
    pool: PoolSnapshot,
    scheduler: SchedulerSnapshot,
) -> DispatchResult<String> {
    let reply = match command {
        ControlCommand::Status => serde_json::to_value(StatusReply {
            node: node.to_string(),
            pool,
            scheduler,
        })?,
        ControlCommand::Running => serde_json::to_value(pool.running_uuids())?,
    };
    Ok(reply.to_string())
}

/// 向某个节点的分发进程发送控制命令并等待回复
pub struct ControlClient<C> {
    conn: C,
    timeout: Duration,
}

impl<C: PubSubConnection> ControlClient<C> {
    pub fn new(conn: C, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    pub async fn request(&mut self, node: &str, command: ControlCommand) -> DispatchResult<Value> {
        let reply_to = format!("reply_to_{}", Uuid::new_v4().simple());
        self.conn.listen(&reply_to).await?;

        let message = ControlMessage {
            control: command,
            reply_to: Some(reply_to.clone()),
        };
        let payload = serde_json::to_string(&message)?;
        debug!("向 {node} 发送控制命令: {payload}");

        let result = match self.conn.notify(node, &payload).await {
            Ok(()) => self.wait_for_reply(&reply_to).await,
            Err(e) => Err(e),
        };
        self.conn.unlisten(&reply_to).await?;
        result
    }

    async fn wait_for_reply(&mut self, reply_to: &str) -> DispatchResult<Value> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DispatchError::Bus(format!(
                    "在 {:?} 内没有收到控制命令的回复",
                    self.timeout
                )));
            }
            if let Some(notification) = self.conn.poll(remaining).await? {
                if notification.channel == reply_to {
                    return Ok(serde_json::from_str(&notification.payload)?);
                }
            }
        }
    }
}
