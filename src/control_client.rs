use std::time::Duration;

use anyhow::{Context, Result};
use dispatch_core::{AppConfig, ControlCommand};
use dispatch_dispatcher::ControlClient;
use dispatch_infrastructure::{DatabaseManager, PgPubSubConnection};

/// 向节点的分发进程发送控制命令，并把回复打印到标准输出
pub async fn query(config: &AppConfig, node: Option<String>, command: ControlCommand) -> Result<()> {
    let node = node.unwrap_or_else(|| config.node.hostname.clone());

    let db = DatabaseManager::new(&config.database)
        .await
        .context("连接数据库失败")?;
    let conn = PgPubSubConnection::connect(db.pool().clone()).await?;
    let timeout = Duration::from_secs(config.bus.control_reply_timeout_seconds);

    let reply = ControlClient::new(conn, timeout)
        .request(&node, command)
        .await
        .with_context(|| format!("节点 {node} 的分发进程没有回复"));
    db.close().await;

    println!("{}", serde_json::to_string_pretty(&reply?)?);
    Ok(())
}
