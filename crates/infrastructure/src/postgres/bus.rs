//! 基于 PostgreSQL LISTEN/NOTIFY 的通知总线

use std::time::Duration;

use async_trait::async_trait;
use dispatch_core::{
    traits::{Notification, Notifier, PubSubConnection},
    DispatchError, DispatchResult,
};
use sqlx::postgres::{PgListener, Postgres};
use sqlx::{Executor, PgPool};
use tracing::{debug, info};

/// 在任意执行器上发布通知
///
/// 传入调用方的事务时，通知随事务提交才对订阅者可见，回滚则丢弃。
pub async fn notify<'e, E>(executor: E, channel: &str, payload: &str) -> DispatchResult<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(executor)
        .await?;
    Ok(())
}

/// 通过连接池发布通知，供发布任务的调用方使用
#[derive(Clone)]
pub struct PgNotifier {
    pool: PgPool,
}

impl PgNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn notify(&self, channel: &str, payload: &str) -> DispatchResult<()> {
        notify(&self.pool, channel, payload).await
    }
}

/// 专用的订阅连接
///
/// 订阅走一条独立的 [`PgListener`] 连接，发布走连接池。
pub struct PgPubSubConnection {
    pool: PgPool,
    listener: PgListener,
    channels: Vec<String>,
}

impl PgPubSubConnection {
    pub async fn connect(pool: PgPool) -> DispatchResult<Self> {
        let listener = PgListener::connect_with(&pool).await?;
        Ok(Self {
            pool,
            listener,
            channels: Vec::new(),
        })
    }
}

#[async_trait]
impl Notifier for PgPubSubConnection {
    async fn notify(&self, channel: &str, payload: &str) -> DispatchResult<()> {
        notify(&self.pool, channel, payload).await
    }
}

#[async_trait]
impl PubSubConnection for PgPubSubConnection {
    fn autocommit(&self) -> bool {
        // PgListener 的连接从不开启事务
        true
    }

    async fn listen(&mut self, channel: &str) -> DispatchResult<()> {
        self.listener.listen(channel).await?;
        if !self.channels.iter().any(|c| c == channel) {
            self.channels.push(channel.to_string());
        }
        Ok(())
    }

    async fn unlisten(&mut self, channel: &str) -> DispatchResult<()> {
        self.listener.unlisten(channel).await?;
        self.channels.retain(|c| c != channel);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> DispatchResult<Option<Notification>> {
        match tokio::time::timeout(timeout, self.listener.try_recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(Some(notification))) => {
                debug!(channel = notification.channel(), "收到通知");
                Ok(Some(Notification::new(
                    notification.channel(),
                    notification.payload(),
                )))
            }
            // try_recv 返回 None 表示连接已断开
            Ok(Ok(None)) => Err(DispatchError::Bus("订阅连接已断开".to_string())),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn reconnect(&mut self) -> DispatchResult<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        let channels: Vec<&str> = self.channels.iter().map(String::as_str).collect();
        listener.listen_all(channels).await?;
        self.listener = listener;
        info!("订阅连接已重建，恢复 {} 个频道", self.channels.len());
        Ok(())
    }

    fn channels(&self) -> Vec<String> {
        self.channels.clone()
    }
}
