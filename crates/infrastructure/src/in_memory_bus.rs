//! 进程内通知总线
//!
//! 用 tokio broadcast 模拟 LISTEN/NOTIFY，适用于嵌入式部署和测试。
//! 支持故障注入：断开后轮询和发布都会失败，重连按设定次数失败后恢复。

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dispatch_core::{
    traits::{Notification, Notifier, PubSubConnection},
    DispatchError, DispatchResult,
};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

const PERMANENT: u32 = u32::MAX;

struct Hub {
    tx: broadcast::Sender<Notification>,
    down: AtomicBool,
    failing_reconnects: AtomicU32,
}

/// 总线本身，可克隆，克隆共享同一个hub
#[derive(Clone)]
pub struct InMemoryBus {
    hub: Arc<Hub>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            hub: Arc::new(Hub {
                tx,
                down: AtomicBool::new(false),
                failing_reconnects: AtomicU32::new(0),
            }),
        }
    }

    /// 建立一条新的订阅连接
    pub fn connect(&self) -> InMemoryConnection {
        InMemoryConnection {
            bus: self.clone(),
            rx: self.hub.tx.subscribe(),
            channels: Vec::new(),
        }
    }

    /// 断开总线，直到调用 [`restore`](Self::restore)
    pub fn disconnect(&self) {
        self.disconnect_for_attempts(PERMANENT);
    }

    /// 断开总线，之后的前 `attempts` 次重连失败，再下一次成功
    pub fn disconnect_for_attempts(&self, attempts: u32) {
        warn!("内存总线断开 (重连失败次数: {attempts})");
        self.hub.failing_reconnects.store(attempts, Ordering::SeqCst);
        self.hub.down.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.hub.failing_reconnects.store(0, Ordering::SeqCst);
        self.hub.down.store(false, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.hub.down.load(Ordering::SeqCst)
    }

    fn try_reconnect(&self) -> DispatchResult<()> {
        if !self.is_down() {
            return Ok(());
        }
        let remaining = self.hub.failing_reconnects.load(Ordering::SeqCst);
        if remaining == 0 {
            self.hub.down.store(false, Ordering::SeqCst);
            return Ok(());
        }
        if remaining != PERMANENT {
            self.hub.failing_reconnects.fetch_sub(1, Ordering::SeqCst);
        }
        Err(DispatchError::Bus("内存总线不可用".to_string()))
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for InMemoryBus {
    async fn notify(&self, channel: &str, payload: &str) -> DispatchResult<()> {
        if self.is_down() {
            return Err(DispatchError::Bus("内存总线不可用".to_string()));
        }
        // 没有订阅者时发送失败，与 NOTIFY 无人监听时一样直接丢弃
        let _ = self.hub.tx.send(Notification::new(channel, payload));
        Ok(())
    }
}

pub struct InMemoryConnection {
    bus: InMemoryBus,
    rx: broadcast::Receiver<Notification>,
    channels: Vec<String>,
}

#[async_trait]
impl Notifier for InMemoryConnection {
    async fn notify(&self, channel: &str, payload: &str) -> DispatchResult<()> {
        self.bus.notify(channel, payload).await
    }
}

#[async_trait]
impl PubSubConnection for InMemoryConnection {
    fn autocommit(&self) -> bool {
        true
    }

    async fn listen(&mut self, channel: &str) -> DispatchResult<()> {
        if !self.channels.iter().any(|c| c == channel) {
            self.channels.push(channel.to_string());
        }
        Ok(())
    }

    async fn unlisten(&mut self, channel: &str) -> DispatchResult<()> {
        self.channels.retain(|c| c != channel);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> DispatchResult<Option<Notification>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.bus.is_down() {
                return Err(DispatchError::Bus("内存总线连接已断开".to_string()));
            }
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(notification)) => {
                    if self.channels.contains(&notification.channel) {
                        return Ok(Some(notification));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!("内存总线订阅者落后，丢弃 {skipped} 条通知");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(DispatchError::Bus("内存总线已关闭".to_string()));
                }
            }
        }
    }

    async fn reconnect(&mut self) -> DispatchResult<()> {
        self.bus.try_reconnect()?;
        // 断线期间的通知不补发
        self.rx = self.bus.hub.tx.subscribe();
        debug!("内存总线重连，恢复 {} 个频道", self.channels.len());
        Ok(())
    }

    fn channels(&self) -> Vec<String> {
        self.channels.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::{BusEvent, PubSub, ReconnectPolicy, ShutdownManager};
    use futures::StreamExt;

    async fn collect_events(bus: PubSub<InMemoryConnection>) -> Vec<DispatchResult<BusEvent>> {
        bus.events(Duration::from_millis(20), false).collect().await
    }

    #[tokio::test]
    async fn test_only_subscribed_channels_are_delivered() {
        let bus = InMemoryBus::new();
        let mut conn = bus.connect();
        conn.listen("node-a").await.unwrap();

        bus.notify("node-b", "ignored").await.unwrap();
        bus.notify("node-a", "hello").await.unwrap();

        let received = conn.poll(Duration::from_millis(100)).await.unwrap();
        assert_eq!(received, Some(Notification::new("node-a", "hello")));
        assert_eq!(conn.poll(Duration::from_millis(20)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unlisten_stops_delivery() {
        let bus = InMemoryBus::new();
        let mut conn = bus.connect();
        conn.listen("node-a").await.unwrap();
        conn.unlisten("node-a").await.unwrap();

        bus.notify("node-a", "hello").await.unwrap();
        assert_eq!(conn.poll(Duration::from_millis(20)).await.unwrap(), None);
        assert!(conn.channels().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_fails_poll_and_notify() {
        let bus = InMemoryBus::new();
        let mut conn = bus.connect();
        bus.disconnect();

        assert!(conn.poll(Duration::from_millis(10)).await.is_err());
        assert!(bus.notify("node-a", "x").await.is_err());
        assert!(conn.reconnect().await.is_err());

        bus.restore();
        assert!(conn.reconnect().await.is_ok());
        assert_eq!(conn.poll(Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reconnect_through_pubsub_requests_restart() {
        let bus = InMemoryBus::new();
        let supervisor = ShutdownManager::new();
        let mut pubsub = PubSub::new(bus.connect())
            .unwrap()
            .with_reconnect_policy(ReconnectPolicy {
                max_attempts: 5,
                interval: Duration::from_millis(1),
            })
            .with_supervisor(supervisor.clone());
        pubsub.listen("node-a").await.unwrap();

        bus.disconnect_for_attempts(2);
        let events = collect_events(pubsub).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(DispatchError::BusRestartRequired)));
        assert!(supervisor.restart_requested().await);
        assert!(!bus.is_down());
    }

    #[tokio::test]
    async fn test_permanent_outage_exhausts_retries() {
        let bus = InMemoryBus::new();
        let pubsub = PubSub::new(bus.connect())
            .unwrap()
            .with_reconnect_policy(ReconnectPolicy {
                max_attempts: 3,
                interval: Duration::from_millis(1),
            });

        bus.disconnect();
        let events = collect_events(pubsub).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            Err(DispatchError::BusUnavailable { attempts: 3, .. })
        ));
    }
}
