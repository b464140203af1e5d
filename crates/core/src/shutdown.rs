use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 收到操作系统信号或调用方主动关闭
    Requested,
    /// 运行状态不可信，需要由进程管理器重新拉起
    Restart(String),
}

/// 优雅关闭管理器
///
/// 一次性广播：第一次 `shutdown`/`request_restart` 生效，之后的调用被忽略。
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    reason: Arc<RwLock<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            reason: Arc::new(RwLock::new(None)),
        }
    }

    /// 订阅关闭信号
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    /// 触发关闭
    pub async fn shutdown(&self) {
        self.trigger(ShutdownReason::Requested).await;
    }

    /// 请求进程管理器重启本进程
    pub async fn request_restart(&self, why: impl Into<String>) {
        let why = why.into();
        warn!("请求重启分发进程: {why}");
        self.trigger(ShutdownReason::Restart(why)).await;
    }

    async fn trigger(&self, reason: ShutdownReason) {
        let mut current = self.reason.write().await;
        if current.is_some() {
            debug!("关闭管理器已经触发过关闭");
            return;
        }

        info!("触发系统关闭: {:?}", reason);
        *current = Some(reason.clone());

        // 没有订阅者时发送失败，忽略
        let receivers = self.shutdown_tx.receiver_count();
        debug!("发送关闭信号给 {} 个订阅者", receivers);
        let _ = self.shutdown_tx.send(reason);
    }

    /// 已触发的关闭原因
    pub async fn reason(&self) -> Option<ShutdownReason> {
        self.reason.read().await.clone()
    }

    pub async fn is_shutdown(&self) -> bool {
        self.reason.read().await.is_some()
    }

    pub async fn restart_requested(&self) -> bool {
        matches!(*self.reason.read().await, Some(ShutdownReason::Restart(_)))
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();

        manager.request_restart("bus reconnected").await;
        manager.shutdown().await;

        assert_eq!(
            rx.recv().await.unwrap(),
            ShutdownReason::Restart("bus reconnected".to_string())
        );
        assert!(manager.restart_requested().await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_without_subscribers() {
        let manager = ShutdownManager::new();
        manager.shutdown().await;
        assert!(manager.is_shutdown().await);
        assert!(!manager.restart_requested().await);
    }
}
