use std::time::Duration;

use async_trait::async_trait;

use crate::DispatchResult;

/// 从订阅频道收到的一条通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

impl Notification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// 发布通知的能力
///
/// 发布必须在承载业务事务的连接上进行，这样消息的可见性随事务提交或回滚。
#[async_trait]
pub trait Notifier: Send + Sync {
    /// 向指定频道发布负载
    async fn notify(&self, channel: &str, payload: &str) -> DispatchResult<()>;
}

/// 专用订阅连接
///
/// 一个实现持有一条独立连接，只被一个任务使用，不跨线程共享。
#[async_trait]
pub trait PubSubConnection: Notifier {
    /// 连接是否处于自动提交模式；事务模式下的通知会被缓冲到提交
    fn autocommit(&self) -> bool;

    /// 订阅频道
    async fn listen(&mut self, channel: &str) -> DispatchResult<()>;

    /// 取消订阅
    async fn unlisten(&mut self, channel: &str) -> DispatchResult<()>;

    /// 最多等待 `timeout`，返回一条已到达的通知；超时返回 `None`
    async fn poll(&mut self, timeout: Duration) -> DispatchResult<Option<Notification>>;

    /// 重新建立连接并恢复订阅
    async fn reconnect(&mut self) -> DispatchResult<()>;

    /// 当前订阅的频道
    fn channels(&self) -> Vec<String>;
}
