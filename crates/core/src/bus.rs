//! 通知总线
//!
//! [`PubSub`] 包装一条专用的订阅连接，提供 listen/unlisten/notify 以及一个
//! 惰性、无限、只能消费一次的事件流。连接丢失时按固定间隔有限次重连：
//! 重试耗尽是致命错误；重连成功则说明期间可能漏掉了通知，内存中的订阅状态不可信，
//! 通过 [`ShutdownManager`] 请求重启。

use std::time::Duration;

use futures::stream::{self, Stream};
use tracing::{debug, error, info, warn};

use crate::{
    shutdown::ShutdownManager,
    traits::{Notification, PubSubConnection},
    DispatchError, DispatchResult,
};

/// 事件流中的一个元素
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Notification(Notification),
    /// 一个轮询周期内没有任何通知
    Idle,
}

/// 断线重连策略
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 40,
            interval: Duration::from_secs(4),
        }
    }
}

pub struct PubSub<C> {
    conn: C,
    policy: ReconnectPolicy,
    supervisor: Option<ShutdownManager>,
}

impl<C: PubSubConnection> PubSub<C> {
    /// 连接必须处于自动提交模式，否则通知会被事务缓冲
    pub fn new(conn: C) -> DispatchResult<Self> {
        if !conn.autocommit() {
            return Err(DispatchError::config(
                "只能在自动提交模式的连接上监听通知",
            ));
        }
        Ok(Self {
            conn,
            policy: ReconnectPolicy::default(),
            supervisor: None,
        })
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 重连成功后通过它请求进程重启
    pub fn with_supervisor(mut self, supervisor: ShutdownManager) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub async fn listen(&mut self, channel: &str) -> DispatchResult<()> {
        debug!("LISTEN {channel}");
        self.conn.listen(channel).await
    }

    pub async fn unlisten(&mut self, channel: &str) -> DispatchResult<()> {
        debug!("UNLISTEN {channel}");
        self.conn.unlisten(channel).await
    }

    pub async fn notify(&self, channel: &str, payload: &str) -> DispatchResult<()> {
        self.conn.notify(channel, payload).await
    }

    /// 消费总线，返回事件流
    ///
    /// 每次轮询最多阻塞 `poll_interval`；`emit_idle_ticks` 为真时，空闲的轮询周期
    /// 产出 [`BusEvent::Idle`]，调用方借此穿插执行周期性维护。
    /// 流在遇到致命错误后结束。
    pub fn events(
        self,
        poll_interval: Duration,
        emit_idle_ticks: bool,
    ) -> impl Stream<Item = DispatchResult<BusEvent>> + Send
    where
        C: Send + 'static,
    {
        stream::unfold(Some(self), move |state| async move {
            let mut bus = state?;
            loop {
                match bus.conn.poll(poll_interval).await {
                    Ok(Some(notification)) => {
                        return Some((Ok(BusEvent::Notification(notification)), Some(bus)));
                    }
                    Ok(None) if emit_idle_ticks => return Some((Ok(BusEvent::Idle), Some(bus))),
                    Ok(None) => continue,
                    Err(e) if e.is_connection_error() => {
                        warn!("通知总线连接丢失: {e}");
                        let outcome = match bus.recover().await {
                            Ok(()) => {
                                if let Some(supervisor) = &bus.supervisor {
                                    supervisor
                                        .request_restart("通知总线连接丢失后已恢复")
                                        .await;
                                }
                                DispatchError::BusRestartRequired
                            }
                            Err(e) => e,
                        };
                        return Some((Err(outcome), None));
                    }
                    Err(e) => {
                        error!("通知总线轮询失败: {e}");
                        return Some((Err(e), None));
                    }
                }
            }
        })
    }

    async fn recover(&mut self) -> DispatchResult<()> {
        let max_attempts = self.policy.max_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.conn.reconnect().await {
                Ok(()) => {
                    info!("通知总线重连成功 (第 {attempt} 次尝试)");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "数据库不可用，{} 秒后重试，尝试 {}/{}: {}",
                        self.policy.interval.as_secs_f64(),
                        attempt,
                        max_attempts,
                        e
                    );
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.interval).await;
                    }
                }
            }
        }

        error!("通知总线重连失败，已达到最大重试次数 {max_attempts}");
        Err(DispatchError::BusUnavailable {
            attempts: max_attempts,
            message: last_error,
        })
    }
}
