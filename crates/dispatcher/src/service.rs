//! 分发进程主循环
//!
//! 监听节点频道，把收到的任务写进本地进程池，回答控制命令；
//! 每个轮询周期顺带触发到期的周期任务并维护进程池。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dispatch_core::{
    bus::{BusEvent, PubSub},
    models::{ControlMessage, InboundMessage, Instance, TaskEnvelope},
    shutdown::{ShutdownManager, ShutdownReason},
    traits::{Notification, Notifier, PubSubConnection},
    DispatchError, DispatchResult,
};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::autoscale::AutoscalePool;
use crate::control::build_reply;
use crate::periodic::Scheduler;
use crate::process::StopSignal;
use crate::reaper::Reaper;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub poll_interval: Duration,
    /// 启动时回收本节点遗留的运行中作业
    pub reap_on_startup: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            reap_on_startup: true,
        }
    }
}

pub struct DispatcherService<C> {
    instance: Instance,
    channels: Vec<String>,
    bus: Option<PubSub<C>>,
    notifier: Arc<dyn Notifier>,
    pool: AutoscalePool,
    scheduler: Scheduler,
    /// 周期任务名 → 要分发的任务名
    schedule_tasks: HashMap<String, String>,
    reaper: Option<Reaper>,
    shutdown: ShutdownManager,
    config: ServiceConfig,
    next_preferred: usize,
}

impl<C: PubSubConnection + Send + 'static> DispatcherService<C> {
    /// `notifier` 用于发布控制命令的回复；订阅连接在运行期间被事件流独占
    pub fn new(
        instance: Instance,
        bus: PubSub<C>,
        notifier: Arc<dyn Notifier>,
        pool: AutoscalePool,
        shutdown: ShutdownManager,
        config: ServiceConfig,
    ) -> Self {
        let channels = vec![instance.hostname.clone()];
        Self {
            instance,
            channels,
            bus: Some(bus),
            notifier,
            pool,
            scheduler: Scheduler::empty(),
            schedule_tasks: HashMap::new(),
            reaper: None,
            shutdown,
            config,
            next_preferred: 0,
        }
    }

    /// 除节点频道外额外订阅的频道
    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        for channel in channels {
            if !self.channels.contains(&channel) {
                self.channels.push(channel);
            }
        }
        self
    }

    pub fn with_schedules(
        mut self,
        scheduler: Scheduler,
        schedule_tasks: HashMap<String, String>,
    ) -> Self {
        self.scheduler = scheduler;
        self.schedule_tasks = schedule_tasks;
        self
    }

    pub fn with_reaper(mut self, reaper: Reaper) -> Self {
        self.reaper = Some(reaper);
        self
    }

    /// 运行直到收到关闭信号、总线要求重启或遇到致命错误
    ///
    /// 无论以何种方式退出，进程池都会先被停止。
    pub async fn run(mut self) -> DispatchResult<ShutdownReason> {
        let started_at = Utc::now();
        self.pool.init_workers().await?;

        if self.config.reap_on_startup {
            self.startup_reap(started_at).await;
        }

        let mut bus = self
            .bus
            .take()
            .ok_or_else(|| DispatchError::Internal("分发服务只能运行一次".to_string()))?;
        for channel in &self.channels {
            bus.listen(channel).await?;
        }
        info!(
            "分发进程已启动: 节点 {}，监听 {:?}，{} 个worker",
            self.instance.hostname,
            self.channels,
            self.pool.len()
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let events = bus.events(self.config.poll_interval, true);
        tokio::pin!(events);

        let mut last_cleanup = Instant::now();
        let outcome = loop {
            if self.shutdown.is_shutdown().await {
                break Ok(());
            }

            // 周期任务到期时不必等满一个轮询周期
            let until_next_run = self
                .scheduler
                .time_until_next_run_at(Instant::now())
                .map_or(self.config.poll_interval, |d| d.min(self.config.poll_interval));

            tokio::select! {
                _ = shutdown_rx.recv() => break Ok(()),
                _ = tokio::time::sleep(until_next_run) => {}
                event = events.next() => match event {
                    Some(Ok(BusEvent::Notification(notification))) => {
                        self.handle_notification(notification).await;
                    }
                    Some(Ok(BusEvent::Idle)) => {}
                    Some(Err(DispatchError::BusRestartRequired)) => {
                        self.shutdown.request_restart("通知总线已重连").await;
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
            }

            self.run_pending_schedules().await;
            if last_cleanup.elapsed() >= self.config.poll_interval {
                self.cleanup().await;
                last_cleanup = Instant::now();
            }
        };

        info!("分发进程正在停止");
        self.pool.stop(StopSignal::Terminate).await;

        match outcome {
            Ok(()) => Ok(self
                .shutdown
                .reason()
                .await
                .unwrap_or(ShutdownReason::Requested)),
            Err(e) => {
                error!("分发进程因错误退出: {e}");
                Err(e)
            }
        }
    }

    async fn startup_reap(&mut self, started_at: chrono::DateTime<Utc>) {
        let Some(reaper) = &self.reaper else {
            return;
        };
        match reaper.reap(&self.instance, &[], Some(started_at)).await {
            Ok(reaped) if !reaped.is_empty() => {
                info!("启动时回收了 {} 个遗留作业", reaped.len());
            }
            Ok(_) => debug!("启动时没有需要回收的作业"),
            Err(e) => warn!("启动时回收作业失败: {e}"),
        }
    }

    async fn handle_notification(&mut self, notification: Notification) {
        match InboundMessage::parse(&notification.payload) {
            Ok(InboundMessage::Control(message)) => self.handle_control(message).await,
            Ok(InboundMessage::Task(envelope)) => self.dispatch(envelope).await,
            Err(e) => warn!(
                channel = %notification.channel,
                "无法解析的消息 ({e}): {}",
                notification.payload
            ),
        }
    }

    async fn handle_control(&mut self, message: ControlMessage) {
        debug!("收到控制命令 {:?}", message.control);
        let Some(reply_to) = message.reply_to else {
            return;
        };

        self.pool.calculate_managed_tasks();
        let reply = build_reply(
            message.control,
            &self.instance.hostname,
            self.pool.debug(),
            self.scheduler.debug(),
        );
        let result = match reply {
            Ok(payload) => self.notifier.notify(&reply_to, &payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("回复控制命令失败: {e}");
        }
    }

    async fn dispatch(&mut self, envelope: TaskEnvelope) {
        let preferred = self.next_preferred % self.pool.len().max(1);
        self.next_preferred = self.next_preferred.wrapping_add(1);

        let task = envelope.task.clone();
        let uuid = envelope.uuid.clone();
        if let Err(e) = self.pool.write(preferred, envelope).await {
            error!(task = %task, uuid = %uuid, "任务分发失败: {e}");
        }
    }

    async fn run_pending_schedules(&mut self) {
        for name in self.scheduler.get_and_mark_pending() {
            match self.schedule_tasks.get(&name) {
                Some(task) => {
                    debug!("周期任务 {name} 到期，分发 {task}");
                    let envelope = TaskEnvelope::bare(task.clone());
                    self.dispatch(envelope).await;
                }
                None => warn!("周期任务 {name} 没有对应的任务"),
            }
        }
    }

    async fn cleanup(&mut self) {
        match self.pool.cleanup().await {
            Ok(report) => {
                if !report.removed_workers.is_empty() || !report.retired_workers.is_empty() {
                    info!(
                        "进程池维护: 移除 {:?}，补充 {}，回收 {:?}",
                        report.removed_workers, report.spawned, report.retired_workers
                    );
                }
            }
            Err(e) => error!("进程池维护失败: {e}"),
        }
    }
}
