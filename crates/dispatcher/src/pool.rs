//! 本地 worker 进程池

use std::sync::Arc;
use std::time::Duration;

use dispatch_core::{
    models::{FinishedReport, TaskEnvelope},
    DispatchError, DispatchResult,
};
use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::process::{attach_pipes, StopSignal, WorkerControl, WorkerSpawner, QUIT_SENTINEL};

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// 进程池中的一个 worker
pub struct PoolWorker {
    id: usize,
    pid: Option<u32>,
    control: Box<dyn WorkerControl>,
    inbound: mpsc::UnboundedSender<String>,
    finished: mpsc::UnboundedReceiver<FinishedReport>,
    /// 已发出但尚未收到完成报告的任务，按发送顺序排列
    managed_tasks: Vec<TaskEnvelope>,
    messages_sent: u64,
    messages_finished: u64,
}

impl PoolWorker {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn busy(&self) -> bool {
        !self.managed_tasks.is_empty()
    }

    pub fn idle(&self) -> bool {
        !self.busy()
    }

    /// 排在当前任务之后的积压数量
    pub fn qsize(&self) -> usize {
        self.managed_tasks.len().saturating_sub(1)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn messages_finished(&self) -> u64 {
        self.messages_finished
    }

    /// worker 正在执行的任务
    pub fn current_task(&self) -> Option<&TaskEnvelope> {
        self.managed_tasks.first()
    }

    pub fn managed_tasks(&self) -> &[TaskEnvelope] {
        &self.managed_tasks
    }

    pub fn alive(&mut self) -> bool {
        !self.control.has_exited()
    }

    fn send(&mut self, envelope: TaskEnvelope) -> DispatchResult<()> {
        let payload = envelope.to_payload()?;
        if self.inbound.send(payload).is_err() {
            return Err(DispatchError::Process(format!(
                "worker {} 的输入管道已关闭",
                self.id
            )));
        }
        self.managed_tasks.push(envelope);
        self.messages_sent += 1;
        Ok(())
    }

    pub(crate) fn quit(&mut self) {
        // 管道已关闭时 worker 也已经在退出
        let _ = self.inbound.send(QUIT_SENTINEL.to_string());
    }

    /// 取走所有已到达的完成报告，按uuid从 `managed_tasks` 中移除
    fn drain_finished(&mut self) {
        while let Ok(report) = self.finished.try_recv() {
            match self.managed_tasks.iter().position(|t| t.uuid == report.uuid) {
                Some(pos) => {
                    let envelope = self.managed_tasks.remove(pos);
                    if let Some(error) = &report.error {
                        warn!(
                            task = %envelope.task,
                            uuid = %envelope.uuid,
                            "worker {} 报告任务失败: {error}",
                            self.id
                        );
                    }
                }
                None => warn!("worker {} 报告了未知任务 {}", self.id, report.uuid),
            }
            self.messages_finished += 1;
            counter!("dispatch_tasks_finished_total").increment(1);
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            pid: self.pid,
            busy: self.busy(),
            qsize: self.qsize(),
            messages_sent: self.messages_sent,
            messages_finished: self.messages_finished,
            current_task: self.current_task().map(|t| t.task.clone()),
            managed_tasks: self.managed_tasks.iter().map(|t| t.uuid.clone()).collect(),
        }
    }

    pub(crate) fn into_control(self) -> Box<dyn WorkerControl> {
        self.control
    }

    pub(crate) fn take_managed_tasks(&mut self) -> Vec<TaskEnvelope> {
        std::mem::take(&mut self.managed_tasks)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub pid: Option<u32>,
    pub busy: bool,
    pub qsize: usize,
    pub messages_sent: u64,
    pub messages_finished: u64,
    pub current_task: Option<String>,
    pub managed_tasks: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub workers: Vec<WorkerSnapshot>,
    pub qsize: usize,
    pub min_workers: usize,
    pub max_workers: Option<usize>,
}

impl PoolSnapshot {
    /// 所有正在处理的任务uuid
    pub fn running_uuids(&self) -> Vec<String> {
        self.workers
            .iter()
            .flat_map(|w| w.managed_tasks.iter().cloned())
            .collect()
    }
}

/// 固定大小的 worker 进程池
///
/// 只由分发任务独占使用，所有状态变更都经过 `&mut self`。
pub struct WorkerPool {
    spawner: Arc<dyn WorkerSpawner>,
    workers: Vec<PoolWorker>,
    min_workers: usize,
    next_id: usize,
    shutdown_grace: Duration,
}

impl WorkerPool {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, min_workers: usize) -> Self {
        Self {
            spawner,
            workers: Vec::new(),
            min_workers,
            next_id: 0,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoolWorker> {
        self.workers.iter()
    }

    pub fn get(&self, index: usize) -> Option<&PoolWorker> {
        self.workers.get(index)
    }

    /// 启动 worker 直到达到 `min_workers`
    pub async fn init_workers(&mut self) -> DispatchResult<()> {
        while self.workers.len() < self.min_workers {
            self.up().await?;
        }
        info!("进程池已初始化，共 {} 个worker", self.workers.len());
        Ok(())
    }

    /// 启动一个新的 worker，返回它的下标
    pub async fn up(&mut self) -> DispatchResult<usize> {
        let spawned = self.spawner.spawn().await?;
        let id = self.next_id;
        self.next_id += 1;

        let channels = attach_pipes(id, spawned.stdin, spawned.stdout);
        self.workers.push(PoolWorker {
            id,
            pid: spawned.pid,
            control: spawned.control,
            inbound: channels.inbound,
            finished: channels.finished,
            managed_tasks: Vec::new(),
            messages_sent: 0,
            messages_finished: 0,
        });

        counter!("dispatch_workers_spawned_total").increment(1);
        debug!("启动worker {id} pid={:?}", spawned.pid);
        Ok(self.workers.len() - 1)
    }

    /// 所有 worker 的积压总数
    pub fn qsize(&self) -> usize {
        self.workers.iter().map(PoolWorker::qsize).sum()
    }

    /// 根据各 worker 的完成报告更新在途任务
    pub fn calculate_managed_tasks(&mut self) {
        for worker in &mut self.workers {
            worker.drain_finished();
        }
    }

    /// 把任务写给一个 worker，返回实际使用的下标
    ///
    /// 首选 worker 空闲时直接使用，否则选最不忙的：没有积压的优先，
    /// 其次在途任务最少，最后下标最小。
    pub fn write(&mut self, preferred_index: usize, envelope: TaskEnvelope) -> DispatchResult<usize> {
        if self.workers.is_empty() {
            return Err(DispatchError::Process("进程池中没有worker".to_string()));
        }

        let index = match self.workers.get(preferred_index) {
            Some(worker) if worker.idle() => preferred_index,
            _ => self.least_busy(),
        };
        self.write_to(index, envelope)?;
        Ok(index)
    }

    pub(crate) fn least_busy(&self) -> usize {
        self.workers
            .iter()
            .enumerate()
            .min_by_key(|(index, w)| (w.qsize() > 0, w.managed_tasks.len(), *index))
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    pub(crate) fn write_to(&mut self, index: usize, envelope: TaskEnvelope) -> DispatchResult<()> {
        let worker = self
            .workers
            .get_mut(index)
            .ok_or_else(|| DispatchError::Process(format!("没有下标为 {index} 的worker")))?;

        let task = envelope.task.clone();
        let uuid = envelope.uuid.clone();
        worker.send(envelope).map_err(|e| {
            error!(task = %task, uuid = %uuid, "写入worker失败: {e}");
            e
        })?;

        counter!("dispatch_tasks_dispatched_total").increment(1);
        debug!(task = %task, uuid = %uuid, "任务已写入worker {}", worker.id);
        Ok(())
    }

    pub(crate) fn workers_mut(&mut self) -> &mut Vec<PoolWorker> {
        &mut self.workers
    }

    /// 停止所有 worker
    ///
    /// 先按 `signal` 通知，最多等待宽限期，仍未退出的强制终止。
    pub async fn stop(&mut self, signal: StopSignal) {
        if self.workers.is_empty() {
            return;
        }
        info!("停止进程池中的 {} 个worker ({:?})", self.workers.len(), signal);

        for worker in &mut self.workers {
            if signal == StopSignal::Terminate {
                worker.quit();
            }
            if let Err(e) = worker.control.signal(signal) {
                warn!("通知worker {} 停止失败: {e}", worker.id);
            }
        }

        let grace = self.shutdown_grace;
        let waited = tokio::time::timeout(
            grace,
            join_all(self.workers.iter_mut().map(|w| w.control.wait())),
        )
        .await;

        if waited.is_err() {
            warn!("worker在 {:?} 内未退出，强制终止", grace);
            for worker in &mut self.workers {
                if !worker.control.has_exited() {
                    if let Err(e) = worker.control.signal(StopSignal::Kill) {
                        warn!("强制终止worker {} 失败: {e}", worker.id);
                    }
                }
            }
            join_all(self.workers.iter_mut().map(|w| w.control.wait())).await;
        }

        for worker in &self.workers {
            if worker.busy() {
                warn!(
                    "worker {} 停止时仍有 {} 个任务未完成",
                    worker.id,
                    worker.managed_tasks.len()
                );
            }
        }
        self.workers.clear();
    }

    pub fn debug(&self) -> PoolSnapshot {
        PoolSnapshot {
            workers: self.workers.iter().map(PoolWorker::snapshot).collect(),
            qsize: self.qsize(),
            min_workers: self.min_workers,
            max_workers: None,
        }
    }
}
