//! 按负载伸缩的进程池

use std::sync::Arc;
use std::time::Duration;

use dispatch_core::{models::TaskEnvelope, DispatchError, DispatchResult};
use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

use crate::pool::{PoolSnapshot, PoolWorker, WorkerPool};
use crate::process::{StopSignal, WorkerControl, WorkerSpawner};

/// 一次 `cleanup` 的结果
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// 已退出并被移除的 worker
    pub removed_workers: Vec<usize>,
    /// 随死亡 worker 一起丢失的任务，不会被重新执行
    pub orphaned: Vec<TaskEnvelope>,
    pub spawned: usize,
    /// 因空闲而被回收的 worker
    pub retired_workers: Vec<usize>,
}

/// 在 `min_workers` 与 `max_workers` 之间伸缩的进程池
pub struct AutoscalePool {
    pool: WorkerPool,
    max_workers: usize,
}

impl AutoscalePool {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        min_workers: usize,
        max_workers: usize,
    ) -> DispatchResult<Self> {
        if max_workers == 0 {
            return Err(DispatchError::config("max_workers must be at least 1"));
        }
        if min_workers > max_workers {
            return Err(DispatchError::config(format!(
                "min_workers ({min_workers}) cannot exceed max_workers ({max_workers})"
            )));
        }
        Ok(Self {
            pool: WorkerPool::new(spawner, min_workers),
            max_workers,
        })
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.pool = self.pool.with_shutdown_grace(grace);
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn min_workers(&self) -> usize {
        self.pool.min_workers()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn full(&self) -> bool {
        self.pool.len() >= self.max_workers
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoolWorker> {
        self.pool.iter()
    }

    pub fn calculate_managed_tasks(&mut self) {
        self.pool.calculate_managed_tasks();
    }

    pub async fn init_workers(&mut self) -> DispatchResult<()> {
        self.pool.init_workers().await
    }

    /// 增加一个 worker；池已满时返回 `None`
    pub async fn up(&mut self) -> DispatchResult<Option<usize>> {
        if self.full() {
            return Ok(None);
        }
        let index = self.pool.up().await?;
        gauge!("dispatch_pool_workers").set(self.pool.len() as f64);
        Ok(Some(index))
    }

    /// 写入任务，必要时先扩容
    pub async fn write(
        &mut self,
        preferred_index: usize,
        envelope: TaskEnvelope,
    ) -> DispatchResult<usize> {
        self.pool.calculate_managed_tasks();

        let (removed, orphaned) = self.remove_dead_workers();
        if !removed.is_empty() {
            warn!("写入前发现 {} 个worker已退出", removed.len());
            log_orphans(&orphaned);
        }
        // 启动失败时任务仍交给现有的 worker，只有一个 worker 都没有时才返回错误
        if let Err(e) = self.replace_missing_workers().await {
            warn!("补充worker失败，使用现有的 {} 个worker: {e}", self.pool.len());
        }

        let all_busy = self.pool.iter().all(PoolWorker::busy);
        if all_busy && !self.full() {
            debug!("所有worker都在忙，扩容进程池");
            if let Err(e) = self.up().await {
                warn!("扩容失败，任务排入现有worker的积压: {e}");
            }
        }

        let idle = match self.pool.get(preferred_index) {
            Some(worker) if worker.idle() => Some(preferred_index),
            _ => self.pool.iter().position(PoolWorker::idle),
        };

        match idle {
            Some(index) => {
                self.pool.write_to(index, envelope)?;
                Ok(index)
            }
            None => self.pool.write(preferred_index, envelope),
        }
    }

    /// 周期性维护：移除已退出的 worker，补足下限，回收多余的空闲 worker
    pub async fn cleanup(&mut self) -> DispatchResult<CleanupReport> {
        self.pool.calculate_managed_tasks();

        let (removed_workers, orphaned) = self.remove_dead_workers();
        log_orphans(&orphaned);

        let spawned = self.replace_missing_workers().await?;
        let retired_workers = self.retire_idle_workers();

        gauge!("dispatch_pool_workers").set(self.pool.len() as f64);
        gauge!("dispatch_pool_qsize").set(self.pool.qsize() as f64);

        Ok(CleanupReport {
            removed_workers,
            orphaned,
            spawned,
            retired_workers,
        })
    }

    fn remove_dead_workers(&mut self) -> (Vec<usize>, Vec<TaskEnvelope>) {
        let mut removed = Vec::new();
        let mut orphaned = Vec::new();

        let workers = self.pool.workers_mut();
        let mut index = 0;
        while index < workers.len() {
            if workers[index].alive() {
                index += 1;
                continue;
            }
            let mut worker = workers.remove(index);
            error!(
                "worker {} (pid={:?}) 已退出，丢失 {} 个任务",
                worker.id(),
                worker.pid(),
                worker.managed_tasks().len()
            );
            removed.push(worker.id());
            orphaned.extend(worker.take_managed_tasks());
        }

        if !removed.is_empty() {
            counter!("dispatch_workers_died_total").increment(removed.len() as u64);
        }
        (removed, orphaned)
    }

    async fn replace_missing_workers(&mut self) -> DispatchResult<usize> {
        let mut spawned = 0;
        while self.pool.len() < self.pool.min_workers() {
            self.pool.up().await?;
            spawned += 1;
        }
        if spawned > 0 {
            info!("补充了 {spawned} 个worker");
        }
        Ok(spawned)
    }

    /// 从末尾开始回收空闲 worker，直到回到 `min_workers`
    fn retire_idle_workers(&mut self) -> Vec<usize> {
        let min_workers = self.pool.min_workers();
        let grace = self.pool.shutdown_grace();
        let mut retired = Vec::new();

        let workers = self.pool.workers_mut();
        let mut index = workers.len();
        while index > 0 && workers.len() > min_workers {
            index -= 1;
            if workers[index].busy() {
                continue;
            }
            let mut worker = workers.remove(index);
            worker.quit();
            info!("回收空闲worker {} (pid={:?})", worker.id(), worker.pid());
            retired.push(worker.id());
            tokio::spawn(reap_retired(worker.id(), worker.into_control(), grace));
        }

        if !retired.is_empty() {
            counter!("dispatch_workers_retired_total").increment(retired.len() as u64);
        }
        retired
    }

    pub async fn stop(&mut self, signal: StopSignal) {
        self.pool.stop(signal).await;
    }

    pub fn debug(&self) -> PoolSnapshot {
        let mut snapshot = self.pool.debug();
        snapshot.max_workers = Some(self.max_workers);
        snapshot
    }
}

fn log_orphans(orphaned: &[TaskEnvelope]) {
    for envelope in orphaned {
        error!(
            task = %envelope.task,
            uuid = %envelope.uuid,
            "任务随worker退出而丢失，不会重新执行"
        );
    }
    if !orphaned.is_empty() {
        counter!("dispatch_tasks_orphaned_total").increment(orphaned.len() as u64);
    }
}

/// 等待被回收的 worker 在宽限期内自行退出，否则强制终止
async fn reap_retired(id: usize, mut control: Box<dyn WorkerControl>, grace: Duration) {
    if tokio::time::timeout(grace, control.wait()).await.is_ok() {
        debug!("worker {id} 已退出");
        return;
    }
    warn!("worker {id} 在 {:?} 内未退出，强制终止", grace);
    if let Err(e) = control.signal(StopSignal::Kill) {
        warn!("强制终止worker {id} 失败: {e}");
    }
    control.wait().await;
}
