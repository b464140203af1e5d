//! 孤儿作业回收
//!
//! 节点或 worker 进程失败后，数据库里仍显示为运行中/等待中的作业永远不会结束，
//! 回收器把属于本节点、又不在本节点在途任务里的作业标记为失败。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dispatch_core::{
    config::ReaperSettings,
    models::{Instance, JobRecord, JobStatus},
    traits::JobRepository,
    DispatchError, DispatchResult,
};
use metrics::counter;
use tracing::{debug, error, info, warn};

pub const DEFAULT_WAITING_GRACE_PERIOD: Duration = Duration::from_secs(360);

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// 等待中的作业至少这么久未被修改才会被回收
    pub waiting_grace_period: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            waiting_grace_period: DEFAULT_WAITING_GRACE_PERIOD,
        }
    }
}

impl From<&ReaperSettings> for ReaperConfig {
    fn from(settings: &ReaperSettings) -> Self {
        Self {
            waiting_grace_period: settings.waiting_grace_period(),
        }
    }
}

pub struct Reaper {
    repo: Arc<dyn JobRepository>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(repo: Arc<dyn JobRepository>, config: ReaperConfig) -> Self {
        Self { repo, config }
    }

    /// 回收本节点上运行中的孤儿作业
    ///
    /// 执行节点或控制节点为本节点的运行中作业都会被回收，工作流作业和
    /// `excluded_uuids` 中的作业除外。给出 `ref_time` 时只回收在它之前已开始的作业，
    /// 尚未记录开始时间的作业视为在它之后开始。
    pub async fn reap(
        &self,
        instance: &Instance,
        excluded_uuids: &[String],
        ref_time: Option<DateTime<Utc>>,
    ) -> DispatchResult<Vec<JobRecord>> {
        let hostname = &instance.hostname;
        let candidates = self.repo.find_running_for_node(hostname).await?;

        let mut reaped = Vec::new();
        let mut failures = 0;
        for job in candidates {
            if job.kind.is_workflow() || excluded_uuids.contains(&job.uuid) {
                continue;
            }
            if let Some(ref_time) = ref_time {
                match job.started {
                    Some(started) if started < ref_time => {}
                    _ => {
                        debug!("{} 在参考时间之后开始，跳过", job.log_format());
                        continue;
                    }
                }
            }

            let explanation = format!(
                "Task was marked as failed by the reaper: it was running on {hostname} \
                 but no dispatcher process there is tracking it."
            );
            if let Some(job) = self
                .try_reap_job(job, JobStatus::Running, &explanation, &mut failures)
                .await
            {
                reaped.push(job);
            }
        }

        record_pass("running", reaped.len(), failures);
        Ok(reaped)
    }

    /// 回收本节点控制的、长期停留在等待状态的作业
    ///
    /// 只看控制节点：等待中的作业还没有交给执行节点。
    pub async fn reap_waiting(
        &self,
        instance: &Instance,
        excluded_uuids: &[String],
        ref_time: Option<DateTime<Utc>>,
    ) -> DispatchResult<Vec<JobRecord>> {
        let hostname = &instance.hostname;
        let grace = chrono::Duration::from_std(self.config.waiting_grace_period)
            .map_err(|e| DispatchError::Internal(format!("无效的宽限期: {e}")))?;
        let cutoff = ref_time.unwrap_or_else(Utc::now) - grace;

        let candidates = self.repo.find_stale_waiting(hostname, cutoff).await?;

        let mut reaped = Vec::new();
        let mut failures = 0;
        for job in candidates {
            if job.kind.is_workflow() || excluded_uuids.contains(&job.uuid) {
                continue;
            }
            let explanation = format!(
                "Task was marked as failed by the reaper: it was waiting on controller node \
                 {hostname} for more than {} seconds.",
                self.config.waiting_grace_period.as_secs()
            );
            if let Some(job) = self
                .try_reap_job(job, JobStatus::Waiting, &explanation, &mut failures)
                .await
            {
                reaped.push(job);
            }
        }

        record_pass("waiting", reaped.len(), failures);
        Ok(reaped)
    }

    /// 单个作业回收失败只记录下来，不影响同一轮的其他作业
    async fn try_reap_job(
        &self,
        job: JobRecord,
        expected: JobStatus,
        explanation: &str,
        failures: &mut usize,
    ) -> Option<JobRecord> {
        let description = job.log_format();
        match self.reap_job(job, expected, explanation).await {
            Ok(reaped) => reaped,
            Err(e) => {
                error!("回收作业 {description} 失败: {e}");
                *failures += 1;
                None
            }
        }
    }

    /// 作业仍处于 `expected` 状态时把它标记为失败，返回更新后的记录
    async fn reap_job(
        &self,
        job: JobRecord,
        expected: JobStatus,
        explanation: &str,
    ) -> DispatchResult<Option<JobRecord>> {
        if !self.repo.mark_failed(job.id, expected, explanation).await? {
            debug!("{} 的状态已经变化，不再回收", job.log_format());
            return Ok(None);
        }

        info!("回收作业 {}", job.log_format());
        let updated = self.repo.get_by_id(job.id).await?;
        Ok(Some(updated.unwrap_or(job)))
    }
}

fn record_pass(status: &'static str, reaped: usize, failures: usize) {
    if reaped > 0 {
        counter!("dispatch_jobs_reaped_total", "status" => status).increment(reaped as u64);
    }
    if failures > 0 {
        warn!("本轮有 {failures} 个{status}作业回收失败，留待下一轮");
        counter!("dispatch_jobs_reap_errors_total", "status" => status)
            .increment(failures as u64);
    }
}
