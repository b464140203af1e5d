//! Mock implementations
//!
//! 内存中的仓储和通知实现，不需要数据库。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::{
    models::{JobRecord, JobStatus},
    traits::{JobRepository, Notifier},
    DispatchError, DispatchResult,
};

/// Mock implementation of JobRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockJobRepository {
    jobs: Arc<Mutex<BTreeMap<i64, JobRecord>>>,
    fail_queries: Arc<Mutex<bool>>,
    failing_updates: Arc<Mutex<BTreeSet<i64>>>,
}

impl MockJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(jobs: Vec<JobRecord>) -> Self {
        let repo = Self::new();
        for job in jobs {
            repo.insert(job);
        }
        repo
    }

    pub fn insert(&self, job: JobRecord) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn get(&self, id: i64) -> Option<JobRecord> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    /// 直接修改一条记录，模拟并发写入
    pub fn set_status(&self, id: i64, status: JobStatus) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&id) {
            job.status = status;
        }
    }

    pub fn count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// 之后的查询都返回错误
    pub fn fail_queries(&self, fail: bool) {
        *self.fail_queries.lock().unwrap() = fail;
    }

    /// 之后对该作业的 `mark_failed` 都返回错误
    pub fn fail_updates_for(&self, id: i64) {
        self.failing_updates.lock().unwrap().insert(id);
    }

    fn check_available(&self) -> DispatchResult<()> {
        if *self.fail_queries.lock().unwrap() {
            return Err(DispatchError::Internal("mock数据库不可用".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobRepository for MockJobRepository {
    async fn find_running_for_node(&self, hostname: &str) -> DispatchResult<Vec<JobRecord>> {
        self.check_available()?;
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|job| job.status == JobStatus::Running && job.is_owned_by(hostname))
            .cloned()
            .collect())
    }

    async fn find_stale_waiting(
        &self,
        controller_node: &str,
        modified_before: DateTime<Utc>,
    ) -> DispatchResult<Vec<JobRecord>> {
        self.check_available()?;
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|job| {
                job.status == JobStatus::Waiting
                    && job.controller_node == controller_node
                    && job.modified < modified_before
            })
            .cloned()
            .collect())
    }

    async fn get_by_id(&self, id: i64) -> DispatchResult<Option<JobRecord>> {
        self.check_available()?;
        Ok(self.get(id))
    }

    async fn mark_failed(
        &self,
        id: i64,
        expected: JobStatus,
        explanation: &str,
    ) -> DispatchResult<bool> {
        self.check_available()?;
        if self.failing_updates.lock().unwrap().contains(&id) {
            return Err(DispatchError::Internal(format!("mock数据库无法更新作业 {id}")));
        }
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != expected {
            return Ok(false);
        }

        job.status = JobStatus::Failed;
        job.start_args.clear();
        job.job_explanation = if job.job_explanation.is_empty() {
            explanation.to_string()
        } else {
            format!("{} {}", job.job_explanation, explanation)
        };
        job.modified = Utc::now();
        Ok(true)
    }
}

/// 记录所有发布内容的 Notifier
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, channel: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: &str, payload: &str) -> DispatchResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.to_string()));
        Ok(())
    }
}
