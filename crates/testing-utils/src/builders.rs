//! Test data builders
//!
//! 带合理默认值的作业记录构建器。

use chrono::{DateTime, Duration, Utc};
use dispatch_core::models::{JobKind, JobRecord, JobStatus};

/// Builder for creating test JobRecord entities
pub struct JobRecordBuilder {
    job: JobRecord,
}

impl JobRecordBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            job: JobRecord {
                id: 1,
                uuid: uuid::Uuid::new_v4().to_string(),
                kind: JobKind::Job,
                status: JobStatus::Pending,
                execution_node: String::new(),
                controller_node: String::new(),
                modified: now,
                started: None,
                job_explanation: String::new(),
                start_args: "SENSITIVE".to_string(),
            },
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.job.id = id;
        self
    }

    pub fn with_uuid(mut self, uuid: &str) -> Self {
        self.job.uuid = uuid.to_string();
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.job.kind = kind;
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.job.status = status;
        self
    }

    pub fn with_execution_node(mut self, node: &str) -> Self {
        self.job.execution_node = node.to_string();
        self
    }

    pub fn with_controller_node(mut self, node: &str) -> Self {
        self.job.controller_node = node.to_string();
        self
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.job.modified = modified;
        self
    }

    pub fn with_started(mut self, started: DateTime<Utc>) -> Self {
        self.job.started = Some(started);
        self
    }

    pub fn with_job_explanation(mut self, explanation: &str) -> Self {
        self.job.job_explanation = explanation.to_string();
        self
    }

    pub fn with_start_args(mut self, start_args: &str) -> Self {
        self.job.start_args = start_args.to_string();
        self
    }

    /// 在 `node` 上运行中，一小时前开始
    pub fn running_on(self, node: &str) -> Self {
        self.with_status(JobStatus::Running)
            .with_execution_node(node)
            .with_started(Utc::now() - Duration::hours(1))
    }

    /// 由 `node` 控制、处于等待状态，`age` 之前最后一次修改
    pub fn waiting_on(self, node: &str, age: Duration) -> Self {
        self.with_status(JobStatus::Waiting)
            .with_controller_node(node)
            .with_modified(Utc::now() - age)
    }

    pub fn build(self) -> JobRecord {
        self.job
    }
}

impl Default for JobRecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}
