use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DispatchError, DispatchResult};

/// 作业状态（由外部数据模型持有，分发层只做少量迁移）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Pending,
    Waiting,
    Running,
    Successful,
    Failed,
    Error,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Pending => "pending",
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        }
    }

    /// 只有运行中或等待中的作业会被回收
    pub fn is_reapable(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Waiting)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> DispatchResult<Self> {
        match s {
            "new" => Ok(JobStatus::New),
            "pending" => Ok(JobStatus::Pending),
            "waiting" => Ok(JobStatus::Waiting),
            "running" => Ok(JobStatus::Running),
            "successful" => Ok(JobStatus::Successful),
            "failed" => Ok(JobStatus::Failed),
            "error" => Ok(JobStatus::Error),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(DispatchError::Internal(format!("未知的作业状态: {other}"))),
        }
    }
}

/// 作业种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Job,
    ProjectUpdate,
    InventoryUpdate,
    SystemJob,
    AdHocCommand,
    /// 工作流聚合作业，本身不运行任何进程
    WorkflowJob,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Job => "job",
            JobKind::ProjectUpdate => "project_update",
            JobKind::InventoryUpdate => "inventory_update",
            JobKind::SystemJob => "system_job",
            JobKind::AdHocCommand => "ad_hoc_command",
            JobKind::WorkflowJob => "workflow_job",
        }
    }

    pub fn is_workflow(&self) -> bool {
        matches!(self, JobKind::WorkflowJob)
    }
}

impl FromStr for JobKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> DispatchResult<Self> {
        match s {
            "job" => Ok(JobKind::Job),
            "project_update" => Ok(JobKind::ProjectUpdate),
            "inventory_update" => Ok(JobKind::InventoryUpdate),
            "system_job" => Ok(JobKind::SystemJob),
            "ad_hoc_command" => Ok(JobKind::AdHocCommand),
            "workflow_job" => Ok(JobKind::WorkflowJob),
            other => Err(DispatchError::Internal(format!("未知的作业种类: {other}"))),
        }
    }
}

/// 作业记录中分发层会读写的字段子集
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    /// 分发时使用的任务uuid
    pub uuid: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub execution_node: String,
    pub controller_node: String,
    pub modified: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub job_explanation: String,
    pub start_args: String,
}

impl JobRecord {
    pub fn log_format(&self) -> String {
        format!("{}-{}-{}", self.kind.as_str(), self.id, self.status)
    }

    /// 作业是否由指定节点执行或控制
    pub fn is_owned_by(&self, hostname: &str) -> bool {
        self.execution_node == hostname || self.controller_node == hostname
    }
}

/// 集群节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Control,
    Execution,
    #[default]
    Hybrid,
    Hop,
}

/// 集群节点身份，由外部心跳/成员管理提供
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub hostname: String,
    #[serde(default)]
    pub node_type: NodeType,
}

impl Instance {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            node_type: NodeType::default(),
        }
    }

    pub fn with_node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = node_type;
        self
    }
}
