use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{JobRecord, JobStatus},
    DispatchResult,
};

/// 作业记录的窄接口
///
/// 数据模型归外部所有；分发层只查询运行中/等待中的作业，并把孤儿作业标记为失败。
/// 这里不提供创建或删除。
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 状态为 running，且执行节点或控制节点为 `hostname` 的作业
    async fn find_running_for_node(&self, hostname: &str) -> DispatchResult<Vec<JobRecord>>;

    /// 状态为 waiting、控制节点为 `hostname`、且 `modified` 早于 `modified_before` 的作业
    async fn find_stale_waiting(
        &self,
        controller_node: &str,
        modified_before: DateTime<Utc>,
    ) -> DispatchResult<Vec<JobRecord>>;

    /// 根据ID获取作业
    async fn get_by_id(&self, id: i64) -> DispatchResult<Option<JobRecord>>;

    /// 仅当作业仍处于 `expected` 状态时，把它标记为 failed：
    /// 清空 `start_args`，并把 `explanation` 追加到 `job_explanation`。
    ///
    /// 返回是否真的更新了记录。
    async fn mark_failed(
        &self,
        id: i64,
        expected: JobStatus,
        explanation: &str,
    ) -> DispatchResult<bool>;
}
