use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::{
    config::ValidationUtils,
    models::{JobRecord, JobStatus},
    traits::JobRepository,
    DispatchResult,
};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::debug;

const JOB_COLUMNS: &str = "id, uuid, kind, status, execution_node, controller_node, \
                           modified, started, job_explanation, start_args";

/// PostgreSQL 作业仓储
///
/// 表结构由外部数据模型维护，这里只依赖上面列出的列。
pub struct PostgresJobRepository {
    pool: PgPool,
    table: String,
}

impl PostgresJobRepository {
    /// `table` 会被拼进 SQL，必须是合法的标识符
    pub fn new(pool: PgPool, table: impl Into<String>) -> DispatchResult<Self> {
        let table = table.into();
        ValidationUtils::validate_sql_identifier(&table, "jobs table")?;
        Ok(Self { pool, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn row_to_job(row: &PgRow) -> DispatchResult<JobRecord> {
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;

        Ok(JobRecord {
            id: row.try_get("id")?,
            uuid: row.try_get::<Option<String>, _>("uuid")?.unwrap_or_default(),
            kind: kind.parse()?,
            status: status.parse()?,
            execution_node: row
                .try_get::<Option<String>, _>("execution_node")?
                .unwrap_or_default(),
            controller_node: row
                .try_get::<Option<String>, _>("controller_node")?
                .unwrap_or_default(),
            modified: row.try_get("modified")?,
            started: row.try_get("started")?,
            job_explanation: row
                .try_get::<Option<String>, _>("job_explanation")?
                .unwrap_or_default(),
            start_args: row
                .try_get::<Option<String>, _>("start_args")?
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    async fn find_running_for_node(&self, hostname: &str) -> DispatchResult<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} \
             WHERE status = 'running' AND (execution_node = $1 OR controller_node = $1) \
             ORDER BY id",
            self.table
        );
        let rows = sqlx::query(&sql).bind(hostname).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn find_stale_waiting(
        &self,
        controller_node: &str,
        modified_before: DateTime<Utc>,
    ) -> DispatchResult<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} \
             WHERE status = 'waiting' AND controller_node = $1 AND modified < $2 \
             ORDER BY id",
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(controller_node)
            .bind(modified_before)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn get_by_id(&self, id: i64) -> DispatchResult<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM {} WHERE id = $1", self.table);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn mark_failed(
        &self,
        id: i64,
        expected: JobStatus,
        explanation: &str,
    ) -> DispatchResult<bool> {
        // 状态检查与更新必须在同一条语句内完成
        let sql = format!(
            "UPDATE {} SET status = 'failed', start_args = '', modified = NOW(), \
             job_explanation = CASE \
                 WHEN COALESCE(job_explanation, '') = '' THEN $3 \
                 ELSE job_explanation || ' ' || $3 END \
             WHERE id = $1 AND status = $2",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(expected.as_str())
            .bind(explanation)
            .execute(&self.pool)
            .await?;

        let updated = result.rows_affected() > 0;
        debug!(job_id = id, updated, "标记作业失败");
        Ok(updated)
    }
}
