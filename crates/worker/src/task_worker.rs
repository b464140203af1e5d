use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dispatch_core::{
    models::{FinishedReport, TaskEnvelope},
    registry::TaskRegistry,
    DispatchResult,
};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// 通知 worker 退出的行
pub const QUIT_SENTINEL: &str = "QUIT";

/// 处理一行输入的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// 写回一条完成报告
    Report(FinishedReport),
    /// 空行或无法识别的行，不需要回复
    Skip,
    Quit,
}

/// 在单个进程内顺序执行任务的 worker
#[derive(Clone)]
pub struct TaskWorker {
    registry: Arc<TaskRegistry>,
}

impl TaskWorker {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// 执行一个任务，把结果转成完成报告
    ///
    /// 任务失败不会中断 worker，错误信息放进报告里。
    pub async fn perform_work(&self, envelope: &TaskEnvelope) -> FinishedReport {
        let started = Instant::now();
        debug!(task = %envelope.task, uuid = %envelope.uuid, "开始执行任务");

        match self.registry.resolve_and_run(envelope).await {
            Ok(result) => {
                info!(
                    task = %envelope.task,
                    uuid = %envelope.uuid,
                    "任务完成，耗时 {:.3}s: {}",
                    started.elapsed().as_secs_f64(),
                    result
                );
                FinishedReport::success(&envelope.uuid)
            }
            Err(e) => {
                error!(task = %envelope.task, uuid = %envelope.uuid, "任务失败: {e}");
                FinishedReport::failure(&envelope.uuid, e.to_string())
            }
        }
    }

    pub async fn handle_line(&self, line: &str) -> LineOutcome {
        let line = line.trim();
        if line.is_empty() {
            return LineOutcome::Skip;
        }
        if line == QUIT_SENTINEL {
            return LineOutcome::Quit;
        }

        match TaskEnvelope::from_payload(line) {
            Ok(envelope) => LineOutcome::Report(self.perform_work(&envelope).await),
            Err(e) => {
                // 能取到uuid时照样回报，分发端据此清掉在途记录
                let uuid = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("uuid").and_then(Value::as_str).map(str::to_string));
                match uuid {
                    Some(uuid) => {
                        warn!(uuid = %uuid, "无法解析任务信封: {e}");
                        LineOutcome::Report(FinishedReport::failure(
                            uuid,
                            format!("invalid task envelope: {e}"),
                        ))
                    }
                    None => {
                        warn!("忽略无法解析的输入 ({e}): {line}");
                        LineOutcome::Skip
                    }
                }
            }
        }
    }

    /// 处理输入直到 `QUIT` 或输入结束
    pub async fn work_loop<R, W>(&self, reader: R, writer: W) -> DispatchResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.work_loop_until(reader, writer, std::future::pending())
            .await
    }

    /// 与 [`work_loop`](Self::work_loop) 相同，但 `stop` 完成后不再读取新任务
    ///
    /// 正在执行的任务总会跑完并写回报告。
    pub async fn work_loop_until<R, W, F>(&self, reader: R, mut writer: W, stop: F) -> DispatchResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        let mut lines = reader.lines();
        tokio::pin!(stop);

        loop {
            let line = tokio::select! {
                biased;
                _ = &mut stop => {
                    info!("worker收到停止信号，退出");
                    break;
                }
                line = lines.next_line() => line?,
            };

            let Some(line) = line else {
                debug!("输入已关闭，worker退出");
                break;
            };

            match self.handle_line(&line).await {
                LineOutcome::Report(report) => {
                    let mut payload = serde_json::to_string(&report)?;
                    payload.push('\n');
                    writer.write_all(payload.as_bytes()).await?;
                    writer.flush().await?;
                }
                LineOutcome::Skip => {}
                LineOutcome::Quit => {
                    debug!("收到 {QUIT_SENTINEL}，worker退出");
                    break;
                }
            }
        }
        Ok(())
    }
}
