use std::sync::Arc;
use std::time::Duration;

use dispatch_core::{
    models::{FinishedReport, TaskEnvelope},
    registry::{task_fn, TaskArgs, TaskRegistry},
};
use dispatch_worker::{LineOutcome, TaskWorker};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn worker() -> TaskWorker {
    let mut registry = TaskRegistry::new("dispatch");
    registry
        .register(
            "dispatch.tests.add",
            task_fn(|args: TaskArgs| async move {
                let a: i64 = args.arg(0)?;
                let b: i64 = args.arg(1)?;
                Ok(json!(a + b))
            }),
        )
        .unwrap();
    registry
        .register(
            "dispatch.tests.fail",
            task_fn(|_args: TaskArgs| async move {
                Err::<Value, _>(anyhow::anyhow!("deliberate failure"))
            }),
        )
        .unwrap();
    registry
        .register(
            "dispatch.tests.slow",
            task_fn(|_args: TaskArgs| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Value::Null)
            }),
        )
        .unwrap();
    TaskWorker::new(Arc::new(registry))
}

fn envelope(task: &str, args: Vec<Value>) -> TaskEnvelope {
    TaskEnvelope::new(task, args, Map::new())
}

fn reports(output: &[u8]) -> Vec<FinishedReport> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_perform_work_success_and_failure() {
    let worker = worker();

    let ok = envelope("dispatch.tests.add", vec![json!(2), json!(2)]);
    assert_eq!(worker.perform_work(&ok).await, FinishedReport::success(&ok.uuid));

    let failing = envelope("dispatch.tests.fail", vec![]);
    let report = worker.perform_work(&failing).await;
    assert_eq!(report.uuid, failing.uuid);
    assert!(report.error.unwrap().contains("deliberate failure"));
}

#[tokio::test]
async fn test_unregistered_task_reports_error() {
    let worker = worker();
    let restricted = envelope("dispatch.tests.restricted", vec![]);
    let report = worker.perform_work(&restricted).await;
    assert_eq!(
        report.error.as_deref(),
        Some("dispatch.tests.restricted is not registered for dispatch")
    );
}

#[tokio::test]
async fn test_handle_line() {
    let worker = worker();
    assert_eq!(worker.handle_line("").await, LineOutcome::Skip);
    assert_eq!(worker.handle_line("   ").await, LineOutcome::Skip);
    assert_eq!(worker.handle_line("QUIT").await, LineOutcome::Quit);
    assert_eq!(worker.handle_line("not json").await, LineOutcome::Skip);

    // 缺少 task 字段但带有uuid
    match worker.handle_line(r#"{"uuid": "u-1", "args": []}"#).await {
        LineOutcome::Report(report) => {
            assert_eq!(report.uuid, "u-1");
            assert!(report.error.unwrap().starts_with("invalid task envelope"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_work_loop_processes_lines_until_quit() {
    let worker = worker();
    let first = envelope("dispatch.tests.add", vec![json!(1), json!(1)]);
    let second = envelope("dispatch.tests.fail", vec![]);
    let after_quit = envelope("dispatch.tests.add", vec![json!(3), json!(3)]);

    let input = format!(
        "{}\n\n{}\nQUIT\n{}\n",
        first.to_payload().unwrap(),
        second.to_payload().unwrap(),
        after_quit.to_payload().unwrap()
    );
    let mut output = Vec::new();
    worker
        .work_loop(BufReader::new(input.as_bytes()), &mut output)
        .await
        .unwrap();

    let reports = reports(&output);
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0], FinishedReport::success(&first.uuid));
    assert_eq!(reports[1].uuid, second.uuid);
    assert!(!reports[1].is_success());
}

#[tokio::test]
async fn test_work_loop_exits_on_eof() {
    let worker = worker();
    let only = envelope("dispatch.tests.add", vec![json!(1), json!(2)]);
    let input = format!("{}\n", only.to_payload().unwrap());

    let mut output = Vec::new();
    worker
        .work_loop(BufReader::new(input.as_bytes()), &mut output)
        .await
        .unwrap();
    assert_eq!(reports(&output), vec![FinishedReport::success(&only.uuid)]);
}

#[tokio::test]
async fn test_stop_signal_lets_current_task_finish() {
    let worker = worker();
    let (mut to_worker, worker_stdin) = tokio::io::duplex(4096);
    let (worker_stdout, from_worker) = tokio::io::duplex(4096);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        worker
            .work_loop_until(BufReader::new(worker_stdin), worker_stdout, async {
                let _ = stop_rx.await;
            })
            .await
    });

    let slow = envelope("dispatch.tests.slow", vec![]);
    to_worker
        .write_all(format!("{}\n", slow.to_payload().unwrap()).as_bytes())
        .await
        .unwrap();

    // 任务执行期间发出停止信号
    tokio::time::sleep(Duration::from_millis(10)).await;
    stop_tx.send(()).unwrap();

    let mut lines = BufReader::new(from_worker).lines();
    let line = lines.next_line().await.unwrap().unwrap();
    let report: FinishedReport = serde_json::from_str(&line).unwrap();
    assert_eq!(report, FinishedReport::success(&slow.uuid));

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
