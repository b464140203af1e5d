//! 进程内 worker
//!
//! 每个 worker 是一个跑着 [`TaskWorker::work_loop_until`] 的 tokio 任务，
//! 管道用 `tokio::io::duplex` 代替。可以按启动顺序让某个 worker 崩溃。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dispatch_core::{registry::TaskRegistry, DispatchError, DispatchResult};
use dispatch_dispatcher::process::{SpawnedWorker, StopSignal, WorkerControl, WorkerSpawner};
use dispatch_worker::TaskWorker;
use tokio::io::BufReader;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};

const PIPE_CAPACITY: usize = 64 * 1024;

pub struct InProcessSpawner {
    worker: TaskWorker,
    spawned: Mutex<Vec<AbortHandle>>,
    /// 剩余需要失败的启动次数
    failing_spawns: AtomicUsize,
}

impl InProcessSpawner {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            worker: TaskWorker::new(registry),
            spawned: Mutex::new(Vec::new()),
            failing_spawns: AtomicUsize::new(0),
        }
    }

    /// 已启动的 worker 数量，包括已退出的
    pub fn spawned_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    /// 让第 `n` 个启动的 worker（从0开始）立即崩溃
    pub fn crash(&self, n: usize) {
        if let Some(handle) = self.spawned.lock().unwrap().get(n) {
            handle.abort();
        }
    }

    /// 接下来的 `count` 次启动失败
    pub fn fail_next_spawns(&self, count: usize) {
        self.failing_spawns.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerSpawner for InProcessSpawner {
    async fn spawn(&self) -> DispatchResult<SpawnedWorker> {
        let failing = self
            .failing_spawns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(DispatchError::Process("模拟的worker启动失败".to_string()));
        }

        let (dispatcher_stdin, worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_stdout, dispatcher_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let worker = self.worker.clone();
        let handle = tokio::spawn(async move {
            worker
                .work_loop_until(BufReader::new(worker_stdin), worker_stdout, async {
                    let _ = stop_rx.await;
                })
                .await
        });
        self.spawned.lock().unwrap().push(handle.abort_handle());

        Ok(SpawnedWorker {
            pid: None,
            stdin: Box::new(dispatcher_stdin),
            stdout: Box::new(dispatcher_stdout),
            control: Box::new(TaskControl {
                handle,
                stop: Some(stop_tx),
                finished: false,
            }),
        })
    }
}

struct TaskControl {
    handle: JoinHandle<DispatchResult<()>>,
    stop: Option<oneshot::Sender<()>>,
    finished: bool,
}

#[async_trait]
impl WorkerControl for TaskControl {
    fn signal(&mut self, signal: StopSignal) -> DispatchResult<()> {
        match signal {
            StopSignal::Terminate => {
                if let Some(stop) = self.stop.take() {
                    let _ = stop.send(());
                }
            }
            StopSignal::Kill => self.handle.abort(),
        }
        Ok(())
    }

    fn has_exited(&mut self) -> bool {
        self.finished || self.handle.is_finished()
    }

    async fn wait(&mut self) {
        if self.finished {
            return;
        }
        let _ = (&mut self.handle).await;
        self.finished = true;
    }
}
