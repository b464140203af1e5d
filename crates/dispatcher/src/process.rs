//! worker 进程的启动与通信
//!
//! 每个 worker 通过两条管道与分发进程通信：stdin 逐行接收任务信封或 `QUIT`，
//! stdout 逐行写回 [`FinishedReport`]。管道两端各由一个后台任务驱动，
//! 进程池只和 channel 打交道。

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use dispatch_core::{models::FinishedReport, DispatchError, DispatchResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 通知 worker 退出的行
pub const QUIT_SENTINEL: &str = "QUIT";

/// 停止 worker 的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM 并发送 `QUIT`，worker 完成当前任务后退出
    Terminate,
    /// 立即强制终止
    Kill,
}

/// 对一个 worker 进程生命周期的控制
#[async_trait]
pub trait WorkerControl: Send {
    fn signal(&mut self, signal: StopSignal) -> DispatchResult<()>;

    /// 非阻塞地检查进程是否已经退出
    fn has_exited(&mut self) -> bool;

    /// 等待进程退出
    async fn wait(&mut self);
}

/// 刚启动的 worker：原始管道加上生命周期控制
pub struct SpawnedWorker {
    pub pid: Option<u32>,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Box<dyn WorkerControl>,
}

/// 启动 worker 的方式
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self) -> DispatchResult<SpawnedWorker>;
}

/// 以子进程方式启动 worker
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    /// 使用当前可执行文件作为 worker 程序
    pub fn current_exe(args: Vec<String>) -> DispatchResult<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, args))
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self) -> DispatchResult<SpawnedWorker> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DispatchError::Process(format!("无法启动worker进程 {:?}: {e}", self.program))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DispatchError::Process("worker进程没有stdin管道".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DispatchError::Process("worker进程没有stdout管道".to_string()))?;

        let pid = child.id();
        debug!("worker进程已启动 pid={:?}", pid);

        Ok(SpawnedWorker {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            control: Box::new(ChildControl { child }),
        })
    }
}

struct ChildControl {
    child: Child,
}

#[async_trait]
impl WorkerControl for ChildControl {
    fn signal(&mut self, signal: StopSignal) -> DispatchResult<()> {
        match signal {
            StopSignal::Kill => self.child.start_kill().map_err(DispatchError::from),
            StopSignal::Terminate => terminate(&mut self.child),
        }
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    async fn wait(&mut self) {
        if let Err(e) = self.child.wait().await {
            warn!("等待worker进程退出失败: {e}");
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> DispatchResult<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // 已经退出的进程没有pid
    let Some(pid) = child.id() else {
        return Ok(());
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(DispatchError::Process(format!(
            "无法向worker进程 {pid} 发送SIGTERM: {e}"
        ))),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> DispatchResult<()> {
    child.start_kill().map_err(DispatchError::from)
}

/// 已接入进程池的管道两端
pub struct WorkerChannels {
    pub inbound: mpsc::UnboundedSender<String>,
    pub finished: mpsc::UnboundedReceiver<FinishedReport>,
}

/// 为 worker 的两条管道各启动一个后台任务
///
/// 写端任务把 channel 中的行写进 stdin，管道关闭即退出；读端任务把 stdout 的每一行
/// 解析为 [`FinishedReport`]，无法解析的行记录后丢弃。
pub fn attach_pipes(
    worker_id: usize,
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    stdout: Box<dyn AsyncRead + Send + Unpin>,
) -> WorkerChannels {
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<String>();
    let (finished_tx, finished_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(line) = inbound_rx.recv().await {
            let written = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                debug!("worker {worker_id} 的stdin已关闭: {e}");
                break;
            }
        }
        let _ = stdin.shutdown().await;
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<FinishedReport>(&line) {
                        Ok(report) => {
                            if finished_tx.send(report).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("worker {worker_id} 输出了无法解析的行 ({e}): {line}"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("读取worker {worker_id} 的stdout失败: {e}");
                    break;
                }
            }
        }
    });

    WorkerChannels {
        inbound: inbound_tx,
        finished: finished_rx,
    }
}
