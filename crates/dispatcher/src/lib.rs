//! 分发进程
//!
//! 监听通知总线，把任务交给本地 worker 进程池执行，并负责周期任务和孤儿作业回收。

pub mod autoscale;
pub mod control;
pub mod periodic;
pub mod pool;
pub mod process;
pub mod reaper;
pub mod service;

pub use autoscale::{AutoscalePool, CleanupReport};
pub use control::{build_reply, ControlClient, StatusReply};
pub use periodic::{ScheduleEntry, ScheduleStatus, Scheduler, SchedulerSnapshot};
pub use pool::{PoolSnapshot, PoolWorker, WorkerPool, WorkerSnapshot};
pub use process::{
    ProcessSpawner, SpawnedWorker, StopSignal, WorkerControl, WorkerSpawner, QUIT_SENTINEL,
};
pub use reaper::{Reaper, ReaperConfig};
pub use service::{DispatcherService, ServiceConfig};
