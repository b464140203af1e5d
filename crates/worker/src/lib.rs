//! worker 进程
//!
//! 从 stdin 逐行读取任务信封，按名称在注册表中解析并执行，
//! 每完成一个任务向 stdout 写一行完成报告。日志只能写 stderr。

pub mod task_worker;

pub use task_worker::{LineOutcome, TaskWorker, QUIT_SENTINEL};
