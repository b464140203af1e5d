//! # Dispatch Testing Utils
//!
//! 工作区共享的测试工具：
//!
//! - **Mock仓储**: 内存中的 `JobRepository` 实现，行为与SQL实现一致
//! - **数据构建器**: 带合理默认值的 `JobRecord` 构建器
//! - **进程内worker**: 用 tokio 任务代替子进程的 `WorkerSpawner`
//! - **测试任务**: 预先注册好的 `dispatch.tests.*` 任务
//!
//! ```toml
//! [dev-dependencies]
//! dispatch-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;
pub mod spawner;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
pub use spawner::*;
