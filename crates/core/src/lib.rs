pub mod bus;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod registry;
pub mod shutdown;
pub mod traits;

pub use bus::{BusEvent, PubSub, ReconnectPolicy};
pub use config::{AppConfig, ConfigValidator};
pub use errors::{DispatchError, DispatchResult};
pub use logging::{init_logging, LogTarget};
pub use models::{
    ControlCommand, ControlMessage, FinishedReport, InboundMessage, Instance, JobKind, JobRecord,
    JobStatus, NodeType, QueueName, TaskEnvelope,
};
pub use registry::{
    task_fn, TaskArgs, TaskError, TaskHandle, TaskHandler, TaskOutcome, TaskRegistry,
};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use traits::{JobRepository, Notification, Notifier, PubSubConnection};
