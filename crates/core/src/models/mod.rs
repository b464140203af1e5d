pub mod control;
pub mod envelope;
pub mod job;
pub mod report;

pub use control::{ControlCommand, ControlMessage, InboundMessage};
pub use envelope::{QueueName, TaskEnvelope};
pub use job::{Instance, JobKind, JobRecord, JobStatus, NodeType};
pub use report::FinishedReport;
