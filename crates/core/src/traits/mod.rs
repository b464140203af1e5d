pub mod job_repository;
pub mod notification_bus;

pub use job_repository::JobRepository;
pub use notification_bus::{Notification, Notifier, PubSubConnection};
