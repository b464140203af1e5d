pub mod bus;
pub mod job_repository;
pub mod manager;

pub use bus::{notify, PgNotifier, PgPubSubConnection};
pub use job_repository::PostgresJobRepository;
pub use manager::DatabaseManager;
