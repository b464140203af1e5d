pub mod in_memory_bus;
pub mod postgres;

pub use in_memory_bus::{InMemoryBus, InMemoryConnection};
pub use postgres::{notify, DatabaseManager, PgNotifier, PgPubSubConnection, PostgresJobRepository};
