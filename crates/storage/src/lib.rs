use std::future::Future;
use std::time::Duration;

use tablegate_contracts::{
    Attributes, ErrorKind, Failure, OwnershipCondition, Record, StorageCommand, StorageOutput,
};

mod executor;
mod memory;
mod postgres;
mod throughput;

pub use executor::execute;
pub use memory::{MemoryEngine, MemoryError};
pub use postgres::{PgEngine, PgStoreError, migrate};
pub use throughput::ThroughputLimiter;

/// One method per storage operation. Guarded mutations are single calls so the
/// engine evaluates the ownership predicate and the write atomically.
pub trait StorageEngine: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Inserts `record`, failing if an item with the same id already exists.
    fn put_item(&self, record: Record) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn get_item(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<Record>, Self::Error>> + Send;

    fn scan(&self) -> impl Future<Output = Result<Vec<Record>, Self::Error>> + Send;

    fn query_by_owner(
        &self,
        owner_id: &str,
    ) -> impl Future<Output = Result<Vec<Record>, Self::Error>> + Send;

    fn update_if_owner(
        &self,
        id: &str,
        attributes: Attributes,
        condition: &OwnershipCondition,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn delete_if_owner(
        &self,
        id: &str,
        condition: &OwnershipCondition,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn check_owner(
        &self,
        id: &str,
        condition: &OwnershipCondition,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Translates the engine's native failure vocabulary into the shared taxonomy.
    fn classify(error: &Self::Error) -> ErrorKind;
}

#[derive(Clone)]
pub enum Storage {
    Memory(MemoryEngine),
    Postgres(PgEngine),
}

impl Storage {
    pub fn backend_name(&self) -> &'static str {
        match self {
            Storage::Memory(_) => "memory",
            Storage::Postgres(_) => "postgres",
        }
    }

    pub async fn execute(
        &self,
        command: StorageCommand,
        deadline: Duration,
    ) -> Result<StorageOutput, Failure> {
        match self {
            Storage::Memory(engine) => execute(engine, command, deadline).await,
            Storage::Postgres(engine) => execute(engine, command, deadline).await,
        }
    }

    pub async fn ping(&self) -> bool {
        match self {
            Storage::Memory(_) => true,
            Storage::Postgres(engine) => engine.ping().await.is_ok(),
        }
    }
}
