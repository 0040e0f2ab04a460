//! lazystore keeps game entities in memory while they are in use and writes them back to durable storage.
//!
//! Entity types describe their persisted fields once with an [`EntitySpec`]. An [`EntityManager`] per type
//! loads values lazily on a host [`Scheduler`], serves them from a concurrent cache, and saves them in batches
//! through a [`StorageDriver`]: either JSON documents on disk or a SQL database (MariaDB / SQLite) via `sqlx`.
//! Inactive entries are saved and evicted by a [`Sweeper`] or on demand.
//!

pub mod entity_model;
pub mod error;
pub mod field;
pub mod identifier;
pub mod key;
pub mod logger;
pub mod manager;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod settings;
pub mod storage;
pub mod sweeper;
pub mod value;

pub use chrono;
pub use futures;
pub use once_cell;
pub use parking_lot;
pub use uuid;

pub use entity_model::{compose_entity, key_of_entity, store_entity, Entity, EntitySpec, FieldSpec, Getter, Setter};
pub use error::PersistError;
pub use field::{FieldDescriptor, ForeignRef, UniqueGroup};
pub use key::PrimaryKey;
pub use manager::{
    Callbacks, EntityManager, LoadOutcome, LoadStatus, LoadedData, ManagerBuilder, PendingManager, SaveCondition,
    SaveOperation, SaveReport, Shared, Wait,
};
pub use retry::{RetryPolicy, MAX_LOAD_ATTEMPTS};
pub use scheduler::{Scheduler, Task, TaskHandle, TokioScheduler};
pub use schema::{ForeignKey, Schema, SchemaRegistry};
pub use settings::{CacheSettings, RelationalSettings, StorageSettings};
pub use storage::{DocumentDriver, RelationalDriver, SqlDialect, StorageDriver};
pub use sweeper::Sweeper;
pub use value::{EntityData, FieldValue, StorageType};
