pub mod document;
pub mod relational;
pub mod statements;

use crate::error::PersistError;
use crate::key::PrimaryKey;
use crate::schema::Schema;
use crate::settings::StorageSettings;
use crate::value::EntityData;
use crate::error;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub use document::DocumentDriver;
pub use relational::RelationalDriver;
pub use statements::SqlDialect;

/// Capability contract every storage backend fulfils. Keys passed in are
/// canonical for `schema`; drivers still check their arity.
///
/// Batched operations report per item; a failing item is logged and reported
/// as `false` without aborting the rest of the batch. Only failures that
/// affect the whole batch (e.g. no connection) are returned as errors.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn exists(&self, schema: &Schema, key: &PrimaryKey) -> Result<bool, PersistError>;

    /// Stored document for `key`, or `None`. Never fabricates defaults.
    async fn load(&self, schema: &Schema, key: &PrimaryKey) -> Result<Option<EntityData>, PersistError>;

    /// Prepares storage for the table. Idempotent.
    async fn create_schema(&self, schema: &Schema) -> Result<bool, PersistError>;

    /// Removes the table and everything in it. True if it no longer exists.
    async fn drop_schema(&self, schema: &Schema) -> Result<bool, PersistError>;

    /// Inserts or overwrites the row keyed by the key fields of `item`.
    async fn save(&self, schema: &Schema, item: &EntityData) -> Result<bool, PersistError>;

    async fn save_many(&self, schema: &Schema, items: &[EntityData]) -> Result<HashMap<PrimaryKey, bool>, PersistError> {
        let mut results = HashMap::with_capacity(items.len());
        for item in items {
            let key = match schema.key_of(item) {
                Ok(key) => key,
                Err(e) => {
                    error!("{} skipped an item of {} without a valid key: {}", self.name(), schema.name(), e);
                    continue;
                }
            };
            let saved = match self.save(schema, item).await {
                Ok(saved) => saved,
                Err(e) => {
                    error!("{} could not save {} into {}: {}", self.name(), key, schema.name(), e);
                    false
                }
            };
            results.insert(key, saved);
        }
        Ok(results)
    }

    /// True if no row for `key` remains afterwards.
    async fn delete(&self, schema: &Schema, key: &PrimaryKey) -> Result<bool, PersistError>;

    async fn delete_many(&self, schema: &Schema, keys: &[PrimaryKey]) -> Result<HashMap<PrimaryKey, bool>, PersistError> {
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            let deleted = match self.delete(schema, key).await {
                Ok(deleted) => deleted,
                Err(e) => {
                    error!("{} could not delete {} from {}: {}", self.name(), key, schema.name(), e);
                    false
                }
            };
            results.insert(key.clone(), deleted);
        }
        Ok(results)
    }
}

/// Opens the backend described by the settings.
pub async fn open(settings: &StorageSettings) -> Result<Arc<dyn StorageDriver>, PersistError> {
    match settings {
        StorageSettings::Document { root } => Ok(Arc::new(DocumentDriver::open(root).await?)),
        StorageSettings::Relational(conf) => Ok(Arc::new(RelationalDriver::connect(conf).await?)),
    }
}

/// Rejects keys whose arity does not match the schema.
pub(crate) fn check_arity(schema: &Schema, key: &PrimaryKey) -> Result<(), PersistError> {
    let expected = schema.primary_key().len();
    if expected != key.len() {
        return Err(PersistError::KeyArityMismatch { table: schema.name().to_string(), expected, actual: key.len() });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    pub(crate) fn mk_temp_dir(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}_{}", prefix, rand::random::<u64>()))
    }

    /// In-memory backend with knobs for slow, stalled and failing calls.
    #[derive(Default)]
    pub(crate) struct MemoryDriver {
        rows: Mutex<HashMap<(String, PrimaryKey), EntityData>>,
        failing_saves: Mutex<HashSet<PrimaryKey>>,
        load_delay: Option<Duration>,
        save_delay: Option<Duration>,
        stall_loads: bool,
        fail_loads: AtomicBool,
        pub(crate) loads: AtomicUsize,
        pub(crate) saves: AtomicUsize,
        pub(crate) deletes: AtomicUsize,
    }

    impl MemoryDriver {
        pub(crate) fn new() -> Self {
            MemoryDriver::default()
        }

        pub(crate) fn with_load_delay(delay: Duration) -> Self {
            MemoryDriver { load_delay: Some(delay), ..Default::default() }
        }

        pub(crate) fn with_save_delay(delay: Duration) -> Self {
            MemoryDriver { save_delay: Some(delay), ..Default::default() }
        }

        /// Loads never complete.
        pub(crate) fn stalling() -> Self {
            MemoryDriver { stall_loads: true, ..Default::default() }
        }

        pub(crate) fn fail_saves_for(&self, key: PrimaryKey) {
            self.failing_saves.lock().insert(key);
        }

        pub(crate) fn fail_loads(&self, fail: bool) {
            self.fail_loads.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn put(&self, table: &str, key: PrimaryKey, data: EntityData) {
            self.rows.lock().insert((table.to_string(), key), data);
        }

        pub(crate) fn get(&self, table: &str, key: &PrimaryKey) -> Option<EntityData> {
            self.rows.lock().get(&(table.to_string(), key.clone())).cloned()
        }

        pub(crate) fn load_count(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }

        pub(crate) fn save_count(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StorageDriver for MemoryDriver {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn exists(&self, schema: &Schema, key: &PrimaryKey) -> Result<bool, PersistError> {
            check_arity(schema, key)?;
            Ok(self.get(schema.name(), key).is_some())
        }

        async fn load(&self, schema: &Schema, key: &PrimaryKey) -> Result<Option<EntityData>, PersistError> {
            check_arity(schema, key)?;
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.stall_loads {
                std::future::pending::<()>().await;
            }
            if let Some(delay) = self.load_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_loads.load(Ordering::SeqCst) {
                return Err(PersistError::BackendIo("memory backend offline".into()));
            }
            Ok(self.get(schema.name(), key))
        }

        async fn create_schema(&self, _schema: &Schema) -> Result<bool, PersistError> {
            Ok(true)
        }

        async fn drop_schema(&self, schema: &Schema) -> Result<bool, PersistError> {
            self.rows.lock().retain(|(table, _), _| table != schema.name());
            Ok(true)
        }

        async fn save(&self, schema: &Schema, item: &EntityData) -> Result<bool, PersistError> {
            let key = schema.key_of(item)?;
            self.saves.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.save_delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing_saves.lock().contains(&key) {
                return Ok(false);
            }
            self.put(schema.name(), key, item.clone());
            Ok(true)
        }

        async fn delete(&self, schema: &Schema, key: &PrimaryKey) -> Result<bool, PersistError> {
            check_arity(schema, key)?;
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.rows.lock().remove(&(schema.name().to_string(), key.clone()));
            Ok(true)
        }
    }
}
