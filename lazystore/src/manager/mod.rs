//! Lazily loading, write-back cache of one entity type.
//!
//! Every key goes through *absent → loading → cached*. At most one load per
//! key is in flight; callers that find a load running either give up
//! (`Wait::Refuse`) or re-check a scheduler tick later (`Wait::Retry`), up to
//! the retry budget. Saves snapshot cached values under per-key locks and hand
//! them to the storage driver in one batch.

pub mod events;
pub mod key_lock;


use crate::entity_model::{compose_entity, key_of_entity, store_entity, Entity, EntitySpec};
use crate::error::PersistError;
use crate::key::PrimaryKey;
use crate::retry::RetryPolicy;
use crate::scheduler::{Scheduler, TaskHandle};
use crate::schema::{Schema, SchemaRegistry};
use crate::settings::CacheSettings;
use crate::storage::StorageDriver;
use crate::value::{EntityData, FieldValue};
use crate::{debug, error, info, warn};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub use events::{LoadOutcome, LoadedData};
pub use key_lock::KeyedLock;

/// Cached entity. Hosts mutate it in place; saves read the latest state.
pub type Shared<T> = Arc<RwLock<T>>;

/// Decides per entity whether a save keeps it (`true`) or deletes it.
pub type SaveCondition<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOperation {
    SaveAll,
    SaveAndEvictInactive,
    SaveAllAndEvictAll,
    SaveAllAndEvictInactive,
}

/// What a request does when the key is already being loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Refuse,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// Value was cached; the success callback already ran.
    Ready,
    /// A load was dispatched; completion is announced through `subscribe`.
    Scheduled,
    /// A load was dispatched and carries the callbacks.
    Pending,
    /// Another load of the key is running.
    InFlight,
    /// Another load is running and the request gave up.
    NotReady,
    /// Another load is running; the request re-checks after a tick.
    Retrying,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub saved: Vec<PrimaryKey>,
    pub failed: Vec<PrimaryKey>,
    pub deleted: Vec<PrimaryKey>,
    /// Requested keys that had no cached value.
    pub skipped: usize,
}

impl SaveReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn merge(&mut self, other: SaveReport) {
        self.saved.extend(other.saved);
        self.failed.extend(other.failed);
        self.deleted.extend(other.deleted);
        self.skipped += other.skipped;
    }
}

pub struct Callbacks<T> {
    on_success: Box<dyn FnOnce(Shared<T>) + Send>,
    on_error: Box<dyn FnOnce(Arc<PersistError>) + Send>,
}

impl<T> Callbacks<T> {
    pub fn new(
        on_success: impl FnOnce(Shared<T>) + Send + 'static,
        on_error: impl FnOnce(Arc<PersistError>) + Send + 'static,
    ) -> Self {
        Callbacks { on_success: Box::new(on_success), on_error: Box::new(on_error) }
    }

    fn succeed(self, value: Shared<T>) {
        (self.on_success)(value)
    }

    fn fail(self, error: Arc<PersistError>) {
        (self.on_error)(error)
    }
}

struct CacheEntry<T> {
    value: Option<Shared<T>>,
    last_access: Instant,
    loading: Option<TaskHandle>,
}

impl<T> CacheEntry<T> {
    fn empty(now: Instant) -> Self {
        CacheEntry { value: None, last_access: now, loading: None }
    }

    fn is_loading(&self) -> bool {
        self.loading.as_ref().is_some_and(|h| !h.is_cancelled())
    }
}

enum Access<T> {
    Cached(Shared<T>, Option<Callbacks<T>>),
    Scheduled,
    InFlight(Option<Callbacks<T>>),
}

struct Inner<T: Entity> {
    spec: EntitySpec<T>,
    schema: Arc<Schema>,
    driver: Arc<dyn StorageDriver>,
    scheduler: Arc<dyn Scheduler>,
    entries: DashMap<PrimaryKey, CacheEntry<T>>,
    locks: KeyedLock<PrimaryKey>,
    events: broadcast::Sender<LoadedData<T>>,
    inactive_time: Option<Duration>,
    save_condition: Option<SaveCondition<T>>,
    retry: RetryPolicy,
    closed: AtomicBool,
}

/// Value read by a save batch, compared again before the entry is evicted.
struct Snapshot<T> {
    key: PrimaryKey,
    value: Shared<T>,
    data: EntityData,
}

/// Marks a key as busy for the owner of `handle`. Dropping the claim clears
/// the marker unless someone else replaced it meanwhile.
struct Claim<'a, T: Entity> {
    inner: &'a Inner<T>,
    key: PrimaryKey,
    handle: TaskHandle,
}

impl<T: Entity> Drop for Claim<'_, T> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.inner.entries.get_mut(&self.key) {
            if entry.loading.as_ref().is_some_and(|h| h.is_same(&self.handle)) {
                entry.loading = None;
            }
        }
    }
}

impl<T: Entity> Inner<T> {
    /// Touches the entry and either returns the cached value, reports a
    /// running load, or registers and dispatches a new one. Registration
    /// happens under the entry lock, so only one load per key can start.
    fn access(self: &Arc<Self>, key: &PrimaryKey, callbacks: Option<Callbacks<T>>) -> Access<T> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.clone()).or_insert_with(|| CacheEntry::empty(now));
        entry.last_access = now;
        if let Some(value) = &entry.value {
            return Access::Cached(Arc::clone(value), callbacks);
        }
        if entry.is_loading() {
            return Access::InFlight(callbacks);
        }
        let inner = Arc::clone(self);
        let task_key = key.clone();
        let handle = self.scheduler.run_async(Box::pin(async move {
            let result = inner.read_through(&task_key).await;
            let _ = inner.finish_load(task_key, result, callbacks);
        }));
        entry.loading = Some(handle);
        Access::Scheduled
    }

    async fn read_through(&self, key: &PrimaryKey) -> Result<Shared<T>, PersistError> {
        let data = self.driver.load(&self.schema, key).await?;
        let entity = compose_entity(&self.spec, &self.schema, data.as_ref(), key)?;
        Ok(Arc::new(RwLock::new(entity)))
    }

    /// Caches the outcome, clears the in-flight marker, then notifies.
    fn finish_load(
        &self,
        key: PrimaryKey,
        result: Result<Shared<T>, PersistError>,
        callbacks: Option<Callbacks<T>>,
    ) -> Result<Shared<T>, PersistError> {
        match result {
            Ok(loaded) => {
                let value = {
                    let now = Instant::now();
                    let mut entry = self.entries.entry(key.clone()).or_insert_with(|| CacheEntry::empty(now));
                    entry.loading = None;
                    Arc::clone(entry.value.get_or_insert(loaded))
                };
                debug!("Loaded {} from {}", key, self.schema.name());
                if let Some(callbacks) = callbacks {
                    callbacks.succeed(Arc::clone(&value));
                }
                let _ = self.events.send(LoadedData::success(key, Arc::clone(&value)));
                Ok(value)
            }
            Err(e) => {
                error!("Could not load {} from {}: {}", key, self.schema.name(), e);
                if let Some(mut entry) = self.entries.get_mut(&key) {
                    entry.loading = None;
                }
                let returned = e.duplicate();
                let shared = Arc::new(e);
                if let Some(callbacks) = callbacks {
                    callbacks.fail(Arc::clone(&shared));
                }
                let _ = self.events.send(LoadedData::failure(key, shared));
                Err(returned)
            }
        }
    }

    /// Claims the key unless it is loading. The returned guard keeps loads,
    /// inserts and evictions away until it is dropped.
    fn claim(&self, key: &PrimaryKey) -> Option<Claim<'_, T>> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.clone()).or_insert_with(|| CacheEntry::empty(now));
        entry.last_access = now;
        if entry.is_loading() {
            return None;
        }
        let handle = TaskHandle::running();
        entry.loading = Some(handle.clone());
        Some(Claim { inner: self, key: key.clone(), handle })
    }

    fn get_attempt(self: &Arc<Self>, key: PrimaryKey, callbacks: Callbacks<T>, wait: Wait, attempt: u32) -> LoadStatus {
        if attempt > 0 && self.closed.load(Ordering::Acquire) {
            debug!("Dropping wait for {} in {} after shutdown", key, self.schema.name());
            callbacks.fail(Arc::new(PersistError::NotReady));
            return LoadStatus::NotReady;
        }
        match self.access(&key, Some(callbacks)) {
            Access::Cached(value, callbacks) => {
                if let Some(callbacks) = callbacks {
                    callbacks.succeed(value);
                }
                LoadStatus::Ready
            }
            Access::Scheduled => LoadStatus::Pending,
            Access::InFlight(None) => LoadStatus::InFlight,
            Access::InFlight(Some(callbacks)) => match wait {
                Wait::Refuse => LoadStatus::NotReady,
                Wait::Retry => match self.retry.next_attempt(attempt) {
                    Some(next) => {
                        let inner = Arc::clone(self);
                        self.scheduler.run_async_with_delay(
                            Box::pin(async move {
                                inner.get_attempt(key, callbacks, Wait::Retry, next);
                            }),
                            self.retry.delay_ticks,
                        );
                        LoadStatus::Retrying
                    }
                    None => {
                        warn!("Gave up waiting for {} in {} after {} attempts", key, self.schema.name(), attempt);
                        callbacks.fail(Arc::new(PersistError::RetryExhausted { attempts: attempt }));
                        LoadStatus::NotReady
                    }
                },
            },
        }
    }

    fn canonical_all(&self, keys: &[PrimaryKey]) -> Vec<PrimaryKey> {
        keys.iter()
            .filter_map(|k| match self.schema.canonical(k) {
                Ok(key) => Some(key),
                Err(e) => {
                    error!("Ignoring key {} of {}: {}", k, self.schema.name(), e);
                    None
                }
            })
            .collect()
    }

    fn touch(&self, keys: &[PrimaryKey]) {
        let now = Instant::now();
        for key in keys {
            if let Some(mut entry) = self.entries.get_mut(key) {
                entry.last_access = now;
            }
        }
    }

    fn cached_keys(&self) -> Vec<PrimaryKey> {
        self.entries.iter().filter(|e| e.value.is_some()).map(|e| e.key().clone()).collect()
    }

    /// Evicts `key` only while it still caches the snapshotted value and
    /// `unchanged` holds for its current state. Returns whether it was evicted.
    fn evict_unchanged(&self, snapshot: &Snapshot<T>, unchanged: impl FnOnce(&T) -> bool) -> bool {
        if !unchanged(&snapshot.value.read()) {
            debug!("Keeping {} of {}: modified while saving", snapshot.key, self.schema.name());
            return false;
        }
        let removed = self
            .entries
            .remove_if(&snapshot.key, |_, e| {
                !e.is_loading() && e.value.as_ref().is_some_and(|v| Arc::ptr_eq(v, &snapshot.value))
            })
            .is_some();
        if !removed {
            debug!("Keeping {} of {}: replaced while saving", snapshot.key, self.schema.name());
        }
        removed
    }

    fn keeps(&self, entity: &T) -> bool {
        self.save_condition.as_ref().map_or(true, |condition| condition(entity))
    }

    /// Splits cached keys into (inactive, active) and drops stale entries
    /// that hold neither a value nor a load.
    fn partition_inactive(&self, threshold: Duration) -> (Vec<PrimaryKey>, Vec<PrimaryKey>) {
        let now = Instant::now();
        self.entries
            .retain(|_, e| e.value.is_some() || e.is_loading() || now.duration_since(e.last_access) < threshold);
        let mut inactive = Vec::new();
        let mut active = Vec::new();
        for entry in self.entries.iter().filter(|e| e.value.is_some()) {
            if now.duration_since(entry.last_access) >= threshold {
                inactive.push(entry.key().clone());
            } else {
                active.push(entry.key().clone());
            }
        }
        (inactive, active)
    }

    /// Reads cached values and applies the save condition. Returns the
    /// snapshots to save and the ones to delete.
    fn snapshot(&self, keys: Vec<PrimaryKey>, report: &mut SaveReport) -> (Vec<Snapshot<T>>, Vec<Snapshot<T>>) {
        let mut to_save = Vec::new();
        let mut to_delete = Vec::new();
        for key in keys {
            let Some(value) = self.entries.get(&key).and_then(|e| e.value.clone()) else {
                report.skipped += 1;
                continue;
            };
            let (keep, data) = {
                let entity = value.read();
                (self.keeps(&entity), store_entity(&self.spec, &entity))
            };
            let snapshot = Snapshot { key, value, data };
            if keep {
                to_save.push(snapshot);
            } else {
                to_delete.push(snapshot);
            }
        }
        (to_save, to_delete)
    }

    async fn flush_keys(&self, keys: Vec<PrimaryKey>, evict: bool) -> SaveReport {
        let mut report = SaveReport::default();
        let mut seen = HashSet::new();
        let mut keys: Vec<PrimaryKey> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();
        keys.sort_by_cached_key(|k| format!("{:?}", k));
        let _guards = self.locks.lock_all(&keys).await;

        let (to_save, to_delete) = self.snapshot(keys, &mut report);

        if !to_delete.is_empty() {
            let keys: Vec<PrimaryKey> = to_delete.iter().map(|s| s.key.clone()).collect();
            match self.driver.delete_many(&self.schema, &keys).await {
                Ok(results) => {
                    for snapshot in to_delete {
                        if results.get(&snapshot.key).copied().unwrap_or(false) {
                            self.evict_unchanged(&snapshot, |entity| !self.keeps(entity));
                            report.deleted.push(snapshot.key);
                        } else {
                            error!("Could not delete {} from {}", snapshot.key, self.schema.name());
                            report.failed.push(snapshot.key);
                        }
                    }
                }
                Err(e) => {
                    error!("Could not delete {} entries from {}: {}", keys.len(), self.schema.name(), e);
                    report.failed.extend(keys);
                }
            }
        }

        if !to_save.is_empty() {
            let items: Vec<EntityData> = to_save.iter().map(|s| s.data.clone()).collect();
            match self.driver.save_many(&self.schema, &items).await {
                Ok(results) => {
                    for snapshot in to_save {
                        if results.get(&snapshot.key).copied().unwrap_or(false) {
                            if evict {
                                self.evict_unchanged(&snapshot, |entity| store_entity(&self.spec, entity) == snapshot.data);
                            }
                            report.saved.push(snapshot.key);
                        } else {
                            error!("Could not save {} into {}", snapshot.key, self.schema.name());
                            report.failed.push(snapshot.key);
                        }
                    }
                }
                Err(e) => {
                    error!("Could not save {} entries into {}: {}", to_save.len(), self.schema.name(), e);
                    report.failed.extend(to_save.into_iter().map(|s| s.key));
                }
            }
        }
        report
    }

    async fn flush_all(&self, op: SaveOperation) -> SaveReport {
        match (op, self.inactive_time) {
            (SaveOperation::SaveAndEvictInactive, None) => SaveReport::default(),
            (SaveOperation::SaveAll, _) | (SaveOperation::SaveAllAndEvictInactive, None) => {
                self.flush_keys(self.cached_keys(), false).await
            }
            (SaveOperation::SaveAllAndEvictAll, _) => self.flush_keys(self.cached_keys(), true).await,
            (SaveOperation::SaveAndEvictInactive, Some(threshold)) => {
                let (inactive, _) = self.partition_inactive(threshold);
                self.flush_keys(inactive, true).await
            }
            (SaveOperation::SaveAllAndEvictInactive, Some(threshold)) => {
                let (inactive, active) = self.partition_inactive(threshold);
                let mut report = self.flush_keys(inactive, true).await;
                report.merge(self.flush_keys(active, false).await);
                report
            }
        }
    }

    fn log_report(&self, what: &str, report: &SaveReport) {
        if report.is_clean() {
            debug!(
                "{} on {}: {} saved, {} deleted, {} skipped",
                what, self.schema.name(), report.saved.len(), report.deleted.len(), report.skipped
            );
        } else {
            warn!(
                "{} on {}: {} saved, {} deleted, {} failed",
                what, self.schema.name(), report.saved.len(), report.deleted.len(), report.failed.len()
            );
        }
    }

    /// Cancels loads that have not started and clears their markers.
    fn cancel_pending_loads(&self) -> usize {
        let mut cancelled = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.loading.as_ref().is_some_and(|h| h.cancel()) {
                entry.loading = None;
                cancelled += 1;
            }
        }
        cancelled
    }
}

/// Configures an [`EntityManager`] before its schema is defined.
pub struct ManagerBuilder<T: Entity> {
    driver: Arc<dyn StorageDriver>,
    scheduler: Arc<dyn Scheduler>,
    registry: Arc<SchemaRegistry>,
    inactive_time: Option<Duration>,
    save_condition: Option<SaveCondition<T>>,
    retry: RetryPolicy,
}

impl<T: Entity> ManagerBuilder<T> {
    /// Registry to define the schema in. Defaults to the global one.
    pub fn registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Negative disables inactivity eviction.
    pub fn inactive_time_ms(mut self, millis: i64) -> Self {
        self.inactive_time = u64::try_from(millis).ok().map(Duration::from_millis);
        self
    }

    pub fn settings(mut self, settings: &CacheSettings) -> Self {
        self.inactive_time = settings.inactive_time();
        self
    }

    pub fn save_condition(mut self, condition: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.save_condition = Some(Arc::new(condition));
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// First phase: registers the schema unless another manager already did.
    pub fn define(self) -> Result<PendingManager<T>, PersistError> {
        let spec = T::spec();
        let (schema, defines) = spec.define(&self.registry)?;
        Ok(PendingManager { builder: self, spec, schema, defines })
    }
}

/// A manager whose schema is defined but whose foreign keys and storage are
/// not set up yet. Define every manager first, then initialize them with
/// referenced tables before referencing ones.
pub struct PendingManager<T: Entity> {
    builder: ManagerBuilder<T>,
    spec: EntitySpec<T>,
    schema: Arc<Schema>,
    defines: bool,
}

impl<T: Entity> PendingManager<T> {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Second phase: wires foreign keys and creates the table.
    pub async fn initialize(self) -> Result<EntityManager<T>, PersistError> {
        let PendingManager { builder, spec, schema, defines } = self;
        if defines {
            spec.wire_foreign_keys(&builder.registry, &schema)?;
        }
        if !builder.driver.create_schema(&schema).await? {
            return Err(PersistError::protocol(format!("{} could not create table {}", builder.driver.name(), schema.name())));
        }
        info!("Entity manager for {} ready on {} storage", schema.name(), builder.driver.name());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(EntityManager {
            inner: Arc::new(Inner {
                spec,
                schema,
                driver: builder.driver,
                scheduler: builder.scheduler,
                entries: DashMap::new(),
                locks: KeyedLock::new(),
                events,
                inactive_time: builder.inactive_time,
                save_condition: builder.save_condition,
                retry: builder.retry,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

pub struct EntityManager<T: Entity> {
    inner: Arc<Inner<T>>,
}

impl<T: Entity> Clone for EntityManager<T> {
    fn clone(&self) -> Self {
        EntityManager { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Entity> EntityManager<T> {
    pub fn builder(driver: Arc<dyn StorageDriver>, scheduler: Arc<dyn Scheduler>) -> ManagerBuilder<T> {
        ManagerBuilder {
            driver,
            scheduler,
            registry: SchemaRegistry::global(),
            inactive_time: None,
            save_condition: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    pub fn table(&self) -> &str {
        self.inner.schema.name()
    }

    pub fn inactive_time(&self) -> Option<Duration> {
        self.inner.inactive_time
    }

    pub fn key(&self, values: Vec<FieldValue>) -> Result<PrimaryKey, PersistError> {
        self.inner.schema.key(values)
    }

    pub fn key_from<I, S>(&self, pairs: I) -> Result<PrimaryKey, PersistError>
    where
        I: IntoIterator<Item = (S, FieldValue)>,
        S: AsRef<str>,
    {
        self.inner.schema.key_from(pairs)
    }

    pub fn key_of(&self, entity: &T) -> Result<PrimaryKey, PersistError> {
        key_of_entity(&self.inner.spec, &self.inner.schema, entity)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoadedData<T>> {
        self.inner.events.subscribe()
    }

    /// Starts a load unless the key is cached or already loading.
    pub fn load(&self, key: &PrimaryKey) -> Result<LoadStatus, PersistError> {
        let key = self.inner.schema.canonical(key)?;
        Ok(match self.inner.access(&key, None) {
            Access::Cached(..) => LoadStatus::Ready,
            Access::Scheduled => LoadStatus::Scheduled,
            Access::InFlight(_) => LoadStatus::InFlight,
        })
    }

    /// Cached value, or `None` after making sure a load is underway.
    pub fn try_get(&self, key: &PrimaryKey) -> Result<Option<Shared<T>>, PersistError> {
        let key = self.inner.schema.canonical(key)?;
        Ok(match self.inner.access(&key, None) {
            Access::Cached(value, _) => Some(value),
            _ => None,
        })
    }

    /// Cached value, or `NotReady` after making sure a load is underway.
    pub fn get_now(&self, key: &PrimaryKey) -> Result<Shared<T>, PersistError> {
        self.try_get(key)?.ok_or(PersistError::NotReady)
    }

    /// Delivers the value to `callbacks`: right away when cached, from the
    /// worker when a load starts, or per `wait` when another load is running.
    pub fn get(&self, key: &PrimaryKey, callbacks: Callbacks<T>, wait: Wait) -> Result<LoadStatus, PersistError> {
        let key = self.inner.schema.canonical(key)?;
        Ok(self.inner.get_attempt(key, callbacks, wait, 0))
    }

    /// Loads on the calling task, awaiting the driver directly. Waits for a
    /// load started elsewhere within the retry budget.
    pub async fn load_inline(&self, key: &PrimaryKey) -> Result<Shared<T>, PersistError> {
        let key = self.inner.schema.canonical(key)?;
        let wait = self.inner.scheduler.tick() * self.inner.retry.delay_ticks.max(1);
        let mut attempt = 0;
        loop {
            let cached = self.inner.entries.get_mut(&key).and_then(|mut e| {
                e.last_access = Instant::now();
                e.value.clone()
            });
            if let Some(value) = cached {
                return Ok(value);
            }
            if let Some(claim) = self.inner.claim(&key) {
                let result = self.inner.read_through(&key).await;
                let loaded = self.inner.finish_load(key, result, None);
                drop(claim);
                return loaded;
            }
            match self.inner.retry.next_attempt(attempt) {
                Some(next) => {
                    attempt = next;
                    tokio::time::sleep(wait).await;
                }
                None => return Err(PersistError::RetryExhausted { attempts: attempt }),
            }
        }
    }

    pub fn is_cached(&self, key: &PrimaryKey) -> bool {
        self.inner
            .schema
            .canonical(key)
            .ok()
            .and_then(|k| self.inner.entries.get(&k).map(|e| e.value.is_some()))
            .unwrap_or(false)
    }

    pub fn is_loading(&self, key: &PrimaryKey) -> bool {
        self.inner
            .schema
            .canonical(key)
            .ok()
            .and_then(|k| self.inner.entries.get(&k).map(|e| e.is_loading()))
            .unwrap_or(false)
    }

    pub fn cached_keys(&self) -> Vec<PrimaryKey> {
        self.inner.cached_keys()
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.inner.entries.iter().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn exists(&self, key: &PrimaryKey) -> Result<bool, PersistError> {
        let key = self.inner.schema.canonical(key)?;
        self.inner.driver.exists(&self.inner.schema, &key).await
    }

    /// Deletes the stored row and drops the cached value. Fails with
    /// `NotReady` while the key is loading; loads and inserts of the key wait
    /// for the delete to finish.
    pub async fn delete(&self, key: &PrimaryKey) -> Result<bool, PersistError> {
        let key = self.inner.schema.canonical(key)?;
        let _guard = self.inner.locks.lock(&key).await;
        let claim = self.inner.claim(&key).ok_or(PersistError::NotReady)?;
        let deleted = self.inner.driver.delete(&self.inner.schema, &key).await?;
        if deleted {
            self.inner.entries.remove(&key);
        }
        drop(claim);
        Ok(deleted)
    }

    /// Adopts a new value into the cache, replacing a cached one. Fails with
    /// `NotReady` while the key is loading.
    pub fn insert(&self, entity: T) -> Result<Shared<T>, PersistError> {
        let key = self.key_of(&entity)?;
        let now = Instant::now();
        let mut entry = self.inner.entries.entry(key).or_insert_with(|| CacheEntry::empty(now));
        if entry.is_loading() {
            return Err(PersistError::NotReady);
        }
        entry.last_access = now;
        let value = Arc::new(RwLock::new(entity));
        entry.value = Some(Arc::clone(&value));
        Ok(value)
    }

    fn deferred_flush(&self, keys: &[PrimaryKey], evict: bool) -> TaskHandle {
        let keys = self.inner.canonical_all(keys);
        self.inner.touch(&keys);
        let inner = Arc::clone(&self.inner);
        self.inner.scheduler.run_async(Box::pin(async move {
            let report = inner.flush_keys(keys, evict).await;
            inner.log_report(if evict { "save and evict" } else { "save" }, &report);
        }))
    }

    /// Saves the cached values of `keys` on the worker pool.
    pub fn save(&self, keys: &[PrimaryKey]) -> TaskHandle {
        self.deferred_flush(keys, false)
    }

    /// Saves on the worker pool and evicts every key the driver confirmed.
    pub fn save_and_evict(&self, keys: &[PrimaryKey]) -> TaskHandle {
        self.deferred_flush(keys, true)
    }

    pub fn save_all(&self, op: SaveOperation) -> TaskHandle {
        let inner = Arc::clone(&self.inner);
        self.inner.scheduler.run_async(Box::pin(async move {
            let report = inner.flush_all(op).await;
            inner.log_report(&format!("{:?}", op), &report);
        }))
    }

    /// Inline form of [`save`](Self::save) / [`save_and_evict`](Self::save_and_evict).
    pub async fn flush(&self, keys: &[PrimaryKey], evict: bool) -> SaveReport {
        let keys = self.inner.canonical_all(keys);
        self.inner.touch(&keys);
        self.inner.flush_keys(keys, evict).await
    }

    /// Inline form of [`save_all`](Self::save_all).
    pub async fn flush_all(&self, op: SaveOperation) -> SaveReport {
        self.inner.flush_all(op).await
    }

    /// Cancels loads that have not started, then saves and evicts everything.
    /// Requests still waiting for a load get `NotReady` on their next check.
    pub async fn shutdown(&self) -> SaveReport {
        self.inner.closed.store(true, Ordering::Release);
        let cancelled = self.inner.cancel_pending_loads();
        if cancelled > 0 {
            info!("Cancelled {} pending loads of {}", cancelled, self.table());
        }
        let report = self.inner.flush_all(SaveOperation::SaveAllAndEvictAll).await;
        self.inner.log_report("shutdown", &report);
        report
    }
}
