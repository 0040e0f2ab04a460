use crate::error::PersistError;
use crate::key::PrimaryKey;
use crate::manager::Shared;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Success,
    Error,
}

/// Broadcast once per completed load, whether it succeeded or not.
pub struct LoadedData<T> {
    pub key: PrimaryKey,
    pub value: Option<Shared<T>>,
    pub error: Option<Arc<PersistError>>,
}

impl<T> LoadedData<T> {
    pub(crate) fn success(key: PrimaryKey, value: Shared<T>) -> Self {
        LoadedData { key, value: Some(value), error: None }
    }

    pub(crate) fn failure(key: PrimaryKey, error: Arc<PersistError>) -> Self {
        LoadedData { key, value: None, error: Some(error) }
    }

    pub fn outcome(&self) -> LoadOutcome {
        if self.error.is_some() { LoadOutcome::Error } else { LoadOutcome::Success }
    }
}

impl<T> Clone for LoadedData<T> {
    fn clone(&self) -> Self {
        LoadedData { key: self.key.clone(), value: self.value.clone(), error: self.error.clone() }
    }
}
