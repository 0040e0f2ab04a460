use crate::error::PersistError;
use crate::field::FieldDescriptor;
use crate::identifier::{validate_field_name, validate_name};
use crate::key::PrimaryKey;
use crate::value::{EntityData, FieldValue};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub local_field: String,
    pub remote_table: String,
    pub remote_field: String,
}

#[derive(Debug, Default)]
struct SchemaState {
    fields: Vec<FieldDescriptor>,
    primary_key: Vec<String>,
    unique_groups: Vec<Vec<String>>,
    foreign_keys: Vec<ForeignKey>,
}

impl SchemaState {
    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name().eq_ignore_ascii_case(name))
    }
}

/// Persisted layout of one table. Definition is append-only and happens at
/// startup; afterwards the schema is only read.
#[derive(Debug)]
pub struct Schema {
    name: String,
    state: RwLock<SchemaState>,
}

impl Schema {
    fn new(name: String) -> Self {
        Schema { name, state: RwLock::new(SchemaState::default()) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the primary key is fixed.
    pub fn is_defined(&self) -> bool {
        !self.state.read().primary_key.is_empty()
    }

    pub fn add_field(&self, field: FieldDescriptor) -> Result<(), PersistError> {
        validate_field_name(field.name())?;
        let mut state = self.state.write();
        if state.position(field.name()).is_some() {
            return Err(PersistError::conflict(&self.name, format!("field {} exists", field.name())));
        }
        state.fields.push(field);
        Ok(())
    }

    fn resolve(&self, state: &SchemaState, names: &[String]) -> Result<Vec<String>, PersistError> {
        names
            .iter()
            .map(|n| {
                state
                    .position(n)
                    .map(|i| state.fields[i].name().to_string())
                    .ok_or_else(|| PersistError::conflict(&self.name, format!("field {} not found", n)))
            })
            .collect()
    }

    pub fn set_primary_key<I, S>(&self, names: I) -> Result<(), PersistError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(PersistError::conflict(&self.name, "primary key needs at least one field"));
        }
        let mut state = self.state.write();
        if !state.primary_key.is_empty() {
            return Err(PersistError::conflict(&self.name, "primary key already defined"));
        }
        let mut resolved = self.resolve(&state, &names)?;
        resolved.sort();
        resolved.dedup();
        for name in &resolved {
            if let Some(i) = state.position(name) {
                if state.fields[i].is_nullable() {
                    return Err(PersistError::conflict(&self.name, format!("key field {} is nullable", name)));
                }
            }
        }
        state.primary_key = resolved;
        Ok(())
    }

    pub fn add_unique_group<I, S>(&self, names: I) -> Result<(), PersistError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(PersistError::conflict(&self.name, "unique group needs at least one field"));
        }
        let mut state = self.state.write();
        let resolved = self.resolve(&state, &names)?;
        state.unique_groups.push(resolved);
        Ok(())
    }

    /// Binds `local` to `remote_field` of an already registered schema.
    pub fn add_foreign_key(&self, local: &str, remote: &Schema, remote_field: &str) -> Result<(), PersistError> {
        let remote_field = remote
            .field(remote_field)
            .ok_or_else(|| PersistError::conflict(remote.name(), format!("field {} not found", remote_field)))?;
        let mut state = self.state.write();
        let local = self.resolve(&state, &[local.to_string()])?.remove(0);
        let binding = ForeignKey {
            local_field: local,
            remote_table: remote.name().to_string(),
            remote_field: remote_field.name().to_string(),
        };
        if !state.foreign_keys.contains(&binding) {
            state.foreign_keys.push(binding);
        }
        Ok(())
    }

    pub fn fields(&self) -> Vec<FieldDescriptor> {
        self.state.read().fields.clone()
    }

    pub fn field(&self, name: &str) -> Option<FieldDescriptor> {
        let state = self.state.read();
        state.position(name).map(|i| state.fields[i].clone())
    }

    pub fn primary_key(&self) -> Vec<String> {
        self.state.read().primary_key.clone()
    }

    /// Key field descriptors in canonical order.
    pub fn primary_key_fields(&self) -> Vec<FieldDescriptor> {
        let state = self.state.read();
        state
            .primary_key
            .iter()
            .filter_map(|n| state.position(n).map(|i| state.fields[i].clone()))
            .collect()
    }

    pub fn unique_groups(&self) -> Vec<Vec<String>> {
        self.state.read().unique_groups.clone()
    }

    pub fn foreign_keys(&self) -> Vec<ForeignKey> {
        self.state.read().foreign_keys.clone()
    }

    fn arity(&self, expected: usize, actual: usize) -> PersistError {
        PersistError::KeyArityMismatch { table: self.name.clone(), expected, actual }
    }

    /// Canonicalises positional values: checks arity and coerces each value to
    /// the type of the key field at the same canonical position.
    pub fn key(&self, values: Vec<FieldValue>) -> Result<PrimaryKey, PersistError> {
        let fields = self.primary_key_fields();
        if fields.is_empty() {
            return Err(PersistError::conflict(&self.name, "primary key not defined"));
        }
        if fields.len() != values.len() {
            return Err(self.arity(fields.len(), values.len()));
        }
        let values = fields
            .iter()
            .zip(values)
            .map(|(field, value)| {
                if value.is_null() {
                    return Err(PersistError::protocol(format!("key field {} of {} is null", field.name(), self.name)));
                }
                value.coerce(field.storage_type())
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PrimaryKey::new(values))
    }

    pub fn canonical(&self, key: &PrimaryKey) -> Result<PrimaryKey, PersistError> {
        self.key(key.values().to_vec())
    }

    /// Builds a key from `(field name, value)` pairs given in any order.
    pub fn key_from<I, S>(&self, pairs: I) -> Result<PrimaryKey, PersistError>
    where
        I: IntoIterator<Item = (S, FieldValue)>,
        S: AsRef<str>,
    {
        let mut named: Vec<(String, FieldValue)> = pairs.into_iter().map(|(n, v)| (n.as_ref().to_string(), v)).collect();
        let key_names = self.primary_key();
        if named.len() != key_names.len() {
            return Err(self.arity(key_names.len(), named.len()));
        }
        let mut values = Vec::with_capacity(key_names.len());
        for name in &key_names {
            let i = named
                .iter()
                .position(|(n, _)| n.eq_ignore_ascii_case(name))
                .ok_or_else(|| PersistError::conflict(&self.name, format!("key field {} missing", name)))?;
            values.push(named.swap_remove(i).1);
        }
        self.key(values)
    }

    /// Extracts the key from a stored document.
    pub fn key_of(&self, data: &EntityData) -> Result<PrimaryKey, PersistError> {
        let key_names = self.primary_key();
        let values: Vec<FieldValue> = key_names.iter().filter_map(|n| data.get(n).cloned()).collect();
        if values.len() != key_names.len() {
            return Err(self.arity(key_names.len(), values.len()));
        }
        self.key(values)
    }
}

static GLOBAL: Lazy<Arc<SchemaRegistry>> = Lazy::new(|| Arc::new(SchemaRegistry::new()));

/// Table name to schema map shared by every manager of a process.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    pub fn global() -> Arc<SchemaRegistry> {
        Arc::clone(&GLOBAL)
    }

    pub fn get_or_create(&self, name: &str) -> Result<Arc<Schema>, PersistError> {
        validate_name("table", name)?;
        if let Some(schema) = self.tables.read().get(name) {
            return Ok(Arc::clone(schema));
        }
        let mut tables = self.tables.write();
        let schema = tables.entry(name.to_string()).or_insert_with(|| Arc::new(Schema::new(name.to_string())));
        Ok(Arc::clone(schema))
    }

    pub fn find(&self, name: &str) -> Option<Arc<Schema>> {
        self.tables.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}
