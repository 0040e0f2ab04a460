use crate::value::{FieldValue, StorageType};

/// Unique constraint membership of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UniqueGroup {
    /// The field is unique on its own.
    Alone,
    /// The field is unique together with every other field of the named group.
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignRef {
    pub table: String,
    pub field: String,
}

/// Static description of one persisted field. Built once with the consuming
/// builder methods below and never changed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    name: String,
    storage_type: StorageType,
    default: FieldValue,
    nullable: bool,
    primary: bool,
    unique: Option<UniqueGroup>,
    foreign: Option<ForeignRef>,
    sql_type: Option<String>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, storage_type: StorageType) -> Self {
        FieldDescriptor {
            name: name.into(),
            storage_type,
            default: storage_type.zero(),
            nullable: false,
            primary: false,
            unique: None,
            foreign: None,
            sql_type: None,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self.nullable = false;
        self
    }

    /// Column accepts NULL. Ignored for primary key fields.
    pub fn nullable(mut self) -> Self {
        self.nullable = !self.primary;
        if self.default == self.storage_type.zero() {
            self.default = FieldValue::Null;
        }
        self
    }

    pub fn default_value(mut self, value: impl Into<FieldValue>) -> Self {
        self.default = value.into();
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = Some(UniqueGroup::Alone);
        self
    }

    pub fn unique_in(mut self, group: impl Into<String>) -> Self {
        let group = group.into();
        self.unique = Some(if group.is_empty() { UniqueGroup::Alone } else { UniqueGroup::Named(group) });
        self
    }

    pub fn references(mut self, table: impl Into<String>, field: impl Into<String>) -> Self {
        self.foreign = Some(ForeignRef { table: table.into(), field: field.into() });
        self
    }

    pub fn sql_type(mut self, sql_type: impl Into<String>) -> Self {
        self.sql_type = Some(sql_type.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn default(&self) -> &FieldValue {
        &self.default
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn unique_group(&self) -> Option<&UniqueGroup> {
        self.unique.as_ref()
    }

    pub fn foreign(&self) -> Option<&ForeignRef> {
        self.foreign.as_ref()
    }

    /// Explicit override or the storage type's default column type.
    pub fn column_type(&self) -> &str {
        self.sql_type.as_deref().unwrap_or_else(|| self.storage_type.sql_type())
    }
}
