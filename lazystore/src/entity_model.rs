use crate::error::PersistError;
use crate::field::{FieldDescriptor, UniqueGroup};
use crate::key::PrimaryKey;
use crate::schema::{Schema, SchemaRegistry};
use crate::value::{EntityData, FieldValue};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type Getter<E> = fn(&E) -> FieldValue;
pub type Setter<E> = fn(&mut E, FieldValue) -> Result<(), PersistError>;

/// Describes how a single field is read from and written into an entity.
pub struct FieldSpec<E> {
    pub descriptor: FieldDescriptor,
    pub get: Getter<E>,
    pub set: Setter<E>,
}

/// Captures the persisted layout of one entity type and drives the shared
/// store/compose helpers.
pub struct EntitySpec<E> {
    pub table: String,
    pub seed: fn() -> E,
    pub fields: Vec<FieldSpec<E>>,
}

/// Implemented by every type an [`EntityManager`](crate::manager::EntityManager) caches.
pub trait Entity: Sized + Send + Sync + 'static {
    fn spec() -> EntitySpec<Self>;
}

impl<E> EntitySpec<E> {
    pub fn new(table: impl Into<String>, seed: fn() -> E) -> Self {
        EntitySpec { table: table.into(), seed, fields: Vec::new() }
    }

    pub fn field(mut self, descriptor: FieldDescriptor, get: Getter<E>, set: Setter<E>) -> Self {
        self.fields.push(FieldSpec { descriptor, get, set });
        self
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldSpec<E>> {
        self.fields.iter().find(|f| f.descriptor.name().eq_ignore_ascii_case(name))
    }

    /// Registers fields, primary key and unique groups unless another manager
    /// already defined the table. Returns the schema and whether this call
    /// defined it.
    pub fn define(&self, registry: &SchemaRegistry) -> Result<(Arc<Schema>, bool), PersistError> {
        let schema = registry.get_or_create(&self.table)?;
        if schema.is_defined() {
            return Ok((schema, false));
        }
        for field in &self.fields {
            schema.add_field(field.descriptor.clone())?;
        }
        let keys: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.descriptor.is_primary())
            .map(|f| f.descriptor.name())
            .collect();
        schema.set_primary_key(keys)?;

        let mut named: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for field in &self.fields {
            match field.descriptor.unique_group() {
                Some(UniqueGroup::Alone) => schema.add_unique_group([field.descriptor.name()])?,
                Some(UniqueGroup::Named(group)) => named.entry(group.as_str()).or_default().push(field.descriptor.name()),
                None => {}
            }
        }
        for (_, members) in named {
            schema.add_unique_group(members)?;
        }
        Ok((schema, true))
    }

    /// Binds every foreign reference of the spec. The remote tables must be
    /// registered already.
    pub fn wire_foreign_keys(&self, registry: &SchemaRegistry, schema: &Schema) -> Result<(), PersistError> {
        for field in &self.fields {
            if let Some(foreign) = field.descriptor.foreign() {
                let remote = registry
                    .find(&foreign.table)
                    .ok_or_else(|| PersistError::SchemaNotFound(foreign.table.clone()))?;
                schema.add_foreign_key(field.descriptor.name(), &remote, &foreign.field)?;
            }
        }
        Ok(())
    }
}

/// Reads every field of the entity into a storage document.
pub fn store_entity<E>(spec: &EntitySpec<E>, entity: &E) -> EntityData {
    spec.fields
        .iter()
        .map(|f| (f.descriptor.name().to_string(), (f.get)(entity)))
        .collect()
}

/// Builds an entity from a stored document: stored values where present,
/// descriptor defaults otherwise, and the key fields from `key`. An absent
/// document yields a fully default entity for the key.
pub fn compose_entity<E>(
    spec: &EntitySpec<E>,
    schema: &Schema,
    data: Option<&EntityData>,
    key: &PrimaryKey,
) -> Result<E, PersistError> {
    let mut entity = (spec.seed)();
    for field in &spec.fields {
        let descriptor = &field.descriptor;
        let raw = data
            .and_then(|d| d.get(descriptor.name()))
            .filter(|v| !v.is_null())
            .cloned()
            .unwrap_or_else(|| descriptor.default().clone());
        (field.set)(&mut entity, raw.coerce(descriptor.storage_type())?)?;
    }
    let key_fields = schema.primary_key_fields();
    if key_fields.len() != key.len() {
        return Err(PersistError::KeyArityMismatch {
            table: schema.name().to_string(),
            expected: key_fields.len(),
            actual: key.len(),
        });
    }
    for (descriptor, value) in key_fields.iter().zip(key.values()) {
        let field = spec
            .find_field(descriptor.name())
            .ok_or_else(|| PersistError::conflict(schema.name(), format!("field {} not found", descriptor.name())))?;
        (field.set)(&mut entity, value.clone().coerce(descriptor.storage_type())?)?;
    }
    Ok(entity)
}

/// Key of an entity, taken from its key fields.
pub fn key_of_entity<E>(spec: &EntitySpec<E>, schema: &Schema, entity: &E) -> Result<PrimaryKey, PersistError> {
    let values = schema
        .primary_key_fields()
        .iter()
        .map(|d| {
            spec.find_field(d.name())
                .map(|f| (f.get)(entity))
                .ok_or_else(|| PersistError::conflict(schema.name(), format!("field {} not found", d.name())))
        })
        .collect::<Result<Vec<_>, _>>()?;
    schema.key(values)
}

/// Entities shared by the unit tests of several modules.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::value::StorageType;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Account {
        pub(crate) owner: Uuid,
        pub(crate) realm: String,
        pub(crate) balance: f64,
        pub(crate) level: i32,
        pub(crate) nickname: Option<String>,
        pub(crate) banned: bool,
        pub(crate) grade: char,
        pub(crate) ratio: f32,
        pub(crate) tier: i8,
        pub(crate) flags: i16,
        pub(crate) visits: i64,
    }

    impl Account {
        pub(crate) fn seed() -> Self {
            Account {
                owner: Uuid::nil(),
                realm: String::new(),
                balance: 0.0,
                level: 0,
                nickname: None,
                banned: false,
                grade: ' ',
                ratio: 0.0,
                tier: 0,
                flags: 0,
                visits: 0,
            }
        }
    }

    impl Entity for Account {
        fn spec() -> EntitySpec<Self> {
            EntitySpec::new("accounts", Account::seed)
                .field(
                    FieldDescriptor::new("owner", StorageType::Uuid).primary(),
                    |a: &Account| a.owner.into(),
                    |a: &mut Account, v: FieldValue| { a.owner = v.as_uuid()?; Ok(()) },
                )
                .field(
                    FieldDescriptor::new("realm", StorageType::Text).primary(),
                    |a: &Account| a.realm.clone().into(),
                    |a: &mut Account, v: FieldValue| { a.realm = v.into_text()?; Ok(()) },
                )
                .field(
                    FieldDescriptor::new("balance", StorageType::Double).default_value(100.0),
                    |a: &Account| a.balance.into(),
                    |a: &mut Account, v: FieldValue| { a.balance = v.as_f64()?; Ok(()) },
                )
                .field(
                    FieldDescriptor::new("level", StorageType::Int),
                    |a: &Account| a.level.into(),
                    |a: &mut Account, v: FieldValue| { a.level = v.as_i32()?; Ok(()) },
                )
                .field(
                    FieldDescriptor::new("nickname", StorageType::Text).nullable().unique(),
                    |a: &Account| a.nickname.clone().into(),
                    |a: &mut Account, v: FieldValue| { a.nickname = v.into_option().map(FieldValue::into_text).transpose()?; Ok(()) },
                )
                .field(
                    FieldDescriptor::new("banned", StorageType::Bool),
                    |a: &Account| a.banned.into(),
                    |a: &mut Account, v: FieldValue| { a.banned = v.as_bool()?; Ok(()) },
                )
                .field(
                    FieldDescriptor::new("grade", StorageType::Char).default_value('C'),
                    |a: &Account| a.grade.into(),
                    |a: &mut Account, v: FieldValue| { a.grade = v.as_char()?; Ok(()) },
                )
                .field(
                    FieldDescriptor::new("ratio", StorageType::Float),
                    |a: &Account| a.ratio.into(),
                    |a: &mut Account, v: FieldValue| { a.ratio = v.as_f32()?; Ok(()) },
                )
                .field(
                    FieldDescriptor::new("tier", StorageType::Byte),
                    |a: &Account| a.tier.into(),
                    |a: &mut Account, v: FieldValue| { a.tier = v.as_i8()?; Ok(()) },
                )
                .field(
                    FieldDescriptor::new("flags", StorageType::Short),
                    |a: &Account| a.flags.into(),
                    |a: &mut Account, v: FieldValue| { a.flags = v.as_i16()?; Ok(()) },
                )
                .field(
                    FieldDescriptor::new("visits", StorageType::Long),
                    |a: &Account| a.visits.into(),
                    |a: &mut Account, v: FieldValue| { a.visits = v.as_i64()?; Ok(()) },
                )
        }
    }

    #[derive(Debug, Clone, PartialEq, Default)]
    pub(crate) struct Guild {
        pub(crate) name: String,
        pub(crate) motto: String,
    }

    impl Entity for Guild {
        fn spec() -> EntitySpec<Self> {
            EntitySpec::new("guilds", Guild::default)
                .field(
                    FieldDescriptor::new("name", StorageType::Text).primary(),
                    |g: &Guild| g.name.clone().into(),
                    |g: &mut Guild, v: FieldValue| { g.name = v.into_text()?; Ok(()) },
                )
                .field(
                    FieldDescriptor::new("motto", StorageType::Text).default_value("none"),
                    |g: &Guild| g.motto.clone().into(),
                    |g: &mut Guild, v: FieldValue| { g.motto = v.into_text()?; Ok(()) },
                )
        }
    }

    #[derive(Debug, Clone, PartialEq, Default)]
    pub(crate) struct Member {
        pub(crate) id: i64,
        pub(crate) guild: String,
    }

    impl Entity for Member {
        fn spec() -> EntitySpec<Self> {
            EntitySpec::new("members", Member::default)
                .field(
                    FieldDescriptor::new("id", StorageType::Long).primary(),
                    |m: &Member| m.id.into(),
                    |m: &mut Member, v: FieldValue| { m.id = v.as_i64()?; Ok(()) },
                )
                .field(
                    FieldDescriptor::new("guild", StorageType::Text).references("guilds", "name"),
                    |m: &Member| m.guild.clone().into(),
                    |m: &mut Member, v: FieldValue| { m.guild = v.into_text()?; Ok(()) },
                )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{Account, Guild, Member};
    use super::*;
    use uuid::Uuid;

    #[test]
    fn define_is_done_once_per_registry() {
        let registry = SchemaRegistry::new();
        let (schema, defined) = Account::spec().define(&registry).unwrap();
        assert!(defined);
        assert_eq!(schema.primary_key(), vec!["owner", "realm"]);
        assert_eq!(schema.unique_groups(), vec![vec!["nickname".to_string()]]);
        let (again, defined) = Account::spec().define(&registry).unwrap();
        assert!(!defined);
        assert!(Arc::ptr_eq(&schema, &again));
    }

    #[test]
    fn wiring_requires_remote_schema() {
        let registry = SchemaRegistry::new();
        let (members, _) = Member::spec().define(&registry).unwrap();
        let err = Member::spec().wire_foreign_keys(&registry, &members).unwrap_err();
        assert!(matches!(err, PersistError::SchemaNotFound(table) if table == "guilds"));

        Guild::spec().define(&registry).unwrap();
        Member::spec().wire_foreign_keys(&registry, &members).unwrap();
        assert_eq!(members.foreign_keys()[0].remote_field, "name");
    }

    #[test]
    fn compose_uses_stored_values_then_defaults_then_key() {
        let registry = SchemaRegistry::new();
        let spec = Account::spec();
        let (schema, _) = spec.define(&registry).unwrap();
        let owner = Uuid::new_v4();
        let key = schema.key(vec![owner.into(), "eu".into()]).unwrap();

        let mut data = EntityData::new();
        data.insert("level".into(), FieldValue::Long(12));
        data.insert("banned".into(), FieldValue::Long(1));
        data.insert("nickname".into(), FieldValue::Null);
        let entity = compose_entity(&spec, &schema, Some(&data), &key).unwrap();
        assert_eq!(entity.owner, owner);
        assert_eq!(entity.realm, "eu");
        assert_eq!(entity.level, 12);
        assert!(entity.banned);
        assert_eq!(entity.balance, 100.0);
        assert_eq!(entity.grade, 'C');
        assert_eq!(entity.nickname, None);

        let fresh = compose_entity(&spec, &schema, None, &key).unwrap();
        assert_eq!(fresh.level, 0);
        assert_eq!(fresh.balance, 100.0);
        assert_eq!(fresh.owner, owner);
    }

    #[test]
    fn store_and_compose_roundtrip() {
        let registry = SchemaRegistry::new();
        let spec = Account::spec();
        let (schema, _) = spec.define(&registry).unwrap();
        let mut account = Account::seed();
        account.owner = Uuid::new_v4();
        account.realm = "us".into();
        account.nickname = Some("zed".into());
        account.ratio = 0.25;
        account.visits = 1 << 40;

        let data = store_entity(&spec, &account);
        assert_eq!(data.len(), spec.fields.len());
        let key = key_of_entity(&spec, &schema, &account).unwrap();
        assert_eq!(schema.key_of(&data).unwrap(), key);
        let loaded = compose_entity(&spec, &schema, Some(&data), &key).unwrap();
        assert_eq!(loaded, account);
    }
}
