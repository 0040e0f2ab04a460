use crate::error::PersistError;
use crate::field::FieldDescriptor;
use crate::key::PrimaryKey;
use crate::retry::retry_with_delay;
use crate::schema::Schema;
use crate::settings::RelationalSettings;
use crate::storage::statements::{escape_like, SqlDialect, Statements};
use crate::storage::{check_arity, StorageDriver};
use crate::value::{EntityData, FieldValue, StorageType};
use crate::{debug, error, info, warn};
use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use std::collections::HashMap;
use std::time::Duration;

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

/// One SQL table per schema, reached through a pooled `sqlx` Any connection.
pub struct RelationalDriver {
    pool: AnyPool,
    dialect: SqlDialect,
    prefix: String,
}

impl RelationalDriver {
    pub async fn connect(settings: &RelationalSettings) -> Result<Self, PersistError> {
        sqlx::any::install_default_drivers();
        let url = settings.url();
        let url = url.as_str();
        let max_connections = settings.max_connections;
        let target = format!("{} database {}", settings.dialect.scheme(), settings.database);
        let target = target.as_str();
        let attempts = settings.connect_attempts.max(1);
        let delay = Duration::from_millis(settings.connect_retry_delay_ms);
        let pool = retry_with_delay(attempts, delay, move || async move {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .connect(url)
                .await
                .inspect_err(|e| warn!("Connecting to {} failed: {}", target, e))
        })
        .await?;
        info!("Connected to {} database {}", settings.dialect.scheme(), settings.database);
        Ok(RelationalDriver::from_pool(pool, settings.dialect, &settings.prefix))
    }

    pub fn from_pool(pool: AnyPool, dialect: SqlDialect, prefix: &str) -> Self {
        RelationalDriver { pool, dialect, prefix: prefix.to_string() }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn statements(&self, schema: &Schema) -> Statements {
        Statements::new(self.dialect, &self.prefix, schema)
    }

    async fn acquire(&self) -> Result<PoolConnection<Any>, PersistError> {
        Ok(self.pool.acquire().await?)
    }

    fn bind_key<'q>(mut query: AnyQuery<'q>, key_fields: &[FieldDescriptor], key: &PrimaryKey) -> Result<AnyQuery<'q>, PersistError> {
        for (field, value) in key_fields.iter().zip(key.values()) {
            let value = value.clone().coerce(field.storage_type())?;
            query = if field.storage_type().is_textual() {
                query.bind(escape_like(&value.into_text()?))
            } else {
                bind_value(query, field.storage_type(), value)
            };
        }
        Ok(query)
    }

    async fn save_on(&self, conn: &mut PoolConnection<Any>, schema: &Schema, item: &EntityData) -> Result<bool, PersistError> {
        let fields = schema.fields();
        let sql = self.statements(schema).upsert_row(&fields, &schema.primary_key_fields());
        let mut values = Vec::with_capacity(fields.len());
        for field in &fields {
            let raw = item.get(field.name()).cloned().unwrap_or(FieldValue::Null);
            values.push(raw.coerce(field.storage_type())?);
        }
        let mut query = sqlx::query::<Any>(&sql);
        for _ in 0..2 {
            for (field, value) in fields.iter().zip(&values) {
                query = bind_value(query, field.storage_type(), value.clone());
            }
        }
        match query.execute(&mut **conn).await {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                warn!("Duplicate key saving into {}: {}", schema.name(), db);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_on(&self, conn: &mut PoolConnection<Any>, schema: &Schema, key: &PrimaryKey) -> Result<bool, PersistError> {
        check_arity(schema, key)?;
        let key_fields = schema.primary_key_fields();
        let sql = self.statements(schema).delete_row(&key_fields);
        let query = Self::bind_key(sqlx::query::<Any>(&sql), &key_fields, key)?;
        let done = query.execute(&mut **conn).await?;
        debug!("Deleted {} rows for {} from {}", done.rows_affected(), key, schema.name());
        Ok(true)
    }
}

fn bind_value<'q>(query: AnyQuery<'q>, ty: StorageType, value: FieldValue) -> AnyQuery<'q> {
    match value {
        FieldValue::Null => match ty {
            StorageType::Byte | StorageType::Short | StorageType::Bool => query.bind(None::<i16>),
            StorageType::Int => query.bind(None::<i32>),
            StorageType::Long => query.bind(None::<i64>),
            StorageType::Float | StorageType::Double => query.bind(None::<f64>),
            StorageType::Char | StorageType::Text | StorageType::Uuid => query.bind(None::<String>),
        },
        FieldValue::Byte(v) => query.bind(v as i16),
        FieldValue::Short(v) => query.bind(v),
        FieldValue::Int(v) => query.bind(v),
        FieldValue::Long(v) => query.bind(v),
        FieldValue::Float(v) => query.bind(v as f64),
        FieldValue::Double(v) => query.bind(v),
        FieldValue::Bool(v) => query.bind(v as i16),
        FieldValue::Char(c) => query.bind(c.to_string()),
        FieldValue::Text(s) => query.bind(s),
        FieldValue::Uuid(u) => query.bind(u.to_string()),
    }
}

/// Reads column `idx` as the raw value closest to `ty`; coercion finishes the job.
fn decode_column(row: &AnyRow, idx: usize, ty: StorageType) -> Result<FieldValue, PersistError> {
    let raw = match ty {
        StorageType::Byte | StorageType::Short | StorageType::Int | StorageType::Long => {
            row.try_get::<Option<i64>, _>(idx)?.map(FieldValue::Long)
        }
        StorageType::Bool => match row.try_get::<Option<i64>, _>(idx) {
            Ok(v) => v.map(FieldValue::Long),
            Err(_) => row.try_get::<Option<bool>, _>(idx)?.map(FieldValue::Bool),
        },
        StorageType::Float | StorageType::Double => match row.try_get::<Option<f64>, _>(idx) {
            Ok(v) => v.map(FieldValue::Double),
            Err(_) => match row.try_get::<Option<f32>, _>(idx) {
                Ok(v) => v.map(FieldValue::Float),
                Err(_) => row.try_get::<Option<i64>, _>(idx)?.map(FieldValue::Long),
            },
        },
        StorageType::Char | StorageType::Text | StorageType::Uuid => {
            row.try_get::<Option<String>, _>(idx)?.map(FieldValue::Text)
        }
    };
    raw.unwrap_or(FieldValue::Null).coerce(ty)
}

#[async_trait]
impl StorageDriver for RelationalDriver {
    fn name(&self) -> &'static str {
        "relational"
    }

    async fn exists(&self, schema: &Schema, key: &PrimaryKey) -> Result<bool, PersistError> {
        check_arity(schema, key)?;
        let key_fields = schema.primary_key_fields();
        let sql = self.statements(schema).exists_row(&key_fields);
        let mut conn = self.acquire().await?;
        let row = Self::bind_key(sqlx::query::<Any>(&sql), &key_fields, key)?
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.try_get::<i64, _>(0)? > 0)
    }

    async fn load(&self, schema: &Schema, key: &PrimaryKey) -> Result<Option<EntityData>, PersistError> {
        check_arity(schema, key)?;
        let fields = schema.fields();
        let key_fields = schema.primary_key_fields();
        let sql = self.statements(schema).select_row(&fields, &key_fields);
        let mut conn = self.acquire().await?;
        let row = Self::bind_key(sqlx::query::<Any>(&sql), &key_fields, key)?
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut data = EntityData::new();
        for (idx, field) in fields.iter().enumerate() {
            data.insert(field.name().to_string(), decode_column(&row, idx, field.storage_type())?);
        }
        Ok(Some(data))
    }

    async fn create_schema(&self, schema: &Schema) -> Result<bool, PersistError> {
        let sql = self.statements(schema).create_table(schema);
        debug!("{}", sql);
        let mut conn = self.acquire().await?;
        sqlx::query::<Any>(&sql).execute(&mut *conn).await?;
        Ok(true)
    }

    async fn drop_schema(&self, schema: &Schema) -> Result<bool, PersistError> {
        let sql = self.statements(schema).drop_table();
        let mut conn = self.acquire().await?;
        sqlx::query::<Any>(&sql).execute(&mut *conn).await?;
        Ok(true)
    }

    async fn save(&self, schema: &Schema, item: &EntityData) -> Result<bool, PersistError> {
        let mut conn = self.acquire().await?;
        self.save_on(&mut conn, schema, item).await
    }

    async fn save_many(&self, schema: &Schema, items: &[EntityData]) -> Result<HashMap<PrimaryKey, bool>, PersistError> {
        let mut conn = self.acquire().await?;
        let mut results = HashMap::with_capacity(items.len());
        for item in items {
            let key = match schema.key_of(item) {
                Ok(key) => key,
                Err(e) => {
                    error!("Skipped an item of {} without a valid key: {}", schema.name(), e);
                    continue;
                }
            };
            let saved = match self.save_on(&mut conn, schema, item).await {
                Ok(saved) => saved,
                Err(e) => {
                    error!("Could not save {} into {}: {}", key, schema.name(), e);
                    false
                }
            };
            results.insert(key, saved);
        }
        Ok(results)
    }

    async fn delete(&self, schema: &Schema, key: &PrimaryKey) -> Result<bool, PersistError> {
        let mut conn = self.acquire().await?;
        self.delete_on(&mut conn, schema, key).await
    }

    async fn delete_many(&self, schema: &Schema, keys: &[PrimaryKey]) -> Result<HashMap<PrimaryKey, bool>, PersistError> {
        let mut conn = self.acquire().await?;
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            let deleted = match self.delete_on(&mut conn, schema, key).await {
                Ok(deleted) => deleted,
                Err(e) => {
                    error!("Could not delete {} from {}: {}", key, schema.name(), e);
                    false
                }
            };
            results.insert(key.clone(), deleted);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_model::fixtures::{Account, Guild, Member};
    use crate::entity_model::{compose_entity, store_entity, Entity};
    use crate::schema::SchemaRegistry;
    use crate::storage::test_utils::mk_temp_dir;
    use uuid::Uuid;

    fn sqlite_settings() -> RelationalSettings {
        let dir = mk_temp_dir("lazystore_sql");
        std::fs::create_dir_all(&dir).unwrap();
        RelationalSettings {
            dialect: SqlDialect::Sqlite,
            database: dir.join("store.db").display().to_string(),
            prefix: "t_".into(),
            ..RelationalSettings::default()
        }
    }

    async fn setup() -> (RelationalDriver, std::sync::Arc<Schema>) {
        let driver = RelationalDriver::connect(&sqlite_settings()).await.unwrap();
        let registry = SchemaRegistry::new();
        let (schema, _) = Account::spec().define(&registry).unwrap();
        assert!(driver.create_schema(&schema).await.unwrap());
        assert!(driver.create_schema(&schema).await.unwrap());
        (driver, schema)
    }

    #[tokio::test]
    async fn connect_retries_then_reports_failure() {
        let missing = mk_temp_dir("lazystore_missing").join("nested").join("store.db");
        let settings = RelationalSettings {
            dialect: SqlDialect::Sqlite,
            database: missing.display().to_string(),
            connect_attempts: 3,
            connect_retry_delay_ms: 50,
            ..RelationalSettings::default()
        };
        let started = std::time::Instant::now();
        let err = RelationalDriver::connect(&settings).await.err().expect("directory does not exist");
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(err.is_io() || err.is_protocol());
        assert!(!missing.exists());
    }

    fn account(realm: &str, nickname: Option<&str>) -> Account {
        let mut account = Account::seed();
        account.owner = Uuid::new_v4();
        account.realm = realm.to_string();
        account.balance = 12.75;
        account.level = -3;
        account.nickname = nickname.map(str::to_string);
        account.banned = true;
        account.grade = 'B';
        account.ratio = 0.1;
        account.tier = -7;
        account.flags = 300;
        account.visits = 1 << 40;
        account
    }

    #[tokio::test]
    async fn sqlite_roundtrip_keeps_every_type() {
        let (driver, schema) = setup().await;
        let spec = Account::spec();
        let original = account("eu", None);
        let key = schema.key(vec![original.owner.into(), "eu".into()]).unwrap();

        assert!(driver.load(&schema, &key).await.unwrap().is_none());
        assert!(!driver.exists(&schema, &key).await.unwrap());
        assert!(driver.save(&schema, &store_entity(&spec, &original)).await.unwrap());
        assert!(driver.exists(&schema, &key).await.unwrap());

        let data = driver.load(&schema, &key).await.unwrap().unwrap();
        assert_eq!(data.get("nickname"), Some(&FieldValue::Null));
        let loaded = compose_entity(&spec, &schema, Some(&data), &key).unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let (driver, schema) = setup().await;
        let spec = Account::spec();
        let mut value = account("us", Some("first"));
        let key = schema.key(vec![value.owner.into(), "us".into()]).unwrap();
        driver.save(&schema, &store_entity(&spec, &value)).await.unwrap();
        value.level = 50;
        value.nickname = Some("second".into());
        assert!(driver.save(&schema, &store_entity(&spec, &value)).await.unwrap());
        let data = driver.load(&schema, &key).await.unwrap().unwrap();
        assert_eq!(data.get("level"), Some(&FieldValue::Int(50)));
        assert_eq!(data.get("nickname"), Some(&FieldValue::Text("second".into())));
    }

    #[tokio::test]
    async fn unique_violation_reports_false() {
        let (driver, schema) = setup().await;
        let spec = Account::spec();
        let first = account("eu", Some("taken"));
        let second = account("eu", Some("taken"));
        let items = vec![store_entity(&spec, &first), store_entity(&spec, &second)];
        let results = driver.save_many(&schema, &items).await.unwrap();
        let first_key = schema.key(vec![first.owner.into(), "eu".into()]).unwrap();
        let second_key = schema.key(vec![second.owner.into(), "eu".into()]).unwrap();
        assert_eq!(results.get(&first_key), Some(&true));
        assert_eq!(results.get(&second_key), Some(&false));
    }

    #[tokio::test]
    async fn keyless_items_are_skipped() {
        let (driver, schema) = setup().await;
        let spec = Account::spec();
        let good = account("eu", None);
        let mut keyless = store_entity(&spec, &account("eu", None));
        keyless.insert("owner".into(), FieldValue::Null);
        let results = driver.save_many(&schema, &[keyless, store_entity(&spec, &good)]).await.unwrap();
        let good_key = schema.key(vec![good.owner.into(), "eu".into()]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results.get(&good_key), Some(&true));
    }

    #[tokio::test]
    async fn like_keys_match_literally() {
        let (driver, schema) = setup().await;
        let spec = Account::spec();
        let mut a = account("a_b", None);
        let owner = a.owner;
        driver.save(&schema, &store_entity(&spec, &a)).await.unwrap();
        a.realm = "axb".into();
        driver.save(&schema, &store_entity(&spec, &a)).await.unwrap();

        let pattern_like = schema.key(vec![owner.into(), "a%".into()]).unwrap();
        assert!(!driver.exists(&schema, &pattern_like).await.unwrap());
        let exact = schema.key(vec![owner.into(), "a_b".into()]).unwrap();
        let data = driver.load(&schema, &exact).await.unwrap().unwrap();
        assert_eq!(data.get("realm"), Some(&FieldValue::Text("a_b".into())));

        assert!(driver.delete(&schema, &exact).await.unwrap());
        assert!(!driver.exists(&schema, &exact).await.unwrap());
        let other = schema.key(vec![owner.into(), "axb".into()]).unwrap();
        assert!(driver.exists(&schema, &other).await.unwrap());
    }

    #[tokio::test]
    async fn foreign_keys_and_drop() {
        let driver = RelationalDriver::connect(&sqlite_settings()).await.unwrap();
        let registry = SchemaRegistry::new();
        let (guilds, _) = Guild::spec().define(&registry).unwrap();
        let (members, _) = Member::spec().define(&registry).unwrap();
        Member::spec().wire_foreign_keys(&registry, &members).unwrap();
        driver.create_schema(&guilds).await.unwrap();
        driver.create_schema(&members).await.unwrap();

        let guild = Guild { name: "miners".into(), motto: "dig".into() };
        assert!(driver.save(&guilds, &store_entity(&Guild::spec(), &guild)).await.unwrap());
        let member = Member { id: 1, guild: "miners".into() };
        assert!(driver.save(&members, &store_entity(&Member::spec(), &member)).await.unwrap());
        let orphan = Member { id: 2, guild: "nobody".into() };
        assert!(driver.save(&members, &store_entity(&Member::spec(), &orphan)).await.is_err());

        assert!(driver.drop_schema(&members).await.unwrap());
        assert!(driver.exists(&members, &crate::key![1i64]).await.is_err());
        driver.close().await;
    }
}
