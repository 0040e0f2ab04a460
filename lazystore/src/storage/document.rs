use crate::error::PersistError;
use crate::identifier::validate_name;
use crate::key::PrimaryKey;
use crate::schema::Schema;
use crate::storage::{check_arity, StorageDriver};
use crate::value::{EntityData, FieldValue};
use crate::{debug, info};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Keeps one JSON document per row at `<root>/<table>/<k1>_<k2>...json`.
pub struct DocumentDriver {
    root: PathBuf,
}

impl DocumentDriver {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, PersistError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        info!("Document storage opened at {}", root.display());
        Ok(DocumentDriver { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, schema: &Schema) -> Result<PathBuf, PersistError> {
        Ok(self.root.join(validate_name("table", schema.name())?))
    }

    fn row_path(&self, schema: &Schema, key: &PrimaryKey) -> Result<PathBuf, PersistError> {
        check_arity(schema, key)?;
        let id = key.join("_");
        validate_name("key", &id)?;
        Ok(self.table_dir(schema)?.join(format!("{}.json", id)))
    }

    fn decode(schema: &Schema, raw: &str) -> Result<EntityData, PersistError> {
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(raw)?;
        let mut data = EntityData::new();
        for field in schema.fields() {
            if let Some(value) = object.get(field.name()) {
                let value = FieldValue::from_json(value)?.coerce(field.storage_type())?;
                data.insert(field.name().to_string(), value);
            }
        }
        Ok(data)
    }

    fn encode(schema: &Schema, item: &EntityData) -> Result<String, PersistError> {
        let object: serde_json::Map<String, serde_json::Value> = schema
            .fields()
            .iter()
            .map(|f| {
                let value = item.get(f.name()).cloned().unwrap_or(FieldValue::Null);
                (f.name().to_string(), value.to_json())
            })
            .collect();
        Ok(serde_json::to_string_pretty(&object)?)
    }
}

#[async_trait]
impl StorageDriver for DocumentDriver {
    fn name(&self) -> &'static str {
        "document"
    }

    async fn exists(&self, schema: &Schema, key: &PrimaryKey) -> Result<bool, PersistError> {
        let path = self.row_path(schema, key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, schema: &Schema, key: &PrimaryKey) -> Result<Option<EntityData>, PersistError> {
        let path = self.row_path(schema, key)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::decode(schema, &raw).map(Some)
    }

    async fn create_schema(&self, schema: &Schema) -> Result<bool, PersistError> {
        let dir = self.table_dir(schema)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(tokio::fs::metadata(&dir).await?.is_dir())
    }

    async fn drop_schema(&self, schema: &Schema) -> Result<bool, PersistError> {
        let dir = self.table_dir(schema)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, schema: &Schema, item: &EntityData) -> Result<bool, PersistError> {
        let key = schema.key_of(item)?;
        let path = self.row_path(schema, &key)?;
        let body = Self::encode(schema, item)?;
        // the rename replaces the target atomically, so readers never see a partial file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Saved {} into {}", key, path.display());
        Ok(true)
    }

    async fn delete(&self, schema: &Schema, key: &PrimaryKey) -> Result<bool, PersistError> {
        let path = self.row_path(schema, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}
