#![allow(dead_code)]

use lazystore::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const TICK: Duration = Duration::from_millis(10);

pub fn temp_path(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}_{}", prefix, rand::random::<u64>()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub id: uuid::Uuid,
    pub name: Option<String>,
    pub score: i64,
    pub online: bool,
}

impl Entity for Player {
    fn spec() -> EntitySpec<Self> {
        EntitySpec::new("players", || Player { id: uuid::Uuid::nil(), name: None, score: 0, online: false })
            .field(
                FieldDescriptor::new("id", StorageType::Uuid).primary(),
                |p: &Player| p.id.into(),
                |p: &mut Player, v: FieldValue| { p.id = v.as_uuid()?; Ok(()) },
            )
            .field(
                FieldDescriptor::new("name", StorageType::Text).nullable().unique(),
                |p: &Player| p.name.clone().into(),
                |p: &mut Player, v: FieldValue| { p.name = v.into_option().map(FieldValue::into_text).transpose()?; Ok(()) },
            )
            .field(
                FieldDescriptor::new("score", StorageType::Long).default_value(10i64),
                |p: &Player| p.score.into(),
                |p: &mut Player, v: FieldValue| { p.score = v.as_i64()?; Ok(()) },
            )
            .field(
                FieldDescriptor::new("online", StorageType::Bool),
                |p: &Player| p.online.into(),
                |p: &mut Player, v: FieldValue| { p.online = v.as_bool()?; Ok(()) },
            )
    }
}

pub async fn players(driver: Arc<dyn StorageDriver>) -> EntityManager<Player> {
    EntityManager::builder(driver, Arc::new(TokioScheduler::current(TICK)))
        .registry(Arc::new(SchemaRegistry::new()))
        .inactive_time_ms(-1)
        .define()
        .unwrap()
        .initialize()
        .await
        .unwrap()
}

pub fn player(name: &str, score: i64) -> Player {
    Player { id: uuid::Uuid::new_v4(), name: Some(name.to_string()), score, online: true }
}
