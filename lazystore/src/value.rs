use crate::error::PersistError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Field name to value document exchanged with storage drivers.
pub type EntityData = BTreeMap<String, FieldValue>;

/// Storage class of a persisted field. Drives coercion of raw values and the
/// default SQL column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Bool,
    Char,
    Text,
    Uuid,
}

impl StorageType {
    pub fn is_integer(self) -> bool {
        matches!(self, StorageType::Byte | StorageType::Short | StorageType::Int | StorageType::Long)
    }

    pub fn is_decimal(self) -> bool {
        matches!(self, StorageType::Float | StorageType::Double)
    }

    /// Text-like values are matched with an escaped `LIKE` instead of `=`.
    pub fn is_textual(self) -> bool {
        matches!(self, StorageType::Text | StorageType::Uuid)
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            StorageType::Byte => "TINYINT",
            StorageType::Short => "SMALLINT",
            StorageType::Int => "INT",
            StorageType::Long => "BIGINT",
            StorageType::Float => "DOUBLE",
            StorageType::Double => "DOUBLE",
            StorageType::Bool => "SMALLINT",
            StorageType::Char => "CHAR(1)",
            StorageType::Text => "VARCHAR(255)",
            StorageType::Uuid => "VARCHAR(36)",
        }
    }

    /// Value a field of this type takes when neither storage nor the
    /// descriptor provide one.
    pub fn zero(self) -> FieldValue {
        match self {
            StorageType::Byte => FieldValue::Byte(0),
            StorageType::Short => FieldValue::Short(0),
            StorageType::Int => FieldValue::Int(0),
            StorageType::Long => FieldValue::Long(0),
            StorageType::Float => FieldValue::Float(0.0),
            StorageType::Double => FieldValue::Double(0.0),
            StorageType::Bool => FieldValue::Bool(false),
            StorageType::Char => FieldValue::Char(' '),
            StorageType::Text => FieldValue::Text(String::new()),
            StorageType::Uuid => FieldValue::Uuid(Uuid::nil()),
        }
    }
}

/// A single persisted value, as exchanged between entities and drivers.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Null,
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Char(char),
    Text(String),
    Uuid(Uuid),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Byte(_) => "byte",
            FieldValue::Short(_) => "short",
            FieldValue::Int(_) => "int",
            FieldValue::Long(_) => "long",
            FieldValue::Float(_) => "float",
            FieldValue::Double(_) => "double",
            FieldValue::Bool(_) => "bool",
            FieldValue::Char(_) => "char",
            FieldValue::Text(_) => "text",
            FieldValue::Uuid(_) => "uuid",
        }
    }

    fn integer(&self) -> Option<i64> {
        match self {
            FieldValue::Byte(v) => Some(*v as i64),
            FieldValue::Short(v) => Some(*v as i64),
            FieldValue::Int(v) => Some(*v as i64),
            FieldValue::Long(v) => Some(*v),
            FieldValue::Float(v) => Some(*v as i64),
            FieldValue::Double(v) => Some(*v as i64),
            FieldValue::Bool(v) => Some(*v as i64),
            FieldValue::Text(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    fn decimal(&self) -> Option<f64> {
        match self {
            FieldValue::Byte(v) => Some(*v as f64),
            FieldValue::Short(v) => Some(*v as f64),
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Long(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v as f64),
            FieldValue::Double(v) => Some(*v),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    fn mismatch(&self, target: StorageType) -> PersistError {
        PersistError::protocol(format!("cannot read {} value {} as {:?}", self.type_name(), self, target))
    }

    /// Converts a raw persisted value to the representation of `target`.
    /// Numbers are widened or narrowed to the field width, booleans accept
    /// integers, UUIDs and chars accept their string forms. Null stays null.
    pub fn coerce(self, target: StorageType) -> Result<FieldValue, PersistError> {
        if self.is_null() {
            return Ok(FieldValue::Null);
        }
        let out = match target {
            StorageType::Byte => self.integer().map(|v| FieldValue::Byte(v as i8)),
            StorageType::Short => self.integer().map(|v| FieldValue::Short(v as i16)),
            StorageType::Int => self.integer().map(|v| FieldValue::Int(v as i32)),
            StorageType::Long => self.integer().map(FieldValue::Long),
            StorageType::Float => self.decimal().map(|v| FieldValue::Float(v as f32)),
            StorageType::Double => self.decimal().map(FieldValue::Double),
            StorageType::Bool => match &self {
                FieldValue::Bool(b) => Some(FieldValue::Bool(*b)),
                FieldValue::Text(s) => s.trim().parse::<bool>().ok().map(FieldValue::Bool),
                other => other.integer().map(|v| FieldValue::Bool(v != 0)),
            },
            StorageType::Char => match &self {
                FieldValue::Char(c) => Some(FieldValue::Char(*c)),
                FieldValue::Text(s) => {
                    let mut chars = s.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => Some(FieldValue::Char(c)),
                        _ => None,
                    }
                }
                _ => None,
            },
            StorageType::Uuid => match &self {
                FieldValue::Uuid(u) => Some(FieldValue::Uuid(*u)),
                FieldValue::Text(s) => Uuid::parse_str(s.trim()).ok().map(FieldValue::Uuid),
                _ => None,
            },
            StorageType::Text => match self {
                FieldValue::Char(c) => return Ok(FieldValue::Text(c.to_string())),
                FieldValue::Uuid(u) => return Ok(FieldValue::Text(u.to_string())),
                other => return Ok(other),
            },
        };
        out.ok_or_else(|| self.mismatch(target))
    }

    pub fn from_json(value: &serde_json::Value) -> Result<FieldValue, PersistError> {
        use serde_json::Value;
        match value {
            Value::Null => Ok(FieldValue::Null),
            Value::Bool(b) => Ok(FieldValue::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(FieldValue::Long)
                .or_else(|| n.as_f64().map(FieldValue::Double))
                .ok_or_else(|| PersistError::protocol(format!("unsupported number {}", n))),
            Value::String(s) => Ok(FieldValue::Text(s.clone())),
            other => Err(PersistError::protocol(format!("nested value {} cannot be stored in a field", other))),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Byte(v) => Value::from(*v),
            FieldValue::Short(v) => Value::from(*v),
            FieldValue::Int(v) => Value::from(*v),
            FieldValue::Long(v) => Value::from(*v),
            FieldValue::Float(v) => serde_json::Number::from_f64(*v as f64).map_or(Value::Null, Value::Number),
            FieldValue::Double(v) => serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number),
            FieldValue::Bool(v) => Value::Bool(*v),
            FieldValue::Char(c) => Value::String(c.to_string()),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Uuid(u) => Value::String(u.to_string()),
        }
    }

    pub fn as_i8(&self) -> Result<i8, PersistError> {
        match self.clone().coerce(StorageType::Byte)? {
            FieldValue::Byte(v) => Ok(v),
            other => Err(other.mismatch(StorageType::Byte)),
        }
    }

    pub fn as_i16(&self) -> Result<i16, PersistError> {
        match self.clone().coerce(StorageType::Short)? {
            FieldValue::Short(v) => Ok(v),
            other => Err(other.mismatch(StorageType::Short)),
        }
    }

    pub fn as_i32(&self) -> Result<i32, PersistError> {
        match self.clone().coerce(StorageType::Int)? {
            FieldValue::Int(v) => Ok(v),
            other => Err(other.mismatch(StorageType::Int)),
        }
    }

    pub fn as_i64(&self) -> Result<i64, PersistError> {
        match self.clone().coerce(StorageType::Long)? {
            FieldValue::Long(v) => Ok(v),
            other => Err(other.mismatch(StorageType::Long)),
        }
    }

    pub fn as_f32(&self) -> Result<f32, PersistError> {
        match self.clone().coerce(StorageType::Float)? {
            FieldValue::Float(v) => Ok(v),
            other => Err(other.mismatch(StorageType::Float)),
        }
    }

    pub fn as_f64(&self) -> Result<f64, PersistError> {
        match self.clone().coerce(StorageType::Double)? {
            FieldValue::Double(v) => Ok(v),
            other => Err(other.mismatch(StorageType::Double)),
        }
    }

    pub fn as_bool(&self) -> Result<bool, PersistError> {
        match self.clone().coerce(StorageType::Bool)? {
            FieldValue::Bool(v) => Ok(v),
            other => Err(other.mismatch(StorageType::Bool)),
        }
    }

    pub fn as_char(&self) -> Result<char, PersistError> {
        match self.clone().coerce(StorageType::Char)? {
            FieldValue::Char(v) => Ok(v),
            other => Err(other.mismatch(StorageType::Char)),
        }
    }

    pub fn as_uuid(&self) -> Result<Uuid, PersistError> {
        match self.clone().coerce(StorageType::Uuid)? {
            FieldValue::Uuid(v) => Ok(v),
            other => Err(other.mismatch(StorageType::Uuid)),
        }
    }

    pub fn into_text(self) -> Result<String, PersistError> {
        match self.coerce(StorageType::Text)? {
            FieldValue::Text(s) => Ok(s),
            other => Err(other.mismatch(StorageType::Text)),
        }
    }

    /// `None` for null, the value otherwise. Setters of nullable fields use
    /// this before converting.
    pub fn into_option(self) -> Option<FieldValue> {
        match self {
            FieldValue::Null => None,
            other => Some(other),
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        use FieldValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Byte(a), Byte(b)) => a == b,
            (Short(a), Short(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Long(a), Long(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (Bool(a), Bool(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Uuid(a), Uuid(b)) => a == b,
            _ => false,
        }
    }
}

// floats compare and hash by bit pattern so values can live in keys
impl Eq for FieldValue {}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            FieldValue::Null => {}
            FieldValue::Byte(v) => v.hash(state),
            FieldValue::Short(v) => v.hash(state),
            FieldValue::Int(v) => v.hash(state),
            FieldValue::Long(v) => v.hash(state),
            FieldValue::Float(v) => v.to_bits().hash(state),
            FieldValue::Double(v) => v.to_bits().hash(state),
            FieldValue::Bool(v) => v.hash(state),
            FieldValue::Char(v) => v.hash(state),
            FieldValue::Text(v) => v.hash(state),
            FieldValue::Uuid(v) => v.hash(state),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Byte(v) => write!(f, "{}", v),
            FieldValue::Short(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Long(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Double(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Char(v) => write!(f, "{}", v),
            FieldValue::Text(v) => write!(f, "{}", v),
            FieldValue::Uuid(v) => write!(f, "{}", v),
        }
    }
}

macro_rules! impl_from_primitive {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for FieldValue {
                fn from(v: $t) -> Self {
                    FieldValue::$variant(v)
                }
            }
        )*
    };
}

impl_from_primitive! {
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    bool => Bool,
    char => Char,
    String => Text,
    Uuid => Uuid,
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<&String> for FieldValue {
    fn from(v: &String) -> Self {
        FieldValue::Text(v.clone())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(FieldValue::Null, Into::into)
    }
}
