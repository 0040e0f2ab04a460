use crate::value::FieldValue;
use std::fmt;

/// Primary key values in the canonical order of the owning schema, i.e. the
/// primary-key field names sorted lexicographically.
///
/// A key built with [`PrimaryKey::new`] or [`key!`](crate::key) is raw; the
/// manager and drivers canonicalise it against the schema (arity check and
/// coercion to the key field types) before use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimaryKey(Vec<FieldValue>);

impl PrimaryKey {
    pub fn new(values: Vec<FieldValue>) -> Self {
        PrimaryKey(values)
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn join(&self, separator: &str) -> String {
        self.0.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(separator)
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.join(", "))
    }
}

impl From<Vec<FieldValue>> for PrimaryKey {
    fn from(values: Vec<FieldValue>) -> Self {
        PrimaryKey(values)
    }
}

/// Builds a raw [`PrimaryKey`] from values in canonical order.
#[macro_export]
macro_rules! key {
    ($($value:expr),+ $(,)?) => {
        $crate::key::PrimaryKey::new(vec![$($crate::value::FieldValue::from($value)),+])
    };
}
