use crate::field::FieldDescriptor;
use crate::schema::Schema;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[serde(alias = "mysql")]
    MariaDb,
    Sqlite,
}

impl SqlDialect {
    pub fn scheme(self) -> &'static str {
        match self {
            SqlDialect::MariaDb => "mysql",
            SqlDialect::Sqlite => "sqlite",
        }
    }

    fn table_options(self) -> &'static str {
        match self {
            SqlDialect::MariaDb => " DEFAULT CHARACTER SET ascii",
            SqlDialect::Sqlite => "",
        }
    }

    fn like(self) -> &'static str {
        match self {
            SqlDialect::MariaDb => "LIKE ?",
            SqlDialect::Sqlite => "LIKE ? ESCAPE '\\'",
        }
    }
}

/// Both dialects accept backtick quoting. Identifiers are validated before
/// they get here, so no escaping is needed.
pub fn quote(ident: &str) -> String {
    format!("`{}`", ident)
}

/// Escapes `LIKE` wildcards so the pattern matches the literal value.
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// SQL text for one table, built from its schema.
pub struct Statements {
    dialect: SqlDialect,
    prefix: String,
    table: String,
}

impl Statements {
    pub fn new(dialect: SqlDialect, prefix: &str, schema: &Schema) -> Self {
        Statements { dialect, prefix: prefix.to_string(), table: schema.name().to_string() }
    }

    pub fn table(&self) -> String {
        quote(&format!("{}{}", self.prefix, self.table))
    }

    pub fn create_table(&self, schema: &Schema) -> String {
        let mut parts: Vec<String> = schema
            .fields()
            .iter()
            .map(|f| {
                let null = if f.is_nullable() { "" } else { " NOT NULL" };
                format!("{} {}{}", quote(f.name()), f.column_type(), null)
            })
            .collect();

        let key = schema.primary_key().iter().map(|n| quote(n)).collect::<Vec<_>>().join(", ");
        parts.push(format!("CONSTRAINT {} PRIMARY KEY ({})", quote(&format!("PK_{}", self.table)), key));

        for (i, group) in schema.unique_groups().iter().enumerate() {
            let cols = group.iter().map(|n| quote(n)).collect::<Vec<_>>().join(", ");
            parts.push(format!("CONSTRAINT {} UNIQUE ({})", quote(&format!("UC_{}{}", self.table, i)), cols));
        }

        for fk in schema.foreign_keys() {
            parts.push(format!(
                "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                quote(&format!("FK_{}{}_{}", self.prefix, self.table, fk.local_field)),
                quote(&fk.local_field),
                quote(&format!("{}{}", self.prefix, fk.remote_table)),
                quote(&fk.remote_field),
            ));
        }

        format!("CREATE TABLE IF NOT EXISTS {} ({}){}", self.table(), parts.join(", "), self.dialect.table_options())
    }

    pub fn drop_table(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.table())
    }

    /// WHERE clause over the key fields, in canonical order.
    pub fn key_condition(&self, key_fields: &[FieldDescriptor]) -> String {
        key_fields
            .iter()
            .map(|f| {
                if f.storage_type().is_textual() {
                    format!("{} {}", quote(f.name()), self.dialect.like())
                } else {
                    format!("{} = ?", quote(f.name()))
                }
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Explicit column list in field order, so rows decode positionally.
    pub fn select_row(&self, fields: &[FieldDescriptor], key_fields: &[FieldDescriptor]) -> String {
        let cols = fields.iter().map(|f| quote(f.name())).collect::<Vec<_>>().join(", ");
        format!("SELECT {} FROM {} WHERE {} LIMIT 1", cols, self.table(), self.key_condition(key_fields))
    }

    pub fn exists_row(&self, key_fields: &[FieldDescriptor]) -> String {
        format!(
            "SELECT COUNT(*) FROM (SELECT 1 FROM {} WHERE {} LIMIT 1) found",
            self.table(),
            self.key_condition(key_fields)
        )
    }

    /// Upsert binding every field value twice: once for the insert and once
    /// for the update.
    pub fn upsert_row(&self, fields: &[FieldDescriptor], key_fields: &[FieldDescriptor]) -> String {
        let cols = fields.iter().map(|f| quote(f.name())).collect::<Vec<_>>().join(", ");
        let marks = vec!["?"; fields.len()].join(", ");
        let updates = fields.iter().map(|f| format!("{} = ?", quote(f.name()))).collect::<Vec<_>>().join(", ");
        match self.dialect {
            SqlDialect::MariaDb => format!(
                "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
                self.table(), cols, marks, updates
            ),
            SqlDialect::Sqlite => {
                let key = key_fields.iter().map(|f| quote(f.name())).collect::<Vec<_>>().join(", ");
                format!(
                    "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
                    self.table(), cols, marks, key, updates
                )
            }
        }
    }

    pub fn delete_row(&self, key_fields: &[FieldDescriptor]) -> String {
        format!("DELETE FROM {} WHERE {}", self.table(), self.key_condition(key_fields))
    }
}
