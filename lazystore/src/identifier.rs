use crate::error::PersistError;

const MAX_LEN: usize = 255;

const RESERVED: [&str; 23] = [
    "aux", "clock$", "con", "nul", "prn",
    "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8", "com9",
    "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

fn invalid(kind: &'static str, value: &str) -> PersistError {
    PersistError::InvalidIdentifier { kind, value: value.to_string() }
}

/// Validates a name that ends up as a directory or file name (tables, joined
/// keys). Accepts `[A-Za-z0-9_.-]` and interior spaces, rejects `..`,
/// reserved device names and anything of 256 characters or more.
pub fn validate_name<'a>(kind: &'static str, value: &'a str) -> Result<&'a str, PersistError> {
    if value.is_empty() || value.chars().count() > MAX_LEN || value.contains("..") {
        return Err(invalid(kind, value));
    }
    let safe = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ' '));
    if !safe || value.starts_with(' ') || value.ends_with(' ') || value.ends_with('.') {
        return Err(invalid(kind, value));
    }
    let stem = value.split('.').next().unwrap_or(value).trim_end().to_ascii_lowercase();
    if RESERVED.contains(&stem.as_str()) {
        return Err(invalid(kind, value));
    }
    Ok(value)
}

/// Validates a column name: a letter or underscore followed by letters,
/// digits or underscores.
pub fn validate_field_name(value: &str) -> Result<&str, PersistError> {
    let mut chars = value.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !head_ok || value.len() > 64 || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid("field", value));
    }
    Ok(value)
}
