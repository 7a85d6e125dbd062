use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::core::fields::{Assignment, FieldValue};
use crate::core::hash::Fingerprint;

pub type ItemId = i64;

/// Width of the zero-padded id in content file names.
pub const ID_WIDTH: usize = 8;

// Item models
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    pub id: ItemId,
    pub extension: String,
    pub fingerprint: Fingerprint,
    pub tweak: bool,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Item {
    /// Name of the content file, e.g. `00000042.jpg`.
    pub fn file_name(&self) -> String {
        item_file_name(self.id, &self.extension)
    }

    pub fn field(&self, key: &str) -> Option<FieldValue> {
        self.fields.get(key).copied()
    }
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub extension: String,
    pub fingerprint: Fingerprint,
    pub tweak: bool,
    pub fields: Vec<Assignment>,
}

impl NewItem {
    pub fn new(extension: impl AsRef<str>, fingerprint: Fingerprint) -> Self {
        Self {
            extension: normalize_extension(extension.as_ref()),
            fingerprint,
            tweak: false,
            fields: Vec::new(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<Assignment>) -> Self {
        self.fields = fields;
        self
    }
}

/// `tweak` state captured before a pull overwrites the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TweakSnapshot {
    pub id: ItemId,
    pub tweak: bool,
    pub updated_at: DateTime<Utc>,
}

pub fn item_file_name(id: ItemId, extension: &str) -> String {
    format!("{:0width$}.{}", id, extension, width = ID_WIDTH)
}

/// Inverse of [`item_file_name`]. Returns `None` for names the store would
/// never have produced.
pub fn parse_item_file_name(name: &str) -> Option<(ItemId, String)> {
    let (stem, extension) = name.split_once('.')?;
    if stem.len() < ID_WIDTH || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if extension.is_empty() || extension.contains('.') {
        return None;
    }
    let id = stem.parse::<ItemId>().ok()?;
    Some((id, extension.to_string()))
}

/// Lowercase, strip a leading dot, and fold `jpeg` into `jpg`.
pub fn normalize_extension(extension: &str) -> String {
    let ext = extension.trim().trim_start_matches('.').to_lowercase();
    match ext.as_str() {
        "jpeg" => "jpg".to_string(),
        _ => ext,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_is_zero_padded() {
        assert_eq!(item_file_name(6, "jpg"), "00000006.jpg");
        assert_eq!(item_file_name(123_456_789, "png"), "123456789.png");
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            parse_item_file_name("00000042.png"),
            Some((42, "png".to_string()))
        );
        assert_eq!(parse_item_file_name("42.png"), None);
        assert_eq!(parse_item_file_name("holiday.jpg"), None);
        assert_eq!(parse_item_file_name("00000042"), None);
        assert_eq!(parse_item_file_name("00000042.tar.gz"), None);
    }

    #[test]
    fn test_normalize_extension() {
        assert_eq!(normalize_extension(".JPEG"), "jpg");
        assert_eq!(normalize_extension("PNG"), "png");
    }
}
