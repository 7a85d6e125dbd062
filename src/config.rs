use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::fields::{FieldSchema, FieldSpec};

/// Columns every index has; user fields may not reuse these names.
pub const RESERVED_COLUMNS: [&str; 6] = [
    "id",
    "extension",
    "tweak",
    "added_at",
    "updated_at",
    "fingerprint",
];

pub const DEFAULT_DEDUP_THRESHOLD: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Store configuration not found at {}", .0.display())]
    Missing(PathBuf),

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Field '{0}' collides with a reserved column")]
    ReservedField(String),

    #[error("Field key '{0}' is not a valid identifier")]
    InvalidFieldKey(String),

    #[error("Field '{0}' is declared more than once")]
    DuplicateField(String),

    #[error("Alias '{alias}' is claimed by both '{first}' and '{second}'")]
    AmbiguousAlias {
        alias: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    pub remote: PathBuf,
    #[serde(default)]
    pub sync_config: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupSettings {
    #[serde(default = "default_threshold")]
    pub threshold: u32,
}

fn default_threshold() -> u32 {
    DEFAULT_DEDUP_THRESHOLD
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DEDUP_THRESHOLD,
        }
    }
}

/// Contents of a store's `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncSettings>,
    #[serde(default)]
    pub dedup: DedupSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

impl StoreConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: StoreConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json + "\n").map_err(write_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut keys = HashSet::new();
        let mut owners: HashMap<String, &str> = HashMap::new();

        for field in &self.fields {
            let key = field.key.trim();
            if !is_identifier(key) {
                return Err(ConfigError::InvalidFieldKey(field.key.clone()));
            }
            if RESERVED_COLUMNS
                .iter()
                .any(|reserved| reserved.eq_ignore_ascii_case(key))
            {
                return Err(ConfigError::ReservedField(field.key.clone()));
            }
            if !keys.insert(key.to_lowercase()) {
                return Err(ConfigError::DuplicateField(field.key.clone()));
            }

            for name in field.names() {
                match owners.get(&name) {
                    Some(owner) if *owner != field.key => {
                        return Err(ConfigError::AmbiguousAlias {
                            alias: name,
                            first: owner.to_string(),
                            second: field.key.clone(),
                        });
                    }
                    _ => {
                        owners.insert(name, &field.key);
                    }
                }
            }
        }

        Ok(())
    }

    pub fn schema(&self) -> FieldSchema {
        FieldSchema::new(self.fields.clone())
    }

    pub fn remote(&self) -> Option<&Path> {
        self.sync.as_ref().map(|sync| sync.remote.as_path())
    }

    pub fn sync_config(&self) -> bool {
        self.sync.as_ref().is_some_and(|sync| sync.sync_config)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fields::FieldKind;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"{
            "fields": [
                {"key": "rating", "type": "int", "aliases": ["r", "stars"]},
                {"key": "fav", "type": "bool"}
            ],
            "sync": {"remote": "/mnt/backup/photos", "sync_config": true},
            "plugins": ["ignored"]
        }"#;
        let config: StoreConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.fields.len(), 2);
        assert_eq!(config.fields[0].kind, FieldKind::Int);
        assert_eq!(config.remote(), Some(Path::new("/mnt/backup/photos")));
        assert!(config.sync_config());
        assert_eq!(config.dedup.threshold, DEFAULT_DEDUP_THRESHOLD);
    }

    #[test]
    fn test_reserved_field_rejected() {
        for reserved in ["tweak", "ID", "fingerprint"] {
            let config = StoreConfig {
                fields: vec![FieldSpec::new(reserved, FieldKind::Bool)],
                ..Default::default()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::ReservedField(_))
            ));
        }
    }

    #[test]
    fn test_invalid_and_duplicate_keys() {
        let config = StoreConfig {
            fields: vec![FieldSpec::new("bad key", FieldKind::Int)],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFieldKey(_))
        ));

        let config = StoreConfig {
            fields: vec![
                FieldSpec::new("rating", FieldKind::Int),
                FieldSpec::new("Rating", FieldKind::Bool),
            ],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateField(_))
        ));
    }

    #[test]
    fn test_ambiguous_alias() {
        let config = StoreConfig {
            fields: vec![
                FieldSpec::new("rating", FieldKind::Int).with_aliases(["r"]),
                FieldSpec::new("red", FieldKind::Bool).with_aliases(["R"]),
            ],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AmbiguousAlias { .. })
        ));
    }

    #[test]
    fn test_missing_config() {
        let temp_dir = TempDir::new().unwrap();
        let err = StoreConfig::load(&temp_dir.path().join("config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        let config = StoreConfig {
            fields: vec![FieldSpec::new("rating", FieldKind::Int)],
            workers: Some(2),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(StoreConfig::load(&path).unwrap(), config);
    }
}
