//! User-declared item fields and the typed setters that replace free-form
//! `key=value` evaluation.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("No such field: '{0}'")]
    UnknownField(String),

    #[error("Field '{key}' expects {expected}, got '{value}'")]
    InvalidValue {
        key: String,
        value: String,
        expected: FieldKind,
    },

    #[error("Field '{key}' is {expected} and needs an explicit value")]
    MissingValue { key: String, expected: FieldKind },

    #[error("Empty assignment")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Bool,
    Int,
}

impl FieldKind {
    pub fn default_value(self) -> FieldValue {
        match self {
            FieldKind::Bool => FieldValue::Bool(false),
            FieldKind::Int => FieldValue::Int(0),
        }
    }

    /// Parse a literal for this kind. Booleans accept the usual spellings.
    pub fn parse(self, key: &str, raw: &str) -> Result<FieldValue, FieldError> {
        let raw = raw.trim();
        let invalid = || FieldError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            expected: self,
        };

        match self {
            FieldKind::Bool => match raw.to_lowercase().as_str() {
                "true" | "yes" | "y" | "1" | "on" => Ok(FieldValue::Bool(true)),
                "false" | "no" | "n" | "0" | "off" => Ok(FieldValue::Bool(false)),
                _ => Err(invalid()),
            },
            FieldKind::Int => raw.parse::<i64>().map(FieldValue::Int).map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Bool => write!(f, "bool"),
            FieldKind::Int => write!(f, "int"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Int(_) => FieldKind::Int,
        }
    }

    /// Column representation; both kinds are stored as SQLite integers.
    pub fn to_sql(&self) -> i64 {
        match *self {
            FieldValue::Bool(value) => value as i64,
            FieldValue::Int(value) => value,
        }
    }

    pub fn from_sql(kind: FieldKind, raw: i64) -> Self {
        match kind {
            FieldKind::Bool => FieldValue::Bool(raw != 0),
            FieldKind::Int => FieldValue::Int(raw),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(value) => write!(f, "{}", value),
            FieldValue::Int(value) => write!(f, "{}", value),
        }
    }
}

/// One field declared in the store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl FieldSpec {
    pub fn new(key: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            key: key.into(),
            kind,
            aliases: Vec::new(),
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    /// Every lowercase name this field answers to, the key included.
    pub fn names(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(self.key.to_lowercase())
            .chain(self.aliases.iter().map(|a| a.to_lowercase()))
    }

    pub fn matches(&self, name: &str) -> bool {
        let name = name.trim().to_lowercase();
        self.names().any(|n| n == name)
    }
}

/// A validated `field = value` pair keyed by the canonical field key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub key: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSchema {
    fields: Vec<FieldSpec>,
}

impl FieldSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn resolve(&self, name: &str) -> Result<&FieldSpec, FieldError> {
        self.fields
            .iter()
            .find(|field| field.matches(name))
            .ok_or_else(|| FieldError::UnknownField(name.trim().to_string()))
    }

    /// Build an assignment from an already typed value, checking the kind.
    pub fn assign(&self, name: &str, value: FieldValue) -> Result<Assignment, FieldError> {
        let field = self.resolve(name)?;
        if field.kind != value.kind() {
            return Err(FieldError::InvalidValue {
                key: field.key.clone(),
                value: value.to_string(),
                expected: field.kind,
            });
        }
        Ok(Assignment {
            key: field.key.clone(),
            value,
        })
    }

    /// Parse one assignment command.
    ///
    /// Accepted forms are `key=value`, a bare `key` (sets a bool field to
    /// true) and `not key` or `!key` (sets a bool field to false).
    pub fn parse_assignment(&self, input: &str) -> Result<Assignment, FieldError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(FieldError::Empty);
        }

        if let Some((name, raw)) = input.split_once('=') {
            let field = self.resolve(name)?;
            let value = field.kind.parse(&field.key, raw)?;
            return Ok(Assignment {
                key: field.key.clone(),
                value,
            });
        }

        let (name, value) = match negated(input) {
            Some(rest) => (rest, false),
            None => (input, true),
        };

        let field = self.resolve(name)?;
        match field.kind {
            FieldKind::Bool => Ok(Assignment {
                key: field.key.clone(),
                value: FieldValue::Bool(value),
            }),
            FieldKind::Int => Err(FieldError::MissingValue {
                key: field.key.clone(),
                expected: field.kind,
            }),
        }
    }

    pub fn parse_assignments<I, S>(&self, inputs: I) -> Result<Vec<Assignment>, FieldError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        inputs
            .into_iter()
            .map(|input| self.parse_assignment(input.as_ref()))
            .collect()
    }
}

fn negated(input: &str) -> Option<&str> {
    if let Some(rest) = input.strip_prefix('!') {
        return Some(rest.trim());
    }
    match input.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("not ") => Some(input[4..].trim()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> FieldSchema {
        FieldSchema::new(vec![
            FieldSpec::new("rating", FieldKind::Int).with_aliases(["r", "Stars"]),
            FieldSpec::new("favourite", FieldKind::Bool).with_aliases(["fav"]),
        ])
    }

    #[test]
    fn test_parse_key_value() {
        let schema = schema();
        let assignment = schema.parse_assignment("stars = 4").unwrap();
        assert_eq!(assignment.key, "rating");
        assert_eq!(assignment.value, FieldValue::Int(4));
    }

    #[test]
    fn test_bare_and_negated_bool() {
        let schema = schema();
        assert_eq!(
            schema.parse_assignment("FAV").unwrap().value,
            FieldValue::Bool(true)
        );
        assert_eq!(
            schema.parse_assignment("not fav").unwrap().value,
            FieldValue::Bool(false)
        );
        assert_eq!(
            schema.parse_assignment("!favourite").unwrap().value,
            FieldValue::Bool(false)
        );
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let schema = schema();
        assert_eq!(
            schema.parse_assignment("colour=3"),
            Err(FieldError::UnknownField("colour".to_string()))
        );
    }

    #[test]
    fn test_type_mismatch() {
        let schema = schema();
        assert!(matches!(
            schema.parse_assignment("rating=high"),
            Err(FieldError::InvalidValue { .. })
        ));
        assert!(matches!(
            schema.parse_assignment("rating"),
            Err(FieldError::MissingValue { .. })
        ));
        assert!(matches!(
            schema.assign("fav", FieldValue::Int(1)),
            Err(FieldError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_no_expression_evaluation() {
        let schema = schema();
        assert!(schema.parse_assignment("rating=1+2").is_err());
    }
}
