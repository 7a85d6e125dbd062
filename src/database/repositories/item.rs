use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;

use crate::core::fields::{Assignment, FieldSchema, FieldValue};
use crate::core::hash::Fingerprint;
use crate::database::models::{Item, ItemId, NewItem, TweakSnapshot};
use crate::database::DatabaseError;

const BASE_COLUMNS: &str = "id, extension, fingerprint, tweak, added_at, updated_at";
const BASE_COLUMN_COUNT: usize = 6;

/// Row access for the `items` table. Works on a plain connection or, through
/// deref, on an open transaction.
pub struct ItemRepository<'c> {
    conn: &'c Connection,
    schema: &'c FieldSchema,
}

impl<'c> ItemRepository<'c> {
    pub fn new(conn: &'c Connection, schema: &'c FieldSchema) -> Self {
        Self { conn, schema }
    }

    fn select(&self) -> String {
        let mut sql = format!("SELECT {}", BASE_COLUMNS);
        for field in self.schema.fields() {
            sql.push_str(&format!(", \"{}\"", field.key));
        }
        sql.push_str(" FROM items");
        sql
    }

    fn map_row(&self, row: &Row<'_>) -> rusqlite::Result<Item> {
        let mut fields = BTreeMap::new();
        for (offset, field) in self.schema.fields().iter().enumerate() {
            let raw: i64 = row.get(BASE_COLUMN_COUNT + offset)?;
            fields.insert(field.key.clone(), FieldValue::from_sql(field.kind, raw));
        }

        Ok(Item {
            id: row.get(0)?,
            extension: row.get(1)?,
            fingerprint: Fingerprint::from_sql(row.get(2)?),
            tweak: row.get::<_, i64>(3)? != 0,
            added_at: row.get(4)?,
            updated_at: row.get(5)?,
            fields,
        })
    }

    fn query_items(&self, sql: &str, values: &[&dyn ToSql]) -> Result<Vec<Item>, DatabaseError> {
        let mut stmt = self.conn.prepare(sql)?;
        let items = stmt
            .query_map(values, |row| self.map_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn known_column(&self, key: &str) -> Result<(), DatabaseError> {
        if self.schema.fields().iter().any(|field| field.key == key) {
            Ok(())
        } else {
            Err(DatabaseError::UnknownColumn(key.to_string()))
        }
    }

    pub fn insert(&self, item: &NewItem, now: DateTime<Utc>) -> Result<Item, DatabaseError> {
        let mut columns = vec!["extension", "tweak", "added_at", "updated_at", "fingerprint"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        let mut values: Vec<Box<dyn ToSql>> = vec![
            Box::new(item.extension.clone()),
            Box::new(item.tweak),
            Box::new(now),
            Box::new(now),
            Box::new(item.fingerprint.to_sql()),
        ];

        // Later assignments to the same key win.
        let assigned: BTreeMap<&str, FieldValue> = item
            .fields
            .iter()
            .map(|a| (a.key.as_str(), a.value))
            .collect();
        for (key, value) in assigned {
            self.known_column(key)?;
            columns.push(format!("\"{}\"", key));
            values.push(Box::new(value.to_sql()));
        }

        let placeholders = (1..=values.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO items ({}) VALUES ({})",
            columns.join(", "),
            placeholders
        );
        self.conn.execute(&sql, params_from_iter(values.iter()))?;

        self.get(self.conn.last_insert_rowid())
    }

    pub fn find_by_id(&self, id: ItemId) -> Result<Option<Item>, DatabaseError> {
        let sql = format!("{} WHERE id = ?1", self.select());
        let item = self
            .conn
            .query_row(&sql, params![id], |row| self.map_row(row))
            .optional()?;
        Ok(item)
    }

    pub fn get(&self, id: ItemId) -> Result<Item, DatabaseError> {
        self.find_by_id(id)?.ok_or(DatabaseError::NotFound(id))
    }

    pub fn find_by_ids(&self, ids: &[ItemId]) -> Result<Vec<Item>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "{} WHERE id IN ({}) ORDER BY id",
            self.select(),
            placeholders
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_from_iter(ids.iter()), |row| self.map_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn list(&self) -> Result<Vec<Item>, DatabaseError> {
        self.query_items(&format!("{} ORDER BY id", self.select()), &[])
    }

    pub fn list_tweaked(&self) -> Result<Vec<Item>, DatabaseError> {
        self.query_items(
            &format!("{} WHERE tweak = 1 ORDER BY id", self.select()),
            &[],
        )
    }

    /// `(id, extension)` of every row, enough to derive content file names.
    pub fn file_keys(&self) -> Result<Vec<(ItemId, String)>, DatabaseError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, extension FROM items ORDER BY id")?;
        let keys = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn fingerprints(&self) -> Result<Vec<(ItemId, Fingerprint)>, DatabaseError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, fingerprint FROM items ORDER BY id")?;
        let pairs = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, Fingerprint::from_sql(row.get(1)?)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    pub fn tweak_snapshot(&self) -> Result<Vec<TweakSnapshot>, DatabaseError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, tweak, updated_at FROM items ORDER BY id")?;
        let snapshot = stmt
            .query_map([], |row| {
                Ok(TweakSnapshot {
                    id: row.get(0)?,
                    tweak: row.get::<_, i64>(1)? != 0,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(snapshot)
    }

    /// Write `tweak` with an explicit timestamp, used both for local edits
    /// and for restoring a snapshot after a pull.
    pub fn set_tweak(
        &self,
        id: ItemId,
        tweak: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self.conn.execute(
            "UPDATE items SET tweak = ?1, updated_at = ?2 WHERE id = ?3",
            params![tweak, updated_at, id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_field(
        &self,
        id: ItemId,
        assignment: &Assignment,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        self.known_column(&assignment.key)?;
        let sql = format!(
            "UPDATE items SET \"{}\" = ?1, updated_at = ?2 WHERE id = ?3",
            assignment.key
        );
        let changed = self
            .conn
            .execute(&sql, params![assignment.value.to_sql(), now, id])?;
        Ok(changed > 0)
    }

    pub fn set_extension(
        &self,
        id: ItemId,
        extension: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self.conn.execute(
            "UPDATE items SET extension = ?1, updated_at = ?2 WHERE id = ?3",
            params![extension, now, id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete(&self, ids: &[ItemId]) -> Result<usize, DatabaseError> {
        let mut stmt = self.conn.prepare("DELETE FROM items WHERE id = ?1")?;
        let mut deleted = 0;
        for id in ids {
            deleted += stmt.execute(params![id])?;
        }
        Ok(deleted)
    }

    /// Highest id ever handed out, including ids of deleted rows.
    pub fn last_assigned_id(&self) -> Result<ItemId, DatabaseError> {
        let seq: Option<ItemId> = self
            .conn
            .query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = 'items'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0))
    }

    pub fn count(&self) -> Result<usize, DatabaseError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn count_tweaked(&self) -> Result<usize, DatabaseError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM items WHERE tweak = 1", [], |row| {
                    row.get(0)
                })?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fields::{FieldKind, FieldSpec};
    use crate::database::open_index;
    use chrono::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Connection, FieldSchema) {
        let temp_dir = TempDir::new().unwrap();
        let schema = FieldSchema::new(vec![
            FieldSpec::new("rating", FieldKind::Int).with_aliases(["r"]),
            FieldSpec::new("fav", FieldKind::Bool),
        ]);
        let conn = open_index(&temp_dir.path().join("db.sqlite3"), &schema).unwrap();
        (temp_dir, conn, schema)
    }

    #[test]
    fn test_insert_and_find() {
        let (_dir, conn, schema) = setup();
        let repo = ItemRepository::new(&conn, &schema);
        let now = Utc::now();

        let rating = schema.parse_assignment("r=4").unwrap();
        let item = repo
            .insert(
                &NewItem::new("JPEG", Fingerprint::new(0xABCD)).with_fields(vec![rating]),
                now,
            )
            .unwrap();

        assert_eq!(item.id, 1);
        assert_eq!(item.extension, "jpg");
        assert_eq!(item.fingerprint, Fingerprint::new(0xABCD));
        assert_eq!(item.field("rating"), Some(FieldValue::Int(4)));
        assert_eq!(item.field("fav"), Some(FieldValue::Bool(false)));
        assert_eq!(item.added_at, now);
        assert_eq!(item.file_name(), "00000001.jpg");

        assert_eq!(repo.find_by_id(1).unwrap(), Some(item));
        assert_eq!(repo.find_by_id(2).unwrap(), None);
        assert!(matches!(repo.get(2), Err(DatabaseError::NotFound(2))));
    }

    #[test]
    fn test_ids_are_never_reused() {
        let (_dir, conn, schema) = setup();
        let repo = ItemRepository::new(&conn, &schema);
        let now = Utc::now();

        let first = repo.insert(&NewItem::new("png", Fingerprint::new(1)), now).unwrap();
        let second = repo.insert(&NewItem::new("png", Fingerprint::new(2)), now).unwrap();
        assert_eq!(repo.delete(&[second.id]).unwrap(), 1);

        assert_eq!(repo.last_assigned_id().unwrap(), 2);

        let third = repo.insert(&NewItem::new("png", Fingerprint::new(3)), now).unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(third.id, 3);
        assert_eq!(repo.last_assigned_id().unwrap(), 3);
    }

    #[test]
    fn test_tweak_and_field_updates_bump_timestamp() {
        let (_dir, conn, schema) = setup();
        let repo = ItemRepository::new(&conn, &schema);
        let created = Utc::now() - Duration::hours(1);
        let item = repo
            .insert(&NewItem::new("png", Fingerprint::new(7)), created)
            .unwrap();

        let later = created + Duration::minutes(5);
        assert!(repo.set_tweak(item.id, true, later).unwrap());
        let updated = repo.get(item.id).unwrap();
        assert!(updated.tweak);
        assert_eq!(updated.updated_at, later);
        assert_eq!(repo.count_tweaked().unwrap(), 1);
        assert_eq!(repo.list_tweaked().unwrap().len(), 1);

        let even_later = later + Duration::minutes(5);
        let fav = schema.parse_assignment("fav").unwrap();
        assert!(repo.set_field(item.id, &fav, even_later).unwrap());
        let updated = repo.get(item.id).unwrap();
        assert_eq!(updated.field("fav"), Some(FieldValue::Bool(true)));
        assert_eq!(updated.updated_at, even_later);
        assert_eq!(updated.added_at, created);
    }

    #[test]
    fn test_unknown_column_rejected() {
        let (_dir, conn, schema) = setup();
        let repo = ItemRepository::new(&conn, &schema);
        let bogus = Assignment {
            key: "tweak\" = 1 --".to_string(),
            value: FieldValue::Int(1),
        };
        assert!(matches!(
            repo.set_field(1, &bogus, Utc::now()),
            Err(DatabaseError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_snapshot_and_lookups() {
        let (_dir, conn, schema) = setup();
        let repo = ItemRepository::new(&conn, &schema);
        let now = Utc::now();
        for bits in [10u64, 20, 30] {
            repo.insert(&NewItem::new("gif", Fingerprint::new(bits)), now)
                .unwrap();
        }

        assert_eq!(repo.count().unwrap(), 3);
        assert_eq!(
            repo.fingerprints().unwrap(),
            vec![
                (1, Fingerprint::new(10)),
                (2, Fingerprint::new(20)),
                (3, Fingerprint::new(30))
            ]
        );
        assert_eq!(repo.file_keys().unwrap()[2], (3, "gif".to_string()));
        assert_eq!(repo.find_by_ids(&[3, 1, 99]).unwrap().len(), 2);

        let snapshot = repo.tweak_snapshot().unwrap();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().all(|s| !s.tweak && s.updated_at == now));
    }
}
