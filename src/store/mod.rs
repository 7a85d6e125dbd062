pub mod lock;

pub use lock::StoreLock;

use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::StoreConfig;
use crate::core::fields::FieldSchema;
use crate::database::models::{
    item_file_name, normalize_extension, parse_item_file_name, Item, ItemId,
};
use crate::database::repositories::ItemRepository;
use crate::database::{now, open_index, DatabaseError};
use crate::error::{Error, Result};
use crate::services::transfer::is_partial;

pub const INDEX_FILE: &str = "db.sqlite3";
pub const CONFIG_FILE: &str = "config.json";
pub const CONTENTS_DIR: &str = "contents";
pub const STAGING_DIR: &str = "staging";
pub const LOCK_FILE: &str = ".lock";
/// Remote index copied in by a pull, renamed over `INDEX_FILE` once the
/// contents are in place.
pub const INCOMING_INDEX_FILE: &str = "db.sqlite3.incoming";
/// Present while a pull is rewriting `contents/`.
pub const PULL_MARKER: &str = ".pulling";

/// Problems with a single content file that sync surfaces but never repairs
/// on its own.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyError {
    #[error("Item {id} is claimed by several content files: {files:?}")]
    AmbiguousFiles { id: ItemId, files: Vec<PathBuf> },

    #[error("{} is not a regular file", path.display())]
    NotAFile { path: PathBuf },

    #[error("Content file {} already exists", path.display())]
    Occupied { path: PathBuf },
}

/// Paths of a store (or remote replica) on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn config(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn contents(&self) -> PathBuf {
        self.root.join(CONTENTS_DIR)
    }

    pub fn staging(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn incoming_index(&self) -> PathBuf {
        self.root.join(INCOMING_INDEX_FILE)
    }

    pub fn pull_marker(&self) -> PathBuf {
        self.root.join(PULL_MARKER)
    }

    pub fn item_path(&self, id: ItemId, extension: &str) -> PathBuf {
        self.contents().join(item_file_name(id, extension))
    }

    fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.contents(), self.staging()] {
            fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }
        Ok(())
    }
}

/// Difference between the index and the contents directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    /// Rows whose content file is gone.
    pub missing_on_disk: Vec<ItemId>,
    /// Content files no row accounts for.
    pub unindexed: Vec<PathBuf>,
    pub conflicts: Vec<ConsistencyError>,
    /// Temporary files of an interrupted transfer.
    pub partial: Vec<PathBuf>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_on_disk.is_empty()
            && self.unindexed.is_empty()
            && self.conflicts.is_empty()
            && self.partial.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub name: String,
    pub root: PathBuf,
    pub items: usize,
    pub tweaked: usize,
    pub staged: usize,
    pub remote: Option<PathBuf>,
}

/// A local store: configuration, index connection and file layout.
///
/// The index connection is opened lazily and may be closed with
/// [`Store::close_index`] while the index file is being transferred.
pub struct Store {
    layout: StoreLayout,
    config: StoreConfig,
    schema: FieldSchema,
    conn: Option<Connection>,
}

impl Store {
    /// Lay out a new store at `root` and write its configuration.
    pub fn create(root: &Path, config: StoreConfig) -> Result<Self> {
        let layout = StoreLayout::new(root);
        if layout.config().exists() {
            return Err(Error::io(
                layout.config(),
                io::Error::new(ErrorKind::AlreadyExists, "store already exists"),
            ));
        }
        layout.ensure_dirs()?;
        config.save(&layout.config())?;
        log::info!("Created store at {}", root.display());
        Self::open(root)
    }

    pub fn open(root: &Path) -> Result<Self> {
        let layout = StoreLayout::new(root);
        let config = StoreConfig::load(&layout.config())?;
        layout.ensure_dirs()?;
        let schema = config.schema();
        let conn = open_index(&layout.index(), &schema)?;
        log::debug!("Opened store {}", root.display());

        Ok(Self {
            layout,
            config,
            schema,
            conn: Some(conn),
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    pub fn name(&self) -> String {
        self.layout
            .root()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.layout.root().display().to_string())
    }

    /// Connection and schema together, reopening the index if it was closed.
    pub fn index_parts(&mut self) -> Result<(&mut Connection, &FieldSchema)> {
        let conn = match self.conn {
            Some(ref mut conn) => conn,
            None => {
                let conn = open_index(&self.layout.index(), &self.schema)?;
                self.conn.insert(conn)
            }
        };
        Ok((conn, &self.schema))
    }

    pub fn items(&mut self) -> Result<ItemRepository<'_>> {
        let (conn, schema) = self.index_parts()?;
        Ok(ItemRepository::new(conn, schema))
    }

    pub fn close_index(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| Error::from(e))?;
        }
        Ok(())
    }

    /// Re-read `config.json`, e.g. after a pull replaced it.
    pub fn reload_config(&mut self) -> Result<()> {
        self.close_index()?;
        self.config = StoreConfig::load(&self.layout.config())?;
        self.schema = self.config.schema();
        Ok(())
    }

    pub fn item_path(&self, item: &Item) -> PathBuf {
        self.layout.item_path(item.id, &item.extension)
    }

    pub fn get(&mut self, id: ItemId) -> Result<Item> {
        Ok(self.items()?.get(id)?)
    }

    pub fn list(&mut self) -> Result<Vec<Item>> {
        Ok(self.items()?.list()?)
    }

    pub fn tweaked(&mut self) -> Result<Vec<Item>> {
        Ok(self.items()?.list_tweaked()?)
    }

    pub fn mark_tweak(&mut self, id: ItemId, tweak: bool) -> Result<Item> {
        let items = self.items()?;
        if !items.set_tweak(id, tweak, now())? {
            return Err(DatabaseError::NotFound(id).into());
        }
        Ok(items.get(id)?)
    }

    pub fn set_field(&mut self, id: ItemId, input: &str) -> Result<Item> {
        self.set_fields(id, &[input])
    }

    /// Apply several `key=value` style assignments in one transaction. Nothing
    /// is written if any of them fails to parse.
    pub fn set_fields<S: AsRef<str>>(&mut self, id: ItemId, inputs: &[S]) -> Result<Item> {
        let assignments = self.schema.parse_assignments(inputs)?;
        let at = now();

        let (conn, schema) = self.index_parts()?;
        let tx = conn.transaction()?;
        {
            let repo = ItemRepository::new(&tx, schema);
            for assignment in &assignments {
                if !repo.set_field(id, assignment, at)? {
                    return Err(DatabaseError::NotFound(id).into());
                }
            }
        }
        tx.commit()?;

        self.get(id)
    }

    /// Remove an item's row and its content file.
    pub fn delete_item(&mut self, id: ItemId) -> Result<Item> {
        let item = self.get(id)?;
        let path = self.item_path(&item);
        self.items()?.delete(&[id])?;
        remove_if_exists(&path)?;
        log::info!("Deleted item {}", id);
        Ok(item)
    }

    /// Swap the content of an item for `file`, keeping its id, fields and
    /// fingerprint. The extension follows the new file.
    pub fn replace_content(&mut self, id: ItemId, file: &Path) -> Result<Item> {
        if !file.is_file() {
            return Err(ConsistencyError::NotAFile {
                path: file.to_path_buf(),
            }
            .into());
        }
        let extension = file
            .extension()
            .map(|ext| normalize_extension(&ext.to_string_lossy()))
            .filter(|ext| !ext.is_empty())
            .ok_or_else(|| {
                Error::io(
                    file,
                    io::Error::new(ErrorKind::InvalidInput, "file has no extension"),
                )
            })?;

        let item = self.get(id)?;
        let old_path = self.item_path(&item);
        let new_path = self.layout.item_path(id, &extension);
        if new_path != old_path && new_path.exists() {
            return Err(ConsistencyError::Occupied { path: new_path }.into());
        }

        let (conn, schema) = self.index_parts()?;
        let tx = conn.transaction()?;
        ItemRepository::new(&tx, schema).set_extension(id, &extension, now())?;
        move_file(file, &new_path).map_err(|e| Error::io(&new_path, e))?;

        if let Err(e) = tx.commit() {
            if new_path != old_path {
                if let Err(undo) = move_file(&new_path, file) {
                    log::warn!("Could not return {}: {}", file.display(), undo);
                }
            }
            return Err(e.into());
        }
        if new_path != old_path {
            remove_if_exists(&old_path)?;
        }

        log::info!("Replaced content of item {}", id);
        self.get(id)
    }

    /// Compare content file names with the names the index implies. Read
    /// only; acting on the report is left to the caller.
    pub fn scan(&mut self) -> Result<ConsistencyReport> {
        let expected: HashMap<ItemId, String> = self
            .items()?
            .file_keys()?
            .into_iter()
            .map(|(id, extension)| (id, item_file_name(id, &extension)))
            .collect();

        let mut report = ConsistencyReport::default();
        let mut claimed: BTreeMap<ItemId, Vec<PathBuf>> = BTreeMap::new();

        let contents = self.layout.contents();
        for entry in WalkDir::new(&contents)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| Error::io(&contents, e.into()))?;
            let path = entry.path().to_path_buf();
            if is_partial(entry.file_name()) {
                report.partial.push(path);
                continue;
            }
            if !entry.file_type().is_file() {
                report.conflicts.push(ConsistencyError::NotAFile { path });
                continue;
            }
            match parse_item_file_name(&entry.file_name().to_string_lossy()) {
                Some((id, _)) => claimed.entry(id).or_default().push(path),
                None => report.unindexed.push(path),
            }
        }

        let mut present = HashSet::new();
        let mut ambiguous = HashSet::new();
        for (id, files) in claimed {
            if files.len() > 1 {
                ambiguous.insert(id);
                report
                    .conflicts
                    .push(ConsistencyError::AmbiguousFiles { id, files });
                continue;
            }
            for file in files {
                let matches_row = expected
                    .get(&id)
                    .is_some_and(|name| file.file_name() == Some(OsStr::new(name)));
                if matches_row {
                    present.insert(id);
                } else {
                    report.unindexed.push(file);
                }
            }
        }

        report.missing_on_disk = expected
            .keys()
            .filter(|id| !present.contains(*id) && !ambiguous.contains(*id))
            .copied()
            .collect();
        report.missing_on_disk.sort_unstable();
        report.unindexed.sort();

        Ok(report)
    }

    /// Regular files waiting in staging, in name order.
    pub fn staged_files(&self) -> Result<Vec<PathBuf>> {
        let staging = self.layout.staging();
        let mut files = Vec::new();
        for entry in WalkDir::new(&staging)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| Error::io(&staging, e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                log::debug!("Ignoring hidden staging entry {}", entry.path().display());
                continue;
            }
            files.push(entry.into_path());
        }
        Ok(files)
    }

    /// Move `path` into staging, renaming it if the name is taken.
    pub fn move_to_staging(&self, path: &Path) -> Result<PathBuf> {
        let name = path.file_name().ok_or_else(|| {
            Error::io(
                path,
                io::Error::new(ErrorKind::InvalidInput, "path has no file name"),
            )
        })?;
        let dest = unique_destination(&self.layout.staging(), name);
        move_file(path, &dest).map_err(|e| Error::io(path, e))?;
        log::info!("Moved {} to staging as {}", path.display(), dest.display());
        Ok(dest)
    }

    /// Copy `path` into staging, leaving the original in place.
    pub fn copy_to_staging(&self, path: &Path) -> Result<PathBuf> {
        let name = path.file_name().ok_or_else(|| {
            Error::io(
                path,
                io::Error::new(ErrorKind::InvalidInput, "path has no file name"),
            )
        })?;
        let dest = unique_destination(&self.layout.staging(), name);
        fs::copy(path, &dest).map_err(|e| Error::io(path, e))?;
        Ok(dest)
    }

    pub fn status(&mut self) -> Result<StoreStatus> {
        let staged = self.staged_files()?.len();
        let remote = self.config.remote().map(Path::to_path_buf);
        let name = self.name();
        let root = self.layout.root().to_path_buf();
        let items = self.items()?;

        Ok(StoreStatus {
            name,
            root,
            items: items.count()?,
            tweaked: items.count_tweaked()?,
            staged,
            remote,
        })
    }
}

/// Names of the stores (directories holding a `config.json`) under `root`.
pub fn list_stores(root: &Path) -> Result<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(root).map_err(|e| Error::io(root, e))? {
        let entry = entry.map_err(|e| Error::io(root, e))?;
        if entry.path().join(CONFIG_FILE).is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Rename, falling back to copy and remove across filesystems.
pub(crate) fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => {
            log::debug!(
                "Rename {} -> {} failed ({}), copying",
                from.display(),
                to.display(),
                e
            );
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(path, e)),
    }
}

fn unique_destination(dir: &Path, name: &OsStr) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let name = Path::new(name);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = name.extension().map(|e| e.to_string_lossy().into_owned());

    (1..)
        .map(|n| match &extension {
            Some(ext) => dir.join(format!("{}-{}.{}", stem, n, ext)),
            None => dir.join(format!("{}-{}", stem, n)),
        })
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}
