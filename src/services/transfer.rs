use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;
use walkdir::WalkDir;

/// Prefix of the temporary files written next to their final destination.
pub const TEMP_PREFIX: &str = ".hoard-partial-";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Transfer source {} does not exist", .0.display())]
    MissingSource(PathBuf),

    #[error("Failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("An earlier pull into {} did not finish; pull again before pushing", .0.display())]
    PullPending(PathBuf),

    #[error("Failed to walk {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

fn io_error<'a>(
    action: &'static str,
    path: &'a Path,
) -> impl FnOnce(io::Error) -> TransferError + 'a {
    move |source| TransferError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MirrorStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl MirrorStats {
    pub fn changed(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    pub fn merge(&mut self, other: MirrorStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
    }
}

/// Bulk file synchronisation between a local replica and its remote.
pub trait Transfer {
    /// Make `dest` match `source`.
    ///
    /// A directory source is mirrored recursively and, when
    /// `delete_extraneous` is set, destination entries absent from the source
    /// are removed. A file source is copied over `dest`.
    fn mirror(
        &self,
        source: &Path,
        dest: &Path,
        delete_extraneous: bool,
    ) -> Result<MirrorStats, TransferError>;
}

/// [`Transfer`] for remotes reachable through the local filesystem (mounted
/// drives, network shares).
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMirror;

enum FileChange {
    Created,
    Updated,
    Unchanged,
}

impl Transfer for LocalMirror {
    fn mirror(
        &self,
        source: &Path,
        dest: &Path,
        delete_extraneous: bool,
    ) -> Result<MirrorStats, TransferError> {
        let metadata = match fs::metadata(source) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TransferError::MissingSource(source.to_path_buf()));
            }
            Err(e) => return Err(io_error("stat", source)(e)),
        };

        let stats = if metadata.is_dir() {
            mirror_dir(source, dest, delete_extraneous)?
        } else {
            let mut stats = MirrorStats::default();
            match sync_file(source, dest)? {
                FileChange::Created => stats.created += 1,
                FileChange::Updated => stats.updated += 1,
                FileChange::Unchanged => {}
            }
            stats
        };

        log::debug!(
            "Mirrored {} -> {}: {} created, {} updated, {} deleted",
            source.display(),
            dest.display(),
            stats.created,
            stats.updated,
            stats.deleted
        );
        Ok(stats)
    }
}

fn mirror_dir(
    source: &Path,
    dest: &Path,
    delete_extraneous: bool,
) -> Result<MirrorStats, TransferError> {
    let walk_error = |source_err, root: &Path| TransferError::Walk {
        path: root.to_path_buf(),
        source: source_err,
    };

    fs::create_dir_all(dest).map_err(io_error("create", dest))?;
    let mut stats = MirrorStats::default();
    let mut wanted = HashSet::new();

    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(e, source))?;
        if is_partial(entry.file_name()) {
            log::debug!("Skipping partial transfer {}", entry.path().display());
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if target.is_file() {
                fs::remove_file(&target).map_err(io_error("remove", &target))?;
                stats.deleted += 1;
            }
            fs::create_dir_all(&target).map_err(io_error("create", &target))?;
        } else if file_type.is_file() {
            if target.is_dir() {
                fs::remove_dir_all(&target).map_err(io_error("remove", &target))?;
            }
            match sync_file(entry.path(), &target)? {
                FileChange::Created => stats.created += 1,
                FileChange::Updated => stats.updated += 1,
                FileChange::Unchanged => {}
            }
        } else {
            log::warn!("Skipping special file {}", entry.path().display());
            continue;
        }
        wanted.insert(relative.to_path_buf());
    }

    if delete_extraneous {
        for entry in WalkDir::new(dest).min_depth(1).contents_first(true) {
            let entry = entry.map_err(|e| walk_error(e, dest))?;
            let Ok(relative) = entry.path().strip_prefix(dest) else {
                continue;
            };
            if wanted.contains(relative) {
                continue;
            }
            if entry.file_type().is_dir() {
                fs::remove_dir(entry.path()).map_err(io_error("remove", entry.path()))?;
            } else {
                fs::remove_file(entry.path()).map_err(io_error("remove", entry.path()))?;
                stats.deleted += 1;
            }
        }
    }

    Ok(stats)
}

fn sync_file(source: &Path, dest: &Path) -> Result<FileChange, TransferError> {
    let source_meta = fs::metadata(source).map_err(io_error("stat", source))?;
    let change = match fs::metadata(dest) {
        Ok(dest_meta) if dest_meta.is_file() => {
            if dest_meta.len() == source_meta.len() {
                let same_mtime = match (dest_meta.modified(), source_meta.modified()) {
                    (Ok(a), Ok(b)) => a == b,
                    _ => false,
                };
                if same_mtime || content_hash(source)? == content_hash(dest)? {
                    return Ok(FileChange::Unchanged);
                }
            }
            FileChange::Updated
        }
        Ok(_) => FileChange::Updated,
        Err(e) if e.kind() == ErrorKind::NotFound => FileChange::Created,
        Err(e) => return Err(io_error("stat", dest)(e)),
    };

    copy_atomic(source, dest, source_meta.modified().ok())?;
    Ok(change)
}

/// Whether `name` is a temporary file left behind by an interrupted copy.
pub fn is_partial(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with(TEMP_PREFIX)
}

fn content_hash(path: &Path) -> Result<blake3::Hash, TransferError> {
    let file = File::open(path).map_err(io_error("open", path))?;
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(file).map_err(io_error("read", path))?;
    Ok(hasher.finalize())
}

/// Copy into a temporary sibling of `dest` and rename it into place, so a
/// reader never sees a partially written file.
fn copy_atomic(
    source: &Path,
    dest: &Path,
    modified: Option<std::time::SystemTime>,
) -> Result<(), TransferError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_error("create", parent))?;
    let temp = parent.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));

    let result = (|| {
        fs::copy(source, &temp).map_err(io_error("copy", source))?;
        if let Some(modified) = modified {
            File::options()
                .write(true)
                .open(&temp)
                .and_then(|file| file.set_modified(modified))
                .map_err(io_error("set mtime on", &temp))?;
        }
        fs::rename(&temp, dest).map_err(io_error("rename", dest))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}
