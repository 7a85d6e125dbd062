use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::fields::{Assignment, FieldSchema};
use crate::core::hash::{Fingerprint, Hasher};
use crate::database::models::{normalize_extension, Item, ItemId, NewItem};
use crate::database::now;
use crate::database::repositories::ItemRepository;
use crate::error::{Error, Result};
use crate::store::{move_file, remove_if_exists, ConsistencyError, Store};

/// Maximum Hamming distance at which a staged file is considered a collision
/// with an existing item.
pub const COLLISION_THRESHOLD: u32 = 9;

/// Extensions (after normalisation) the store accepts.
pub const SUPPORTED_EXTENSIONS: [&str; 7] = ["jpg", "png", "gif", "bmp", "tif", "tiff", "webp"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NotAFile,
    MissingExtension,
    UnsupportedExtension(String),
    Undecodable(String),
    Vetoed(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotAFile => write!(f, "not a regular file"),
            RejectReason::MissingExtension => write!(f, "no file extension"),
            RejectReason::UnsupportedExtension(ext) => write!(f, "unsupported extension '{}'", ext),
            RejectReason::Undecodable(reason) => write!(f, "cannot decode: {}", reason),
            RejectReason::Vetoed(reason) => write!(f, "vetoed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionResult {
    Clear {
        fingerprint: Fingerprint,
    },
    Collision {
        fingerprint: Fingerprint,
        existing: Vec<ItemId>,
    },
    Rejected(RejectReason),
}

/// What to do with a candidate that collides with existing items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Delete the colliding items and admit the candidate.
    Replace,
    /// Leave the candidate in staging.
    Skip,
    /// Delete the candidate.
    Discard,
    /// Admit the candidate next to the colliding items.
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Collision,
    Skip,
    Rejected,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureReason::Collision => "collision",
            FailureReason::Skip => "skip",
            FailureReason::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Field values to admit a candidate with, or an instruction to leave it in
/// staging for now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Triage {
    Admit(Vec<Assignment>),
    Leave,
}

/// Decisions that need a human (or a script standing in for one).
pub trait AdmissionPolicy {
    fn resolve(&mut self, candidate: &Path, existing: &[Item]) -> Resolution;

    fn triage(&mut self, _candidate: &Path, _schema: &FieldSchema) -> Triage {
        Triage::Admit(Vec::new())
    }
}

/// Applies the same resolution to every collision and admits without fields.
#[derive(Debug, Clone, Copy)]
pub struct FixedPolicy(pub Resolution);

impl AdmissionPolicy for FixedPolicy {
    fn resolve(&mut self, _candidate: &Path, _existing: &[Item]) -> Resolution {
        self.0
    }
}

/// Extension points around admission.
pub trait AdmissionHook {
    /// Return `Err` with a reason to veto the candidate.
    fn before_admit(&mut self, _candidate: &Path) -> std::result::Result<(), String> {
        Ok(())
    }

    fn admitted(&mut self, _item: &Item, _path: &Path) {}

    fn rejected(&mut self, _candidate: &Path, _reason: &RejectReason) {}
}

impl AdmissionHook for () {}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdmissionOutcome {
    Admitted {
        item: Item,
        replaced: Vec<ItemId>,
    },
    Failed {
        path: PathBuf,
        reason: FailureReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Left {
        path: PathBuf,
    },
}

/// Decides whether staged files may enter a store and commits them.
pub struct AdmissionGate {
    hasher: Hasher,
    threshold: u32,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
            threshold: COLLISION_THRESHOLD,
        }
    }

    pub fn hasher(&self) -> &Hasher {
        &self.hasher
    }

    /// Classify `candidate` without touching the store.
    pub fn check(&self, store: &mut Store, candidate: &Path) -> Result<AdmissionResult> {
        if let Some(reason) = precheck(candidate) {
            return Ok(AdmissionResult::Rejected(reason));
        }
        match self.hasher.fingerprint(candidate) {
            Ok(fingerprint) => self.check_fingerprint(store, fingerprint),
            Err(e) => Ok(AdmissionResult::Rejected(RejectReason::Undecodable(
                e.reason,
            ))),
        }
    }

    /// Collision search for an already computed fingerprint.
    pub fn check_fingerprint(
        &self,
        store: &mut Store,
        fingerprint: Fingerprint,
    ) -> Result<AdmissionResult> {
        let known = store.items()?.fingerprints()?;
        let existing: Vec<ItemId> = known
            .par_iter()
            .filter(|(_, other)| fingerprint.distance(*other) <= self.threshold)
            .map(|(id, _)| *id)
            .collect();

        if existing.is_empty() {
            Ok(AdmissionResult::Clear { fingerprint })
        } else {
            Ok(AdmissionResult::Collision {
                fingerprint,
                existing,
            })
        }
    }

    /// Insert the candidate's row, drop the rows it replaces and move it to
    /// its content path, all under one transaction.
    ///
    /// The file move happens before the commit and is undone if the commit
    /// fails. Files of replaced items are removed after the commit.
    pub fn commit(
        &self,
        store: &mut Store,
        candidate: &Path,
        fingerprint: Fingerprint,
        fields: Vec<Assignment>,
        replace: &[ItemId],
    ) -> Result<Item> {
        let extension = candidate
            .extension()
            .map(|ext| normalize_extension(&ext.to_string_lossy()))
            .unwrap_or_default();
        let replaced_items = store.items()?.find_by_ids(replace)?;
        let replaced_paths: Vec<PathBuf> = replaced_items
            .iter()
            .map(|item| store.item_path(item))
            .collect();
        let layout = store.layout().clone();

        let (conn, schema) = store.index_parts()?;
        let tx = conn.transaction()?;
        let item = {
            let repo = ItemRepository::new(&tx, schema);
            let item = repo.insert(
                &NewItem::new(extension, fingerprint).with_fields(fields),
                now(),
            )?;
            repo.delete(replace)?;
            item
        };

        let target = layout.item_path(item.id, &item.extension);
        if target.exists() {
            return Err(ConsistencyError::Occupied { path: target }.into());
        }
        move_file(candidate, &target).map_err(|e| Error::io(candidate, e))?;

        if let Err(e) = tx.commit() {
            if let Err(undo) = move_file(&target, candidate) {
                log::warn!(
                    "Could not move {} back to {}: {}",
                    target.display(),
                    candidate.display(),
                    undo
                );
            }
            return Err(e.into());
        }

        for path in replaced_paths {
            if let Err(e) = remove_if_exists(&path) {
                log::warn!("Could not remove replaced file {}: {}", path.display(), e);
            }
        }

        log::info!("Admitted {} as item {}", candidate.display(), item.id);
        Ok(item)
    }

    /// Fingerprint `candidate` and run it through the whole gate.
    pub fn admit<P, H>(
        &self,
        store: &mut Store,
        candidate: &Path,
        policy: &mut P,
        hook: &mut H,
    ) -> Result<AdmissionOutcome>
    where
        P: AdmissionPolicy + ?Sized,
        H: AdmissionHook + ?Sized,
    {
        if let Some(reason) = precheck(candidate) {
            return Ok(reject(candidate, reason, hook));
        }
        match self.hasher.fingerprint(candidate) {
            Ok(fingerprint) => self.admit_with(store, candidate, fingerprint, policy, hook),
            Err(e) => Ok(reject(candidate, RejectReason::Undecodable(e.reason), hook)),
        }
    }

    /// [`AdmissionGate::admit`] with a fingerprint computed up front, as the
    /// staging phase does for a whole batch.
    pub fn admit_with<P, H>(
        &self,
        store: &mut Store,
        candidate: &Path,
        fingerprint: Fingerprint,
        policy: &mut P,
        hook: &mut H,
    ) -> Result<AdmissionOutcome>
    where
        P: AdmissionPolicy + ?Sized,
        H: AdmissionHook + ?Sized,
    {
        if let Some(reason) = precheck(candidate) {
            return Ok(reject(candidate, reason, hook));
        }
        if let Err(veto) = hook.before_admit(candidate) {
            return Ok(reject(candidate, RejectReason::Vetoed(veto), hook));
        }

        let replace = match self.check_fingerprint(store, fingerprint)? {
            AdmissionResult::Clear { .. } => Vec::new(),
            AdmissionResult::Collision { existing, .. } => {
                let colliding = store.items()?.find_by_ids(&existing)?;
                match policy.resolve(candidate, &colliding) {
                    Resolution::Replace => existing,
                    Resolution::Force => Vec::new(),
                    Resolution::Skip => {
                        log::info!(
                            "Skipping {}: collides with {:?}",
                            candidate.display(),
                            existing
                        );
                        return Ok(AdmissionOutcome::Failed {
                            path: candidate.to_path_buf(),
                            reason: FailureReason::Collision,
                            detail: None,
                        });
                    }
                    Resolution::Discard => {
                        remove_if_exists(candidate)?;
                        log::info!("Discarded {}", candidate.display());
                        return Ok(AdmissionOutcome::Failed {
                            path: candidate.to_path_buf(),
                            reason: FailureReason::Skip,
                            detail: None,
                        });
                    }
                }
            }
            AdmissionResult::Rejected(reason) => return Ok(reject(candidate, reason, hook)),
        };

        let fields = match policy.triage(candidate, store.schema()) {
            Triage::Admit(fields) => fields,
            Triage::Leave => {
                return Ok(AdmissionOutcome::Left {
                    path: candidate.to_path_buf(),
                });
            }
        };

        let item = self.commit(store, candidate, fingerprint, fields, &replace)?;
        hook.admitted(&item, &store.item_path(&item));
        Ok(AdmissionOutcome::Admitted {
            item,
            replaced: replace,
        })
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}

fn precheck(candidate: &Path) -> Option<RejectReason> {
    match fs::symlink_metadata(candidate) {
        Ok(metadata) if metadata.is_file() => {}
        _ => return Some(RejectReason::NotAFile),
    }
    let extension = match candidate.extension() {
        Some(ext) => normalize_extension(&ext.to_string_lossy()),
        None => return Some(RejectReason::MissingExtension),
    };
    if SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        None
    } else {
        Some(RejectReason::UnsupportedExtension(extension))
    }
}

fn reject<H: AdmissionHook + ?Sized>(
    candidate: &Path,
    reason: RejectReason,
    hook: &mut H,
) -> AdmissionOutcome {
    log::warn!("Rejected {}: {}", candidate.display(), reason);
    hook.rejected(candidate, &reason);
    AdmissionOutcome::Failed {
        path: candidate.to_path_buf(),
        reason: FailureReason::Rejected,
        detail: Some(reason.to_string()),
    }
}
