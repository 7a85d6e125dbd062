use indicatif::ProgressBar;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::core::fields::FieldSchema;
use crate::core::hash::{DecodeError, Fingerprint};
use crate::core::with_workers;
use crate::database::models::{ItemId, TweakSnapshot};
use crate::database::open_index_read_only;
use crate::database::repositories::ItemRepository;
use crate::error::{Error, Result};
use crate::services::admission::{
    AdmissionGate, AdmissionHook, AdmissionOutcome, AdmissionPolicy, FailureReason, RejectReason,
};
use crate::services::transfer::{MirrorStats, Transfer, TransferError};
use crate::store::{remove_if_exists, ConsistencyError, Store, StoreLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    LocalReconcile,
    Pull,
    MergeReconcile,
    Staging,
    Push,
    Done,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::LocalReconcile => "local reconciliation",
            SyncPhase::Pull => "pull",
            SyncPhase::MergeReconcile => "merge reconciliation",
            SyncPhase::Staging => "staging",
            SyncPhase::Push => "push",
            SyncPhase::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub pull: bool,
    pub push: bool,
    pub stage: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            pull: true,
            push: true,
            stage: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StagingFailure {
    pub path: PathBuf,
    pub reason: FailureReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Summary of one sync pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub completed: Vec<SyncPhase>,
    /// Rows removed because their content file disappeared.
    pub deleted: usize,
    /// Unindexed content files moved back to staging.
    pub restaged: usize,
    pub pulled: Option<MirrorStats>,
    /// Never-pushed items moved back to staging ahead of a pull.
    pub rescued: usize,
    pub pushed: Option<MirrorStats>,
    pub tweaks_restored: usize,
    pub staged: usize,
    pub replaced: usize,
    pub failed: Vec<StagingFailure>,
    pub left: usize,
    pub decode_errors: Vec<DecodeError>,
    pub conflicts: Vec<ConsistencyError>,
    pub cancelled: bool,
}

/// A phase failed. Phases listed in `report.completed` have been committed.
#[derive(Debug, Error)]
#[error("Sync aborted during {phase}: {source}")]
pub struct SyncAbort {
    pub phase: SyncPhase,
    pub report: Box<SyncReport>,
    #[source]
    pub source: Error,
}

/// Outcome of local reconciliation, consumed by the merge phase.
#[derive(Debug, Clone, Default)]
pub struct LocalPlan {
    /// Rows whose content file is gone, deleted after the pull.
    pub delete_ids: Vec<ItemId>,
    /// Where unindexed content files ended up in staging.
    pub restaged: Vec<PathBuf>,
    pub conflicts: Vec<ConsistencyError>,
    pub snapshot: Vec<TweakSnapshot>,
    /// An earlier pull stopped half way; contents were not classified.
    pub pull_pending: bool,
}

/// What a pull changed locally.
#[derive(Debug, Clone, Default)]
pub struct PullOutcome {
    pub stats: MirrorStats,
    /// Content files of never-pushed items, moved to staging beforehand.
    pub rescued: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub processed: usize,
    pub total: usize,
    pub current_file: Option<String>,
}

/// Receives progress updates during a sync.
pub trait SyncProgressCallback {
    fn progress(&mut self, progress: SyncProgress);
}

impl<F: FnMut(SyncProgress)> SyncProgressCallback for F {
    fn progress(&mut self, progress: SyncProgress) {
        self(progress);
    }
}

impl SyncProgressCallback for () {
    fn progress(&mut self, _progress: SyncProgress) {}
}

impl SyncProgressCallback for ProgressBar {
    fn progress(&mut self, progress: SyncProgress) {
        self.set_length(progress.total as u64);
        self.set_position(progress.processed as u64);
        match &progress.current_file {
            Some(file) => self.set_message(format!("{}: {}", progress.phase, file)),
            None => self.set_message(progress.phase.to_string()),
        }
    }
}

/// Reconciles a store with its remote replica and admits staged files.
pub struct SyncEngine<T: Transfer> {
    transfer: T,
    gate: AdmissionGate,
    cancel: Arc<AtomicBool>,
}

impl<T: Transfer> SyncEngine<T> {
    pub fn new(transfer: T) -> Self {
        Self {
            transfer,
            gate: AdmissionGate::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Token that stops staging before the next file when set.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Make the contents directory authoritative: unindexed files go back to
    /// staging, rows without a file are scheduled for deletion, and the tweak
    /// state of every row is captured before a pull can overwrite it.
    ///
    /// After an interrupted pull the contents directory is a mix of local and
    /// remote files, so nothing is classified until the pull has been redone.
    pub fn reconcile_local(&self, store: &mut Store) -> Result<LocalPlan> {
        if store.layout().pull_marker().exists() {
            log::warn!(
                "Previous pull into {} did not finish, leaving contents alone until it is retried",
                store.name()
            );
            return Ok(LocalPlan {
                pull_pending: true,
                snapshot: store.items()?.tweak_snapshot()?,
                ..Default::default()
            });
        }

        let scan = store.scan()?;
        for conflict in &scan.conflicts {
            log::warn!("{}", conflict);
        }
        for path in &scan.partial {
            log::info!("Removing partial transfer {}", path.display());
            remove_if_exists(path)?;
        }

        let mut restaged = Vec::with_capacity(scan.unindexed.len());
        for path in &scan.unindexed {
            restaged.push(store.move_to_staging(path)?);
        }

        if !scan.missing_on_disk.is_empty() {
            log::info!(
                "{} items missing on disk, scheduled for deletion: {:?}",
                scan.missing_on_disk.len(),
                scan.missing_on_disk
            );
        }

        Ok(LocalPlan {
            delete_ids: scan.missing_on_disk,
            restaged,
            conflicts: scan.conflicts,
            snapshot: store.items()?.tweak_snapshot()?,
            pull_pending: false,
        })
    }

    /// Replace local contents and index (and config, when shared) with the
    /// remote's. `None` when no remote is configured or it is still empty.
    ///
    /// The remote index is first copied next to the local one. Items the
    /// remote has never seen are moved back to staging, then the contents
    /// are mirrored and only then does the copied index replace the local
    /// one. A marker file covers the window in which the two disagree.
    pub fn pull(&self, store: &mut Store) -> Result<Option<PullOutcome>> {
        let Some(remote) = store.config().remote().map(StoreLayout::new) else {
            return Ok(None);
        };
        if !remote.root().exists() {
            return Err(TransferError::MissingSource(remote.root().to_path_buf()).into());
        }
        if !remote.index().exists() {
            log::warn!(
                "Remote {} has no index yet, nothing to pull",
                remote.root().display()
            );
            return Ok(None);
        }

        let local = store.layout().clone();
        let sync_config = store.config().sync_config();

        log::info!("Pulling from {}", remote.root().display());
        self.transfer
            .mirror(&remote.index(), &local.incoming_index(), false)?;
        let marker = local.pull_marker();
        fs::write(&marker, std::process::id().to_string())
            .map_err(|e| Error::io(&marker, e))?;

        let rescued = self.rescue_unpushed(store)?;
        store.close_index()?;

        let stats = self
            .transfer
            .mirror(&remote.contents(), &local.contents(), true)?;
        fs::rename(local.incoming_index(), local.index())
            .map_err(|e| Error::io(local.index(), e))?;
        if sync_config {
            self.transfer
                .mirror(&remote.config(), &local.config(), false)?;
            store.reload_config()?;
        }
        remove_if_exists(&marker)?;

        Ok(Some(PullOutcome { stats, rescued }))
    }

    /// Move content files of items the incoming index does not know into
    /// staging, so the contents mirror cannot delete or overwrite them.
    ///
    /// An item is unknown when the remote holds a different image under its
    /// id, or when its id is beyond anything the remote ever assigned. Ids
    /// the remote assigned and later deleted are remote deletions and are
    /// left to the mirror.
    fn rescue_unpushed(&self, store: &mut Store) -> Result<Vec<PathBuf>> {
        let (remote, last_remote_id) = {
            let conn = open_index_read_only(&store.layout().incoming_index())?;
            let schema = FieldSchema::default();
            let repo = ItemRepository::new(&conn, &schema);
            let remote: HashMap<ItemId, Fingerprint> = repo.fingerprints()?.into_iter().collect();
            (remote, repo.last_assigned_id()?)
        };

        let mut rescued = Vec::new();
        for item in store.list()? {
            let path = store.item_path(&item);
            if !path.is_file() {
                continue;
            }
            let unpushed = match remote.get(&item.id) {
                Some(fingerprint) => *fingerprint != item.fingerprint,
                None => item.id > last_remote_id,
            };
            if unpushed {
                log::warn!(
                    "Item {} never reached the remote, moving it back to staging",
                    item.id
                );
                rescued.push(store.move_to_staging(&path)?);
            }
        }
        Ok(rescued)
    }

    /// Apply the local plan to the freshly pulled index. Returns the number of
    /// rows deleted and the number of tweak flags restored.
    pub fn merge(&self, store: &mut Store, plan: &LocalPlan) -> Result<(usize, usize)> {
        let doomed = store.items()?.find_by_ids(&plan.delete_ids)?;
        let doomed_paths: Vec<PathBuf> = doomed.iter().map(|item| store.item_path(item)).collect();

        let (conn, schema) = store.index_parts()?;
        let tx = conn.transaction()?;
        let (deleted, restored) = {
            let repo = ItemRepository::new(&tx, schema);
            let deleted = repo.delete(&plan.delete_ids)?;

            let pulled: HashMap<ItemId, TweakSnapshot> = repo
                .tweak_snapshot()?
                .into_iter()
                .map(|snapshot| (snapshot.id, snapshot))
                .collect();

            let mut restored = 0;
            for local in &plan.snapshot {
                let Some(remote) = pulled.get(&local.id) else {
                    continue;
                };
                if local.updated_at > remote.updated_at {
                    if local.tweak != remote.tweak {
                        log::debug!(
                            "Keeping local tweak={} for item {} (local edit is newer)",
                            local.tweak,
                            local.id
                        );
                    }
                    repo.set_tweak(local.id, local.tweak, local.updated_at)?;
                    restored += 1;
                }
            }
            (deleted, restored)
        };
        tx.commit()?;

        for path in doomed_paths {
            if let Err(e) = remove_if_exists(&path) {
                log::warn!("Could not remove {}: {}", path.display(), e);
            }
        }

        Ok((deleted, restored))
    }

    /// Run every staged file through the admission gate. Per-file problems
    /// land in `report`; only store-level failures are returned.
    pub fn stage<P, H, C>(
        &self,
        store: &mut Store,
        policy: &mut P,
        hook: &mut H,
        progress: &mut C,
        report: &mut SyncReport,
    ) -> Result<()>
    where
        P: AdmissionPolicy + ?Sized,
        H: AdmissionHook + ?Sized,
        C: SyncProgressCallback + ?Sized,
    {
        let files = store.staged_files()?;
        if files.is_empty() {
            return Ok(());
        }
        let total = files.len();
        log::info!("Fingerprinting {} staged files", total);

        let hasher = self.gate.hasher();
        let fingerprints = with_workers(store.config().worker_count(), || {
            hasher.fingerprint_batch(&files)
        });

        for (processed, (path, fingerprint)) in fingerprints.into_iter().enumerate() {
            if self.is_cancelled() {
                log::info!("Staging cancelled with {} files left", total - processed);
                report.cancelled = true;
                break;
            }
            progress.progress(SyncProgress {
                phase: SyncPhase::Staging,
                processed,
                total,
                current_file: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            });

            let fingerprint = match fingerprint {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    log::warn!("{}", e);
                    hook.rejected(&path, &RejectReason::Undecodable(e.reason.clone()));
                    report.decode_errors.push(e);
                    continue;
                }
            };

            match self
                .gate
                .admit_with(store, &path, fingerprint, policy, hook)
            {
                Ok(AdmissionOutcome::Admitted { replaced, .. }) => {
                    report.staged += 1;
                    report.replaced += replaced.len();
                }
                Ok(AdmissionOutcome::Failed {
                    path,
                    reason,
                    detail,
                }) => report.failed.push(StagingFailure {
                    path,
                    reason,
                    detail,
                }),
                Ok(AdmissionOutcome::Left { .. }) => report.left += 1,
                Err(e) if e.is_item_local() => {
                    log::warn!("Could not admit {}: {}", path.display(), e);
                    if let Error::Consistency(conflict) = &e {
                        report.conflicts.push(conflict.clone());
                    }
                    report.failed.push(StagingFailure {
                        path,
                        reason: FailureReason::Rejected,
                        detail: Some(e.to_string()),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        progress.progress(SyncProgress {
            phase: SyncPhase::Staging,
            processed: total,
            total,
            current_file: None,
        });
        Ok(())
    }

    /// Replace the remote's contents and index (and config, when shared)
    /// with the local ones.
    pub fn push(&self, store: &mut Store) -> Result<Option<MirrorStats>> {
        let Some(remote) = store.config().remote().map(StoreLayout::new) else {
            return Ok(None);
        };
        let local = store.layout().clone();
        if local.pull_marker().exists() {
            return Err(TransferError::PullPending(local.root().to_path_buf()).into());
        }
        let sync_config = store.config().sync_config();
        store.close_index()?;

        log::info!("Pushing to {}", remote.root().display());
        let stats = self
            .transfer
            .mirror(&local.contents(), &remote.contents(), true)?;
        self.transfer.mirror(&local.index(), &remote.index(), false)?;
        if sync_config {
            self.transfer
                .mirror(&local.config(), &remote.config(), false)?;
        }

        Ok(Some(stats))
    }

    /// Run a full pass. The caller holds the store's [`StoreLock`].
    ///
    /// [`StoreLock`]: crate::store::StoreLock
    pub fn sync<P, H, C>(
        &self,
        store: &mut Store,
        options: SyncOptions,
        policy: &mut P,
        hook: &mut H,
        progress: &mut C,
    ) -> std::result::Result<SyncReport, SyncAbort>
    where
        P: AdmissionPolicy + ?Sized,
        H: AdmissionHook + ?Sized,
        C: SyncProgressCallback + ?Sized,
    {
        let name = store.name();
        let mut report = SyncReport::default();
        let abort = |phase: SyncPhase, report: &SyncReport, source: Error| {
            log::error!("Sync of {} aborted during {}: {}", name, phase, source);
            SyncAbort {
                phase,
                report: Box::new(report.clone()),
                source,
            }
        };
        let announce = |progress: &mut C, phase: SyncPhase| {
            log::info!("Sync phase: {}", phase);
            progress.progress(SyncProgress {
                phase,
                processed: 0,
                total: 0,
                current_file: None,
            });
        };

        announce(progress, SyncPhase::LocalReconcile);
        let plan = match self.reconcile_local(store) {
            Ok(plan) => plan,
            Err(e) => return Err(abort(SyncPhase::LocalReconcile, &report, e)),
        };
        report.restaged = plan.restaged.len();
        report.conflicts.extend(plan.conflicts.iter().cloned());
        report.completed.push(SyncPhase::LocalReconcile);

        if options.pull {
            announce(progress, SyncPhase::Pull);
            match self.pull(store) {
                Ok(outcome) => {
                    if let Some(outcome) = outcome {
                        report.rescued = outcome.rescued.len();
                        report.pulled = Some(outcome.stats);
                    }
                }
                Err(e) => return Err(abort(SyncPhase::Pull, &report, e)),
            }
            report.completed.push(SyncPhase::Pull);
        }

        announce(progress, SyncPhase::MergeReconcile);
        match self.merge(store, &plan) {
            Ok((deleted, restored)) => {
                report.deleted = deleted;
                report.tweaks_restored = restored;
            }
            Err(e) => return Err(abort(SyncPhase::MergeReconcile, &report, e)),
        }
        report.completed.push(SyncPhase::MergeReconcile);

        if options.stage {
            announce(progress, SyncPhase::Staging);
            if let Err(e) = self.stage(store, policy, hook, progress, &mut report) {
                return Err(abort(SyncPhase::Staging, &report, e));
            }
            report.completed.push(SyncPhase::Staging);
        }

        if options.push {
            announce(progress, SyncPhase::Push);
            match self.push(store) {
                Ok(stats) => report.pushed = stats,
                Err(e) => return Err(abort(SyncPhase::Push, &report, e)),
            }
            report.completed.push(SyncPhase::Push);
        }

        announce(progress, SyncPhase::Done);
        report.completed.push(SyncPhase::Done);
        log::info!(
            "Sync of {} done: {} deleted, {} restaged, {} staged, {} failed",
            name,
            report.deleted,
            report.restaged,
            report.staged,
            report.failed.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::core::hash::Fingerprint;
    use crate::database::models::NewItem;
    use crate::database::now;
    use crate::services::admission::{FixedPolicy, Resolution};
    use crate::services::transfer::LocalMirror;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_image(path: &std::path::Path) {
        use image::{ImageBuffer, Rgb};

        let img = ImageBuffer::from_fn(40, 40, |x, y| {
            let intensity = ((x * 5 + y * 2) % 256) as u8;
            Rgb([intensity, 255 - intensity, intensity / 3])
        });
        img.save(path).unwrap();
    }

    fn setup() -> (TempDir, Store) {
        let temp_dir = TempDir::new().unwrap();
        let store =
            Store::create(&temp_dir.path().join("local"), StoreConfig::default()).unwrap();
        (temp_dir, store)
    }

    fn add_item(store: &mut Store) -> ItemId {
        let item = store
            .items()
            .unwrap()
            .insert(&NewItem::new("jpg", Fingerprint::new(0)), now())
            .unwrap();
        fs::write(store.item_path(&item), b"content").unwrap();
        item.id
    }

    #[test]
    fn test_reconcile_local_restages_and_schedules() {
        let (_dir, mut store) = setup();
        let kept = add_item(&mut store);
        let lost = add_item(&mut store);
        fs::remove_file(store.layout().item_path(lost, "jpg")).unwrap();
        fs::write(store.layout().contents().join("00000007.png"), b"orphan").unwrap();

        let engine = SyncEngine::new(LocalMirror);
        let plan = engine.reconcile_local(&mut store).unwrap();

        assert_eq!(plan.delete_ids, vec![lost]);
        assert_eq!(plan.restaged, vec![store.layout().staging().join("00000007.png")]);
        assert_eq!(plan.snapshot.len(), 2);
        assert!(plan.snapshot.iter().any(|s| s.id == kept));

        let (deleted, restored) = engine.merge(&mut store, &plan).unwrap();
        assert_eq!((deleted, restored), (1, 0));
        assert!(store.scan().unwrap().is_consistent());

        // A consistent store reconciles to an empty plan.
        let plan = engine.reconcile_local(&mut store).unwrap();
        assert!(plan.delete_ids.is_empty());
        assert!(plan.restaged.is_empty());
    }

    #[test]
    fn test_ambiguous_files_are_left_alone() {
        let (_dir, mut store) = setup();
        let id = add_item(&mut store);
        let twin = store.layout().contents().join("000000001.jpg");
        fs::write(&twin, b"twin").unwrap();

        let engine = SyncEngine::new(LocalMirror);
        let mut report = engine
            .sync(
                &mut store,
                SyncOptions::default(),
                &mut FixedPolicy(Resolution::Skip),
                &mut (),
                &mut (),
            )
            .unwrap();

        assert_eq!(report.deleted, 0);
        assert_eq!(report.restaged, 0);
        assert_eq!(report.conflicts.len(), 1);
        assert!(twin.exists());
        assert!(store.layout().item_path(id, "jpg").exists());
        assert_eq!(store.list().unwrap().len(), 1);
        report.completed.retain(|p| *p != SyncPhase::Done);
        assert_eq!(report.completed.last(), Some(&SyncPhase::Push));
    }

    #[test]
    fn test_sync_without_remote_stages_files() {
        let (_dir, mut store) = setup();
        create_test_image(&store.layout().staging().join("new.png"));
        fs::write(store.layout().staging().join("broken.jpg"), b"nope").unwrap();

        let engine = SyncEngine::new(LocalMirror);
        let mut phases = Vec::new();
        let mut progress = |p: SyncProgress| phases.push(p.phase);
        let report = engine
            .sync(
                &mut store,
                SyncOptions::default(),
                &mut FixedPolicy(Resolution::Skip),
                &mut (),
                &mut progress,
            )
            .unwrap();

        assert_eq!(report.staged, 1);
        assert_eq!(report.decode_errors.len(), 1);
        assert_eq!(report.pulled, None);
        assert_eq!(report.pushed, None);
        assert_eq!(report.completed.last(), Some(&SyncPhase::Done));
        assert!(phases.contains(&SyncPhase::Staging));
        assert!(store.layout().contents().join("00000001.png").exists());
    }

    #[test]
    fn test_cancellation_stops_staging() {
        let (_dir, mut store) = setup();
        create_test_image(&store.layout().staging().join("a.png"));

        let engine = SyncEngine::new(LocalMirror);
        engine.cancel_token().store(true, Ordering::Relaxed);
        let report = engine
            .sync(
                &mut store,
                SyncOptions::default(),
                &mut FixedPolicy(Resolution::Skip),
                &mut (),
                &mut (),
            )
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.staged, 0);
        assert!(store.layout().staging().join("a.png").exists());
    }

    #[test]
    fn test_missing_remote_aborts_pull() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig {
            sync: Some(crate::config::SyncSettings {
                remote: temp_dir.path().join("unmounted"),
                sync_config: false,
            }),
            ..Default::default()
        };
        let mut store = Store::create(&temp_dir.path().join("local"), config).unwrap();
        add_item(&mut store);

        let engine = SyncEngine::new(LocalMirror);
        let abort = engine
            .sync(
                &mut store,
                SyncOptions::default(),
                &mut FixedPolicy(Resolution::Skip),
                &mut (),
                &mut (),
            )
            .unwrap_err();

        assert_eq!(abort.phase, SyncPhase::Pull);
        assert_eq!(abort.report.completed, vec![SyncPhase::LocalReconcile]);
        assert!(matches!(abort.source, Error::Transfer(_)));
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
