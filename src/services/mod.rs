pub mod admission;
pub mod dedup;
pub mod sync;
pub mod transfer;

pub use admission::{
    AdmissionGate, AdmissionHook, AdmissionOutcome, AdmissionPolicy, AdmissionResult,
    FailureReason, FixedPolicy, RejectReason, Resolution, Triage, COLLISION_THRESHOLD,
};
pub use dedup::{deduplicate, DedupReport};
pub use sync::{
    LocalPlan, PullOutcome, StagingFailure, SyncAbort, SyncEngine, SyncOptions, SyncPhase,
    SyncProgress, SyncProgressCallback, SyncReport,
};
pub use transfer::{LocalMirror, MirrorStats, Transfer, TransferError};
