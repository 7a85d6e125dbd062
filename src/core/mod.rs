pub mod cluster;
pub mod fields;
pub mod hash;

pub use cluster::{cluster, cluster_by, Cluster};
pub use fields::{Assignment, FieldError, FieldKind, FieldSchema, FieldSpec, FieldValue};
pub use hash::{distance, DecodeError, Fingerprint, Hasher};

/// Run `f` on a rayon pool with `workers` threads, falling back to the
/// global pool if a dedicated one cannot be built.
pub fn with_workers<R, F>(workers: usize, f: F) -> R
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    match rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
    {
        Ok(pool) => pool.install(f),
        Err(e) => {
            log::warn!("Could not build a {}-thread pool: {}", workers, e);
            f()
        }
    }
}
