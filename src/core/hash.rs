use image::{DynamicImage, ImageReader};
use image_hasher::{HashAlg, HasherConfig};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize)]
#[error("cannot decode {}: {reason}", path.display())]
pub struct DecodeError {
    pub path: PathBuf,
    pub reason: String,
}

impl DecodeError {
    fn new(path: &Path, reason: impl fmt::Display) -> Self {
        Self {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// 64-bit perceptual fingerprint of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Hamming distance between the two bit patterns.
    pub const fn distance(self, other: Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// SQLite has no unsigned 64-bit integer, so the bits are stored as `i64`.
    pub const fn to_sql(self) -> i64 {
        self.0 as i64
    }

    pub const fn from_sql(raw: i64) -> Self {
        Self(raw as u64)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

pub fn distance(a: Fingerprint, b: Fingerprint) -> u32 {
    a.distance(b)
}

/// Computes DCT mean hashes (the pHash construction) over an 8x8 grid.
pub struct Hasher {
    inner: image_hasher::Hasher,
}

impl Hasher {
    pub fn new() -> Self {
        let inner = HasherConfig::new()
            .hash_size(8, 8)
            .preproc_dct()
            .hash_alg(HashAlg::Mean)
            .to_hasher();
        Self { inner }
    }

    pub fn fingerprint(&self, path: &Path) -> Result<Fingerprint, DecodeError> {
        let image = ImageReader::open(path)
            .map_err(|e| DecodeError::new(path, e))?
            .with_guessed_format()
            .map_err(|e| DecodeError::new(path, e))?
            .decode()
            .map_err(|e| DecodeError::new(path, e))?;
        Ok(self.fingerprint_image(&image))
    }

    pub fn fingerprint_image(&self, image: &DynamicImage) -> Fingerprint {
        let hash = self.inner.hash_image(image);
        let bits = hash
            .as_bytes()
            .iter()
            .take(8)
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        Fingerprint(bits)
    }

    /// Fingerprint many files in parallel. Results keep the input order and
    /// a failure only affects its own entry.
    pub fn fingerprint_batch(
        &self,
        paths: &[PathBuf],
    ) -> Vec<(PathBuf, Result<Fingerprint, DecodeError>)> {
        paths
            .par_iter()
            .map(|path| (path.clone(), self.fingerprint(path)))
            .collect()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
