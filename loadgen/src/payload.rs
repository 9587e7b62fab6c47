//! Deterministic test payloads and their checksums.
//!
//! A run transfers the same [`Payload`] for every request, unless objects are asked to be
//! unique. Generating multi-megabyte buffers per request would dominate the benchmark, so the
//! [`PayloadSource`] builds its payload once and hands out the cached instance afterwards.

use std::fmt;
use std::sync::OnceLock;

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;

use crate::error::{Error, Result};

/// Seed used for payload contents unless a source is created with an explicit seed.
const DEFAULT_SEED: u64 = 0x6c6f_6164_6765_6e00;

/// Hex-encoded MD5 digest of a payload.
///
/// This is what S3-compatible servers return as `ETag` for objects uploaded in a single part.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct Checksum(String);

impl Checksum {
    /// Computes the checksum of the given bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(format!("{:x}", md5::compute(data)))
    }

    /// Returns the lowercase hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for Checksum {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Immutable contents of an object together with their precomputed checksum.
///
/// Cloning is cheap, the underlying buffer is reference counted.
#[derive(Clone)]
pub struct Payload {
    data: Bytes,
    checksum: Checksum,
}

impl Payload {
    /// Fills a buffer of `size` bytes from an RNG seeded with `seed`.
    pub fn generate(size: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut data = vec![0; size];
        rng.fill_bytes(&mut data);
        Self::from_bytes(data)
    }

    /// Creates a payload that is unique per object.
    ///
    /// The object's `index` is written big-endian into the leading bytes of an otherwise random
    /// block, so every index yields different contents and a different checksum. Payloads
    /// smaller than eight bytes carry only the low-order bytes of the index.
    pub fn unique(index: u64, size: usize) -> Self {
        let mut rng = SmallRng::seed_from_u64(DEFAULT_SEED);
        let mut data = vec![0; size];
        rng.fill_bytes(&mut data);

        let prefix = index.to_be_bytes();
        let len = prefix.len().min(size);
        data[..len].copy_from_slice(&prefix[prefix.len() - len..]);

        Self::from_bytes(data)
    }

    /// Wraps existing contents and computes their checksum.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let checksum = Checksum::of(&data);
        Self { data, checksum }
    }

    /// The raw contents.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The checksum of [`data`](Self::data).
    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    /// Length of the payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("len", &self.data.len())
            .field("checksum", &self.checksum)
            .finish()
    }
}

/// Creates the payload of a run exactly once.
///
/// The source is owned by whoever drives the run and passed down explicitly. It is not a
/// process-wide singleton.
#[derive(Debug)]
pub struct PayloadSource {
    seed: u64,
    cached: OnceLock<Payload>,
}

impl PayloadSource {
    /// Creates an empty source that will fill payloads from the given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            cached: OnceLock::new(),
        }
    }

    /// Returns the payload of `size` bytes, generating it on the first call.
    ///
    /// Later calls return the very same instance. Asking for a different size than the cached
    /// payload fails with [`Error::PayloadSizeMismatch`].
    pub fn create(&self, size: usize) -> Result<&Payload> {
        let payload = self
            .cached
            .get_or_init(|| Payload::generate(size, self.seed));

        if payload.len() != size {
            return Err(Error::PayloadSizeMismatch {
                cached: payload.len(),
                requested: size,
            });
        }

        Ok(payload)
    }

    /// The checksum of the cached payload.
    ///
    /// Fails with [`Error::NotInitialized`] before [`create`](Self::create) was called.
    pub fn checksum(&self) -> Result<&Checksum> {
        self.cached
            .get()
            .map(Payload::checksum)
            .ok_or(Error::NotInitialized)
    }
}

impl Default for PayloadSource {
    fn default() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }
}
