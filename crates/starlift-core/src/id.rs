use std::fmt;

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Live handle to an entity inside one simulation process.
    ///
    /// Handles are only meaningful to the process that issued them and are
    /// never written into a snapshot; see [`StableId`].
    pub struct EntityHandle;

    /// Live handle to the surface a platform's tiles and entities live on.
    pub struct SurfaceId;
}

/// A reference to an entity that survives serialization and reconstruction.
///
/// Either the engine's unit number (top bit clear) or an FNV-1a hash of
/// name, position, direction and orientation (top bit set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(pub u64);

impl StableId {
    /// Marks ids derived from a content hash rather than a unit number.
    pub const HASHED_BIT: u64 = 1 << 63;

    pub fn from_unit_number(unit_number: u64) -> Self {
        Self(unit_number & !Self::HASHED_BIT)
    }

    pub fn from_hash(hash: u64) -> Self {
        Self(hash | Self::HASHED_BIT)
    }

    pub fn is_hashed(self) -> bool {
        self.0 & Self::HASHED_BIT != 0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_hashed() {
            write!(f, "h{:016x}", self.0 & !Self::HASHED_BIT)
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

numeric_id!(
    /// Identifies one export artifact (a locked, scanned, encoded platform).
    ExportId(u64),
    "export-"
);
numeric_id!(
    /// Identifies one transfer attempt across two processes.
    TransferId(u64),
    "transfer-"
);
numeric_id!(
    /// Identifies a job inside one process's scheduler.
    JobId(u64),
    "job-"
);
numeric_id!(
    /// Identifies a simulation process.
    InstanceId(u32),
    "instance-"
);

// ---------------------------------------------------------------------------
// Deterministic hashing
// ---------------------------------------------------------------------------

/// FNV-1a (64-bit) hasher. Deterministic across processes and runs, which
/// `std::hash` does not guarantee. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fnv64(u64);

impl Fnv64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write(&[v]);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write(&v.to_le_bytes());
    }

    /// Feed a string followed by a separator so "ab"+"c" differs from "a"+"bc".
    pub fn write_str(&mut self, s: &str) {
        self.write(s.as_bytes());
        self.write(&[0xFF]);
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for Fnv64 {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest of an arbitrary byte payload.
pub fn digest(bytes: &[u8]) -> u64 {
    let mut h = Fnv64::new();
    h.write(bytes);
    h.finish()
}
