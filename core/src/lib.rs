//! # Dvojník Core Library
//!
//! Core engine for Dvojník, a local-first near-duplicate photo and video
//! finder. It detects duplicate clusters across user-selected roots and
//! consolidates each cluster down to one keeper file through a
//! transactional, undoable merge.
//!
//! ## Architecture
//!
//! The engine is a modular monolith with seven components, leaves first:
//!
//! - **store** - Root enumeration, stable file ids, size/mtime tracking
//! - **extract** (+ **phash**, **meta**) - Checksums, perceptual hashes,
//!   video fingerprints, normalized metadata
//! - **buckets** - Candidate grouping by checksum, BK-tree and duration keys
//! - **score** - Per-pair signals with distances and a verdict
//! - **cluster** - Union-find over accepted pairs into duplicate groups
//! - **confidence** - Per-group confidence, rationale and keeper suggestion
//! - **merge** (+ **txlog**, **recycle**) - Transactional merge and undo
//!
//! The [`engine`] module ties the components into a pipeline behind a
//! single facade consumed by the CLI and by UIs.
//!
//! ## Core Philosophy
//!
//! - **Immutable originals** - Media bytes are never rewritten; merged
//!   metadata lands in sidecars written atomically next to the keeper
//! - **Reversible by construction** - Every merge is a logged transaction
//!   whose undo restores paths and metadata bit-for-bit
//! - **Deterministic output** - Identical inputs and configuration produce
//!   identical groups, member order and rationale across runs
//! - **Local-first** - 100% offline, no cloud uploads

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;

// Module declarations
pub mod buckets;
pub mod cluster;
pub mod confidence;
pub mod config;
pub mod engine;
pub mod extract;
pub mod merge;
pub mod meta;
pub mod phash;
pub mod recycle;
pub mod score;
pub mod store;
pub mod txlog;

// Re-export commonly used types for convenience
pub use cluster::DuplicateGroup;
pub use config::EngineConfig;
pub use engine::{Engine, ScanEvent, ScanOptions};
pub use merge::{MergePlan, Transaction, TxStatus};
pub use store::{FileRecord, MediaKind};

// ============================================================================
// Type Aliases
// ============================================================================

/// Standard result type for all Dvojník operations.
pub type Result<T> = std::result::Result<T, DvojnikError>;

/// RFC3339-formatted timestamp string.
///
/// All human-facing timestamps use ISO 8601 / RFC3339 format
/// (e.g., `2025-01-15T14:30:00Z`). Transaction-log records additionally
/// carry raw nanosecond timestamps, see [`now_nanos`].
pub type Timestamp = String;

/// Formats an `OffsetDateTime` as RFC3339.
pub fn format_rfc3339(ts: OffsetDateTime) -> Result<Timestamp> {
    ts.format(&time::format_description::well_known::Rfc3339)
        .map_err(|e| DvojnikError::Internal {
            message: format!("Failed to format timestamp: {}", e),
        })
}

/// Current UTC time as an RFC3339 string.
pub fn rfc3339_now() -> Result<Timestamp> {
    format_rfc3339(OffsetDateTime::now_utc())
}

/// Current UTC time as nanoseconds since the Unix epoch.
///
/// Truncated to 64 bits; sufficient until the year 2262.
pub fn now_nanos() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as i64
}

// ============================================================================
// Identifier Types
// ============================================================================

macro_rules! hex_id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u128);

        impl $name {
            /// Parses a 32-character lowercase hex string.
            pub fn parse(s: &str) -> Result<Self> {
                if s.len() != 32 {
                    return Err(DvojnikError::User {
                        message: format!(
                            "Invalid {}: expected 32 hex characters, got {:?}",
                            stringify!($name),
                            s
                        ),
                    });
                }
                u128::from_str_radix(s, 16)
                    .map($name)
                    .map_err(|_| DvojnikError::User {
                        message: format!("Invalid {}: {:?}", stringify!($name), s),
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:032x}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:032x})", stringify!($name), self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                $name::parse(&s).map_err(de::Error::custom)
            }
        }
    };
}

hex_id_type! {
    /// Stable 128-bit file identifier.
    ///
    /// Derived deterministically from the canonical absolute path, so
    /// re-enumeration of an unchanged root reproduces identical ids.
    FileId
}

hex_id_type! {
    /// 128-bit duplicate-group identifier, derived from the sorted member
    /// ids so that identical inputs reproduce identical group ids.
    GroupId
}

hex_id_type! {
    /// 128-bit transaction identifier.
    TxId
}

impl FileId {
    /// Derives the id for a path from the first 16 bytes of
    /// `blake3(canonical absolute path)`.
    ///
    /// The path is canonicalized when possible; a path that cannot be
    /// canonicalized (e.g. it vanished mid-scan) is hashed as given.
    pub fn from_path(path: &Path) -> FileId {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let hash = blake3::hash(canonical.to_string_lossy().as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        FileId(u128::from_be_bytes(bytes))
    }
}

impl GroupId {
    /// Derives a deterministic group id from sorted member ids.
    pub fn from_members(members: &[FileId]) -> GroupId {
        let mut sorted: Vec<FileId> = members.to_vec();
        sorted.sort();
        let mut hasher = blake3::Hasher::new();
        for id in &sorted {
            hasher.update(&id.0.to_be_bytes());
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        GroupId(u128::from_be_bytes(bytes))
    }
}

impl TxId {
    /// Allocates a fresh transaction id from the clock and a caller-held
    /// counter (the counter disambiguates transactions within one tick).
    pub fn allocate(counter: u64) -> TxId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&now_nanos().to_be_bytes());
        hasher.update(&counter.to_be_bytes());
        hasher.update(&std::process::id().to_be_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        TxId(u128::from_be_bytes(bytes))
    }
}

// ============================================================================
// Structured Error Type with Exit Codes
// ============================================================================

/// Structured error type for all Dvojník operations.
///
/// Each variant corresponds to one error kind reported across the engine
/// boundary. When serialized it produces a JSON object tagged by `kind`
/// (e.g. `{"kind":"permission_denied","path":"/photos"}`), matching the
/// kinds consumed by UIs and tests.
///
/// Exit-code mapping for the CLI:
///
/// - 1: user errors (bad arguments, unknown ids)
/// - 2: I/O-shaped errors (permission_denied, not_found, io_error,
///   quota_exceeded, cancelled)
/// - 3: data errors (corrupt_media, schema_mismatch,
///   collision_unresolvable, concurrent_modification)
/// - 4: internal errors and fatal_partial
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DvojnikError {
    /// Invalid arguments, unknown ids, bad configuration values.
    User { message: String },

    /// A path could not be accessed due to filesystem permissions.
    PermissionDenied { path: String },

    /// A referenced path or entity does not exist.
    NotFound { path: String },

    /// Any other I/O failure (disk errors, unexpected EOF, rename failure).
    #[serde(rename = "io_error")]
    Io { message: String },

    /// Media that could not be decoded or parsed.
    CorruptMedia { path: String, message: String },

    /// Persistent store or transaction log written by an incompatible
    /// schema version, with no applicable migration.
    SchemaMismatch { found: String, expected: String },

    /// Disk quota or space exhausted while writing.
    QuotaExceeded { message: String },

    /// A recycle/restore destination collision that suffixing could not
    /// resolve.
    CollisionUnresolvable { path: String },

    /// The target of an operation changed underneath it (e.g. re-executing
    /// an already-committed plan, or a file mutated since planning).
    ConcurrentModification { message: String },

    /// The operation was cancelled cooperatively.
    Cancelled,

    /// Rollback itself failed; the listed paths need manual recovery.
    /// Further merges are blocked until the transaction is resolved.
    FatalPartial { tx_id: TxId, unresolved: Vec<String> },

    /// Invariant violations and unexpected failures in Dvojník logic.
    Internal { message: String },
}

impl fmt::Display for DvojnikError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DvojnikError::User { message } => write!(f, "User error: {}", message),
            DvojnikError::PermissionDenied { path } => {
                write!(f, "Permission denied: {}", path)
            }
            DvojnikError::NotFound { path } => write!(f, "Not found: {}", path),
            DvojnikError::Io { message } => write!(f, "I/O error: {}", message),
            DvojnikError::CorruptMedia { path, message } => {
                write!(f, "Corrupt media {}: {}", path, message)
            }
            DvojnikError::SchemaMismatch { found, expected } => {
                write!(f, "Schema mismatch: found {}, expected {}", found, expected)
            }
            DvojnikError::QuotaExceeded { message } => {
                write!(f, "Quota exceeded: {}", message)
            }
            DvojnikError::CollisionUnresolvable { path } => {
                write!(f, "Unresolvable path collision: {}", path)
            }
            DvojnikError::ConcurrentModification { message } => {
                write!(f, "Concurrent modification: {}", message)
            }
            DvojnikError::Cancelled => write!(f, "Operation cancelled"),
            DvojnikError::FatalPartial { tx_id, unresolved } => write!(
                f,
                "Transaction {} left partial; paths needing manual recovery: {}",
                tx_id,
                unresolved.join(", ")
            ),
            DvojnikError::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for DvojnikError {}

impl From<std::io::Error> for DvojnikError {
    fn from(err: std::io::Error) -> Self {
        DvojnikError::from_io_with_path(None, err)
    }
}

impl From<serde_json::Error> for DvojnikError {
    fn from(err: serde_json::Error) -> Self {
        DvojnikError::Internal {
            message: format!("JSON error: {}", err),
        }
    }
}

impl From<walkdir::Error> for DvojnikError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(Path::to_path_buf);
        let io = err
            .into_io_error()
            .unwrap_or_else(|| std::io::Error::other("directory traversal error"));
        DvojnikError::from_io_with_path(path, io)
    }
}

impl DvojnikError {
    /// Classifies an I/O error while keeping the offending path.
    pub fn from_io_with_path(path: Option<PathBuf>, err: std::io::Error) -> Self {
        let path_str = path.map(|p| p.display().to_string()).unwrap_or_default();
        // ENOSPC surfaces as quota_exceeded so callers can stop retrying.
        if err.raw_os_error() == Some(28) {
            return DvojnikError::QuotaExceeded {
                message: format!("{}: {}", path_str, err),
            };
        }
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                DvojnikError::PermissionDenied { path: path_str }
            }
            std::io::ErrorKind::NotFound => DvojnikError::NotFound { path: path_str },
            _ => DvojnikError::Io {
                message: if path_str.is_empty() {
                    err.to_string()
                } else {
                    format!("{}: {}", path_str, err)
                },
            },
        }
    }

    /// Returns the CLI exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            DvojnikError::User { .. } => 1,
            DvojnikError::PermissionDenied { .. }
            | DvojnikError::NotFound { .. }
            | DvojnikError::Io { .. }
            | DvojnikError::QuotaExceeded { .. }
            | DvojnikError::Cancelled => 2,
            DvojnikError::CorruptMedia { .. }
            | DvojnikError::SchemaMismatch { .. }
            | DvojnikError::CollisionUnresolvable { .. }
            | DvojnikError::ConcurrentModification { .. } => 3,
            DvojnikError::FatalPartial { .. } | DvojnikError::Internal { .. } => 4,
        }
    }

    /// True for errors worth a bounded retry at the operation boundary.
    pub fn is_transient(&self) -> bool {
        matches!(self, DvojnikError::Io { .. })
    }
}

// ============================================================================
// Cooperative Cancellation
// ============================================================================

/// Cooperative cancellation token threaded through long-running operations.
///
/// Cancellation is observed at safe points only: between files during
/// extraction, between edges during clustering. An in-flight merge execute
/// is never interrupted past its first atomic rename; it completes or
/// rolls back.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DvojnikError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// System Signals
// ============================================================================

/// Host signals the pipeline subscribes to.
///
/// The extractor polls `memory_pressure` between files and halves its
/// effective parallelism while pressure is reported. Tests supply a stub
/// that fires deterministically.
pub trait SystemSignals: Send + Sync {
    fn memory_pressure(&self) -> bool {
        false
    }
}

/// Default signal source: never reports pressure.
#[derive(Debug, Default)]
pub struct NoSignals;

impl SystemSignals for NoSignals {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_is_stable_for_same_path() {
        let a = FileId::from_path(Path::new("/photos/IMG_0001.JPG"));
        let b = FileId::from_path(Path::new("/photos/IMG_0001.JPG"));
        assert_eq!(a, b);
        let c = FileId::from_path(Path::new("/photos/IMG_0002.JPG"));
        assert_ne!(a, c);
    }

    #[test]
    fn test_group_id_ignores_member_order() {
        let a = FileId(1);
        let b = FileId(2);
        assert_eq!(
            GroupId::from_members(&[a, b]),
            GroupId::from_members(&[b, a])
        );
    }

    #[test]
    fn test_id_hex_round_trip() {
        let id = FileId(0x00ab_cdef_0123_4567_89ab_cdef_0123_4567);
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(FileId::parse(&text).unwrap(), id);
        assert!(FileId::parse("zz").is_err());
    }

    #[test]
    fn test_error_kind_serialization() {
        let err = DvojnikError::PermissionDenied {
            path: "/photos".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"permission_denied\""));

        let err = DvojnikError::Io {
            message: "disk failure".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"io_error\""));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            DvojnikError::User {
                message: String::new()
            }
            .exit_code(),
            1
        );
        assert_eq!(
            DvojnikError::NotFound {
                path: String::new()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            DvojnikError::SchemaMismatch {
                found: "2".into(),
                expected: "1".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(
            DvojnikError::Internal {
                message: String::new()
            }
            .exit_code(),
            4
        );
    }

    #[test]
    fn test_io_error_classification() {
        let err: DvojnikError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(matches!(err, DvojnikError::NotFound { .. }));

        let err: DvojnikError =
            std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, DvojnikError::PermissionDenied { .. }));
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(DvojnikError::Cancelled)));
    }
}
