//! Content store - root enumeration and file identity.
//!
//! Walks the selected roots depth-first, assigns stable 128-bit file ids,
//! and tracks size/mtime so changed files drop their cached signatures.
//! Enumeration is streaming and restartable: consumers pull records
//! through a bounded channel, and re-enumerating unchanged roots yields
//! identical records in identical order (entries are sorted
//! lexicographically within each directory).
//!
//! Failure semantics: an unreadable directory emits a [`ScanError`] and
//! traversal continues; an unreadable file is emitted as a record with
//! `incomplete = true`.

use crate::extract::SignatureBundle;
use crate::{CancelToken, DvojnikError, EngineConfig, FileId, Result};
use crossbeam_channel::Sender;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use walkdir::WalkDir;

// ============================================================================
// Constants
// ============================================================================

/// Photo extensions (lowercase).
///
/// JPEG variants, PNG, HEIC/HEIF, common RAW formats, TIFF and WebP.
const PHOTO_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "heic", "heif", "raw", "cr2", "cr3", "nef", "arw", "dng", "orf",
    "rw2", "raf", "tiff", "tif", "webp",
];

/// Video extensions (lowercase).
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "avi", "mkv", "webm", "mts", "3gp"];

/// Sidecar extensions: auxiliary metadata files riding next to a primary.
const SIDECAR_EXTENSIONS: &[&str] = &["xmp", "json"];

// ============================================================================
// Public Types
// ============================================================================

/// Media classification derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Sidecar,
    Other,
}

impl MediaKind {
    pub fn from_path(path: &Path) -> MediaKind {
        let Some(ext) = path.extension() else {
            return MediaKind::Other;
        };
        let ext = ext.to_string_lossy().to_lowercase();
        if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Photo
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Video
        } else if SIDECAR_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Sidecar
        } else {
            MediaKind::Other
        }
    }

    /// RAW photo formats are never rewritten; merges target an XMP
    /// sidecar instead.
    pub fn is_raw(path: &Path) -> bool {
        matches!(
            path.extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .as_deref(),
            Some("raw" | "cr2" | "cr3" | "nef" | "arw" | "dng" | "orf" | "rw2" | "raf")
        )
    }
}

/// One discovered file.
///
/// Created at enumeration, updated when signature extraction completes,
/// destroyed only when its root is deselected or the file disappears on
/// re-enumeration. Owned exclusively by the [`ContentStore`]; all other
/// components refer to it by `file_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: FileId,
    pub path: PathBuf,
    pub size: u64,
    /// Modification time, nanoseconds since epoch (nanosecond resolution
    /// where the filesystem provides it).
    pub mtime_ns: i64,
    pub kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signatures: Option<SignatureBundle>,
    /// Set when enumeration or extraction partially failed for this file.
    #[serde(default)]
    pub incomplete: bool,
}

impl FileRecord {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Non-fatal enumeration failure, reported as an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanError {
    pub path: String,
    pub kind: ScanErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanErrorKind {
    PermissionDenied,
    NotFound,
    IoError,
}

impl ScanError {
    pub fn new(path: &Path, err: &DvojnikError) -> ScanError {
        let kind = match err {
            DvojnikError::PermissionDenied { .. } => ScanErrorKind::PermissionDenied,
            DvojnikError::NotFound { .. } => ScanErrorKind::NotFound,
            _ => ScanErrorKind::IoError,
        };
        ScanError {
            path: path.display().to_string(),
            kind,
            message: err.to_string(),
        }
    }
}

/// Item pushed through the enumeration channel.
#[derive(Debug, Clone)]
pub enum EnumEvent {
    Record(FileRecord),
    Error(ScanError),
}

// ============================================================================
// Root Handles
// ============================================================================

/// Opaque handle to a scan root.
///
/// Acquisition and release of platform permission scopes (e.g.
/// security-scoped bookmarks) are the caller's responsibility; the core
/// only sees a path it can open for the duration of a [`RootAccess`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootHandle {
    path: PathBuf,
}

impl RootHandle {
    pub fn new(path: impl Into<PathBuf>) -> RootHandle {
        RootHandle { path: path.into() }
    }

    /// Opens the root for enumeration. Released when the returned access
    /// token drops, on all exit paths.
    pub fn open(&self) -> Result<RootAccess<'_>> {
        let metadata = fs::metadata(&self.path)
            .map_err(|e| DvojnikError::from_io_with_path(Some(self.path.clone()), e))?;
        if !metadata.is_dir() {
            return Err(DvojnikError::User {
                message: format!("Scan root is not a directory: {}", self.path.display()),
            });
        }
        log::debug!("opened root {}", self.path.display());
        Ok(RootAccess { handle: self })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Scoped access to an open root.
pub struct RootAccess<'a> {
    handle: &'a RootHandle,
}

impl RootAccess<'_> {
    pub fn path(&self) -> &Path {
        &self.handle.path
    }
}

impl Drop for RootAccess<'_> {
    fn drop(&mut self) {
        log::debug!("released root {}", self.handle.path.display());
    }
}

// ============================================================================
// Content Store
// ============================================================================

/// Exclusive owner of all [`FileRecord`]s.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ContentStore {
    records: BTreeMap<FileId, FileRecord>,
    #[serde(skip)]
    by_path: HashMap<PathBuf, FileId>,
}

impl ContentStore {
    pub fn new() -> ContentStore {
        ContentStore::default()
    }

    /// Rebuilds the path index after deserialization.
    pub fn reindex(&mut self) {
        self.by_path = self
            .records
            .values()
            .map(|r| (r.path.clone(), r.file_id))
            .collect();
    }

    /// Inserts or refreshes a record.
    ///
    /// A previously-seen path reappearing with a different size or mtime
    /// drops its cached signatures.
    pub fn upsert(&mut self, record: FileRecord) -> FileId {
        let id = record.file_id;
        match self.records.get_mut(&id) {
            Some(existing) if existing.size == record.size && existing.mtime_ns == record.mtime_ns => {
                existing.incomplete = record.incomplete;
            }
            Some(existing) => {
                log::debug!(
                    "file changed, invalidating signatures: {}",
                    record.path.display()
                );
                *existing = record;
            }
            None => {
                self.by_path.insert(record.path.clone(), id);
                self.records.insert(id, record);
            }
        }
        id
    }

    pub fn lookup(&self, file_id: FileId) -> Option<&FileRecord> {
        self.records.get(&file_id)
    }

    pub fn lookup_by_path(&self, path: &Path) -> Option<&FileRecord> {
        self.by_path.get(path).and_then(|id| self.records.get(id))
    }

    /// Folds metadata parsed from a sidecar file into its primary
    /// record, filling only fields the primary does not populate itself.
    pub fn absorb_sidecar_meta(&mut self, primary: &Path, meta: &crate::meta::MediaMeta) {
        let Some(id) = self.by_path.get(primary).copied() else {
            return;
        };
        if let Some(bundle) = self
            .records
            .get_mut(&id)
            .and_then(|r| r.signatures.as_mut())
        {
            match bundle.meta.as_mut() {
                Some(existing) => existing.absorb_sidecar(meta),
                None => bundle.meta = Some(meta.clone()),
            }
        }
    }

    /// Drops cached signatures for a file (e.g. after external mutation).
    pub fn invalidate(&mut self, file_id: FileId) {
        if let Some(record) = self.records.get_mut(&file_id) {
            record.signatures = None;
        }
    }

    /// Attaches a completed signature bundle.
    pub fn set_signatures(&mut self, file_id: FileId, bundle: SignatureBundle, incomplete: bool) {
        if let Some(record) = self.records.get_mut(&file_id) {
            record.signatures = Some(bundle);
            record.incomplete = record.incomplete || incomplete;
        }
    }

    /// Drops records under the given roots that this enumeration pass did
    /// not see again; records under unscanned roots are untouched.
    pub fn prune_missing_under(
        &mut self,
        roots: &[PathBuf],
        seen: &std::collections::HashSet<FileId>,
    ) {
        let by_path = &mut self.by_path;
        self.records.retain(|id, r| {
            let under_root = roots.iter().any(|root| r.path.starts_with(root));
            let keep = !under_root || seen.contains(id);
            if !keep {
                by_path.remove(&r.path);
            }
            keep
        });
    }

    /// Removes records whose paths disappeared, keeping only `seen`.
    pub fn retain_seen(&mut self, seen: &std::collections::HashSet<FileId>) {
        let by_path = &mut self.by_path;
        self.records.retain(|id, r| {
            let keep = seen.contains(id);
            if !keep {
                by_path.remove(&r.path);
            }
            keep
        });
    }

    /// Records in deterministic (id) order.
    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ============================================================================
// Enumeration
// ============================================================================

/// Summary counters returned when an enumeration pass finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumStats {
    pub discovered: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Streams records for the given roots into `sender`.
///
/// Depth-first per root, lexicographic within each directory, hidden
/// entries skipped unless configured otherwise, symlinks never followed
/// (which also breaks symlink cycles). The bounded `sender` applies
/// backpressure: enumeration suspends while the extraction queue is full.
///
/// # Errors
///
/// Returns an error only for unusable roots or cancellation; per-entry
/// failures are reported as [`EnumEvent::Error`] and traversal continues.
pub fn enumerate(
    roots: &[RootHandle],
    config: &EngineConfig,
    cancel: &CancelToken,
    sender: &Sender<EnumEvent>,
) -> Result<EnumStats> {
    let ignore = build_glob_matcher(&config.ignore_globs)?;
    let mut stats = EnumStats::default();

    for root in roots {
        let access = root.open()?;
        walk_root(access.path(), config, &ignore, cancel, sender, &mut stats)?;
    }
    Ok(stats)
}

fn walk_root(
    root: &Path,
    config: &EngineConfig,
    ignore: &GlobSet,
    cancel: &CancelToken,
    sender: &Sender<EnumEvent>,
    stats: &mut EnumStats,
) -> Result<()> {
    let include_hidden = config.include_hidden;
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            // The root itself is always entered, even when hidden.
            if entry.depth() == 0 {
                return true;
            }
            include_hidden || !is_hidden(entry.file_name())
        });

    for entry in walker {
        cancel.check()?;
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf());
                let err = DvojnikError::from(e);
                stats.errors += 1;
                send(sender, EnumEvent::Error(ScanError::new(&path, &err)))?;
                continue;
            }
        };

        if entry.path_is_symlink() || !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if ignore.is_match(path) {
            stats.skipped += 1;
            continue;
        }

        let record = match read_record(path) {
            Ok(record) => record,
            Err(err) => {
                // Unreadable file: still surfaced, flagged incomplete.
                stats.errors += 1;
                send(sender, EnumEvent::Error(ScanError::new(path, &err)))?;
                FileRecord {
                    file_id: FileId::from_path(path),
                    path: path.to_path_buf(),
                    size: 0,
                    mtime_ns: 0,
                    kind: MediaKind::from_path(path),
                    signatures: None,
                    incomplete: true,
                }
            }
        };
        stats.discovered += 1;
        send(sender, EnumEvent::Record(record))?;
    }
    Ok(())
}

fn send(sender: &Sender<EnumEvent>, event: EnumEvent) -> Result<()> {
    sender.send(event).map_err(|_| DvojnikError::Cancelled)
}

/// Builds one record from filesystem metadata.
pub fn read_record(path: &Path) -> Result<FileRecord> {
    let metadata = fs::metadata(path)
        .map_err(|e| DvojnikError::from_io_with_path(Some(path.to_path_buf()), e))?;
    let mtime_ns = metadata
        .modified()
        .map(|t| OffsetDateTime::from(t).unix_timestamp_nanos() as i64)
        .unwrap_or(0);
    Ok(FileRecord {
        file_id: FileId::from_path(path),
        path: path.to_path_buf(),
        size: metadata.len(),
        mtime_ns,
        kind: MediaKind::from_path(path),
        signatures: None,
        incomplete: false,
    })
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Primary media path a sidecar file belongs to: `IMG_1.JPG.xmp` and
/// `IMG_1.JPG.json` both attach to `IMG_1.JPG`; `IMG_1.xmp` attaches to
/// any sibling named `IMG_1.*` (resolved by the caller).
pub fn sidecar_primary_path(path: &Path) -> Option<PathBuf> {
    if MediaKind::from_path(path) != MediaKind::Sidecar {
        return None;
    }
    let stem = path.file_stem()?;
    let candidate = path.with_file_name(stem);
    if candidate.extension().is_some() {
        Some(candidate)
    } else {
        None
    }
}

fn build_glob_matcher(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => {
                return Err(DvojnikError::User {
                    message: format!("Invalid glob pattern '{}': {}", pattern, e),
                });
            }
        }
    }
    builder.build().map_err(|e| DvojnikError::Internal {
        message: format!("Failed to build glob matcher: {}", e),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    fn collect(roots: &[RootHandle], config: &EngineConfig) -> (Vec<FileRecord>, Vec<ScanError>) {
        let (tx, rx) = unbounded();
        enumerate(roots, config, &CancelToken::new(), &tx).unwrap();
        drop(tx);
        let mut records = Vec::new();
        let mut errors = Vec::new();
        for event in rx {
            match event {
                EnumEvent::Record(r) => records.push(r),
                EnumEvent::Error(e) => errors.push(e),
            }
        }
        (records, errors)
    }

    #[test]
    fn test_media_kind_from_extension() {
        assert_eq!(MediaKind::from_path(Path::new("a.JPG")), MediaKind::Photo);
        assert_eq!(MediaKind::from_path(Path::new("a.nef")), MediaKind::Photo);
        assert_eq!(MediaKind::from_path(Path::new("a.mp4")), MediaKind::Video);
        assert_eq!(MediaKind::from_path(Path::new("a.xmp")), MediaKind::Sidecar);
        assert_eq!(MediaKind::from_path(Path::new("a.txt")), MediaKind::Other);
        assert_eq!(MediaKind::from_path(Path::new("noext")), MediaKind::Other);
        assert!(MediaKind::is_raw(Path::new("a.NEF")));
        assert!(!MediaKind::is_raw(Path::new("a.jpg")));
    }

    #[test]
    fn test_enumeration_is_sorted_and_deterministic() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "b.jpg", b"b");
        touch(dir.path(), "a.jpg", b"a");
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        touch(&sub, "c.jpg", b"c");

        let roots = [RootHandle::new(dir.path())];
        let config = EngineConfig::default();
        let (first, _) = collect(&roots, &config);
        let (second, _) = collect(&roots, &config);

        let names: Vec<String> = first.iter().map(|r| r.file_name()).collect();
        assert_eq!(names, vec!["a.jpg", "b.jpg", "c.jpg"]);
        let second_names: Vec<String> = second.iter().map(|r| r.file_name()).collect();
        assert_eq!(names, second_names);
        let ids: Vec<FileId> = first.iter().map(|r| r.file_id).collect();
        let second_ids: Vec<FileId> = second.iter().map(|r| r.file_id).collect();
        assert_eq!(ids, second_ids);
    }

    #[test]
    fn test_hidden_files_skipped_by_default() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "seen.jpg", b"x");
        touch(dir.path(), ".hidden.jpg", b"x");
        let hidden_dir = dir.path().join(".cache");
        fs::create_dir(&hidden_dir).unwrap();
        touch(&hidden_dir, "inside.jpg", b"x");

        let roots = [RootHandle::new(dir.path())];
        let (records, _) = collect(&roots, &EngineConfig::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_name(), "seen.jpg");

        let mut config = EngineConfig::default();
        config.include_hidden = true;
        let (records, _) = collect(&roots, &config);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_ignore_globs() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "keep.jpg", b"x");
        let skip = dir.path().join("skipme");
        fs::create_dir(&skip).unwrap();
        touch(&skip, "drop.jpg", b"x");

        let mut config = EngineConfig::default();
        config.ignore_globs = vec!["**/skipme/**".to_string()];
        let roots = [RootHandle::new(dir.path())];
        let (records, _) = collect(&roots, &config);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_name(), "keep.jpg");
    }

    #[test]
    fn test_invalid_glob_is_user_error() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.ignore_globs = vec!["[broken".to_string()];
        let (tx, _rx) = unbounded();
        let err = enumerate(
            &[RootHandle::new(dir.path())],
            &config,
            &CancelToken::new(),
            &tx,
        )
        .unwrap_err();
        assert!(matches!(err, DvojnikError::User { .. }));
    }

    #[test]
    fn test_missing_root_fails_open() {
        let handle = RootHandle::new("/definitely/not/here");
        assert!(handle.open().is_err());
    }

    #[test]
    fn test_upsert_invalidates_on_change() {
        let dir = TempDir::new().unwrap();
        let path = touch(dir.path(), "a.jpg", b"first");
        let mut store = ContentStore::new();

        let mut record = read_record(&path).unwrap();
        record.signatures = Some(SignatureBundle::checksum_only("00".repeat(32)));
        let id = record.file_id;
        store.upsert(record.clone());
        assert!(store.lookup(id).unwrap().signatures.is_some());

        // Same size/mtime: signatures survive.
        let again = read_record(&path).unwrap();
        store.upsert(again);
        assert!(store.lookup(id).unwrap().signatures.is_some());

        // Changed size: signatures dropped.
        let mut changed = read_record(&path).unwrap();
        changed.size += 10;
        changed.mtime_ns += 1;
        store.upsert(changed);
        assert!(store.lookup(id).unwrap().signatures.is_none());
    }

    #[test]
    fn test_retain_seen_drops_vanished() {
        let dir = TempDir::new().unwrap();
        let a = touch(dir.path(), "a.jpg", b"a");
        let b = touch(dir.path(), "b.jpg", b"b");
        let mut store = ContentStore::new();
        let id_a = store.upsert(read_record(&a).unwrap());
        let id_b = store.upsert(read_record(&b).unwrap());

        let seen = std::collections::HashSet::from([id_a]);
        store.retain_seen(&seen);
        assert!(store.lookup(id_a).is_some());
        assert!(store.lookup(id_b).is_none());
        assert!(store.lookup_by_path(&b).is_none());
    }

    #[test]
    fn test_sidecar_primary_path() {
        assert_eq!(
            sidecar_primary_path(Path::new("/p/IMG_1.JPG.xmp")),
            Some(PathBuf::from("/p/IMG_1.JPG"))
        );
        assert_eq!(
            sidecar_primary_path(Path::new("/p/IMG_1.JPG.json")),
            Some(PathBuf::from("/p/IMG_1.JPG"))
        );
        // Bare stem has no recoverable primary extension.
        assert_eq!(sidecar_primary_path(Path::new("/p/IMG_1.xmp")), None);
        assert_eq!(sidecar_primary_path(Path::new("/p/IMG_1.jpg")), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directory_emits_scan_error() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "ok.jpg", b"x");
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        touch(&locked, "secret.jpg", b"x");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let roots = [RootHandle::new(dir.path())];
        let (records, errors) = collect(&roots, &EngineConfig::default());

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        // Traversal continued past the unreadable directory.
        assert!(records.iter().any(|r| r.file_name() == "ok.jpg"));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ScanErrorKind::PermissionDenied);
    }
}
