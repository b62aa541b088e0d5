//! Merge / undo engine.
//!
//! Plans a keeper for a duplicate group, writes merged metadata
//! atomically, moves losers to the recycle area, and records the whole
//! operation in the transaction log so it can be undone bit-for-bit.
//!
//! Originals are immutable: metadata writes land in a sidecar next to
//! the keeper - an XMP sidecar for RAW formats, a JSON sidecar for
//! everything else - via write-temp, fsync, atomic rename. The
//! transaction snapshots the prior sidecar bytes, which makes undo a
//! literal byte restore.
//!
//! Execution protocol (crash-safe): append `pending` + fsync, write the
//! sidecar atomically, move each loser to its pre-planned recycle path,
//! append `committed` + fsync. Any failure rolls the moves and the
//! sidecar back; a rollback failure marks the transaction `partial`,
//! which blocks further merges until resolved.

use crate::cluster::DuplicateGroup;
use crate::meta::{FieldValue, MediaMeta, MetaField};
use crate::recycle::{self, RecycleArea};
use crate::store::{ContentStore, FileRecord, MediaKind};
use crate::txlog::TxLog;
use crate::{now_nanos, DvojnikError, FileId, GroupId, Result, TxId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ============================================================================
// Public Types
// ============================================================================

/// Transaction lifecycle.
///
/// ```text
/// [nonexistent] -create-> pending -commit-> committed -undo-> undone
///                             |-rollback-> rolled_back
///                             |-fail-> partial
/// ```
///
/// Terminal states: committed, undone, rolled_back, partial. Only
/// `committed -> undone` is reversible through this interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Committed,
    RolledBack,
    Undone,
    Partial,
}

/// One loser's move record: everything undo needs to restore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoserEntry {
    pub file_id: FileId,
    pub original_path: PathBuf,
    pub recycle_path: PathBuf,
    pub size: u64,
    pub pre_mtime_ns: i64,
    /// The loser's own sidecar, moved alongside it when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sidecar_original: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sidecar_recycle: Option<PathBuf>,
}

/// One metadata write into the keeper, with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaWrite {
    pub field: MetaField,
    pub new_value: FieldValue,
    pub source_file_id: FileId,
}

/// Persisted execution record of one merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: TxId,
    pub status: TxStatus,
    /// Nanoseconds since epoch.
    pub timestamp_ns: i64,
    pub group_id: GroupId,
    pub keeper_id: FileId,
    pub losers: Vec<LoserEntry>,
    /// Prior bytes of the keeper's sidecar; `None` when no sidecar
    /// existed. Restored verbatim on undo and rollback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keeper_pre_metadata: Option<Vec<u8>>,
    pub keeper_sidecar_path: PathBuf,
    pub writes: Vec<MetaWrite>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// Proposed action for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub group_id: GroupId,
    pub keeper_id: FileId,
    /// Lexicographic by file id.
    pub losers: Vec<FileId>,
    pub writes: Vec<MetaWrite>,
    pub dry_run: bool,
}

/// Outcome of an undo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoResult {
    pub target: TxId,
    pub undo_id: TxId,
    /// Paths the losers were restored to (suffixed on collision).
    pub restored_paths: Vec<PathBuf>,
    pub keeper_metadata_restored: bool,
}

/// What startup recovery did with leftover `pending` transactions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub rolled_back: Vec<TxId>,
    pub partial: Vec<TxId>,
}

// ============================================================================
// Sidecar Paths
// ============================================================================

/// Where merged metadata for this file lives: `<path>.xmp` for RAW
/// (never rewritten in place), `<path>.json` otherwise.
pub fn sidecar_path_for(path: &Path) -> PathBuf {
    let ext = if MediaKind::is_raw(path) { "xmp" } else { "json" };
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push('.');
    name.push_str(ext);
    path.with_file_name(name)
}

// ============================================================================
// Plan Construction
// ============================================================================

/// Computes the field-level merge for a group. Pure: reads records,
/// touches nothing.
///
/// Keeper fields that are already populated are never overwritten unless
/// the field is listed in `overwrite_fields`.
///
/// # Errors
///
/// `User` when the keeper override is not a member, `NotFound` when a
/// member record is unknown.
pub fn plan_merge(
    group: &DuplicateGroup,
    store: &ContentStore,
    keeper_override: Option<FileId>,
    overwrite_fields: &BTreeSet<MetaField>,
    dry_run: bool,
) -> Result<MergePlan> {
    let keeper_id = match keeper_override {
        Some(id) => {
            if !group.members.contains(&id) {
                return Err(DvojnikError::User {
                    message: format!("keeper {} is not a member of group {}", id, group.group_id),
                });
            }
            id
        }
        None => group
            .suggested_keeper
            .or_else(|| group.members.first().copied())
            .ok_or_else(|| DvojnikError::Internal {
                message: format!("group {} has no members", group.group_id),
            })?,
    };

    let keeper = lookup_record(store, keeper_id)?;
    let mut members: Vec<&FileRecord> = Vec::with_capacity(group.members.len());
    for id in &group.members {
        members.push(lookup_record(store, *id)?);
    }

    let losers: Vec<FileId> = group
        .members
        .iter()
        .copied()
        .filter(|id| *id != keeper_id)
        .collect();

    let writes = build_writes(keeper, &members, overwrite_fields);

    Ok(MergePlan {
        group_id: group.group_id,
        keeper_id,
        losers,
        writes,
        dry_run,
    })
}

fn lookup_record(store: &ContentStore, id: FileId) -> Result<&FileRecord> {
    store.lookup(id).ok_or_else(|| DvojnikError::NotFound {
        path: format!("file record {}", id),
    })
}

fn effective_meta(record: &FileRecord) -> MediaMeta {
    record
        .signatures
        .as_ref()
        .and_then(|s| s.meta.clone())
        .unwrap_or_default()
}

/// The merge matrix: which member value fills which keeper field.
fn build_writes(
    keeper: &FileRecord,
    members: &[&FileRecord],
    overwrite: &BTreeSet<MetaField>,
) -> Vec<MetaWrite> {
    let keeper_meta = effective_meta(keeper);
    let mut writes = Vec::new();
    let may_write = |field: MetaField, keeper_empty: bool| keeper_empty || overwrite.contains(&field);

    // Capture date: earliest non-empty wins.
    if may_write(MetaField::CaptureTime, keeper_meta.capture_time.is_none()) {
        let earliest = members
            .iter()
            .filter_map(|m| {
                let meta = effective_meta(m);
                meta.capture_unix().map(|unix| (unix, m.file_id, meta))
            })
            .min_by(|x, y| x.0.cmp(&y.0).then(x.1.cmp(&y.1)));
        if let Some((_, source, meta)) = earliest {
            if source != keeper.file_id {
                if let Some(ts) = meta.capture_time {
                    writes.push(MetaWrite {
                        field: MetaField::CaptureTime,
                        new_value: FieldValue::Time(ts),
                        source_file_id: source,
                    });
                }
            }
        }
    }

    // GPS: most complete position wins (lat+lon+alt ranks above lat+lon).
    if may_write(MetaField::Gps, !keeper_meta.has_gps()) {
        let best = members
            .iter()
            .filter_map(|m| {
                let meta = effective_meta(m);
                meta.has_gps()
                    .then(|| (meta.gps_completeness(), m.file_id, meta))
            })
            .max_by(|x, y| x.0.cmp(&y.0).then(y.1.cmp(&x.1)));
        if let Some((_, source, meta)) = best {
            if source != keeper.file_id {
                if let (Some(lat), Some(lon)) = (meta.gps_lat, meta.gps_lon) {
                    writes.push(MetaWrite {
                        field: MetaField::Gps,
                        new_value: FieldValue::Gps {
                            lat,
                            lon,
                            alt: meta.gps_alt,
                        },
                        source_file_id: source,
                    });
                }
            }
        }
    }

    // Keywords: union, deduplicated, sorted. Additive, so the keeper's
    // own tags are never lost.
    let mut union: BTreeSet<String> = keeper_meta.keywords.clone();
    let mut keyword_source = None;
    for member in members {
        let meta = effective_meta(member);
        for keyword in meta.keywords {
            if union.insert(keyword) && keyword_source.is_none() {
                keyword_source = Some(member.file_id);
            }
        }
    }
    if let Some(source) = keyword_source {
        writes.push(MetaWrite {
            field: MetaField::Keywords,
            new_value: FieldValue::Keywords(union.into_iter().collect()),
            source_file_id: source,
        });
    }

    // Orientation: keeper's own value survives when valid; otherwise the
    // highest-resolution member supplies one.
    let keeper_orientation_valid = keeper_meta
        .orientation
        .map(|o| (1..=8).contains(&o))
        .unwrap_or(false);
    if !keeper_orientation_valid || overwrite.contains(&MetaField::Orientation) {
        let donor = members
            .iter()
            .filter_map(|m| {
                let meta = effective_meta(m);
                meta.orientation
                    .filter(|o| (1..=8).contains(o))
                    .map(|o| (meta.pixels().unwrap_or(0), m.file_id, o))
            })
            .max_by(|x, y| x.0.cmp(&y.0).then(y.1.cmp(&x.1)));
        if let Some((_, source, orientation)) = donor {
            if source != keeper.file_id {
                writes.push(MetaWrite {
                    field: MetaField::Orientation,
                    new_value: FieldValue::Orientation(orientation),
                    source_file_id: source,
                });
            }
        }
    }

    // Camera model and title: fill when the keeper is empty.
    for (field, keeper_value, pick) in [
        (
            MetaField::CameraModel,
            keeper_meta.camera_model.clone(),
            (|m: &MediaMeta| m.camera_model.clone()) as fn(&MediaMeta) -> Option<String>,
        ),
        (
            MetaField::Title,
            keeper_meta.title.clone(),
            |m: &MediaMeta| m.title.clone(),
        ),
    ] {
        if may_write(field, keeper_value.as_deref().unwrap_or("").is_empty()) {
            let donor = members.iter().find_map(|m| {
                let value = pick(&effective_meta(m))?;
                (!value.is_empty() && m.file_id != keeper.file_id).then_some((m.file_id, value))
            });
            if let Some((source, value)) = donor {
                writes.push(MetaWrite {
                    field,
                    new_value: FieldValue::Text(value),
                    source_file_id: source,
                });
            }
        }
    }

    // Description: longest non-empty wins.
    if may_write(
        MetaField::Description,
        keeper_meta.description.as_deref().unwrap_or("").is_empty(),
    ) {
        let donor = members
            .iter()
            .filter_map(|m| {
                let value = effective_meta(m).description?;
                (!value.is_empty()).then(|| (value.len(), m.file_id, value))
            })
            .max_by(|x, y| x.0.cmp(&y.0).then(y.1.cmp(&x.1)));
        if let Some((_, source, value)) = donor {
            if source != keeper.file_id {
                writes.push(MetaWrite {
                    field: MetaField::Description,
                    new_value: FieldValue::Text(value),
                    source_file_id: source,
                });
            }
        }
    }

    writes
}

// ============================================================================
// Sidecar Rendering
// ============================================================================

fn apply_write(meta: &mut MediaMeta, write: &MetaWrite) {
    match (&write.field, &write.new_value) {
        (MetaField::CaptureTime, FieldValue::Time(ts)) => meta.capture_time = Some(ts.clone()),
        (MetaField::Gps, FieldValue::Gps { lat, lon, alt }) => {
            meta.gps_lat = Some(*lat);
            meta.gps_lon = Some(*lon);
            meta.gps_alt = *alt;
        }
        (MetaField::Keywords, FieldValue::Keywords(keywords)) => {
            meta.keywords = keywords.iter().cloned().collect();
        }
        (MetaField::Orientation, FieldValue::Orientation(o)) => meta.orientation = Some(*o),
        (MetaField::CameraModel, FieldValue::Text(v)) => meta.camera_model = Some(v.clone()),
        (MetaField::Title, FieldValue::Text(v)) => meta.title = Some(v.clone()),
        (MetaField::Description, FieldValue::Text(v)) => meta.description = Some(v.clone()),
        (field, value) => {
            log::warn!("mismatched write {:?} = {:?} ignored", field, value);
        }
    }
}

/// Renders the merged sidecar payload for the keeper.
fn render_sidecar(keeper: &FileRecord, sidecar_path: &Path, writes: &[MetaWrite]) -> Result<Vec<u8>> {
    // Base: the existing JSON sidecar when parseable, else the keeper's
    // extracted metadata.
    let mut meta = fs::read_to_string(sidecar_path)
        .ok()
        .and_then(|text| serde_json::from_str::<MediaMeta>(&text).ok())
        .unwrap_or_else(|| effective_meta(keeper));
    for write in writes {
        apply_write(&mut meta, write);
    }

    if MediaKind::is_raw(&keeper.path) {
        Ok(render_xmp(&meta).into_bytes())
    } else {
        let mut json = serde_json::to_string_pretty(&meta)?;
        json.push('\n');
        Ok(json.into_bytes())
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Minimal XMP packet carrying the merged fields.
fn render_xmp(meta: &MediaMeta) -> String {
    let mut fields = String::new();
    if let Some(ts) = &meta.capture_time {
        fields.push_str(&format!(
            "   <exif:DateTimeOriginal>{}</exif:DateTimeOriginal>\n",
            xml_escape(ts)
        ));
    }
    if let (Some(lat), Some(lon)) = (meta.gps_lat, meta.gps_lon) {
        fields.push_str(&format!("   <exif:GPSLatitude>{}</exif:GPSLatitude>\n", lat));
        fields.push_str(&format!(
            "   <exif:GPSLongitude>{}</exif:GPSLongitude>\n",
            lon
        ));
        if let Some(alt) = meta.gps_alt {
            fields.push_str(&format!("   <exif:GPSAltitude>{}</exif:GPSAltitude>\n", alt));
        }
    }
    if let Some(orientation) = meta.orientation {
        fields.push_str(&format!(
            "   <tiff:Orientation>{}</tiff:Orientation>\n",
            orientation
        ));
    }
    if let Some(model) = &meta.camera_model {
        fields.push_str(&format!("   <tiff:Model>{}</tiff:Model>\n", xml_escape(model)));
    }
    if let Some(title) = &meta.title {
        fields.push_str(&format!(
            "   <dc:title><rdf:Alt><rdf:li xml:lang=\"x-default\">{}</rdf:li></rdf:Alt></dc:title>\n",
            xml_escape(title)
        ));
    }
    if let Some(description) = &meta.description {
        fields.push_str(&format!(
            "   <dc:description><rdf:Alt><rdf:li xml:lang=\"x-default\">{}</rdf:li></rdf:Alt></dc:description>\n",
            xml_escape(description)
        ));
    }
    if !meta.keywords.is_empty() {
        fields.push_str("   <dc:subject><rdf:Bag>\n");
        for keyword in &meta.keywords {
            fields.push_str(&format!("    <rdf:li>{}</rdf:li>\n", xml_escape(keyword)));
        }
        fields.push_str("   </rdf:Bag></dc:subject>\n");
    }

    format!(
        "<?xpacket begin=\"\u{feff}\" id=\"W5M0MpCehiHzreSzNTczkc9d\"?>\n\
         <x:xmpmeta xmlns:x=\"adobe:ns:meta/\">\n\
         \x20<rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\">\n\
         \x20 <rdf:Description rdf:about=\"\"\n\
         \x20   xmlns:dc=\"http://purl.org/dc/elements/1.1/\"\n\
         \x20   xmlns:exif=\"http://ns.adobe.com/exif/1.0/\"\n\
         \x20   xmlns:tiff=\"http://ns.adobe.com/tiff/1.0/\">\n\
         {}\
         \x20 </rdf:Description>\n\
         \x20</rdf:RDF>\n\
         </x:xmpmeta>\n\
         <?xpacket end=\"w\"?>\n",
        fields
    )
}

/// Write-temp, fsync, atomic rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    tmp_name.push_str(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file =
        File::create(&tmp).map_err(|e| DvojnikError::from_io_with_path(Some(tmp.clone()), e))?;
    file.write_all(bytes)
        .map_err(|e| DvojnikError::from_io_with_path(Some(tmp.clone()), e))?;
    file.sync_all()
        .map_err(|e| DvojnikError::from_io_with_path(Some(tmp.clone()), e))?;
    fs::rename(&tmp, path)
        .map_err(|e| DvojnikError::from_io_with_path(Some(path.to_path_buf()), e))?;
    Ok(())
}

// ============================================================================
// Merge Engine
// ============================================================================

/// Owns transaction execution: the log, the recycle area, and the
/// crash-recovery protocol. The caller serializes access (at most one
/// execute or undo at a time).
pub struct MergeEngine {
    txlog: TxLog,
    recycle: RecycleArea,
    execute_timeout: Duration,
    tx_counter: AtomicU64,
}

impl MergeEngine {
    pub fn new(txlog: TxLog, recycle: RecycleArea, execute_timeout: Duration) -> MergeEngine {
        MergeEngine {
            txlog,
            recycle,
            execute_timeout,
            tx_counter: AtomicU64::new(1),
        }
    }

    pub fn txlog(&self) -> &TxLog {
        &self.txlog
    }

    /// Refuses to run anything while a `partial` transaction awaits
    /// manual resolution.
    fn check_not_blocked(&self) -> Result<()> {
        if let Some(tx_id) = self.txlog.has_partial()? {
            let unresolved = self
                .txlog
                .find(tx_id)?
                .map(|tx| {
                    tx.losers
                        .iter()
                        .map(|l| l.original_path.display().to_string())
                        .collect()
                })
                .unwrap_or_default();
            return Err(DvojnikError::FatalPartial { tx_id, unresolved });
        }
        Ok(())
    }

    /// Executes a merge plan. Serialized by the caller; crash-safe.
    ///
    /// With `plan.dry_run` set, returns the fully-populated would-be
    /// transaction without touching the filesystem or the log.
    pub fn execute(&self, plan: &MergePlan, store: &ContentStore) -> Result<Transaction> {
        self.check_not_blocked()?;

        // Re-executing an already-merged group is a deterministic error,
        // never data loss.
        let mut group_txs: Vec<Transaction> = self
            .txlog
            .load()?
            .into_iter()
            .filter(|tx| tx.group_id == plan.group_id)
            .collect();
        group_txs.sort_by_key(|tx| tx.timestamp_ns);
        if let Some(last) = group_txs.last() {
            if last.status == TxStatus::Committed {
                return Err(DvojnikError::ConcurrentModification {
                    message: format!(
                        "group {} already merged by transaction {}",
                        plan.group_id, last.tx_id
                    ),
                });
            }
        }

        let keeper = store
            .lookup(plan.keeper_id)
            .ok_or_else(|| DvojnikError::NotFound {
                path: format!("file record {}", plan.keeper_id),
            })?;
        if !keeper.path.exists() {
            return Err(DvojnikError::ConcurrentModification {
                message: format!("keeper vanished: {}", keeper.path.display()),
            });
        }

        let tx_id = TxId::allocate(self.tx_counter.fetch_add(1, Ordering::SeqCst));
        let recycle_dir = self.recycle.dir_path(tx_id);
        let sidecar_path = sidecar_path_for(&keeper.path);
        let snapshot = fs::read(&sidecar_path).ok();

        // Plan every move up front so the pending record fully describes
        // the state change before anything happens.
        let mut planned_names: HashSet<String> = HashSet::new();
        let mut losers = Vec::with_capacity(plan.losers.len());
        for loser_id in &plan.losers {
            let record = store
                .lookup(*loser_id)
                .ok_or_else(|| DvojnikError::NotFound {
                    path: format!("file record {}", loser_id),
                })?;
            if !record.path.exists() {
                return Err(DvojnikError::ConcurrentModification {
                    message: format!("loser vanished: {}", record.path.display()),
                });
            }
            let recycle_path =
                planned_destination(&recycle_dir, &record.path, tx_id, &mut planned_names)?;
            let loser_sidecar = sidecar_path_for(&record.path);
            let (sidecar_original, sidecar_recycle) = if loser_sidecar.exists() {
                let dest =
                    planned_destination(&recycle_dir, &loser_sidecar, tx_id, &mut planned_names)?;
                (Some(loser_sidecar), Some(dest))
            } else {
                (None, None)
            };
            losers.push(LoserEntry {
                file_id: *loser_id,
                original_path: record.path.clone(),
                recycle_path,
                size: record.size,
                pre_mtime_ns: record.mtime_ns,
                sidecar_original,
                sidecar_recycle,
            });
        }

        let tx = Transaction {
            tx_id,
            status: TxStatus::Pending,
            timestamp_ns: now_nanos(),
            group_id: plan.group_id,
            keeper_id: plan.keeper_id,
            losers,
            keeper_pre_metadata: snapshot,
            keeper_sidecar_path: sidecar_path,
            writes: plan.writes.clone(),
            notes: Vec::new(),
        };

        if plan.dry_run {
            let mut preview = tx;
            preview.status = TxStatus::Committed;
            return Ok(preview);
        }

        // Step 1: durable pending record.
        self.txlog.append_open(&tx)?;

        match self.apply(&tx, keeper) {
            Ok(()) => {
                self.txlog.append_status(tx_id, TxStatus::Committed, None)?;
                log::info!(
                    "merged group {}: keeper {}, {} losers recycled",
                    tx.group_id,
                    tx.keeper_id,
                    tx.losers.len()
                );
                let mut committed = tx;
                committed.status = TxStatus::Committed;
                Ok(committed)
            }
            Err(err) => {
                log::warn!("execute failed, rolling back {}: {}", tx_id, err);
                match self.rollback(&tx) {
                    Ok(()) => {
                        self.txlog.append_status(
                            tx_id,
                            TxStatus::RolledBack,
                            Some(err.to_string()),
                        )?;
                        Err(err)
                    }
                    Err(unresolved) => {
                        self.txlog.append_status(
                            tx_id,
                            TxStatus::Partial,
                            Some(format!("rollback failed after: {}", err)),
                        )?;
                        Err(DvojnikError::FatalPartial { tx_id, unresolved })
                    }
                }
            }
        }
    }

    /// Steps 2-3 of the protocol: sidecar write, then loser moves.
    fn apply(&self, tx: &Transaction, keeper: &FileRecord) -> Result<()> {
        let deadline = Instant::now() + self.execute_timeout;

        let payload = render_sidecar(keeper, &tx.keeper_sidecar_path, &tx.writes)?;
        write_atomic(&tx.keeper_sidecar_path, &payload)?;

        if !tx.losers.is_empty() {
            fs::create_dir_all(recycle_parent(&tx.losers))
                .map_err(|e| DvojnikError::from_io_with_path(None, e))?;
        }
        for loser in &tx.losers {
            if Instant::now() >= deadline {
                return Err(DvojnikError::Io {
                    message: format!("merge execution timed out after {:?}", self.execute_timeout),
                });
            }
            recycle::move_file(&loser.original_path, &loser.recycle_path)?;
            if let (Some(src), Some(dest)) = (&loser.sidecar_original, &loser.sidecar_recycle) {
                recycle::move_file(src, dest)?;
            }
        }
        Ok(())
    }

    /// Restores everything a (possibly partial) apply changed. Returns
    /// the unresolved paths on failure.
    fn rollback(&self, tx: &Transaction) -> std::result::Result<(), Vec<String>> {
        let mut unresolved = Vec::new();

        for loser in &tx.losers {
            for (recycled, original) in [(&loser.recycle_path, &loser.original_path)]
                .into_iter()
                .chain(
                    loser
                        .sidecar_recycle
                        .as_ref()
                        .zip(loser.sidecar_original.as_ref())
                        .map(|(r, o)| (r, o)),
                )
            {
                if !recycled.exists() {
                    continue; // never moved
                }
                if original.exists() {
                    unresolved.push(original.display().to_string());
                    continue;
                }
                if let Err(err) = recycle::move_file(recycled, original) {
                    log::error!("rollback move failed: {}", err);
                    unresolved.push(original.display().to_string());
                }
            }
        }

        let restore_result = match &tx.keeper_pre_metadata {
            Some(bytes) => write_atomic(&tx.keeper_sidecar_path, bytes),
            None => {
                if tx.keeper_sidecar_path.exists() {
                    fs::remove_file(&tx.keeper_sidecar_path).map_err(|e| {
                        DvojnikError::from_io_with_path(Some(tx.keeper_sidecar_path.clone()), e)
                    })
                } else {
                    Ok(())
                }
            }
        };
        if let Err(err) = restore_result {
            log::error!("rollback sidecar restore failed: {}", err);
            unresolved.push(tx.keeper_sidecar_path.display().to_string());
        }

        if unresolved.is_empty() {
            Ok(())
        } else {
            Err(unresolved)
        }
    }

    /// Undoes the most recent committed transaction (or a specific one).
    ///
    /// Restores each loser to its original path - suffixed when
    /// something unrelated occupies it, never overwriting - and the
    /// keeper's sidecar bytes. Recycle payload emptied out of band
    /// surfaces `not_found` and leaves the transaction committed with an
    /// appended note.
    pub fn undo(&self, tx_id: Option<TxId>) -> Result<UndoResult> {
        self.check_not_blocked()?;

        let tx = match self.txlog.find_committed(tx_id)? {
            Some(tx) => tx,
            None => {
                return Err(match tx_id {
                    Some(id) => DvojnikError::User {
                        message: format!("transaction {} is not committed", id),
                    },
                    None => DvojnikError::NotFound {
                        path: "no committed transaction to undo".to_string(),
                    },
                })
            }
        };

        // Verify the payload first so a half-emptied trash never leaves
        // a half-undone merge.
        let missing: Vec<&LoserEntry> = tx
            .losers
            .iter()
            .filter(|l| !l.recycle_path.exists())
            .collect();
        if !missing.is_empty() {
            let paths: Vec<String> = missing
                .iter()
                .map(|l| l.recycle_path.display().to_string())
                .collect();
            self.txlog.append_status(
                tx.tx_id,
                TxStatus::Committed,
                Some(format!("undo skipped, recycle payload missing: {}", paths.join(", "))),
            )?;
            return Err(DvojnikError::NotFound {
                path: paths.join(", "),
            });
        }

        let mut restored_paths = Vec::new();
        let mut unresolved = Vec::new();
        for loser in &tx.losers {
            match self
                .recycle
                .restore(&loser.recycle_path, &loser.original_path, tx.tx_id)
            {
                Ok(path) => restored_paths.push(path),
                Err(err) => {
                    log::error!("undo restore failed: {}", err);
                    unresolved.push(loser.original_path.display().to_string());
                }
            }
            if let (Some(recycled), Some(original)) =
                (&loser.sidecar_recycle, &loser.sidecar_original)
            {
                if recycled.exists() {
                    if let Err(err) = self.recycle.restore(recycled, original, tx.tx_id) {
                        log::error!("undo sidecar restore failed: {}", err);
                        unresolved.push(original.display().to_string());
                    }
                }
            }
        }

        let keeper_restore = match &tx.keeper_pre_metadata {
            Some(bytes) => write_atomic(&tx.keeper_sidecar_path, bytes).map(|()| true),
            None => {
                if tx.keeper_sidecar_path.exists() {
                    fs::remove_file(&tx.keeper_sidecar_path)
                        .map(|()| true)
                        .map_err(|e| {
                            DvojnikError::from_io_with_path(
                                Some(tx.keeper_sidecar_path.clone()),
                                e,
                            )
                        })
                } else {
                    Ok(true)
                }
            }
        };
        let keeper_metadata_restored = match keeper_restore {
            Ok(done) => done,
            Err(err) => {
                log::error!("undo keeper restore failed: {}", err);
                unresolved.push(tx.keeper_sidecar_path.display().to_string());
                false
            }
        };

        if !unresolved.is_empty() {
            self.txlog.append_status(
                tx.tx_id,
                TxStatus::Partial,
                Some("undo left unresolved paths".to_string()),
            )?;
            return Err(DvojnikError::FatalPartial {
                tx_id: tx.tx_id,
                unresolved,
            });
        }

        let undo_id = TxId::allocate(self.tx_counter.fetch_add(1, Ordering::SeqCst));
        self.txlog.append_status(tx.tx_id, TxStatus::Undone, None)?;
        self.txlog.append_undo(undo_id, tx.tx_id)?;
        log::info!("undid transaction {} via {}", tx.tx_id, undo_id);

        Ok(UndoResult {
            target: tx.tx_id,
            undo_id,
            restored_paths,
            keeper_metadata_restored,
        })
    }

    /// Startup crash recovery: rolls back every `pending` leftover.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for tx in self.txlog.pending()? {
            log::warn!("recovering interrupted transaction {}", tx.tx_id);
            match self.rollback(&tx) {
                Ok(()) => {
                    self.txlog.append_status(
                        tx.tx_id,
                        TxStatus::RolledBack,
                        Some("recovered at startup".to_string()),
                    )?;
                    report.rolled_back.push(tx.tx_id);
                }
                Err(unresolved) => {
                    self.txlog.append_status(
                        tx.tx_id,
                        TxStatus::Partial,
                        Some(format!("recovery failed: {}", unresolved.join(", "))),
                    )?;
                    report.partial.push(tx.tx_id);
                }
            }
        }
        Ok(report)
    }
}

fn recycle_parent(losers: &[LoserEntry]) -> &Path {
    losers[0]
        .recycle_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
}

/// Collision-free destination under the (possibly not yet created)
/// recycle directory, unique against both disk and the other planned
/// moves of this transaction.
fn planned_destination(
    recycle_dir: &Path,
    src: &Path,
    tx_id: TxId,
    used: &mut HashSet<String>,
) -> Result<PathBuf> {
    let name = src
        .file_name()
        .ok_or_else(|| DvojnikError::Internal {
            message: format!("recycle source has no file name: {}", src.display()),
        })?
        .to_string_lossy()
        .to_string();
    if used.insert(name.clone()) && !recycle_dir.join(&name).exists() {
        return Ok(recycle_dir.join(name));
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (name.clone(), None),
    };
    for n in 1..=1000u32 {
        let candidate = match &ext {
            Some(ext) => format!("{}-{}-{}.{}", stem, tx_id, n, ext),
            None => format!("{}-{}-{}", stem, tx_id, n),
        };
        if used.insert(candidate.clone()) && !recycle_dir.join(&candidate).exists() {
            return Ok(recycle_dir.join(candidate));
        }
    }
    Err(DvojnikError::CollisionUnresolvable {
        path: recycle_dir.join(name).display().to_string(),
    })
}

// ============================================================================
// Test Support
// ============================================================================

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Minimal transaction for log-level tests.
    pub fn sample_tx(tx_id: TxId, status: TxStatus) -> Transaction {
        Transaction {
            tx_id,
            status,
            timestamp_ns: now_nanos(),
            group_id: GroupId(1),
            keeper_id: FileId(1),
            losers: vec![LoserEntry {
                file_id: FileId(2),
                original_path: PathBuf::from("/photos/loser.jpg"),
                recycle_path: PathBuf::from("/data/recycle/loser.jpg"),
                size: 100,
                pre_mtime_ns: 0,
                sidecar_original: None,
                sidecar_recycle: None,
            }],
            keeper_pre_metadata: None,
            keeper_sidecar_path: PathBuf::from("/photos/keeper.jpg.json"),
            writes: Vec::new(),
            notes: Vec::new(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
