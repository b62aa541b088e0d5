//! Engine facade.
//!
//! Ties the seven components into one pipeline behind the API consumed
//! by the CLI and by UIs: scans stream events, groups are listed from
//! the persisted store, and merge/undo run serialized through the
//! transactional engine.
//!
//! Concurrency domains: one enumeration producer per root, a bounded
//! extraction pool, data-parallel scoring feeding clustering through a
//! bounded edge queue, and merge execution behind a process-wide lock.
//! Enumeration suspends while `max_pending_signatures` records await
//! extraction; scoring suspends while `max_pending_edges` edges await
//! clustering.

use crate::buckets;
use crate::cluster::{self, ClusteredGroup, DuplicateGroup, IgnorePair};
use crate::confidence;
use crate::extract::{Extractor, FfmpegDecoder, VideoDecoder};
use crate::merge::{self, MergeEngine, MergePlan, RecoveryReport, Transaction, UndoResult};
use crate::meta::MetaField;
use crate::recycle::RecycleArea;
use crate::score::{self, PairScore};
use crate::store::{
    self, ContentStore, EnumEvent, FileRecord, MediaKind, RootHandle, ScanError,
};
use crate::txlog::TxLog;
use crate::{
    CancelToken, DvojnikError, EngineConfig, FileId, GroupId, NoSignals, Result, SystemSignals,
    TxId,
};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// Current `store.db` schema version.
pub const STORE_SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Public Types
// ============================================================================

/// Per-scan overrides of the engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanOptions {
    pub include_hidden: Option<bool>,
    pub ignore_globs: Option<Vec<String>>,
}

/// Events streamed while a scan runs.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Progress {
        discovered: usize,
        extracted: usize,
        failed: usize,
    },
    GroupReady(DuplicateGroup),
    ScanError(ScanError),
    Done(ScanSummary),
}

/// Final counters of one scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub discovered: usize,
    pub extracted: usize,
    pub failed: usize,
    pub groups: usize,
    pub duration_ms: u64,
}

/// Handle to a running scan: an event stream plus cancellation.
pub struct ScanHandle {
    events: Receiver<ScanEvent>,
    cancel: CancelToken,
    thread: Option<thread::JoinHandle<Result<ScanSummary>>>,
}

impl ScanHandle {
    /// The event stream: Progress, GroupReady, ScanError, then Done.
    pub fn events(&self) -> &Receiver<ScanEvent> {
        &self.events
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Blocks until the scan finishes and returns its summary.
    pub fn wait(mut self) -> Result<ScanSummary> {
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|_| DvojnikError::Internal {
                message: "scan thread panicked".to_string(),
            })?,
            None => Err(DvojnikError::Internal {
                message: "scan already waited on".to_string(),
            }),
        }
    }
}

/// Filter for [`Engine::list_groups`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupFilter {
    pub kind: Option<MediaKind>,
    pub min_confidence: Option<f64>,
    /// `Some(false)` hides incomplete groups.
    pub incomplete: Option<bool>,
}

/// Persisted engine state: file records, groups, ignore pairs.
#[derive(Debug, Default, Deserialize)]
struct StoreDoc {
    schema_version: u32,
    store: ContentStore,
    groups: Vec<DuplicateGroup>,
    ignore_pairs: BTreeSet<IgnorePair>,
}

#[derive(Serialize)]
struct StoreDocRef<'a> {
    schema_version: u32,
    store: &'a ContentStore,
    groups: &'a [DuplicateGroup],
    ignore_pairs: &'a BTreeSet<IgnorePair>,
}

// ============================================================================
// Engine
// ============================================================================

/// The duplicate-finder engine. One instance per data directory.
pub struct Engine {
    data_dir: PathBuf,
    config: EngineConfig,
    store: Mutex<ContentStore>,
    groups: Mutex<Vec<DuplicateGroup>>,
    ignore: RwLock<BTreeSet<IgnorePair>>,
    merge: MergeEngine,
    /// At most one execute or undo proceeds at a time.
    merge_lock: Mutex<()>,
    decoder: Arc<dyn VideoDecoder>,
    signals: Arc<dyn SystemSignals>,
    recovery: RecoveryReport,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.data_dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Opens the engine over a data directory with configuration from
    /// its `config.json`, running crash recovery and retention purge.
    pub fn open(data_dir: &Path) -> Result<Arc<Engine>> {
        let config = EngineConfig::load(&data_dir.join("config.json"))?;
        Engine::open_with(
            data_dir,
            config,
            Arc::new(FfmpegDecoder),
            Arc::new(NoSignals),
        )
    }

    /// Opens with explicit configuration, video decoder and system
    /// signal source (tests inject deterministic stubs here).
    pub fn open_with(
        data_dir: &Path,
        config: EngineConfig,
        decoder: Arc<dyn VideoDecoder>,
        signals: Arc<dyn SystemSignals>,
    ) -> Result<Arc<Engine>> {
        config.validate()?;
        fs::create_dir_all(data_dir)
            .map_err(|e| DvojnikError::from_io_with_path(Some(data_dir.to_path_buf()), e))?;

        let txlog = TxLog::open(&data_dir.join("txlog.db"))?;
        let recycle = RecycleArea::new(data_dir, config.move_to_trash);
        let merge = MergeEngine::new(
            txlog,
            recycle,
            Duration::from_millis(config.execute_timeout_ms),
        );

        // Crash recovery before anything else touches the filesystem.
        let recovery = merge.recover()?;
        if !recovery.partial.is_empty() {
            log::error!(
                "recovery left partial transactions needing manual resolution: {:?}",
                recovery.partial
            );
        }
        merge.txlog().purge_older_than(config.undo_retention_days)?;

        let doc = load_store(&data_dir.join("store.db"))?;

        Ok(Arc::new(Engine {
            data_dir: data_dir.to_path_buf(),
            config,
            store: Mutex::new(doc.store),
            groups: Mutex::new(doc.groups),
            ignore: RwLock::new(doc.ignore_pairs),
            merge,
            merge_lock: Mutex::new(()),
            decoder,
            signals,
            recovery,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// What startup recovery did; `partial` entries block merges.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    /// Starts an asynchronous scan of the given roots.
    pub fn start_scan(self: &Arc<Self>, roots: Vec<PathBuf>, options: ScanOptions) -> ScanHandle {
        let cancel = CancelToken::new();
        let (event_tx, event_rx) = unbounded();
        let engine = Arc::clone(self);
        let scan_cancel = cancel.clone();
        let thread = thread::spawn(move || {
            let result = engine.run_scan(&roots, &options, &scan_cancel, &event_tx);
            if let Err(err) = &result {
                let _ = event_tx.send(ScanEvent::ScanError(ScanError {
                    path: String::new(),
                    kind: store::ScanErrorKind::IoError,
                    message: err.to_string(),
                }));
            }
            result
        });
        ScanHandle {
            events: event_rx,
            cancel,
            thread: Some(thread),
        }
    }

    /// Convenience: scan synchronously, discarding intermediate events.
    pub fn scan_blocking(self: &Arc<Self>, roots: Vec<PathBuf>) -> Result<ScanSummary> {
        let handle = self.start_scan(roots, ScanOptions::default());
        // Drain so the pipeline never blocks on the event queue.
        for _ in handle.events() {}
        handle.wait()
    }

    fn effective_config(&self, options: &ScanOptions) -> EngineConfig {
        let mut config = self.config.clone();
        if let Some(include_hidden) = options.include_hidden {
            config.include_hidden = include_hidden;
        }
        if let Some(globs) = &options.ignore_globs {
            config.ignore_globs = globs.clone();
        }
        config
    }

    fn run_scan(
        &self,
        roots: &[PathBuf],
        options: &ScanOptions,
        cancel: &CancelToken,
        events: &Sender<ScanEvent>,
    ) -> Result<ScanSummary> {
        let started = Instant::now();
        let config = self.effective_config(options);
        let root_handles: Vec<RootHandle> = roots.iter().map(RootHandle::new).collect();
        for handle in &root_handles {
            // Fail fast on unusable roots before spawning anything.
            handle.open()?;
        }

        // Stage 1+2: one enumeration producer per root feeding the
        // bounded extraction queue; workers emit completed records.
        let (record_tx, record_rx) = bounded::<EnumEvent>(config.max_pending_signatures);
        let (done_tx, done_rx) = unbounded::<(FileRecord, bool)>();

        let mut producers = Vec::new();
        for handle in root_handles {
            let tx = record_tx.clone();
            let producer_config = config.clone();
            let producer_cancel = cancel.clone();
            producers.push(thread::spawn(move || {
                store::enumerate(&[handle], &producer_config, &producer_cancel, &tx)
            }));
        }
        drop(record_tx);

        let parallelism = config.effective_parallelism();
        let extractor = Arc::new(Extractor::new(config.clone(), Arc::clone(&self.decoder)));
        let mut workers = Vec::new();
        for worker_idx in 0..parallelism {
            let rx = record_rx.clone();
            let tx = done_tx.clone();
            let event_tx = events.clone();
            let worker_cancel = cancel.clone();
            let worker_extractor = Arc::clone(&extractor);
            let worker_signals = Arc::clone(&self.signals);
            workers.push(thread::spawn(move || {
                extraction_worker(
                    &worker_extractor,
                    worker_signals.as_ref(),
                    worker_idx,
                    parallelism,
                    &rx,
                    &tx,
                    &event_tx,
                    &worker_cancel,
                );
            }));
        }
        drop(record_rx);
        drop(done_tx);

        // Collect extracted records into the store.
        let mut summary = ScanSummary::default();
        let mut seen: HashSet<FileId> = HashSet::new();
        {
            let mut store_guard = self.lock_store();
            for (record, failed) in done_rx.iter() {
                summary.discovered += 1;
                if failed {
                    summary.failed += 1;
                } else {
                    summary.extracted += 1;
                }
                seen.insert(record.file_id);
                let id = record.file_id;
                let signatures = record.signatures.clone();
                let incomplete = record.incomplete;
                store_guard.upsert(record);
                if let Some(bundle) = signatures {
                    store_guard.set_signatures(id, bundle, incomplete);
                }
                let _ = events.send(ScanEvent::Progress {
                    discovered: summary.discovered,
                    extracted: summary.extracted,
                    failed: summary.failed,
                });
            }
            store_guard.prune_missing_under(roots, &seen);

            // Sidecar metadata attaches to its primary file.
            let sidecar_meta: Vec<_> = store_guard
                .records()
                .filter(|r| r.kind == MediaKind::Sidecar)
                .filter_map(|r| {
                    let meta = r.signatures.as_ref()?.meta.clone()?;
                    let primary = store::sidecar_primary_path(&r.path)?;
                    Some((primary, meta))
                })
                .collect();
            for (primary, meta) in sidecar_meta {
                store_guard.absorb_sidecar_meta(&primary, &meta);
            }
        }
        for producer in producers {
            match producer.join() {
                Ok(Ok(_stats)) => {}
                Ok(Err(DvojnikError::Cancelled)) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    return Err(DvojnikError::Internal {
                        message: "enumeration thread panicked".to_string(),
                    })
                }
            }
        }
        for worker in workers {
            worker.join().map_err(|_| DvojnikError::Internal {
                message: "extraction worker panicked".to_string(),
            })?;
        }
        cancel.check()?;

        // Stage 3: buckets, scoring, clustering, annotation.
        let groups = self.detect_groups(&config, cancel)?;
        summary.groups = groups.len();
        for group in &groups {
            let _ = events.send(ScanEvent::GroupReady(group.clone()));
        }
        *self.lock_groups() = groups;
        self.persist()?;

        summary.duration_ms = started.elapsed().as_millis() as u64;
        log::info!(
            "scan finished: {} files, {} groups, {} ms",
            summary.discovered,
            summary.groups,
            summary.duration_ms
        );
        let _ = events.send(ScanEvent::Done(summary.clone()));
        Ok(summary)
    }

    /// Buckets, scores and clusters the current store contents.
    fn detect_groups(
        &self,
        config: &EngineConfig,
        cancel: &CancelToken,
    ) -> Result<Vec<DuplicateGroup>> {
        let store_guard = self.lock_store();
        let records: Vec<&FileRecord> = store_guard
            .records()
            .filter(|r| r.signatures.is_some())
            .collect();
        let candidates = buckets::build(&records, config);

        // Unique unordered pairs across checksum groups and candidate
        // sets; each scored exactly once.
        let mut pair_set: BTreeSet<(FileId, FileId)> = BTreeSet::new();
        for set in candidates
            .checksum_groups
            .iter()
            .chain(candidates.candidate_sets.iter())
        {
            for (i, a) in set.ids.iter().enumerate() {
                for b in &set.ids[i + 1..] {
                    pair_set.insert((*a, *b));
                }
            }
        }
        let pairs: Vec<(FileId, FileId)> = pair_set.into_iter().collect();

        // Scoring is pure CPU; rayon fans it out while the bounded edge
        // queue applies backpressure toward the collector.
        let store_ref = &*store_guard;
        let (edge_tx, edge_rx) = bounded::<PairScore>(config.max_pending_edges);
        let collector = thread::spawn(move || edge_rx.iter().collect::<Vec<PairScore>>());
        pairs.par_iter().for_each_with(edge_tx, |tx, (a, b)| {
            if cancel.is_cancelled() {
                return;
            }
            if let (Some(ra), Some(rb)) = (store_ref.lookup(*a), store_ref.lookup(*b)) {
                let _ = tx.send(score::score_pair(ra, rb, config));
            }
        });
        let scored = collector.join().map_err(|_| DvojnikError::Internal {
            message: "edge collector panicked".to_string(),
        })?;

        let incomplete_ids: HashSet<FileId> = store_guard
            .records()
            .filter(|r| r.incomplete)
            .map(|r| r.file_id)
            .collect();
        let ignore = self
            .ignore
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let clustered: Vec<ClusteredGroup> = cluster::build(
            scored,
            &ignore,
            &incomplete_ids,
            Duration::from_millis(config.cluster_time_budget_ms),
            cancel,
        );

        let mut groups = Vec::with_capacity(clustered.len());
        for mut item in clustered {
            let members: Vec<&FileRecord> = item
                .group
                .members
                .iter()
                .filter_map(|id| store_guard.lookup(*id))
                .collect();
            confidence::annotate(&mut item, &members, &config.confidence_weights);
            groups.push(item.group);
        }
        Ok(groups)
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Groups from the last completed scan, filtered, in stored order
    /// (descending size, then smallest member).
    pub fn list_groups(&self, filter: &GroupFilter) -> Vec<DuplicateGroup> {
        self.lock_groups()
            .iter()
            .filter(|g| filter.kind.map_or(true, |k| g.kind == k))
            .filter(|g| filter.min_confidence.map_or(true, |min| g.confidence >= min))
            .filter(|g| filter.incomplete.map_or(true, |inc| g.incomplete == inc))
            .cloned()
            .collect()
    }

    pub fn find_group(&self, group_id: GroupId) -> Option<DuplicateGroup> {
        self.lock_groups()
            .iter()
            .find(|g| g.group_id == group_id)
            .cloned()
    }

    pub fn lookup_record(&self, file_id: FileId) -> Option<FileRecord> {
        self.lock_store().lookup(file_id).cloned()
    }

    // ------------------------------------------------------------------
    // Merge / Undo
    // ------------------------------------------------------------------

    /// Plans a merge for one group. Read-only; may run concurrently
    /// with other planning.
    pub fn plan_merge(
        &self,
        group_id: GroupId,
        keeper_override: Option<FileId>,
        overwrite_fields: Option<BTreeSet<MetaField>>,
        dry_run: bool,
    ) -> Result<MergePlan> {
        let group = self.find_group(group_id).ok_or_else(|| DvojnikError::User {
            message: format!("unknown group {}", group_id),
        })?;
        let overwrite =
            overwrite_fields.unwrap_or_else(|| self.config.force_overwrite_fields.clone());
        let store_guard = self.lock_store();
        merge::plan_merge(&group, &store_guard, keeper_override, &overwrite, dry_run)
    }

    /// Executes a merge plan. Serialized process-wide.
    pub fn execute_merge(&self, plan: &MergePlan) -> Result<Transaction> {
        let _guard = self.merge_lock.lock().unwrap_or_else(|p| p.into_inner());
        let tx = {
            let store_guard = self.lock_store();
            self.merge.execute(plan, &store_guard)?
        };
        if !plan.dry_run {
            // Losers left the library; their records and the group go.
            {
                let mut store_guard = self.lock_store();
                let keep: HashSet<FileId> = store_guard
                    .records()
                    .map(|r| r.file_id)
                    .filter(|id| !plan.losers.contains(id))
                    .collect();
                store_guard.retain_seen(&keep);
            }
            self.lock_groups().retain(|g| g.group_id != plan.group_id);
            self.persist()?;
        }
        Ok(tx)
    }

    /// Undoes the most recent committed transaction, or a specific one.
    pub fn undo(&self, tx_id: Option<TxId>) -> Result<UndoResult> {
        let _guard = self.merge_lock.lock().unwrap_or_else(|p| p.into_inner());
        let result = self.merge.undo(tx_id)?;
        // Restored files re-enter the store; signatures return on the
        // next scan.
        {
            let mut store_guard = self.lock_store();
            for path in &result.restored_paths {
                if let Ok(record) = store::read_record(path) {
                    store_guard.upsert(record);
                }
            }
        }
        self.persist()?;
        Ok(result)
    }

    pub fn list_transactions(&self, window: usize) -> Result<Vec<Transaction>> {
        self.merge.txlog().list(window)
    }

    // ------------------------------------------------------------------
    // Ignore Pairs
    // ------------------------------------------------------------------

    /// Never group these two files together again.
    pub fn add_ignore_pair(&self, a: FileId, b: FileId) -> Result<()> {
        if a == b {
            return Err(DvojnikError::User {
                message: "cannot ignore a file against itself".to_string(),
            });
        }
        self.ignore
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(IgnorePair::new(a, b));
        // Groups holding both are no longer valid.
        self.lock_groups()
            .retain(|g| !(g.members.contains(&a) && g.members.contains(&b)));
        self.persist()
    }

    pub fn remove_ignore_pair(&self, a: FileId, b: FileId) -> Result<()> {
        self.ignore
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&IgnorePair::new(a, b));
        self.persist()
    }

    pub fn ignore_pairs(&self) -> BTreeSet<IgnorePair> {
        self.ignore.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn lock_store(&self) -> std::sync::MutexGuard<'_, ContentStore> {
        self.store.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_groups(&self) -> std::sync::MutexGuard<'_, Vec<DuplicateGroup>> {
        self.groups.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Writes `store.db` atomically with backup rotation.
    fn persist(&self) -> Result<()> {
        let store_guard = self.lock_store();
        let groups_guard = self.lock_groups();
        let ignore_guard = self.ignore.read().unwrap_or_else(|p| p.into_inner());
        let doc = StoreDocRef {
            schema_version: STORE_SCHEMA_VERSION,
            store: &store_guard,
            groups: &groups_guard,
            ignore_pairs: &ignore_guard,
        };
        save_store(&self.data_dir.join("store.db"), &doc)
    }
}

// ============================================================================
// Extraction Worker
// ============================================================================

/// One extraction worker: pulls enumerated records, attaches signature
/// bundles, forwards scan errors. Cancellation is observed between
/// files; under memory pressure the upper half of the pool idles, which
/// halves effective parallelism until pressure clears.
#[allow(clippy::too_many_arguments)]
fn extraction_worker(
    extractor: &Extractor,
    signals: &dyn SystemSignals,
    worker_idx: usize,
    pool_size: usize,
    records: &Receiver<EnumEvent>,
    done: &Sender<(FileRecord, bool)>,
    events: &Sender<ScanEvent>,
    cancel: &CancelToken,
) {
    let reduced_pool = (pool_size / 2).max(1);
    for event in records.iter() {
        if cancel.is_cancelled() {
            break;
        }
        match event {
            EnumEvent::Error(error) => {
                let _ = events.send(ScanEvent::ScanError(error));
            }
            EnumEvent::Record(mut record) => {
                while signals.memory_pressure() && worker_idx >= reduced_pool {
                    if cancel.is_cancelled() {
                        return;
                    }
                    thread::sleep(Duration::from_millis(25));
                }
                if record.incomplete {
                    // Enumeration already failed to read it.
                    let _ = done.send((record, true));
                    continue;
                }
                match extractor.extract(&record.path, record.kind) {
                    Ok(extraction) => {
                        // Extraction failures stay attached to the record;
                        // the scan continues.
                        let failed = extraction.incomplete;
                        record.signatures = Some(extraction.bundle);
                        record.incomplete = extraction.incomplete;
                        let _ = done.send((record, failed));
                    }
                    Err(err) => {
                        let _ = events.send(ScanEvent::ScanError(ScanError::new(
                            &record.path,
                            &err,
                        )));
                        record.incomplete = true;
                        let _ = done.send((record, true));
                    }
                }
            }
        }
    }
}

// ============================================================================
// Store Persistence
// ============================================================================

fn load_store(path: &Path) -> Result<StoreDoc> {
    if !path.exists() {
        return Ok(StoreDoc {
            schema_version: STORE_SCHEMA_VERSION,
            ..StoreDoc::default()
        });
    }
    let text = fs::read_to_string(path)
        .map_err(|e| DvojnikError::from_io_with_path(Some(path.to_path_buf()), e))?;
    let mut doc: StoreDoc =
        serde_json::from_str(&text).map_err(|_| DvojnikError::SchemaMismatch {
            found: "unreadable store.db".to_string(),
            expected: format!("schema_version {}", STORE_SCHEMA_VERSION),
        })?;
    if doc.schema_version != STORE_SCHEMA_VERSION {
        // Migration hook: no migrations defined yet.
        return Err(DvojnikError::SchemaMismatch {
            found: format!("schema_version {}", doc.schema_version),
            expected: format!("schema_version {}", STORE_SCHEMA_VERSION),
        });
    }
    doc.store.reindex();
    Ok(doc)
}

fn save_store(path: &Path, doc: &StoreDocRef<'_>) -> Result<()> {
    if path.exists() {
        rotate_backups(path)?;
    }
    let json = serde_json::to_string(doc)?;
    let tmp = path.with_extension("db.tmp");
    fs::write(&tmp, json.as_bytes())
        .map_err(|e| DvojnikError::from_io_with_path(Some(tmp.clone()), e))?;
    let file = fs::File::open(&tmp)
        .map_err(|e| DvojnikError::from_io_with_path(Some(tmp.clone()), e))?;
    file.sync_all()
        .map_err(|e| DvojnikError::from_io_with_path(Some(tmp.clone()), e))?;
    fs::rename(&tmp, path)
        .map_err(|e| DvojnikError::from_io_with_path(Some(path.to_path_buf()), e))?;
    Ok(())
}

/// Rotates store backups: store.db -> .bak1 -> .bak2 -> .bak3.
fn rotate_backups(path: &Path) -> Result<()> {
    let bak3 = path.with_extension("db.bak3");
    let bak2 = path.with_extension("db.bak2");
    let bak1 = path.with_extension("db.bak1");
    if bak2.exists() {
        fs::rename(&bak2, &bak3).map_err(|e| DvojnikError::from_io_with_path(Some(bak3), e))?;
    }
    if bak1.exists() {
        fs::rename(&bak1, &bak2).map_err(|e| DvojnikError::from_io_with_path(Some(bak2), e))?;
    }
    fs::rename(path, &bak1).map_err(|e| DvojnikError::from_io_with_path(Some(bak1), e))?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    /// Seed 0: horizontal gradient. Other seeds: vertical stripes whose
    /// period depends on the seed, perceptually far from the gradient.
    fn gradient_png_bytes(width: u32, height: u32, seed: u8) -> Vec<u8> {
        let img = if seed == 0 {
            GrayImage::from_fn(width, height, |x, _| {
                Luma([(x * 255 / width.max(1)) as u8])
            })
        } else {
            // Wide stripes survive the hash downsample, so these sit far
            // from the gradient in Hamming distance.
            GrayImage::from_fn(width, height, |x, _| {
                Luma([if (x / 16) % 2 == 0 { seed } else { 255 }])
            })
        };
        let mut bytes = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut bytes, image::ImageOutputFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    struct World {
        _tmp: TempDir,
        photos: PathBuf,
        data: PathBuf,
    }

    fn world() -> World {
        let tmp = TempDir::new().unwrap();
        let photos = tmp.path().join("photos");
        let data = tmp.path().join("data");
        fs::create_dir_all(&photos).unwrap();
        World {
            _tmp: tmp,
            photos,
            data,
        }
    }

    fn open(world: &World) -> Arc<Engine> {
        let mut config = EngineConfig::default();
        config.move_to_trash = false; // keep tests inside the temp dir
        Engine::open_with(
            &world.data,
            config,
            Arc::new(FfmpegDecoder),
            Arc::new(NoSignals),
        )
        .unwrap()
    }

    fn scan(engine: &Arc<Engine>, world: &World) -> ScanSummary {
        engine.scan_blocking(vec![world.photos.clone()]).unwrap()
    }

    #[test]
    fn test_exact_copy_end_to_end() {
        let w = world();
        let bytes = gradient_png_bytes(64, 48, 0);
        fs::write(w.photos.join("a.png"), &bytes).unwrap();
        fs::write(w.photos.join("a_copy.png"), &bytes).unwrap();
        fs::write(w.photos.join("other.png"), gradient_png_bytes(64, 48, 91)).unwrap();

        let engine = open(&w);
        let summary = scan(&engine, &w);
        assert_eq!(summary.discovered, 3);

        let groups = engine.list_groups(&GroupFilter::default());
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.members.len(), 2);
        assert_eq!(group.confidence, 1.0);
        assert!(group
            .rationale_lines
            .contains(&score::CHECKSUM_RATIONALE.to_string()));
        // Smaller path wins the final tie-break.
        let keeper = engine
            .lookup_record(group.suggested_keeper.unwrap())
            .unwrap();
        assert_eq!(keeper.file_name(), "a.png");
    }

    #[test]
    fn test_scan_is_deterministic() {
        let w = world();
        let bytes = gradient_png_bytes(64, 48, 0);
        fs::write(w.photos.join("a.png"), &bytes).unwrap();
        fs::write(w.photos.join("b.png"), &bytes).unwrap();
        fs::write(w.photos.join("c.png"), gradient_png_bytes(64, 48, 7)).unwrap();

        let engine = open(&w);
        scan(&engine, &w);
        let first = serde_json::to_string(&engine.list_groups(&GroupFilter::default())).unwrap();
        scan(&engine, &w);
        let second = serde_json::to_string(&engine.list_groups(&GroupFilter::default())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ignore_pair_end_to_end() {
        let w = world();
        let bytes = gradient_png_bytes(64, 48, 0);
        fs::write(w.photos.join("a.png"), &bytes).unwrap();
        fs::write(w.photos.join("b.png"), &bytes).unwrap();

        let engine = open(&w);
        scan(&engine, &w);
        let groups = engine.list_groups(&GroupFilter::default());
        assert_eq!(groups.len(), 1);
        let (a, b) = (groups[0].members[0], groups[0].members[1]);

        engine.add_ignore_pair(a, b).unwrap();
        assert!(engine.list_groups(&GroupFilter::default()).is_empty());

        // Still honored on re-scan.
        scan(&engine, &w);
        assert!(engine.list_groups(&GroupFilter::default()).is_empty());

        engine.remove_ignore_pair(a, b).unwrap();
        scan(&engine, &w);
        assert_eq!(engine.list_groups(&GroupFilter::default()).len(), 1);
    }

    #[test]
    fn test_merge_and_undo_end_to_end() {
        let w = world();
        let bytes = gradient_png_bytes(64, 48, 0);
        fs::write(w.photos.join("a.png"), &bytes).unwrap();
        fs::write(w.photos.join("a_copy.png"), &bytes).unwrap();

        let engine = open(&w);
        scan(&engine, &w);
        let group = engine.list_groups(&GroupFilter::default()).remove(0);

        let plan = engine.plan_merge(group.group_id, None, None, false).unwrap();
        let tx = engine.execute_merge(&plan).unwrap();
        assert_eq!(tx.status, crate::merge::TxStatus::Committed);
        assert!(w.photos.join("a.png").exists());
        assert!(!w.photos.join("a_copy.png").exists());
        assert!(engine.list_groups(&GroupFilter::default()).is_empty());

        let undo = engine.undo(None).unwrap();
        assert_eq!(undo.target, tx.tx_id);
        assert!(w.photos.join("a_copy.png").exists());
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let w = world();
        let bytes = gradient_png_bytes(64, 48, 0);
        fs::write(w.photos.join("a.png"), &bytes).unwrap();
        fs::write(w.photos.join("a_copy.png"), &bytes).unwrap();

        let engine = open(&w);
        scan(&engine, &w);
        let group = engine.list_groups(&GroupFilter::default()).remove(0);
        let plan = engine.plan_merge(group.group_id, None, None, true).unwrap();
        let tx = engine.execute_merge(&plan).unwrap();

        assert_eq!(tx.losers.len(), 1);
        assert!(w.photos.join("a_copy.png").exists());
        assert!(engine.list_transactions(10).unwrap().is_empty());
        assert_eq!(engine.list_groups(&GroupFilter::default()).len(), 1);
    }

    #[test]
    fn test_keeper_override_in_plan() {
        let w = world();
        let bytes = gradient_png_bytes(64, 48, 0);
        fs::write(w.photos.join("a.png"), &bytes).unwrap();
        fs::write(w.photos.join("b.png"), &bytes).unwrap();

        let engine = open(&w);
        scan(&engine, &w);
        let group = engine.list_groups(&GroupFilter::default()).remove(0);
        let other = group
            .members
            .iter()
            .copied()
            .find(|m| Some(*m) != group.suggested_keeper)
            .unwrap();
        let plan = engine
            .plan_merge(group.group_id, Some(other), None, false)
            .unwrap();
        assert_eq!(plan.keeper_id, other);
    }

    #[test]
    fn test_group_filter() {
        let w = world();
        let bytes = gradient_png_bytes(64, 48, 0);
        fs::write(w.photos.join("a.png"), &bytes).unwrap();
        fs::write(w.photos.join("b.png"), &bytes).unwrap();

        let engine = open(&w);
        scan(&engine, &w);
        assert_eq!(
            engine
                .list_groups(&GroupFilter {
                    kind: Some(MediaKind::Video),
                    ..GroupFilter::default()
                })
                .len(),
            0
        );
        assert_eq!(
            engine
                .list_groups(&GroupFilter {
                    min_confidence: Some(0.99),
                    ..GroupFilter::default()
                })
                .len(),
            1
        );
    }

    #[test]
    fn test_state_survives_reopen() {
        let w = world();
        let bytes = gradient_png_bytes(64, 48, 0);
        fs::write(w.photos.join("a.png"), &bytes).unwrap();
        fs::write(w.photos.join("b.png"), &bytes).unwrap();

        {
            let engine = open(&w);
            scan(&engine, &w);
            assert_eq!(engine.list_groups(&GroupFilter::default()).len(), 1);
        }
        // A fresh engine over the same data directory sees the groups.
        let engine = open(&w);
        assert_eq!(engine.list_groups(&GroupFilter::default()).len(), 1);
        assert!(w.data.join("store.db").exists());
    }

    #[test]
    fn test_store_schema_mismatch_refused() {
        let w = world();
        fs::create_dir_all(&w.data).unwrap();
        fs::write(
            w.data.join("store.db"),
            r#"{"schema_version":99,"store":{"records":{}},"groups":[],"ignore_pairs":[]}"#,
        )
        .unwrap();
        let mut config = EngineConfig::default();
        config.move_to_trash = false;
        let err = Engine::open_with(
            &w.data,
            config,
            Arc::new(FfmpegDecoder),
            Arc::new(NoSignals),
        )
        .unwrap_err();
        assert!(matches!(err, DvojnikError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_cancelled_scan_reports_cancelled() {
        let w = world();
        for i in 0..16 {
            fs::write(
                w.photos.join(format!("p{:02}.png", i)),
                gradient_png_bytes(64, 48, i as u8),
            )
            .unwrap();
        }
        let engine = open(&w);
        let handle = engine.start_scan(vec![w.photos.clone()], ScanOptions::default());
        handle.cancel();
        for _ in handle.events() {}
        let result = handle.wait();
        // Depending on timing the scan either finished before observing
        // the token or reports cancellation; both are acceptable.
        if let Err(err) = result {
            assert!(matches!(err, DvojnikError::Cancelled));
        }
    }

    #[test]
    fn test_sidecar_metadata_attaches_to_primary() {
        let w = world();
        let photo = w.photos.join("a.png");
        fs::write(&photo, gradient_png_bytes(64, 48, 0)).unwrap();
        fs::write(
            w.photos.join("a.png.json"),
            r#"{"capture_time":"2020-06-15T10:30:00Z","keywords":["trip"]}"#,
        )
        .unwrap();

        let engine = open(&w);
        scan(&engine, &w);

        let record = engine
            .lookup_record(crate::FileId::from_path(&photo))
            .unwrap();
        let meta = record.signatures.unwrap().meta.unwrap();
        assert_eq!(meta.capture_time.as_deref(), Some("2020-06-15T10:30:00Z"));
        assert!(meta.keywords.contains("trip"));
        // The photo's own decoded dimensions survive.
        assert_eq!(meta.width, Some(64));
    }

    #[test]
    fn test_memory_pressure_stub_still_completes() {
        struct AlwaysPressure;
        impl SystemSignals for AlwaysPressure {
            fn memory_pressure(&self) -> bool {
                // Fire for the first poll only; a permanently-pressured
                // stub would stall the reduced workers forever.
                use std::sync::atomic::{AtomicUsize, Ordering};
                static POLLS: AtomicUsize = AtomicUsize::new(0);
                POLLS.fetch_add(1, Ordering::Relaxed) < 2
            }
        }

        let w = world();
        let bytes = gradient_png_bytes(64, 48, 0);
        fs::write(w.photos.join("a.png"), &bytes).unwrap();
        fs::write(w.photos.join("b.png"), &bytes).unwrap();

        let mut config = EngineConfig::default();
        config.move_to_trash = false;
        config.extraction_parallelism = Some(2);
        let engine = Engine::open_with(
            &w.data,
            config,
            Arc::new(FfmpegDecoder),
            Arc::new(AlwaysPressure),
        )
        .unwrap();
        let summary = engine.scan_blocking(vec![w.photos.clone()]).unwrap();
        assert_eq!(summary.discovered, 2);
        assert_eq!(engine.list_groups(&GroupFilter::default()).len(), 1);
    }
}
