//! Candidate buckets.
//!
//! Narrows the all-pairs space to small candidate sets before scoring.
//! Three keys run in parallel conceptually and their sets are unioned per
//! file: exact checksum equality (an immediate accept), BK-tree phash
//! neighborhoods for photos, and quantized-duration buckets with a
//! first-frame prefilter for videos.
//!
//! Output ordering is deterministic: candidates are sorted by file id
//! within a set, and sets emerge in a stable order keyed by their
//! smallest member.

use crate::phash::Phash;
use crate::store::{FileRecord, MediaKind};
use crate::{EngineConfig, FileId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Width of one video duration bucket.
const DURATION_BUCKET_MS: u64 = 2000;

/// A small set of files that may pairwise match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSet {
    pub kind: MediaKind,
    /// Sorted, deduplicated member ids.
    pub ids: Vec<FileId>,
}

/// Result of the bucketing pass.
#[derive(Debug, Default)]
pub struct CandidateBuckets {
    /// Checksum-equal groups (size ≥ 2): exact content duplicates that
    /// short-circuit straight to clustering.
    pub checksum_groups: Vec<CandidateSet>,
    /// Perceptual candidate sets for the pair scorer.
    pub candidate_sets: Vec<CandidateSet>,
    /// Candidates discarded by bucket-cap splitting; surfaced in logs.
    pub dropped_candidates: usize,
}

/// Builds candidate buckets over the extracted records.
pub fn build(records: &[&FileRecord], config: &EngineConfig) -> CandidateBuckets {
    let mut result = CandidateBuckets::default();
    result.checksum_groups = checksum_buckets(records);

    let mut sets: BTreeSet<(MediaKind, Vec<FileId>)> = BTreeSet::new();

    let photos: Vec<&FileRecord> = records
        .iter()
        .copied()
        .filter(|r| r.kind == MediaKind::Photo)
        .collect();
    photo_buckets(&photos, config, &mut sets, &mut result.dropped_candidates);

    let videos: Vec<&FileRecord> = records
        .iter()
        .copied()
        .filter(|r| r.kind == MediaKind::Video)
        .collect();
    video_buckets(&videos, config, &mut sets, &mut result.dropped_candidates);

    result.candidate_sets = sets
        .into_iter()
        .map(|(kind, ids)| CandidateSet { kind, ids })
        .collect();

    if result.dropped_candidates > 0 {
        log::warn!(
            "bucket cap splitting dropped {} cross-candidates",
            result.dropped_candidates
        );
    }
    result
}

// ============================================================================
// Checksum Buckets
// ============================================================================

fn checksum_buckets(records: &[&FileRecord]) -> Vec<CandidateSet> {
    let mut by_checksum: BTreeMap<(MediaKind, &str), Vec<FileId>> = BTreeMap::new();
    for record in records {
        // Only media participates in grouping; identical sidecars or
        // stray files are not duplicate candidates.
        if !matches!(record.kind, MediaKind::Photo | MediaKind::Video) {
            continue;
        }
        if let Some(bundle) = &record.signatures {
            by_checksum
                .entry((record.kind, bundle.checksum.as_str()))
                .or_default()
                .push(record.file_id);
        }
    }
    by_checksum
        .into_iter()
        .filter(|(_, ids)| ids.len() >= 2)
        .map(|((kind, _), mut ids)| {
            ids.sort();
            ids.dedup();
            CandidateSet { kind, ids }
        })
        .filter(|set| set.ids.len() >= 2)
        .collect()
}

// ============================================================================
// Photo Buckets (BK-tree)
// ============================================================================

/// BK-tree over 64-bit phashes under Hamming distance.
///
/// Children are keyed by their distance to the parent; a radius query
/// only descends into children whose key lies within `d ± radius`.
pub struct BkTree {
    root: Option<BkNode>,
    len: usize,
}

struct BkNode {
    hash: Phash,
    ids: Vec<FileId>,
    children: BTreeMap<u32, BkNode>,
}

impl BkTree {
    pub fn new() -> BkTree {
        BkTree { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, hash: Phash, id: FileId) {
        self.len += 1;
        let Some(root) = &mut self.root else {
            self.root = Some(BkNode {
                hash,
                ids: vec![id],
                children: BTreeMap::new(),
            });
            return;
        };
        let mut node = root;
        loop {
            let d = node.hash.distance(hash);
            if d == 0 {
                node.ids.push(id);
                return;
            }
            match node.children.entry(d) {
                std::collections::btree_map::Entry::Occupied(entry) => {
                    node = entry.into_mut();
                }
                std::collections::btree_map::Entry::Vacant(entry) => {
                    entry.insert(BkNode {
                        hash,
                        ids: vec![id],
                        children: BTreeMap::new(),
                    });
                    return;
                }
            }
        }
    }

    /// All ids whose hash lies within `radius` bits of `hash`, including
    /// exact matches.
    pub fn neighbors(&self, hash: Phash, radius: u32) -> Vec<FileId> {
        let mut found = Vec::new();
        if let Some(root) = &self.root {
            Self::search(root, hash, radius, &mut found);
        }
        found.sort();
        found.dedup();
        found
    }

    fn search(node: &BkNode, hash: Phash, radius: u32, found: &mut Vec<FileId>) {
        let d = node.hash.distance(hash);
        if d <= radius {
            found.extend_from_slice(&node.ids);
        }
        let low = d.saturating_sub(radius);
        let high = d + radius;
        for (key, child) in node.children.range(low..=high) {
            debug_assert!(*key >= low && *key <= high);
            Self::search(child, hash, radius, found);
        }
    }
}

impl Default for BkTree {
    fn default() -> Self {
        Self::new()
    }
}

fn photo_buckets(
    photos: &[&FileRecord],
    config: &EngineConfig,
    sets: &mut BTreeSet<(MediaKind, Vec<FileId>)>,
    dropped: &mut usize,
) {
    let hashed: Vec<(FileId, Phash, u64)> = photos
        .iter()
        .filter_map(|r| {
            let phash = r.signatures.as_ref()?.phash?;
            Some((r.file_id, phash, r.size))
        })
        .collect();
    if hashed.len() < 2 {
        return;
    }

    let sizes: HashMap<FileId, u64> = hashed.iter().map(|(id, _, size)| (*id, *size)).collect();
    let radius = config.phash_radius;

    if hashed.len() < config.bktree_linear_fallback_len {
        // Small input: a linear scan beats tree construction.
        log::debug!("phash index: linear scan over {} photos", hashed.len());
        for (id, phash, _) in &hashed {
            let mut ids: Vec<FileId> = hashed
                .iter()
                .filter(|(_, other, _)| phash.distance(*other) <= radius)
                .map(|(other_id, _, _)| *other_id)
                .collect();
            ids.sort();
            ids.dedup();
            debug_assert!(ids.contains(id));
            push_capped(MediaKind::Photo, ids, &sizes, config, sets, dropped);
        }
    } else {
        let mut tree = BkTree::new();
        for (id, phash, _) in &hashed {
            tree.insert(*phash, *id);
        }
        for (_, phash, _) in &hashed {
            let ids = tree.neighbors(*phash, radius);
            push_capped(MediaKind::Photo, ids, &sizes, config, sets, dropped);
        }
    }
}

// ============================================================================
// Video Buckets
// ============================================================================

fn video_buckets(
    videos: &[&FileRecord],
    config: &EngineConfig,
    sets: &mut BTreeSet<(MediaKind, Vec<FileId>)>,
    dropped: &mut usize,
) {
    let mut by_duration: BTreeMap<u64, Vec<(FileId, Phash, u64)>> = BTreeMap::new();
    for record in videos {
        let Some(bundle) = &record.signatures else {
            continue;
        };
        let Some(fp) = &bundle.video_fp else {
            continue;
        };
        let Some(first) = fp.first_frame() else {
            continue;
        };
        by_duration
            .entry(fp.duration_ms / DURATION_BUCKET_MS)
            .or_default()
            .push((record.file_id, first, record.size));
    }

    let radius = config.video_first_frame_radius;
    for bucket in by_duration.values() {
        if bucket.len() < 2 {
            continue;
        }
        let sizes: HashMap<FileId, u64> =
            bucket.iter().map(|(id, _, size)| (*id, *size)).collect();
        for (id, first, _) in bucket {
            let mut ids: Vec<FileId> = bucket
                .iter()
                .filter(|(_, other, _)| first.distance(*other) <= radius)
                .map(|(other_id, _, _)| *other_id)
                .collect();
            ids.sort();
            ids.dedup();
            debug_assert!(ids.contains(id));
            push_capped(MediaKind::Video, ids, &sizes, config, sets, dropped);
        }
    }
}

// ============================================================================
// Bucket Cap
// ============================================================================

/// Records a candidate set, splitting oversized buckets by size quartile.
/// Candidates separated by the split are never compared; the count of
/// dropped cross-pairs is reported for telemetry.
fn push_capped(
    kind: MediaKind,
    ids: Vec<FileId>,
    sizes: &HashMap<FileId, u64>,
    config: &EngineConfig,
    sets: &mut BTreeSet<(MediaKind, Vec<FileId>)>,
    dropped: &mut usize,
) {
    if ids.len() < 2 {
        return;
    }
    if ids.len() <= config.bucket_cap {
        sets.insert((kind, ids));
        return;
    }

    // Oversized: order by size, cut into quartiles.
    let mut ordered = ids;
    ordered.sort_by_key(|id| (sizes.get(id).copied().unwrap_or(0), *id));
    let quarter = ordered.len().div_ceil(4);
    let total_pairs = pair_count(ordered.len());
    let mut kept_pairs = 0usize;
    let mut inserted_any = false;
    for chunk in ordered.chunks(quarter.max(1)) {
        kept_pairs += pair_count(chunk.len());
        if chunk.len() >= 2 {
            let mut sub: Vec<FileId> = chunk.to_vec();
            sub.sort();
            inserted_any |= sets.insert((kind, sub));
        }
    }
    // Count the split once even when several queries rediscover it.
    if inserted_any {
        *dropped += total_pairs - kept_pairs;
    }
}

fn pair_count(n: usize) -> usize {
    n * (n.saturating_sub(1)) / 2
}

// ============================================================================
// Tests
// ============================================================================
