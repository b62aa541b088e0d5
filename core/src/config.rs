//! Engine configuration.
//!
//! Every tunable recognized by the pipeline lives in [`EngineConfig`],
//! loaded from `config.json` in the application data directory. A missing
//! file means defaults; unknown keys are rejected so typos surface instead
//! of silently reverting to defaults.

use crate::meta::MetaField;
use crate::{DvojnikError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Signal weights for the confidence model.
///
/// A checksum-equal pair scores exactly 1.0 and overrides everything else.
/// Each penalty signal subtracts `penalty`; pair scores clamp to [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConfidenceWeights {
    pub checksum_equal: f64,
    pub phash: f64,
    pub video_fp: f64,
    pub capture_time: f64,
    pub gps: f64,
    pub camera_model: f64,
    pub filename: f64,
    pub size_ratio: f64,
    /// Subtracted once per penalty signal.
    pub penalty: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            checksum_equal: 1.0,
            phash: 0.55,
            video_fp: 0.6,
            capture_time: 0.15,
            gps: 0.15,
            camera_model: 0.05,
            filename: 0.05,
            size_ratio: 0.05,
            penalty: 0.2,
        }
    }
}

/// User-tunable thresholds, weights and concurrency caps.
///
/// Persisted as `config.json`; every field has the documented default and
/// serializes under the same name it is documented by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// BK-tree neighbor radius for photo phash candidates, in bits.
    pub phash_radius: u32,
    /// Accept threshold for the phash_distance signal, in bits.
    pub phash_accept: u32,
    /// Frames sampled per video at fixed fractional offsets.
    pub video_frame_samples: usize,
    /// Accept threshold for the average aligned frame distance, in bits.
    pub video_accept_avg_bits: u32,
    /// Maximum duration delta for a video accept, in milliseconds.
    pub video_duration_tolerance_ms: u64,
    /// First-frame phash prefilter radius inside a duration bucket, in bits.
    pub video_first_frame_radius: u32,
    /// Maximum candidate bucket size before splitting by size quartile.
    pub bucket_cap: usize,
    /// Extraction worker count; `null` means auto (min(cpu_count, 8)).
    pub extraction_parallelism: Option<usize>,
    /// Below this many photos the candidate index skips BK-tree
    /// construction and scans linearly.
    pub bktree_linear_fallback_len: usize,
    /// Cluster-build time budget before returning a truncated partition.
    pub cluster_time_budget_ms: u64,
    /// Per-file extraction timeout, checked at stage boundaries.
    pub extraction_timeout_ms: u64,
    /// Merge/undo execution timeout.
    pub execute_timeout_ms: u64,
    /// Signal weights for the confidence model.
    pub confidence_weights: ConfidenceWeights,
    /// Prefer the platform trash over the app-owned recycle directory.
    pub move_to_trash: bool,
    /// Days after which transactions with no remaining recycle payload
    /// are purged from the log.
    pub undo_retention_days: u32,
    /// Metadata fields a merge may overwrite even when the keeper's field
    /// is non-empty. Empty by default.
    pub force_overwrite_fields: BTreeSet<MetaField>,
    /// Enumeration suspends while this many records await extraction.
    pub max_pending_signatures: usize,
    /// Scoring suspends while this many edges await clustering.
    pub max_pending_edges: usize,
    /// Glob patterns excluded from enumeration (e.g. `**/.cache/**`).
    pub ignore_globs: Vec<String>,
    /// Traverse hidden files and directories. Off by default.
    pub include_hidden: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            phash_radius: 8,
            phash_accept: 5,
            video_frame_samples: 9,
            video_accept_avg_bits: 6,
            video_duration_tolerance_ms: 2000,
            video_first_frame_radius: 10,
            bucket_cap: 256,
            extraction_parallelism: None,
            bktree_linear_fallback_len: 64,
            cluster_time_budget_ms: 60_000,
            extraction_timeout_ms: 30_000,
            execute_timeout_ms: 120_000,
            confidence_weights: ConfidenceWeights::default(),
            move_to_trash: true,
            undo_retention_days: 7,
            force_overwrite_fields: BTreeSet::new(),
            max_pending_signatures: 1024,
            max_pending_edges: 4096,
            ignore_globs: Vec::new(),
            include_hidden: false,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from `config.json`, falling back to defaults
    /// when the file does not exist.
    ///
    /// # Errors
    ///
    /// - `DvojnikError::User` if the file exists but fails to parse or
    ///   contains unknown keys
    /// - I/O-kind errors when the file exists but cannot be read
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .map_err(|e| DvojnikError::from_io_with_path(Some(path.to_path_buf()), e))?;
        serde_json::from_str(&text).map_err(|e| DvojnikError::User {
            message: format!("Invalid config {}: {}", path.display(), e),
        })
    }

    /// Writes configuration atomically (temp file, fsync, rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp)
            .map_err(|e| DvojnikError::from_io_with_path(Some(tmp.clone()), e))?;
        file.write_all(json.as_bytes())
            .map_err(|e| DvojnikError::from_io_with_path(Some(tmp.clone()), e))?;
        file.sync_all()
            .map_err(|e| DvojnikError::from_io_with_path(Some(tmp.clone()), e))?;
        fs::rename(&tmp, path)
            .map_err(|e| DvojnikError::from_io_with_path(Some(path.to_path_buf()), e))?;
        Ok(())
    }

    /// Effective extraction worker count: the configured value, or
    /// min(cpu_count, 8) when set to auto. Never zero.
    pub fn effective_parallelism(&self) -> usize {
        self.extraction_parallelism
            .unwrap_or_else(|| num_cpus::get().min(8))
            .max(1)
    }

    /// Validates ranges that would otherwise wedge the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.video_frame_samples == 0 {
            return Err(DvojnikError::User {
                message: "video_frame_samples must be at least 1".to_string(),
            });
        }
        if self.bucket_cap < 2 {
            return Err(DvojnikError::User {
                message: "bucket_cap must be at least 2".to_string(),
            });
        }
        if self.max_pending_signatures == 0 || self.max_pending_edges == 0 {
            return Err(DvojnikError::User {
                message: "backpressure queue bounds must be positive".to_string(),
            });
        }
        Ok(())
    }
}
