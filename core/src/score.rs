//! Pair scoring.
//!
//! Converts one candidate pair into a set of named signals with distances
//! and verdicts, then an overall verdict. Scoring is pure, deterministic
//! and side-effect free; the engine parallelizes it freely over buckets.
//!
//! Verdict rule: `accept` on a checksum match, or on at least one
//! perceptual accept with zero penalty signals. Anything else is
//! `neutral` and produces no clustering edge, so borderline perceptual
//! matches are suppressed by contradicting metadata.

use crate::store::FileRecord;
use crate::{EngineConfig, FileId, MediaKind};
use serde::{Deserialize, Serialize};

/// Rationale line emitted for exact content duplicates.
pub const CHECKSUM_RATIONALE: &str = "identical content (checksum match)";

/// Mean Earth radius in meters, for the Haversine distance.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Capture-time accept window in seconds, penalty threshold in seconds.
const CAPTURE_ACCEPT_S: i64 = 2;
const CAPTURE_PENALTY_S: i64 = 86_400;

/// GPS accept radius and penalty distance in meters.
const GPS_ACCEPT_M: f64 = 30.0;
const GPS_PENALTY_M: f64 = 1_000.0;

/// Jaro-Winkler filename similarity accept threshold.
const FILENAME_ACCEPT: f64 = 0.85;

/// Size ratio accept band.
const SIZE_ACCEPT_LOW: f64 = 0.8;
const SIZE_ACCEPT_HIGH: f64 = 1.25;

// ============================================================================
// Types
// ============================================================================

/// Named evidence kinds on a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ChecksumEqual,
    PhashDistance,
    VideoFpDistance,
    CaptureTimeDelta,
    GpsDelta,
    CameraModelMatch,
    FilenameSimilarity,
    SizeRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accept,
    Penalty,
    Neutral,
}

/// One piece of evidence on a pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    /// Distance or score in the signal's natural unit.
    pub value: f64,
    pub verdict: Verdict,
    pub rationale: String,
}

/// Scored pair: an unordered pair of same-kind files plus its signals.
///
/// Transient; never persisted. An accepted pair becomes one clustering
/// edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairScore {
    /// Smaller id first.
    pub a: FileId,
    pub b: FileId,
    pub kind: MediaKind,
    pub signals: Vec<Signal>,
    pub verdict: Verdict,
}

impl PairScore {
    pub fn is_accept(&self) -> bool {
        self.verdict == Verdict::Accept
    }

    pub fn is_checksum_match(&self) -> bool {
        self.signals
            .iter()
            .any(|s| s.kind == SignalKind::ChecksumEqual && s.verdict == Verdict::Accept)
    }

    /// Canonical ordering distance: checksum edges sort first (distance
    /// 0), otherwise the smallest accepted perceptual distance.
    pub fn primary_distance(&self) -> f64 {
        if self.is_checksum_match() {
            return 0.0;
        }
        self.signals
            .iter()
            .filter(|s| {
                matches!(
                    s.kind,
                    SignalKind::PhashDistance | SignalKind::VideoFpDistance
                ) && s.verdict == Verdict::Accept
            })
            .map(|s| s.value)
            .fold(f64::INFINITY, f64::min)
    }

    /// Rationale lines of all non-neutral signals.
    pub fn rationale_lines(&self) -> impl Iterator<Item = &str> {
        self.signals
            .iter()
            .filter(|s| s.verdict != Verdict::Neutral)
            .map(|s| s.rationale.as_str())
    }

    /// Synthesizes the score for a pair known to share a checksum,
    /// used by the bucket short-circuit.
    pub fn checksum_pair(a: FileId, b: FileId, kind: MediaKind) -> PairScore {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        PairScore {
            a,
            b,
            kind,
            signals: vec![Signal {
                kind: SignalKind::ChecksumEqual,
                value: 0.0,
                verdict: Verdict::Accept,
                rationale: CHECKSUM_RATIONALE.to_string(),
            }],
            verdict: Verdict::Accept,
        }
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// Scores one candidate pair.
///
/// Records lacking signature bundles contribute no perceptual or
/// metadata signals, so the pair can never reach an accept.
pub fn score_pair(a: &FileRecord, b: &FileRecord, config: &EngineConfig) -> PairScore {
    let (first, second) = if a.file_id <= b.file_id { (a, b) } else { (b, a) };
    let mut signals = Vec::new();

    if let (Some(sig_a), Some(sig_b)) = (&first.signatures, &second.signatures) {
        // Identical content needs no further evidence; the checksum
        // signal subsumes everything else.
        if sig_a.checksum == sig_b.checksum {
            return PairScore::checksum_pair(first.file_id, second.file_id, first.kind);
        }

        // Signals are evaluated in a fixed order so rationale output is
        // reproducible.
        if let (Some(ha), Some(hb)) = (sig_a.phash, sig_b.phash) {
            let d = ha.distance(hb);
            let verdict = if d <= config.phash_accept {
                Verdict::Accept
            } else if d > config.phash_accept * 2 {
                Verdict::Penalty
            } else {
                Verdict::Neutral
            };
            signals.push(Signal {
                kind: SignalKind::PhashDistance,
                value: f64::from(d),
                verdict,
                rationale: format!("phash_distance={}", d),
            });
        }

        if let (Some(fa), Some(fb)) = (&sig_a.video_fp, &sig_b.video_fp) {
            if let Some(avg) = fa.aligned_distance(fb) {
                let delta_ms = fa.duration_delta_ms(fb);
                let verdict = if avg <= f64::from(config.video_accept_avg_bits)
                    && delta_ms <= config.video_duration_tolerance_ms
                {
                    Verdict::Accept
                } else {
                    Verdict::Penalty
                };
                signals.push(Signal {
                    kind: SignalKind::VideoFpDistance,
                    value: avg,
                    verdict,
                    rationale: format!(
                        "video_fp_distance={:.1}bits duration_delta={}ms",
                        avg, delta_ms
                    ),
                });
            }
        }

        let meta_a = sig_a.meta.as_ref();
        let meta_b = sig_b.meta.as_ref();

        if let (Some(ta), Some(tb)) = (
            meta_a.and_then(|m| m.capture_unix()),
            meta_b.and_then(|m| m.capture_unix()),
        ) {
            let delta = (ta - tb).abs();
            let verdict = if delta <= CAPTURE_ACCEPT_S {
                Verdict::Accept
            } else if delta > CAPTURE_PENALTY_S {
                Verdict::Penalty
            } else {
                Verdict::Neutral
            };
            signals.push(Signal {
                kind: SignalKind::CaptureTimeDelta,
                value: delta as f64,
                verdict,
                rationale: format!("capture_time_delta={}", format_seconds(delta)),
            });
        }

        if let (Some(ma), Some(mb)) = (meta_a, meta_b) {
            if ma.has_gps() && mb.has_gps() {
                let meters = haversine_m(
                    ma.gps_lat.unwrap_or(0.0),
                    ma.gps_lon.unwrap_or(0.0),
                    mb.gps_lat.unwrap_or(0.0),
                    mb.gps_lon.unwrap_or(0.0),
                );
                let verdict = if meters <= GPS_ACCEPT_M {
                    Verdict::Accept
                } else if meters > GPS_PENALTY_M {
                    Verdict::Penalty
                } else {
                    Verdict::Neutral
                };
                signals.push(Signal {
                    kind: SignalKind::GpsDelta,
                    value: meters,
                    verdict,
                    rationale: format!("gps_delta={}", format_meters(meters)),
                });
            }

            if let (Some(model_a), Some(model_b)) = (&ma.camera_model, &mb.camera_model) {
                if !model_a.is_empty() && !model_b.is_empty() {
                    let (verdict, rationale) = if model_a == model_b {
                        (Verdict::Accept, format!("camera_model={}", model_a))
                    } else {
                        (
                            Verdict::Penalty,
                            format!("camera_model_mismatch: {} vs {}", model_a, model_b),
                        )
                    };
                    signals.push(Signal {
                        kind: SignalKind::CameraModelMatch,
                        value: if verdict == Verdict::Accept { 1.0 } else { 0.0 },
                        verdict,
                        rationale,
                    });
                }
            }
        }
    }

    // Filename and size are corroborative only: a resize or an export
    // legitimately changes both, so they may support a match but never
    // veto one.
    let similarity = filename_similarity(first, second);
    let verdict = if similarity >= FILENAME_ACCEPT {
        Verdict::Accept
    } else {
        Verdict::Neutral
    };
    signals.push(Signal {
        kind: SignalKind::FilenameSimilarity,
        value: similarity,
        verdict,
        rationale: format!("filename_similarity={:.2}", similarity),
    });

    if first.size > 0 && second.size > 0 {
        let ratio = first.size as f64 / second.size as f64;
        let verdict = if (SIZE_ACCEPT_LOW..=SIZE_ACCEPT_HIGH).contains(&ratio) {
            Verdict::Accept
        } else {
            Verdict::Neutral
        };
        signals.push(Signal {
            kind: SignalKind::SizeRatio,
            value: ratio,
            verdict,
            rationale: format!("size_ratio={:.2}", ratio),
        });
    }

    let verdict = overall_verdict(&signals);
    PairScore {
        a: first.file_id,
        b: second.file_id,
        kind: first.kind,
        signals,
        verdict,
    }
}

/// Checksum accept, or one perceptual accept with zero penalties.
fn overall_verdict(signals: &[Signal]) -> Verdict {
    let checksum = signals
        .iter()
        .any(|s| s.kind == SignalKind::ChecksumEqual && s.verdict == Verdict::Accept);
    if checksum {
        return Verdict::Accept;
    }
    let perceptual_accept = signals.iter().any(|s| {
        matches!(
            s.kind,
            SignalKind::PhashDistance | SignalKind::VideoFpDistance
        ) && s.verdict == Verdict::Accept
    });
    let penalties = signals.iter().filter(|s| s.verdict == Verdict::Penalty).count();
    if perceptual_accept && penalties == 0 {
        Verdict::Accept
    } else {
        Verdict::Neutral
    }
}

fn filename_similarity(a: &FileRecord, b: &FileRecord) -> f64 {
    let stem = |r: &FileRecord| {
        r.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    };
    strsim::jaro_winkler(&stem(a), &stem(b))
}

/// Great-circle distance between two WGS84 points, in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

fn format_seconds(seconds: i64) -> String {
    if seconds < 120 {
        format!("{}s", seconds)
    } else if seconds < 7200 {
        format!("{}m", seconds / 60)
    } else if seconds < 172_800 {
        format!("{}h", seconds / 3600)
    } else {
        format!("{}d", seconds / 86_400)
    }
}

fn format_meters(meters: f64) -> String {
    if meters < 1000.0 {
        format!("{:.0}m", meters)
    } else {
        format!("{:.0}km", meters / 1000.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
