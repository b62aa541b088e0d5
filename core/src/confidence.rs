//! Confidence engine.
//!
//! Folds the scored pairs of a group into one confidence value in
//! [0, 1], a deduplicated sorted rationale, and a deterministic keeper
//! suggestion. Weights come from configuration; a checksum-equal pair
//! scores exactly 1.0 and overrides every other signal.

use crate::cluster::{ClusteredGroup, DuplicateGroup};
use crate::config::ConfidenceWeights;
use crate::score::{PairScore, SignalKind, Verdict};
use crate::store::{FileRecord, MediaKind};
use crate::FileId;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::Path;

/// Annotates a clustered group in place: confidence, rationale lines and
/// suggested keeper.
///
/// `members` must hold one record per group member. The keeper ranking
/// is a pure function of the records, so adding an unrelated member
/// never changes the winner among the existing ones.
pub fn annotate(
    clustered: &mut ClusteredGroup,
    members: &[&FileRecord],
    weights: &ConfidenceWeights,
) {
    let group = &mut clustered.group;
    group.confidence = group_confidence(&clustered.pairs, weights);
    group.rationale_lines = rationale_lines(&clustered.pairs);
    group.suggested_keeper = suggest_keeper(members);
}

// ============================================================================
// Confidence
// ============================================================================

/// Mean pair score over the scored pairs of the group.
///
/// An all-checksum group is exactly 1.0. Pairs that never met in any
/// candidate bucket contribute no term.
pub fn group_confidence(pairs: &[PairScore], weights: &ConfidenceWeights) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    if pairs.iter().all(PairScore::is_checksum_match) {
        return 1.0;
    }
    let sum: f64 = pairs.iter().map(|p| pair_score(p, weights)).sum();
    (sum / pairs.len() as f64).clamp(0.0, 1.0)
}

/// Score of one pair: checksum overrides everything at exactly 1.0;
/// otherwise accepted signal weights minus a penalty term per penalty
/// signal, clamped to [0, 1].
pub fn pair_score(pair: &PairScore, weights: &ConfidenceWeights) -> f64 {
    if pair.is_checksum_match() {
        return 1.0;
    }
    let mut score = 0.0;
    for signal in &pair.signals {
        match signal.verdict {
            Verdict::Accept => score += signal_weight(signal.kind, weights),
            Verdict::Penalty => score -= weights.penalty,
            Verdict::Neutral => {}
        }
    }
    score.clamp(0.0, 1.0)
}

fn signal_weight(kind: SignalKind, weights: &ConfidenceWeights) -> f64 {
    match kind {
        SignalKind::ChecksumEqual => weights.checksum_equal,
        SignalKind::PhashDistance => weights.phash,
        SignalKind::VideoFpDistance => weights.video_fp,
        SignalKind::CaptureTimeDelta => weights.capture_time,
        SignalKind::GpsDelta => weights.gps,
        SignalKind::CameraModelMatch => weights.camera_model,
        SignalKind::FilenameSimilarity => weights.filename,
        SignalKind::SizeRatio => weights.size_ratio,
    }
}

/// Deduplicated, sorted rationale lines from all non-neutral signals.
fn rationale_lines(pairs: &[PairScore]) -> Vec<String> {
    let unique: BTreeSet<&str> = pairs.iter().flat_map(PairScore::rationale_lines).collect();
    unique.into_iter().map(str::to_string).collect()
}

// ============================================================================
// Keeper Suggestion
// ============================================================================

/// Preferred-format order: RAW > PNG > TIFF > HEIC > JPEG > others.
fn format_rank(path: &Path) -> u8 {
    if MediaKind::is_raw(path) {
        return 0;
    }
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("png") => 1,
        Some("tiff" | "tif") => 2,
        Some("heic" | "heif") => 3,
        Some("jpg" | "jpeg") => 4,
        _ => 5,
    }
}

/// Effective resolution: pixel count for photos; frame area times
/// duration for videos.
fn resolution_score(record: &FileRecord) -> u64 {
    let meta = record
        .signatures
        .as_ref()
        .and_then(|s| s.meta.as_ref());
    let pixels = meta.and_then(|m| m.pixels()).unwrap_or(0);
    match record.kind {
        MediaKind::Video => {
            let duration = record
                .signatures
                .as_ref()
                .and_then(|s| s.video_fp.as_ref())
                .map(|fp| fp.duration_ms)
                .unwrap_or(0);
            pixels.max(1).saturating_mul(duration)
        }
        _ => pixels,
    }
}

fn completeness(record: &FileRecord) -> f64 {
    record
        .signatures
        .as_ref()
        .and_then(|s| s.meta.as_ref())
        .map(|m| m.completeness())
        .unwrap_or(0.0)
}

fn capture_unix(record: &FileRecord) -> Option<i64> {
    record
        .signatures
        .as_ref()
        .and_then(|s| s.meta.as_ref())
        .and_then(|m| m.capture_unix())
}

/// Ranks members and returns the suggested keeper.
///
/// Order: highest resolution, largest size, preferred format, metadata
/// completeness, earliest capture time, lexicographically smallest path.
/// The ranking must be reproduced exactly run over run.
pub fn suggest_keeper(members: &[&FileRecord]) -> Option<FileId> {
    members
        .iter()
        .min_by(|x, y| keeper_order(x, y))
        .map(|r| r.file_id)
}

fn keeper_order(x: &FileRecord, y: &FileRecord) -> Ordering {
    resolution_score(y)
        .cmp(&resolution_score(x))
        .then(y.size.cmp(&x.size))
        .then(format_rank(&x.path).cmp(&format_rank(&y.path)))
        .then(completeness(y).total_cmp(&completeness(x)))
        .then_with(|| match (capture_unix(x), capture_unix(y)) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| x.path.cmp(&y.path))
}

/// Convenience for tests and the engine: annotate and return the group.
pub fn annotated_group(
    mut clustered: ClusteredGroup,
    members: &[&FileRecord],
    weights: &ConfidenceWeights,
) -> DuplicateGroup {
    annotate(&mut clustered, members, weights);
    clustered.group
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::SignatureBundle;
    use crate::meta::MediaMeta;
    use crate::phash::Phash;
    use crate::score::{Signal, CHECKSUM_RATIONALE};
    use crate::{GroupId, MediaKind};
    use std::path::PathBuf;

    fn weights() -> ConfidenceWeights {
        ConfidenceWeights::default()
    }

    fn record(id: u128, name: &str, size: u64, meta: MediaMeta) -> FileRecord {
        FileRecord {
            file_id: FileId(id),
            path: PathBuf::from(format!("/photos/{}", name)),
            size,
            mtime_ns: 0,
            kind: MediaKind::Photo,
            signatures: Some(SignatureBundle {
                checksum: format!("c{}", id),
                phash: Some(Phash(0)),
                video_fp: None,
                meta: Some(meta),
            }),
            incomplete: false,
        }
    }

    fn dims(width: u32, height: u32) -> MediaMeta {
        MediaMeta {
            width: Some(width),
            height: Some(height),
            ..MediaMeta::default()
        }
    }

    fn signal(kind: SignalKind, verdict: Verdict, rationale: &str) -> Signal {
        Signal {
            kind,
            value: 0.0,
            verdict,
            rationale: rationale.to_string(),
        }
    }

    fn pair(a: u128, b: u128, signals: Vec<Signal>, verdict: Verdict) -> PairScore {
        PairScore {
            a: FileId(a),
            b: FileId(b),
            kind: MediaKind::Photo,
            signals,
            verdict,
        }
    }

    fn clustered(members: Vec<u128>, pairs: Vec<PairScore>) -> ClusteredGroup {
        let members: Vec<FileId> = members.into_iter().map(FileId).collect();
        ClusteredGroup {
            group: DuplicateGroup {
                group_id: GroupId::from_members(&members),
                kind: MediaKind::Photo,
                members,
                confidence: 0.0,
                rationale_lines: Vec::new(),
                suggested_keeper: None,
                incomplete: false,
            },
            pairs,
        }
    }

    #[test]
    fn test_exact_copy_scenario() {
        // a.jpg / a_copy.jpg, identical bytes.
        let a = record(1, "a.jpg", 100, MediaMeta::default());
        let b = record(2, "a_copy.jpg", 100, MediaMeta::default());
        let checksum_pair = PairScore::checksum_pair(FileId(1), FileId(2), MediaKind::Photo);
        let group = annotated_group(
            clustered(vec![1, 2], vec![checksum_pair]),
            &[&a, &b],
            &weights(),
        );

        assert_eq!(group.confidence, 1.0);
        assert_eq!(group.rationale_lines, vec![CHECKSUM_RATIONALE.to_string()]);
        // Equal resolution/size/format: smaller path wins, i.e. a.jpg.
        assert_eq!(group.suggested_keeper, Some(FileId(1)));
    }

    #[test]
    fn test_resized_variant_scenario() {
        // phash accept (0.55) + capture time accept (0.15) = 0.70.
        let orig = record(1, "orig.jpg", 3_100_000, dims(4000, 3000));
        let small = record(2, "small.jpg", 120_000, dims(800, 600));
        let signals = vec![
            signal(SignalKind::PhashDistance, Verdict::Accept, "phash_distance=3"),
            signal(
                SignalKind::CaptureTimeDelta,
                Verdict::Accept,
                "capture_time_delta=0s",
            ),
        ];
        let group = annotated_group(
            clustered(vec![1, 2], vec![pair(1, 2, signals, Verdict::Accept)]),
            &[&orig, &small],
            &weights(),
        );

        assert!((group.confidence - 0.70).abs() < 1e-9, "{}", group.confidence);
        assert_eq!(group.suggested_keeper, Some(FileId(1)));
        assert!(group
            .rationale_lines
            .contains(&"phash_distance=3".to_string()));
        assert!(group
            .rationale_lines
            .contains(&"capture_time_delta=0s".to_string()));
    }

    #[test]
    fn test_penalty_subtracts_and_clamps() {
        let signals = vec![
            signal(SignalKind::PhashDistance, Verdict::Accept, "phash_distance=4"),
            signal(SignalKind::GpsDelta, Verdict::Penalty, "gps_delta=5km"),
            signal(
                SignalKind::CaptureTimeDelta,
                Verdict::Penalty,
                "capture_time_delta=30d",
            ),
        ];
        let score = pair_score(&pair(1, 2, signals, Verdict::Neutral), &weights());
        assert!((score - 0.15).abs() < 1e-9, "{}", score);

        let all_penalties = vec![
            signal(SignalKind::GpsDelta, Verdict::Penalty, "gps_delta=5km"),
            signal(
                SignalKind::CaptureTimeDelta,
                Verdict::Penalty,
                "capture_time_delta=30d",
            ),
        ];
        let score = pair_score(&pair(1, 2, all_penalties, Verdict::Neutral), &weights());
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_checksum_pair_overrides_penalties() {
        let mut p = PairScore::checksum_pair(FileId(1), FileId(2), MediaKind::Photo);
        p.signals.push(signal(
            SignalKind::CaptureTimeDelta,
            Verdict::Penalty,
            "capture_time_delta=30d",
        ));
        assert_eq!(pair_score(&p, &weights()), 1.0);
    }

    #[test]
    fn test_mixed_group_averages_pairs() {
        let checksum = PairScore::checksum_pair(FileId(1), FileId(2), MediaKind::Photo);
        let perceptual = pair(
            2,
            3,
            vec![signal(
                SignalKind::PhashDistance,
                Verdict::Accept,
                "phash_distance=2",
            )],
            Verdict::Accept,
        );
        let confidence = group_confidence(&[checksum, perceptual], &weights());
        // (1.0 + 0.55) / 2
        assert!((confidence - 0.775).abs() < 1e-9, "{}", confidence);
    }

    #[test]
    fn test_rationale_deduplicated_and_sorted() {
        let p1 = pair(
            1,
            2,
            vec![signal(SignalKind::PhashDistance, Verdict::Accept, "phash_distance=3")],
            Verdict::Accept,
        );
        let p2 = pair(
            2,
            3,
            vec![
                signal(SignalKind::PhashDistance, Verdict::Accept, "phash_distance=3"),
                signal(SignalKind::CameraModelMatch, Verdict::Accept, "camera_model=X"),
            ],
            Verdict::Accept,
        );
        let lines = rationale_lines(&[p1, p2]);
        assert_eq!(lines, vec!["camera_model=X", "phash_distance=3"]);
    }

    #[test]
    fn test_keeper_prefers_resolution_then_size_then_format() {
        let big = record(1, "b_big.jpg", 100, dims(4000, 3000));
        let small = record(2, "a_small.jpg", 5000, dims(800, 600));
        assert_eq!(suggest_keeper(&[&small, &big]), Some(FileId(1)));

        // Equal resolution: larger size wins.
        let heavy = record(3, "heavy.jpg", 9000, dims(1000, 1000));
        let light = record(4, "light.jpg", 100, dims(1000, 1000));
        assert_eq!(suggest_keeper(&[&light, &heavy]), Some(FileId(3)));

        // Equal resolution and size: RAW beats JPEG.
        let raw = record(5, "shot.nef", 100, dims(1000, 1000));
        let jpeg = record(6, "shot.jpg", 100, dims(1000, 1000));
        assert_eq!(suggest_keeper(&[&jpeg, &raw]), Some(FileId(5)));
    }

    #[test]
    fn test_keeper_final_tie_break_is_path() {
        let a = record(1, "a.jpg", 100, MediaMeta::default());
        let b = record(2, "b.jpg", 100, MediaMeta::default());
        assert_eq!(suggest_keeper(&[&b, &a]), Some(FileId(1)));
    }

    #[test]
    fn test_keeper_stable_under_unrelated_member() {
        let orig = record(1, "orig.jpg", 3_100_000, dims(4000, 3000));
        let small = record(2, "small.jpg", 120_000, dims(800, 600));
        let keeper_before = suggest_keeper(&[&orig, &small]);

        let unrelated = record(3, "tiny.jpg", 10, dims(10, 10));
        let keeper_after = suggest_keeper(&[&orig, &small, &unrelated]);
        assert_eq!(keeper_before, keeper_after);
    }

    #[test]
    fn test_video_resolution_uses_duration() {
        use crate::phash::VideoFingerprint;
        let make = |id: u128, duration_ms: u64| {
            let mut r = record(id, &format!("v{}.mp4", id), 100, dims(1920, 1080));
            r.kind = MediaKind::Video;
            if let Some(sig) = r.signatures.as_mut() {
                sig.video_fp = Some(VideoFingerprint {
                    frames: vec![Phash(0)],
                    duration_ms,
                });
            }
            r
        };
        let long = make(1, 60_000);
        let short = make(2, 5_000);
        assert_eq!(suggest_keeper(&[&short, &long]), Some(FileId(1)));
    }

    #[test]
    fn test_empty_pairs_zero_confidence() {
        assert_eq!(group_confidence(&[], &weights()), 0.0);
    }
}
