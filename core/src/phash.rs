//! Perceptual hashing.
//!
//! A 64-bit difference hash over canonical normalized pixels: EXIF
//! orientation applied by the caller, grayscale, fixed 9×8 downsample.
//! Visually similar images land within a few bits of Hamming distance.
//! Video fingerprints are ordered sequences of frame hashes compared by
//! their best aligned overlap.

use image::imageops::FilterType;
use image::GrayImage;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Downsample grid: 9 columns compared pairwise into 8 bits per row.
const HASH_WIDTH: u32 = 9;
const HASH_HEIGHT: u32 = 8;

/// 64-bit perceptual difference hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Phash(pub u64);

impl Phash {
    /// Computes the difference hash of an orientation-normalized grayscale
    /// image.
    ///
    /// The image is resized to a fixed 9×8 grid (Triangle filter, so the
    /// result is deterministic for identical input pixels) and each bit
    /// records whether brightness increases between horizontal neighbors.
    pub fn from_gray(img: &GrayImage) -> Phash {
        let small = image::imageops::resize(img, HASH_WIDTH, HASH_HEIGHT, FilterType::Triangle);
        let mut bits: u64 = 0;
        for y in 0..HASH_HEIGHT {
            for x in 0..HASH_WIDTH - 1 {
                bits <<= 1;
                if small.get_pixel(x, y)[0] < small.get_pixel(x + 1, y)[0] {
                    bits |= 1;
                }
            }
        }
        Phash(bits)
    }

    /// Hamming distance in bits.
    pub fn distance(self, other: Phash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for Phash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for Phash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phash({:016x})", self.0)
    }
}

impl Serialize for Phash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Phash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        u64::from_str_radix(&s, 16)
            .map(Phash)
            .map_err(|_| de::Error::custom(format!("invalid phash {:?}", s)))
    }
}

/// Ordered frame hashes plus duration for one video.
///
/// Frames are sampled at fixed fractional offsets of the duration, so two
/// encodes of the same footage produce comparable sequences even when
/// their frame counts differ slightly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFingerprint {
    pub frames: Vec<Phash>,
    pub duration_ms: u64,
}

impl VideoFingerprint {
    /// First sampled frame, used as a cheap bucket prefilter.
    pub fn first_frame(&self) -> Option<Phash> {
        self.frames.first().copied()
    }

    /// Average Hamming distance over the best aligned overlap of the two
    /// frame sequences.
    ///
    /// The shorter sequence slides over the longer one; the minimum mean
    /// distance across all full-overlap alignments wins. `None` when
    /// either fingerprint has no frames.
    pub fn aligned_distance(&self, other: &VideoFingerprint) -> Option<f64> {
        let (short, long) = if self.frames.len() <= other.frames.len() {
            (&self.frames, &other.frames)
        } else {
            (&other.frames, &self.frames)
        };
        if short.is_empty() {
            return None;
        }
        let mut best: Option<f64> = None;
        for offset in 0..=(long.len() - short.len()) {
            let sum: u32 = short
                .iter()
                .zip(&long[offset..offset + short.len()])
                .map(|(a, b)| a.distance(*b))
                .sum();
            let avg = f64::from(sum) / short.len() as f64;
            best = Some(match best {
                Some(b) if b <= avg => b,
                _ => avg,
            });
        }
        best
    }

    /// Absolute duration difference in milliseconds.
    pub fn duration_delta_ms(&self, other: &VideoFingerprint) -> u64 {
        self.duration_ms.abs_diff(other.duration_ms)
    }
}
