//! Signature extraction.
//!
//! Turns a discovered file into its [`SignatureBundle`]: a mandatory
//! 256-bit streaming checksum, a perceptual hash for photos, an ordered
//! frame-hash fingerprint for videos, and normalized metadata. Extraction
//! runs on a bounded worker pool; per-file failures produce partial
//! bundles rather than terminating the scan.
//!
//! Failure semantics: malformed media yields a partial bundle (checksum
//! present, perceptual hash absent) and flags the record incomplete.
//! Transient I/O errors are retried up to 3 times with exponential
//! backoff. A per-file timeout is checked at stage boundaries.

use crate::meta::{self, MediaMeta};
use crate::phash::{Phash, VideoFingerprint};
use crate::store::MediaKind;
use crate::{DvojnikError, EngineConfig, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

/// Retry schedule for transient I/O failures.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(10),
    Duration::from_millis(50),
    Duration::from_millis(250),
];

/// Edge length of the normalized grayscale frame requested from video
/// decoders.
pub const FRAME_EDGE: u32 = 32;

// ============================================================================
// Signature Bundle
// ============================================================================

/// Per-file signature set.
///
/// `checksum` is mandatory whenever a bundle exists; the perceptual
/// members are present only for the media kinds and files they apply to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureBundle {
    /// 256-bit BLAKE3 content hash, lowercase hex.
    pub checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phash: Option<Phash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_fp: Option<VideoFingerprint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<MediaMeta>,
}

impl SignatureBundle {
    pub fn checksum_only(checksum: String) -> SignatureBundle {
        SignatureBundle {
            checksum,
            phash: None,
            video_fp: None,
            meta: None,
        }
    }
}

/// Outcome of extracting one file.
#[derive(Debug)]
pub struct Extraction {
    pub bundle: SignatureBundle,
    /// Set when any stage beyond the checksum failed.
    pub incomplete: bool,
    /// The failure that made the bundle partial, when any.
    pub error: Option<DvojnikError>,
}

// ============================================================================
// Video Decoder Seam
// ============================================================================

/// Frame access for video fingerprinting.
///
/// The production implementation shells out to ffmpeg; tests supply a
/// synthetic decoder so the pipeline stays deterministic and offline.
pub trait VideoDecoder: Send + Sync {
    /// Total duration in milliseconds.
    fn probe_duration_ms(&self, path: &Path) -> Result<u64>;

    /// Grayscale frame at the given offset, normalized to
    /// [`FRAME_EDGE`]² pixels.
    fn frame_at(&self, path: &Path, at_ms: u64) -> Result<image::GrayImage>;
}

/// Decoder backed by the `ffprobe`/`ffmpeg` binaries.
#[derive(Debug, Default)]
pub struct FfmpegDecoder;

impl VideoDecoder for FfmpegDecoder {
    fn probe_duration_ms(&self, path: &Path) -> Result<u64> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "csv=p=0",
            ])
            .arg(path)
            .output()
            .map_err(|e| DvojnikError::Io {
                message: format!("ffprobe unavailable: {}", e),
            })?;
        if !output.status.success() {
            return Err(DvojnikError::CorruptMedia {
                path: path.display().to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let seconds: f64 = text.trim().parse().map_err(|_| DvojnikError::CorruptMedia {
            path: path.display().to_string(),
            message: format!("unparseable duration {:?}", text.trim()),
        })?;
        Ok((seconds * 1000.0).round() as u64)
    }

    fn frame_at(&self, path: &Path, at_ms: u64) -> Result<image::GrayImage> {
        let seek_s = at_ms as f64 / 1000.0;
        let output = Command::new("ffmpeg")
            .args(["-v", "error", "-ss", &format!("{:.3}", seek_s), "-i"])
            .arg(path)
            .args([
                "-frames:v",
                "1",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "gray",
                "-s",
                &format!("{}x{}", FRAME_EDGE, FRAME_EDGE),
                "-",
            ])
            .output()
            .map_err(|e| DvojnikError::Io {
                message: format!("ffmpeg unavailable: {}", e),
            })?;
        if !output.status.success() {
            return Err(DvojnikError::CorruptMedia {
                path: path.display().to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        image::GrayImage::from_raw(FRAME_EDGE, FRAME_EDGE, output.stdout).ok_or_else(|| {
            DvojnikError::CorruptMedia {
                path: path.display().to_string(),
                message: "short frame read".to_string(),
            }
        })
    }
}

// ============================================================================
// Extractor
// ============================================================================

/// Stateless per-file extractor; safe to share across worker threads.
pub struct Extractor {
    config: EngineConfig,
    decoder: std::sync::Arc<dyn VideoDecoder>,
}

impl Extractor {
    pub fn new(config: EngineConfig, decoder: std::sync::Arc<dyn VideoDecoder>) -> Extractor {
        Extractor { config, decoder }
    }

    /// Extracts the signature bundle for one file.
    ///
    /// # Errors
    ///
    /// Returns an error only when even the checksum cannot be computed
    /// (after retries); any later stage failure is captured inside the
    /// returned [`Extraction`].
    pub fn extract(&self, path: &Path, kind: MediaKind) -> Result<Extraction> {
        let deadline = Instant::now() + Duration::from_millis(self.config.extraction_timeout_ms);

        let checksum = with_retries(|| compute_checksum(path))?;
        let mut bundle = SignatureBundle::checksum_only(checksum);
        let mut failure: Option<DvojnikError> = None;

        match kind {
            MediaKind::Photo => {
                self.extract_photo(path, deadline, &mut bundle, &mut failure);
            }
            MediaKind::Video => {
                self.extract_video(path, deadline, &mut bundle, &mut failure);
            }
            MediaKind::Sidecar => {
                // Checksum only; metadata parsed for the primary file.
                bundle.meta = parse_sidecar_meta(path);
            }
            MediaKind::Other => {}
        }

        if let Some(err) = &failure {
            log::warn!("partial signature for {}: {}", path.display(), err);
        }
        Ok(Extraction {
            incomplete: failure.is_some(),
            error: failure,
            bundle,
        })
    }

    fn extract_photo(
        &self,
        path: &Path,
        deadline: Instant,
        bundle: &mut SignatureBundle,
        failure: &mut Option<DvojnikError>,
    ) {
        let mut media_meta = match meta::read_exif(path) {
            Ok(m) => m,
            Err(err) => {
                *failure = Some(err);
                MediaMeta::default()
            }
        };

        if let Err(err) = check_deadline(path, deadline) {
            *failure = Some(err);
            bundle.meta = Some(media_meta);
            return;
        }

        match image::open(path) {
            Ok(img) => {
                let oriented = apply_orientation(img, media_meta.orientation.unwrap_or(1));
                if media_meta.width.is_none() {
                    media_meta.width = Some(oriented.width());
                    media_meta.height = Some(oriented.height());
                }
                bundle.phash = Some(Phash::from_gray(&oriented.to_luma8()));
            }
            Err(err) => {
                *failure = Some(DvojnikError::CorruptMedia {
                    path: path.display().to_string(),
                    message: err.to_string(),
                });
            }
        }

        if media_meta.codec.is_none() {
            media_meta.codec = extension_codec(path);
        }
        bundle.meta = Some(media_meta);
    }

    fn extract_video(
        &self,
        path: &Path,
        deadline: Instant,
        bundle: &mut SignatureBundle,
        failure: &mut Option<DvojnikError>,
    ) {
        let duration_ms = match self.decoder.probe_duration_ms(path) {
            Ok(d) => d,
            Err(err) => {
                *failure = Some(err);
                return;
            }
        };

        let samples = self.config.video_frame_samples;
        let mut frames = Vec::with_capacity(samples);
        for i in 0..samples {
            if let Err(err) = check_deadline(path, deadline) {
                *failure = Some(err);
                break;
            }
            // Fixed fractional offsets: midpoints of equal slices.
            let at_ms = duration_ms * (2 * i as u64 + 1) / (2 * samples as u64);
            match self.decoder.frame_at(path, at_ms) {
                Ok(frame) => frames.push(Phash::from_gray(&frame)),
                Err(err) => {
                    *failure = Some(err);
                    break;
                }
            }
        }

        if !frames.is_empty() {
            bundle.video_fp = Some(VideoFingerprint {
                frames,
                duration_ms,
            });
        }
        bundle.meta = Some(MediaMeta {
            codec: extension_codec(path),
            ..MediaMeta::default()
        });
    }
}

fn check_deadline(path: &Path, deadline: Instant) -> Result<()> {
    if Instant::now() >= deadline {
        Err(DvojnikError::Io {
            message: format!("extraction timed out: {}", path.display()),
        })
    } else {
        Ok(())
    }
}

fn extension_codec(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// Streaming BLAKE3 over the raw bytes, 8 KiB chunks.
pub fn compute_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| DvojnikError::from_io_with_path(Some(path.to_path_buf()), e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| DvojnikError::from_io_with_path(Some(path.to_path_buf()), e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Parses metadata out of a sidecar file. XMP parsing is limited to the
/// JSON sidecars Dvojník itself writes; foreign XMP is checksummed only.
fn parse_sidecar_meta(path: &Path) -> Option<MediaMeta> {
    if path.extension()?.to_string_lossy().to_lowercase() != "json" {
        return None;
    }
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str::<MediaMeta>(&text).ok()
}

/// Applies the EXIF orientation (1-8) so perceptual hashes are computed
/// over canonical pixels.
pub fn apply_orientation(img: DynamicImage, orientation: u8) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Runs `op`, retrying transient I/O failures up to 3 times with
/// exponential backoff.
fn with_retries<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < RETRY_DELAYS.len() => {
                log::debug!("transient failure (attempt {}): {}", attempt + 1, err);
                std::thread::sleep(RETRY_DELAYS[attempt]);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
