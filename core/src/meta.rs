//! Normalized media metadata.
//!
//! EXIF and container metadata reduced to one flat, comparable form:
//! capture time, GPS position, camera model, pixel dimensions, codec,
//! keywords. Extraction tolerates absent or malformed EXIF; every field
//! is optional.

use crate::{DvojnikError, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Metadata fields addressable by merge plans and overwrite options.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MetaField {
    CaptureTime,
    Gps,
    Keywords,
    Orientation,
    CameraModel,
    Title,
    Description,
}

impl MetaField {
    pub fn as_str(self) -> &'static str {
        match self {
            MetaField::CaptureTime => "capture_time",
            MetaField::Gps => "gps",
            MetaField::Keywords => "keywords",
            MetaField::Orientation => "orientation",
            MetaField::CameraModel => "camera_model",
            MetaField::Title => "title",
            MetaField::Description => "description",
        }
    }
}

/// A concrete value for one metadata field, as written by a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Time(Timestamp),
    Gps {
        lat: f64,
        lon: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        alt: Option<f64>,
    },
    Keywords(Vec<String>),
    Orientation(u8),
}

/// Normalized per-file metadata.
///
/// Populated from EXIF for photos and from the container probe for
/// videos; sidecar files contribute metadata to their primary file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMeta {
    /// Capture time (EXIF DateTimeOriginal), RFC3339, assumed UTC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_time: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gps_lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gps_lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gps_alt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_make: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    /// EXIF orientation, 1-8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orientation: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub keywords: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl MediaMeta {
    /// Capture time as Unix seconds, when present and parseable.
    pub fn capture_unix(&self) -> Option<i64> {
        let text = self.capture_time.as_deref()?;
        OffsetDateTime::parse(text, &time::format_description::well_known::Rfc3339)
            .ok()
            .map(|t| t.unix_timestamp())
    }

    /// Pixel count, when dimensions are known.
    pub fn pixels(&self) -> Option<u64> {
        Some(u64::from(self.width?) * u64::from(self.height?))
    }

    /// Count of populated GPS components; used by the merge matrix to
    /// pick the most complete position.
    pub fn gps_completeness(&self) -> u32 {
        [self.gps_lat, self.gps_lon, self.gps_alt]
            .iter()
            .filter(|c| c.is_some())
            .count() as u32
    }

    pub fn has_gps(&self) -> bool {
        self.gps_lat.is_some() && self.gps_lon.is_some()
    }

    /// Fraction of populated normalized fields, in [0, 1].
    ///
    /// Drives the metadata-completeness rank of keeper suggestion.
    pub fn completeness(&self) -> f64 {
        let populated = [
            self.capture_time.is_some(),
            self.gps_lat.is_some(),
            self.gps_lon.is_some(),
            self.camera_make.is_some(),
            self.camera_model.is_some(),
            self.width.is_some(),
            self.height.is_some(),
            self.codec.is_some(),
            self.orientation.is_some(),
            !self.keywords.is_empty(),
            self.title.is_some(),
            self.description.is_some(),
        ];
        let count = populated.iter().filter(|p| **p).count();
        count as f64 / populated.len() as f64
    }

    /// Merges fields parsed from an associated sidecar file into self,
    /// filling only empty fields (the primary's own metadata wins).
    pub fn absorb_sidecar(&mut self, other: &MediaMeta) {
        if self.capture_time.is_none() {
            self.capture_time = other.capture_time.clone();
        }
        if !self.has_gps() && other.has_gps() {
            self.gps_lat = other.gps_lat;
            self.gps_lon = other.gps_lon;
            self.gps_alt = other.gps_alt;
        }
        if self.camera_make.is_none() {
            self.camera_make = other.camera_make.clone();
        }
        if self.camera_model.is_none() {
            self.camera_model = other.camera_model.clone();
        }
        if self.title.is_none() {
            self.title = other.title.clone();
        }
        if self.description.is_none() {
            self.description = other.description.clone();
        }
        self.keywords.extend(other.keywords.iter().cloned());
    }
}

// ============================================================================
// EXIF Extraction
// ============================================================================

/// Reads normalized metadata from a photo's EXIF header.
///
/// Missing or unparseable EXIF is not an error: the result simply has
/// fewer populated fields. Only an unreadable file reports an error.
pub fn read_exif(path: &Path) -> Result<MediaMeta> {
    let file = File::open(path)
        .map_err(|e| DvojnikError::from_io_with_path(Some(path.to_path_buf()), e))?;
    let mut reader = BufReader::new(file);
    let mut meta = MediaMeta::default();

    let exif_data = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(data) => data,
        Err(_) => return Ok(meta), // no EXIF container; nothing to normalize
    };

    meta.orientation = exif_data
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .and_then(|v| u8::try_from(v).ok())
        .filter(|v| (1..=8).contains(v));

    meta.capture_time = exif_data
        .get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)
        .or_else(|| exif_data.get_field(exif::Tag::DateTime, exif::In::PRIMARY))
        .and_then(|f| parse_exif_datetime(&f.display_value().to_string()));

    meta.camera_make = exif_string(&exif_data, exif::Tag::Make);
    meta.camera_model = exif_string(&exif_data, exif::Tag::Model);

    meta.width = exif_data
        .get_field(exif::Tag::PixelXDimension, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0));
    meta.height = exif_data
        .get_field(exif::Tag::PixelYDimension, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0));

    if let (Some(lat), Some(lon)) = (
        gps_coordinate(&exif_data, exif::Tag::GPSLatitude, exif::Tag::GPSLatitudeRef),
        gps_coordinate(
            &exif_data,
            exif::Tag::GPSLongitude,
            exif::Tag::GPSLongitudeRef,
        ),
    ) {
        meta.gps_lat = Some(lat);
        meta.gps_lon = Some(lon);
        meta.gps_alt = gps_altitude(&exif_data);
    }

    Ok(meta)
}

fn exif_string(data: &exif::Exif, tag: exif::Tag) -> Option<String> {
    data.get_field(tag, exif::In::PRIMARY).and_then(|f| {
        let text = f.display_value().to_string();
        let trimmed = text.trim_matches(|c| c == '"' || c == ' ').to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

/// Parses the EXIF `YYYY:MM:DD HH:MM:SS` form into RFC3339, assuming UTC.
fn parse_exif_datetime(raw: &str) -> Option<Timestamp> {
    let format = time::macros::format_description!(
        "[year]:[month]:[day] [hour]:[minute]:[second]"
    );
    let parsed = PrimitiveDateTime::parse(raw.trim(), &format).ok()?;
    crate::format_rfc3339(parsed.assume_utc()).ok()
}

/// Converts the EXIF degrees/minutes/seconds rational triplet into signed
/// decimal degrees.
fn gps_coordinate(data: &exif::Exif, tag: exif::Tag, ref_tag: exif::Tag) -> Option<f64> {
    let field = data.get_field(tag, exif::In::PRIMARY)?;
    let decimal = match &field.value {
        exif::Value::Rational(parts) if parts.len() >= 3 => {
            parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0
        }
        _ => return None,
    };
    let reference = data
        .get_field(ref_tag, exif::In::PRIMARY)
        .map(|f| f.display_value().to_string())
        .unwrap_or_default();
    let sign = if reference.contains('S') || reference.contains('W') {
        -1.0
    } else {
        1.0
    };
    Some(sign * decimal)
}

fn gps_altitude(data: &exif::Exif) -> Option<f64> {
    let field = data.get_field(exif::Tag::GPSAltitude, exif::In::PRIMARY)?;
    match &field.value {
        exif::Value::Rational(parts) if !parts.is_empty() => Some(parts[0].to_f64()),
        _ => None,
    }
}
