use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use exif::{In, Reader, Tag, Value};
use log::{debug, warn};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

use crate::keywords::split_keyword_string;
use crate::mimetype_detector;

const TITLE_TAGS: &[&str] = &[
    "XMP:Title",
    "XMP-dc:Title",
    "IPTC:Headline",
    "XMP:Headline",
    "EXIF:ImageDescription",
    "Title",
];

const DESCRIPTION_TAGS: &[&str] = &[
    "XMP:Description",
    "XMP-dc:Description",
    "IPTC:Caption-Abstract",
    "EXIF:ImageDescription",
    "Description",
];

const SHOT_AT_TAGS: &[&str] = &[
    "DateTimeOriginal",
    "EXIF:CreateDate",
    "CreateDate",
    "XMP:CreateDate",
    "ModifyDate",
    "XMP:ModifyDate",
    "FileModifyDate",
];

const KEYWORD_TAGS: &[&str] = &[
    "Subject",
    "HierarchicalSubject",
    "TagsList",
    "XPKeywords",
    "XMP:Subject",
    "XMP-dc:Subject",
    "XMP:HierarchicalSubject",
    "XMP-lr:HierarchicalSubject",
    "XMP:TagsList",
    "XMP:Keywords",
    "MWG:Keywords",
    "IPTC:Keywords",
    "IPTC:Subject",
    "EXIF:XPKeywords",
    "Keywords",
];

/// Windows XP keyword tag (UTF-16LE bytes in IFD0).
const XP_KEYWORDS: Tag = Tag(exif::Context::Tiff, 0x9c9e);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedMetadata {
    pub mime: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub shot_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Raw keyword candidates, not yet normalized or deduplicated.
    pub keywords: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("Probe exited with status: {0}")]
    Status(std::process::ExitStatus),
    #[error("Probe output is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads metadata from a single file. Implementations never fail: anything
/// that goes wrong degrades to an empty or partial result.
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    async fn extract(&self, path: &Path) -> ExtractedMetadata;

    /// Capture time only, for backfilling entries that lack one.
    async fn extract_shot_at(&self, path: &Path) -> Option<DateTime<Utc>>;
}

/// Runs `exiftool -json -n -charset utf8` with a bounded timeout and falls
/// back to the embedded EXIF reader when the tool is unavailable or fails.
pub struct ExifToolProbe {
    program: String,
    timeout: Duration,
}

impl ExifToolProbe {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    async fn run(&self, path: &Path, tags: &[&str]) -> Result<Map<String, JsonValue>, ProbeError> {
        let mut command = Command::new(&self.program);
        command
            .args(["-json", "-n", "-charset", "utf8"])
            .args(tags.iter().map(|tag| format!("-{}", tag)))
            .arg(path)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
            .map_err(|source| ProbeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Status(output.status));
        }

        let payload: Vec<Map<String, JsonValue>> = serde_json::from_slice(&output.stdout)?;
        Ok(payload.into_iter().next().unwrap_or_default())
    }
}

#[async_trait]
impl MetadataProbe for ExifToolProbe {
    async fn extract(&self, path: &Path) -> ExtractedMetadata {
        if !path.exists() {
            return ExtractedMetadata::default();
        }

        let mut metadata = match self.run(path, &[]).await {
            Ok(record) => metadata_from_record(&record),
            Err(e) => {
                warn!(
                    "exiftool failed for {}, using embedded EXIF: {}",
                    path.display(),
                    e
                );
                read_embedded_blocking(path.to_path_buf()).await
            }
        };

        if metadata.width.is_none() || metadata.height.is_none() {
            if let Ok((width, height)) = image::image_dimensions(path) {
                metadata.width = Some(width as i64);
                metadata.height = Some(height as i64);
            }
        }
        if metadata.mime.is_none() {
            metadata.mime = mimetype_detector::from_path(path).map(|mime| mime.to_string());
        }

        metadata
    }

    async fn extract_shot_at(&self, path: &Path) -> Option<DateTime<Utc>> {
        if !path.exists() {
            return None;
        }

        match self.run(path, SHOT_AT_TAGS).await {
            Ok(record) => shot_at_from_record(&record),
            Err(e) => {
                debug!("exiftool failed for {}: {}", path.display(), e);
                read_embedded_blocking(path.to_path_buf()).await.shot_at
            }
        }
    }
}

async fn read_embedded_blocking(path: PathBuf) -> ExtractedMetadata {
    tokio::task::spawn_blocking(move || read_embedded(&path))
        .await
        .unwrap_or_default()
}

/// Built-in reader: EXIF fields via `kamadak-exif`, dimensions from the image header.
pub fn read_embedded(path: &Path) -> ExtractedMetadata {
    let mut metadata = ExtractedMetadata {
        mime: mimetype_detector::from_path(path).map(|mime| mime.to_string()),
        ..Default::default()
    };

    if let Ok(file) = File::open(path) {
        let mut reader = BufReader::new(file);
        match Reader::new().read_from_container(&mut reader) {
            Ok(exif) => apply_exif(&exif, &mut metadata),
            Err(e) => debug!("No EXIF data in {}: {}", path.display(), e),
        }
    }

    if metadata.width.is_none() || metadata.height.is_none() {
        if let Ok((width, height)) = image::image_dimensions(path) {
            metadata.width = Some(width as i64);
            metadata.height = Some(height as i64);
        }
    }

    // Same last resort as exiftool's FileModifyDate
    if metadata.shot_at.is_none() {
        metadata.shot_at = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
    }

    metadata
}

fn apply_exif(exif: &exif::Exif, metadata: &mut ExtractedMetadata) {
    metadata.shot_at = [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime]
        .iter()
        .filter_map(|tag| exif.get_field(*tag, In::PRIMARY))
        .filter_map(|field| parse_exif_datetime(&field.display_value().to_string()))
        .next();

    metadata.width = exif
        .get_field(Tag::PixelXDimension, In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .map(i64::from);
    metadata.height = exif
        .get_field(Tag::PixelYDimension, In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .map(i64::from);

    if let Some(field) = exif.get_field(Tag::ImageDescription, In::PRIMARY) {
        if let Value::Ascii(ref parts) = field.value {
            let text = parts
                .iter()
                .map(|part| clean_exif_string(&String::from_utf8_lossy(part)))
                .find(|part| !part.is_empty());
            metadata.title = text.clone();
            metadata.description = text;
        }
    }

    if let Some(field) = exif.get_field(XP_KEYWORDS, In::PRIMARY) {
        if let Value::Byte(ref bytes) = field.value {
            metadata.keywords = split_keyword_string(&decode_utf16le(bytes));
        }
    }
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
        .trim_end_matches('\0')
        .to_string()
}

fn clean_exif_string(value: &str) -> String {
    value.replace('\0', "").trim().trim_matches('"').trim().to_string()
}

fn first_present<'a>(record: &'a Map<String, JsonValue>, tags: &[&str]) -> Option<&'a JsonValue> {
    tags.iter()
        .filter_map(|tag| record.get(*tag))
        .find(|value| coerce_text(value).is_some())
}

/// First non-empty text inside a scalar, list or object value.
fn coerce_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(items) => items.iter().find_map(coerce_text),
        JsonValue::Object(fields) => fields.values().find_map(coerce_text),
        JsonValue::Bool(_) | JsonValue::Null => None,
    }
}

fn keywords_from_record(record: &Map<String, JsonValue>) -> Vec<String> {
    let mut candidates = Vec::new();
    for tag in KEYWORD_TAGS {
        match record.get(*tag) {
            Some(JsonValue::Array(items)) => {
                candidates.extend(items.iter().map(|item| match item {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                }));
            }
            Some(JsonValue::String(s)) => candidates.extend(split_keyword_string(s)),
            Some(JsonValue::Number(n)) => candidates.push(n.to_string()),
            _ => {}
        }
    }
    candidates
}

fn shot_at_from_record(record: &Map<String, JsonValue>) -> Option<DateTime<Utc>> {
    first_present(record, SHOT_AT_TAGS)
        .and_then(coerce_text)
        .and_then(|text| parse_exif_datetime(&text))
}

fn dimension(record: &Map<String, JsonValue>, tag: &str) -> Option<i64> {
    match record.get(tag)? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|value| *value > 0)
}

pub fn metadata_from_record(record: &Map<String, JsonValue>) -> ExtractedMetadata {
    ExtractedMetadata {
        mime: record.get("MIMEType").and_then(coerce_text),
        width: dimension(record, "ImageWidth"),
        height: dimension(record, "ImageHeight"),
        shot_at: shot_at_from_record(record),
        title: first_present(record, TITLE_TAGS).and_then(coerce_text),
        description: first_present(record, DESCRIPTION_TAGS).and_then(coerce_text),
        keywords: keywords_from_record(record),
    }
}

/// Parses the date formats exiftool and cameras emit. Values without an
/// offset are taken as UTC.
pub fn parse_exif_datetime(value: &str) -> Option<DateTime<Utc>> {
    let cleaned = value.replace('"', "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }

    for format in ["%Y:%m:%d %H:%M:%S%z", "%Y:%m:%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(cleaned, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    for format in [
        "%Y:%m:%d %H:%M:%S",
        "%Y:%m:%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(cleaned, format) {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }

    DateTime::parse_from_rfc3339(&cleaned.replace('Z', "+00:00"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Probe with canned answers per path, for tests and dry runs.
#[derive(Default)]
pub struct ScriptedProbe {
    answers: Mutex<HashMap<PathBuf, ExtractedMetadata>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: impl Into<PathBuf>, metadata: ExtractedMetadata) {
        if let Ok(mut answers) = self.answers.lock() {
            answers.insert(path.into(), metadata);
        }
    }
}

#[async_trait]
impl MetadataProbe for ScriptedProbe {
    async fn extract(&self, path: &Path) -> ExtractedMetadata {
        self.answers
            .lock()
            .ok()
            .and_then(|answers| answers.get(path).cloned())
            .unwrap_or_default()
    }

    async fn extract_shot_at(&self, path: &Path) -> Option<DateTime<Utc>> {
        self.extract(path).await.shot_at
    }
}
