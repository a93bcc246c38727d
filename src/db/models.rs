use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
#[error("Unknown {kind} value: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Landscape,
    Portrait,
    Square,
    Unknown,
}

impl Orientation {
    pub fn from_dimensions(width: Option<i64>, height: Option<i64>) -> Self {
        match (width, height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => {
                if w > h {
                    Orientation::Landscape
                } else if h > w {
                    Orientation::Portrait
                } else {
                    Orientation::Square
                }
            }
            _ => Orientation::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Landscape => "landscape",
            Orientation::Portrait => "portrait",
            Orientation::Square => "square",
            Orientation::Unknown => "unknown",
        }
    }
}

impl TryFrom<String> for Orientation {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "landscape" => Ok(Orientation::Landscape),
            "portrait" => Ok(Orientation::Portrait),
            "square" => Ok(Orientation::Square),
            "unknown" => Ok(Orientation::Unknown),
            _ => Err(UnknownVariant {
                kind: "orientation",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Filesystem,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Filesystem => "filesystem",
        }
    }
}

impl TryFrom<String> for StorageMode {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "filesystem" => Ok(StorageMode::Filesystem),
            _ => Err(UnknownVariant {
                kind: "storage mode",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexRunStatus {
    Running,
    Completed,
    Failed,
}

impl IndexRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexRunStatus::Running => "running",
            IndexRunStatus::Completed => "completed",
            IndexRunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IndexRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for IndexRunStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "running" => Ok(IndexRunStatus::Running),
            "completed" => Ok(IndexRunStatus::Completed),
            "failed" => Ok(IndexRunStatus::Failed),
            _ => Err(UnknownVariant {
                kind: "index run status",
                value,
            }),
        }
    }
}

/// One file known to the catalog. `deleted_at` marks a soft delete.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CatalogEntry {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub storage_mode: StorageMode,
    pub original_key: String,
    pub filename: String,
    pub ext: String,
    pub mime: String,
    pub size_bytes: i64,
    pub mtime: DateTime<Utc>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    #[sqlx(try_from = "String")]
    pub orientation: Orientation,
    pub shot_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CatalogEntry {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Fields the scanner knows about a file before any metadata is probed.
#[derive(Debug, Clone)]
pub struct NewCatalogEntry {
    pub original_key: String,
    pub filename: String,
    pub ext: String,
    pub mime: String,
    pub size_bytes: i64,
    pub mtime: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Keyword {
    pub id: i64,
    pub value_norm: String,
    pub value_display: String,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Preview {
    pub file_id: i64,
    pub thumb_key: String,
    pub medium_key: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IndexRun {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub status: IndexRunStatus,
    pub scanned_count: i64,
    pub created_count: i64,
    pub updated_count: i64,
    pub restored_count: i64,
    pub deleted_count: i64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanCounters {
    pub scanned: i64,
    pub created: i64,
    pub updated: i64,
    pub restored: i64,
    pub deleted: i64,
}

/// Converts a filesystem timestamp to UTC, truncated to whole milliseconds.
pub fn mtime_from_system(time: SystemTime) -> DateTime<Utc> {
    let millis = match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    };
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_orientation_from_dimensions() {
        assert_eq!(
            Orientation::from_dimensions(Some(4000), Some(3000)),
            Orientation::Landscape
        );
        assert_eq!(
            Orientation::from_dimensions(Some(3000), Some(4000)),
            Orientation::Portrait
        );
        assert_eq!(
            Orientation::from_dimensions(Some(500), Some(500)),
            Orientation::Square
        );
        assert_eq!(
            Orientation::from_dimensions(None, Some(500)),
            Orientation::Unknown
        );
        assert_eq!(
            Orientation::from_dimensions(Some(0), Some(0)),
            Orientation::Unknown
        );
    }

    #[test]
    fn test_orientation_round_trips_through_text() {
        for orientation in [
            Orientation::Landscape,
            Orientation::Portrait,
            Orientation::Square,
            Orientation::Unknown,
        ] {
            let parsed = Orientation::try_from(orientation.as_str().to_string()).unwrap();
            assert_eq!(parsed, orientation);
        }
        assert!(Orientation::try_from("sideways".to_string()).is_err());
    }

    #[test]
    fn test_mtime_truncated_to_millis() {
        let time = UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789);
        let mtime = mtime_from_system(time);
        assert_eq!(mtime.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(mtime.timestamp_subsec_nanos(), 123_000_000);
    }
}
