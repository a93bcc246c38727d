//! Search-engine documents and the client seam used by the sync jobs.

pub mod meili;
pub mod memory;

pub use meili::MeiliSearchClient;
pub use memory::MemorySearchIndex;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::{CatalogEntry, Keyword};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("HTTP error: {0}")]
    Http(#[from] ureq::Error),
    #[error("Search engine returned {status} for {path}: {body}")]
    Status {
        status: u16,
        path: String,
        body: String,
    },
    #[error("Search request task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Search index lock poisoned")]
    Poisoned,
}

pub type SearchResult<T> = Result<T, SearchError>;

pub const SEARCHABLE_ATTRIBUTES: [&str; 4] = ["keywords", "filename", "title", "description"];
pub const FILTERABLE_ATTRIBUTES: [&str; 5] =
    ["orientation", "shot_at", "mtime", "keywords_norm", "deleted"];
pub const SORTABLE_ATTRIBUTES: [&str; 2] = ["shot_at", "mtime"];

/// One catalog entry as the search engine sees it. Timestamps are unix
/// seconds so they can be range-filtered and sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub id: i64,
    pub keywords: Vec<String>,
    pub keywords_norm: Vec<String>,
    pub filename: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub shot_at: Option<i64>,
    pub mtime: i64,
    pub orientation: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub deleted: bool,
    pub updated_at: String,
}

impl SearchDocument {
    pub fn build(entry: &CatalogEntry, keywords: &[Keyword]) -> Self {
        Self {
            id: entry.id,
            keywords: keywords.iter().map(|k| k.value_display.clone()).collect(),
            keywords_norm: keywords.iter().map(|k| k.value_norm.clone()).collect(),
            filename: entry.filename.clone(),
            title: entry.title.clone(),
            description: entry.description.clone(),
            shot_at: entry.shot_at.map(|t| t.timestamp()),
            mtime: entry.mtime.timestamp(),
            orientation: entry.orientation.as_str().to_string(),
            width: entry.width,
            height: entry.height,
            deleted: entry.is_deleted(),
            updated_at: Utc::now().to_rfc3339(),
        }
    }
}

/// A page of matching entry ids in engine ranking order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    pub ids: Vec<i64>,
    pub estimated_total_hits: Option<u64>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Creates the index if absent and (re)applies its attribute settings.
    async fn ensure_index(&self) -> SearchResult<()>;

    async fn upsert(&self, documents: &[SearchDocument]) -> SearchResult<()>;

    async fn delete(&self, id: i64) -> SearchResult<()>;

    async fn search(&self, query: &str, limit: usize, offset: usize) -> SearchResult<SearchHits>;
}
