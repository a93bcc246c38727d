use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{SearchDocument, SearchError, SearchHits, SearchIndex, SearchResult};

/// In-process index for tests and offline runs. Every query word must occur
/// in the document's keywords, filename, title or description; results are
/// ordered by id and capped at `max_total_hits` like the real engine.
#[derive(Clone)]
pub struct MemorySearchIndex {
    documents: Arc<Mutex<BTreeMap<i64, SearchDocument>>>,
    ensure_calls: Arc<AtomicUsize>,
    max_total_hits: usize,
}

impl Default for MemorySearchIndex {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl MemorySearchIndex {
    pub fn new(max_total_hits: usize) -> Self {
        Self {
            documents: Arc::new(Mutex::new(BTreeMap::new())),
            ensure_calls: Arc::new(AtomicUsize::new(0)),
            max_total_hits,
        }
    }

    pub fn document(&self, id: i64) -> Option<SearchDocument> {
        self.documents.lock().ok()?.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ensure_calls(&self) -> usize {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    fn matches(doc: &SearchDocument, words: &[String]) -> bool {
        let mut haystack: Vec<String> = doc.keywords_norm.clone();
        haystack.extend(doc.keywords.iter().map(|k| k.to_lowercase()));
        haystack.push(doc.filename.to_lowercase());
        haystack.extend(doc.title.iter().map(|t| t.to_lowercase()));
        haystack.extend(doc.description.iter().map(|d| d.to_lowercase()));

        words
            .iter()
            .all(|word| haystack.iter().any(|field| field.contains(word.as_str())))
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn ensure_index(&self) -> SearchResult<()> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert(&self, documents: &[SearchDocument]) -> SearchResult<()> {
        let mut stored = self.documents.lock().map_err(|_| SearchError::Poisoned)?;
        for doc in documents {
            stored.insert(doc.id, doc.clone());
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> SearchResult<()> {
        let mut stored = self.documents.lock().map_err(|_| SearchError::Poisoned)?;
        stored.remove(&id);
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize, offset: usize) -> SearchResult<SearchHits> {
        let words: Vec<String> = query
            .split_whitespace()
            .map(|w| w.trim_matches('"').to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();

        let stored = self.documents.lock().map_err(|_| SearchError::Poisoned)?;
        let matching: Vec<i64> = stored
            .values()
            .filter(|doc| Self::matches(doc, &words))
            .map(|doc| doc.id)
            .take(self.max_total_hits)
            .collect();

        Ok(SearchHits {
            ids: matching.iter().skip(offset).take(limit).copied().collect(),
            estimated_total_hits: Some(matching.len() as u64),
        })
    }
}
