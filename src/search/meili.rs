use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;
use ureq::http::Response;
use ureq::{Agent, Body, RequestBuilder};

use super::{
    SearchDocument, SearchError, SearchHits, SearchIndex, SearchResult, FILTERABLE_ATTRIBUTES,
    SEARCHABLE_ATTRIBUTES, SORTABLE_ATTRIBUTES,
};
use crate::config::SearchConfig;

#[derive(Debug, Deserialize)]
struct Hit {
    id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<Hit>,
    estimated_total_hits: Option<u64>,
    total_hits: Option<u64>,
}

/// Document API client for a Meilisearch server. Requests are blocking
/// `ureq` calls moved onto the blocking thread pool.
#[derive(Clone)]
pub struct MeiliSearchClient {
    agent: Agent,
    base_url: String,
    api_key: Option<String>,
    index: String,
    max_total_hits: usize,
}

impl MeiliSearchClient {
    pub fn new(config: &SearchConfig) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(config.timeout))
            .http_status_as_error(false)
            .build()
            .into();

        Self {
            agent,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            index: config.index.clone(),
            max_total_hits: config.max_total_hits,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize<B>(&self, request: RequestBuilder<B>) -> RequestBuilder<B> {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    fn check(path: &str, mut response: Response<Body>) -> SearchResult<Response<Body>> {
        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            return Err(SearchError::Status {
                status,
                path: path.to_string(),
                body,
            });
        }
        Ok(response)
    }

    fn settings_payload(&self) -> serde_json::Value {
        json!({
            "searchableAttributes": SEARCHABLE_ATTRIBUTES,
            "filterableAttributes": FILTERABLE_ATTRIBUTES,
            "sortableAttributes": SORTABLE_ATTRIBUTES,
            "pagination": { "maxTotalHits": self.max_total_hits },
        })
    }

    fn ensure_index_blocking(&self) -> SearchResult<()> {
        let path = format!("/indexes/{}", self.index);
        let response = self.authorize(self.agent.get(self.url(&path))).call()?;

        if response.status().as_u16() == 404 {
            info!("Creating search index {}", self.index);
            let response = self
                .authorize(self.agent.post(self.url("/indexes")))
                .send_json(json!({ "uid": self.index, "primaryKey": "id" }))?;
            Self::check("/indexes", response)?;
        } else {
            Self::check(&path, response)?;
        }

        let settings_path = format!("/indexes/{}/settings", self.index);
        let response = self
            .authorize(self.agent.patch(self.url(&settings_path)))
            .send_json(self.settings_payload())?;
        Self::check(&settings_path, response)?;
        Ok(())
    }

    fn upsert_blocking(&self, documents: &[SearchDocument]) -> SearchResult<()> {
        let path = format!("/indexes/{}/documents", self.index);
        let response = self
            .authorize(self.agent.post(self.url(&path)))
            .send_json(documents)?;
        Self::check(&path, response)?;
        debug!("Upserted {} search documents", documents.len());
        Ok(())
    }

    fn delete_blocking(&self, id: i64) -> SearchResult<()> {
        let path = format!("/indexes/{}/documents/{}", self.index, id);
        let response = self.authorize(self.agent.delete(self.url(&path))).call()?;
        // Deleting an unknown document is fine
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check(&path, response)?;
        Ok(())
    }

    fn search_blocking(&self, query: &str, limit: usize, offset: usize) -> SearchResult<SearchHits> {
        let path = format!("/indexes/{}/search", self.index);
        let response = self
            .authorize(self.agent.post(self.url(&path)))
            .send_json(json!({
                "q": query,
                "limit": limit,
                "offset": offset,
                "attributesToRetrieve": ["id"],
            }))?;
        let mut response = Self::check(&path, response)?;
        let parsed: SearchResponse = response.body_mut().read_json()?;

        Ok(SearchHits {
            ids: parsed.hits.into_iter().map(|hit| hit.id).collect(),
            estimated_total_hits: parsed.estimated_total_hits.or(parsed.total_hits),
        })
    }
}

#[async_trait]
impl SearchIndex for MeiliSearchClient {
    async fn ensure_index(&self) -> SearchResult<()> {
        let client = self.clone();
        tokio::task::spawn_blocking(move || client.ensure_index_blocking()).await?
    }

    async fn upsert(&self, documents: &[SearchDocument]) -> SearchResult<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let client = self.clone();
        let documents = documents.to_vec();
        tokio::task::spawn_blocking(move || client.upsert_blocking(&documents)).await?
    }

    async fn delete(&self, id: i64) -> SearchResult<()> {
        let client = self.clone();
        tokio::task::spawn_blocking(move || client.delete_blocking(id)).await?
    }

    async fn search(&self, query: &str, limit: usize, offset: usize) -> SearchResult<SearchHits> {
        let client = self.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || {
            client.ensure_index_blocking()?;
            client.search_blocking(&query, limit, offset)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SearchBackend, SearchConfig};
    use std::time::Duration;

    fn config() -> SearchConfig {
        SearchConfig {
            backend: SearchBackend::Meili,
            url: "http://localhost:7700/".to_string(),
            api_key: None,
            index: "files".to_string(),
            max_total_hits: 5000,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_url_strips_trailing_slash() {
        let client = MeiliSearchClient::new(&config());
        assert_eq!(
            client.url("/indexes/files"),
            "http://localhost:7700/indexes/files"
        );
    }

    #[test]
    fn test_settings_payload() {
        let payload = MeiliSearchClient::new(&config()).settings_payload();
        assert_eq!(payload["pagination"]["maxTotalHits"], 5000);
        assert_eq!(payload["sortableAttributes"], json!(["shot_at", "mtime"]));
        assert_eq!(
            payload["filterableAttributes"]
                .as_array()
                .map(|attrs| attrs.len()),
            Some(5)
        );
    }

    #[test]
    fn test_search_response_accepts_total_hits() {
        let parsed: SearchResponse =
            serde_json::from_str(r#"{"hits":[{"id":3},{"id":4}],"totalHits":12}"#).unwrap();
        assert_eq!(parsed.hits.len(), 2);
        assert_eq!(parsed.estimated_total_hits.or(parsed.total_hits), Some(12));
    }

    #[test]
    fn test_unreachable_server_is_an_error() {
        let mut config = config();
        config.url = "http://127.0.0.1:9".to_string();
        let client = MeiliSearchClient::new(&config);
        assert!(client.search_blocking("x", 10, 0).is_err());
    }
}
