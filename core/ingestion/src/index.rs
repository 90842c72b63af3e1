use anyhow::{anyhow, Result};
use async_trait::async_trait;
use contact_hub_schemas::CanonicalDocument;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// A row returned by a point lookup against the external index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRow {
    pub id: String,
    #[serde(default)]
    pub text: String,
}

/// External search index collaborator. The core treats this as the
/// authoritative existence oracle and the permanent store of conversation
/// text; `query_by_id` must never produce a false negative.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn add_documents(&self, docs: &[CanonicalDocument]) -> Result<()>;
    async fn query_by_id(&self, id: &str) -> Result<Vec<IndexRow>>;
}

/// HTTP client for the indexing service.
pub struct HttpSearchIndex {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct AddDocumentsRequest<'a> {
    documents: &'a [CanonicalDocument],
}

#[derive(Deserialize)]
struct QueryByIdResponse {
    #[serde(default)]
    rows: Vec<IndexRow>,
}

impl HttpSearchIndex {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn add_documents(&self, docs: &[CanonicalDocument]) -> Result<()> {
        let url = format!("{}/documents", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&AddDocumentsRequest { documents: docs })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "index rejected documents: HTTP {}",
                response.status()
            ));
        }
        debug!("Indexed {} documents", docs.len());
        Ok(())
    }

    async fn query_by_id(&self, id: &str) -> Result<Vec<IndexRow>> {
        let url = format!("{}/documents/{}", self.base_url, id);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(anyhow!("index lookup failed: HTTP {}", response.status()));
        }
        let body: QueryByIdResponse = response.json().await?;
        Ok(body.rows)
    }
}

/// In-memory index for tests and offline runs.
#[derive(Default)]
pub struct MemoryIndex {
    docs: Mutex<HashMap<String, CanonicalDocument>>,
    fail_writes: AtomicBool,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `add_documents` calls fail, for exercising the
    /// pipeline's persistence-error path.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.docs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.lock().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<CanonicalDocument> {
        self.docs.lock().await.get(id).cloned()
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn add_documents(&self, docs: &[CanonicalDocument]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("simulated index write failure"));
        }
        let mut map = self.docs.lock().await;
        for doc in docs {
            map.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn query_by_id(&self, id: &str) -> Result<Vec<IndexRow>> {
        let map = self.docs.lock().await;
        Ok(map
            .get(id)
            .map(|doc| {
                vec![IndexRow {
                    id: doc.id.clone(),
                    text: doc.text.clone(),
                }]
            })
            .unwrap_or_default())
    }
}
