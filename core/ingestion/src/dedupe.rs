use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::HubError;
use crate::index::SearchIndex;

/// Hot in-memory tier: recent ids only, oldest evicted on overflow.
const HOT_CAPACITY: usize = 5_000;
/// Persisted tier: trimmed oldest-first once the cap is exceeded, so
/// redelivery across process restarts is caught without unbounded growth.
const SEEN_CAPACITY: usize = 100_000;
const SEEN_TRIM_TO: usize = 80_000;

/// Three-tier duplicate detector for canonical document ids.
///
/// Tiers, cheapest first: (a) bounded in-memory set of hot recent ids,
/// (b) a persisted seen set loaded once per process lifetime, (c) an
/// authoritative point lookup against the external index. Tiers (a)/(b) are
/// caches and may be incomplete; tier (c) is the source of truth and its
/// positive results are back-filled into the caches. Persistence of (b) is
/// best-effort and never blocks ingestion.
pub struct IdempotencyGate {
    index: Arc<dyn SearchIndex>,
    path: PathBuf,
    hot: VecDeque<String>,
    hot_set: HashSet<String>,
    seen: VecDeque<String>,
    seen_set: HashSet<String>,
    hot_capacity: usize,
    seen_capacity: usize,
    seen_trim_to: usize,
}

impl IdempotencyGate {
    /// Open the gate, loading the persisted seen set from `path`. A missing
    /// or unreadable file is treated as empty — the index remains the
    /// authority.
    pub fn open<P: AsRef<Path>>(path: P, index: Arc<dyn SearchIndex>) -> Self {
        Self::with_capacities(path, index, HOT_CAPACITY, SEEN_CAPACITY, SEEN_TRIM_TO)
    }

    pub fn with_capacities<P: AsRef<Path>>(
        path: P,
        index: Arc<dyn SearchIndex>,
        hot_capacity: usize,
        seen_capacity: usize,
        seen_trim_to: usize,
    ) -> Self {
        let path = path.as_ref().to_path_buf();
        let seen: VecDeque<String> = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(ids) => ids.into(),
                Err(e) => {
                    warn!("Seen-id file {} unreadable ({}), starting empty", path.display(), e);
                    VecDeque::new()
                }
            },
            Err(_) => VecDeque::new(),
        };
        let seen_set: HashSet<String> = seen.iter().cloned().collect();
        debug!("Loaded {} persisted seen ids", seen.len());

        Self {
            index,
            path,
            hot: VecDeque::new(),
            hot_set: HashSet::new(),
            seen,
            seen_set,
            hot_capacity,
            seen_capacity,
            seen_trim_to,
        }
    }

    /// Whether the document id has already been ingested. Consults the
    /// cache tiers first and falls through to the authoritative index
    /// lookup only on a miss.
    pub async fn exists(&mut self, doc_id: &str) -> Result<bool, HubError> {
        if self.hot_set.contains(doc_id) {
            return Ok(true);
        }
        if self.seen_set.contains(doc_id) {
            // Promote into the hot tier for subsequent checks
            self.push_hot(doc_id);
            return Ok(true);
        }

        let rows = self
            .index
            .query_by_id(doc_id)
            .await
            .map_err(|e| HubError::persistence(format!("index lookup for {}: {}", doc_id, e)))?;
        if rows.is_empty() {
            return Ok(false);
        }

        debug!("Index knows {} but caches did not, back-filling", doc_id);
        self.remember(doc_id);
        Ok(true)
    }

    /// Record a newly ingested (or index-confirmed) id in both cache tiers
    /// and persist the seen set, best-effort.
    pub fn remember(&mut self, doc_id: &str) {
        self.push_hot(doc_id);
        if self.seen_set.insert(doc_id.to_string()) {
            self.seen.push_back(doc_id.to_string());
            if self.seen.len() > self.seen_capacity {
                while self.seen.len() > self.seen_trim_to {
                    if let Some(old) = self.seen.pop_front() {
                        self.seen_set.remove(&old);
                    }
                }
            }
        }
        self.persist_seen();
    }

    fn push_hot(&mut self, doc_id: &str) {
        if !self.hot_set.insert(doc_id.to_string()) {
            return;
        }
        self.hot.push_back(doc_id.to_string());
        while self.hot.len() > self.hot_capacity {
            if let Some(old) = self.hot.pop_front() {
                self.hot_set.remove(&old);
            }
        }
    }

    /// Write the seen set to disk via temp-then-rename so a crash mid-write
    /// cannot corrupt it. Failures are swallowed; they must never block the
    /// ingestion outcome.
    fn persist_seen(&self) {
        let result = (|| -> anyhow::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let dir = self
                .path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let ids: Vec<&String> = self.seen.iter().collect();
            let json = serde_json::to_string(&ids)?;
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(json.as_bytes())?;
            tmp.persist(&self.path)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!("Failed to persist seen-id set (continuing): {}", e);
        }
    }

    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }
}
