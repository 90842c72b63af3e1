use chrono::Utc;
use contact_hub_schemas::{
    derive_document_id, AuditRecord, AuditStatus, CanonicalDocument, InboundEvent,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::audit::AuditLog;
use crate::dedupe::IdempotencyGate;
use crate::error::HubError;
use crate::index::SearchIndex;
use crate::normalizer::normalize;
use contact_hub_identity::{ContactPatch, ContactStore};

/// Outcome of a single ingestion: whether the event was newly accepted or
/// was a duplicate, plus the normalized event and canonical document.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub duplicate: bool,
    pub event: InboundEvent,
    pub doc: CanonicalDocument,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub index: usize,
    pub status: String,
    pub doc_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub accepted: usize,
    pub skipped: usize,
    pub errors: usize,
    pub total: usize,
    pub results: Vec<BatchItem>,
}

/// Ingestion orchestrator: normalize → dedupe → persist to index → update
/// contact → append audit record.
///
/// All caches (idempotency tiers, in-flight map) are fields of this struct,
/// so tests construct isolated instances. Within one process, two calls for
/// the same derived document id are serialized by the in-flight map; across
/// processes only the authoritative index check prevents duplicates.
pub struct IngestPipeline {
    index: Arc<dyn SearchIndex>,
    contacts: Arc<Mutex<ContactStore>>,
    gate: Mutex<IdempotencyGate>,
    audit: AuditLog,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IngestPipeline {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        contacts: Arc<Mutex<ContactStore>>,
        gate: IdempotencyGate,
        audit: AuditLog,
    ) -> Self {
        Self {
            index,
            contacts,
            gate: Mutex::new(gate),
            audit,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Build a pipeline over the standard flat-file layout in `data_dir`:
    /// `contacts.json`, `seen_ids.json`, `audit.jsonl`.
    pub fn open<P: AsRef<Path>>(data_dir: P, index: Arc<dyn SearchIndex>) -> anyhow::Result<Self> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let contacts = Arc::new(Mutex::new(ContactStore::open(dir.join("contacts.json"))?));
        let gate = IdempotencyGate::open(dir.join("seen_ids.json"), index.clone());
        let audit = AuditLog::new(dir.join("audit.jsonl"));
        Ok(Self::new(index, contacts, gate, audit))
    }

    /// Shared handle to the contact store, for callers that expose identity
    /// operations alongside ingestion.
    pub fn contacts(&self) -> Arc<Mutex<ContactStore>> {
        self.contacts.clone()
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Ingest one raw payload. Validation failures are terminal and leave no
    /// trace; duplicates append an audit record and perform no other side
    /// effects; persistence failures append an audit record and surface the
    /// error (retry policy belongs to the caller).
    pub async fn ingest_event(&self, raw: &Value) -> Result<IngestOutcome, HubError> {
        let event = normalize(raw)?;
        let doc_id = derive_document_id(event.channel, &event.message_id);
        let doc = render_document(&event, &doc_id);

        // Collapse concurrent duplicate calls: the first caller for an id
        // owns an in-flight token; later callers block on it, then re-check.
        // A failed first attempt leaves the id unseen, so a waiter retries
        // independently instead of inheriting the failure.
        let mut waited = false;
        let guard = loop {
            let existing = {
                let mut inflight = self.inflight.lock().await;
                match inflight.get(&doc_id) {
                    Some(token) => token.clone(),
                    None => {
                        let token = Arc::new(Mutex::new(()));
                        let guard = token
                            .clone()
                            .try_lock_owned()
                            .expect("freshly created token is unlocked");
                        inflight.insert(doc_id.clone(), token);
                        break guard;
                    }
                }
            };
            waited = true;
            let _released = existing.lock().await;
            debug!("In-flight ingestion for {} settled, re-checking", doc_id);
        };

        match self.ingest_accepted(&event, &doc, &doc_id, waited).await {
            Ok(outcome) => {
                self.clear_inflight(&doc_id, guard).await;
                Ok(outcome)
            }
            Err(e) => {
                // Clear the entry before surfacing so later calls may retry
                self.clear_inflight(&doc_id, guard).await;
                self.audit.append(&AuditRecord {
                    at: Utc::now().to_rfc3339(),
                    status: AuditStatus::Error,
                    channel: event.channel.as_str().to_string(),
                    message_id: event.message_id.clone(),
                    peer: event.peer.handle.clone(),
                    doc: doc_id.clone(),
                    reason: None,
                    error: Some(e.to_string()),
                });
                error!("Ingestion of {} failed: {}", doc_id, e);
                Err(e)
            }
        }
    }

    async fn ingest_accepted(
        &self,
        event: &InboundEvent,
        doc: &CanonicalDocument,
        doc_id: &str,
        waited: bool,
    ) -> Result<IngestOutcome, HubError> {
        let already = self.gate.lock().await.exists(doc_id).await?;
        if already {
            let reason = if waited {
                "inflight_duplicate"
            } else {
                "seen_or_existing"
            };
            self.audit.append(&AuditRecord {
                at: Utc::now().to_rfc3339(),
                status: AuditStatus::Duplicate,
                channel: event.channel.as_str().to_string(),
                message_id: event.message_id.clone(),
                peer: event.peer.handle.clone(),
                doc: doc_id.to_string(),
                reason: Some(reason.to_string()),
                error: None,
            });
            debug!("Duplicate {} ({})", doc_id, reason);
            return Ok(IngestOutcome {
                duplicate: true,
                event: event.clone(),
                doc: doc.clone(),
            });
        }

        self.index
            .add_documents(std::slice::from_ref(doc))
            .await
            .map_err(|e| HubError::persistence(format!("index write for {}: {}", doc_id, e)))?;

        self.gate.lock().await.remember(doc_id);

        self.update_contact_for_event(event)
            .await
            .map_err(|e| HubError::persistence(format!("contact update for {}: {}", doc_id, e)))?;

        self.audit.append(&AuditRecord {
            at: Utc::now().to_rfc3339(),
            status: AuditStatus::Ingested,
            channel: event.channel.as_str().to_string(),
            message_id: event.message_id.clone(),
            peer: event.peer.handle.clone(),
            doc: doc_id.to_string(),
            reason: None,
            error: None,
        });
        info!("Ingested {} from {} via {}", doc_id, event.peer.handle, event.channel);

        Ok(IngestOutcome {
            duplicate: false,
            event: event.clone(),
            doc: doc.clone(),
        })
    }

    async fn update_contact_for_event(&self, event: &InboundEvent) -> anyhow::Result<()> {
        let mut contacts = self.contacts.lock().await;
        let contact = contacts.update_last_contacted(
            &event.peer.handle,
            &event.timestamp,
            Some(event.channel.as_str()),
        )?;

        // Promote the scraped display name only over auto-generated ones so
        // a human-entered name is never clobbered by noisy source data.
        if let Some(name) = &event.peer.display_name {
            let name = name.trim();
            if !name.is_empty()
                && name != contact.display_name
                && looks_auto_generated(&contact.display_name, &contact.handle)
            {
                contacts.update_contact(
                    &event.peer.handle,
                    ContactPatch {
                        display_name: Some(name.to_string()),
                        ..Default::default()
                    },
                )?;
            }
        }
        Ok(())
    }

    async fn clear_inflight(&self, doc_id: &str, guard: OwnedMutexGuard<()>) {
        // Remove the map entry before releasing the token so a woken waiter
        // re-entering the map sees a clean slate.
        self.inflight.lock().await.remove(doc_id);
        drop(guard);
    }

    /// Batch form. With `fail_fast` (the default for callers that want
    /// all-or-nothing semantics) processing stops at the first error;
    /// otherwise every item is attempted and per-item outcomes collected.
    pub async fn ingest_batch(&self, raws: &[Value], fail_fast: bool) -> BatchReport {
        let mut report = BatchReport {
            accepted: 0,
            skipped: 0,
            errors: 0,
            total: raws.len(),
            results: Vec::with_capacity(raws.len()),
        };

        for (i, raw) in raws.iter().enumerate() {
            match self.ingest_event(raw).await {
                Ok(outcome) if outcome.duplicate => {
                    report.skipped += 1;
                    report.results.push(BatchItem {
                        index: i,
                        status: "duplicate".to_string(),
                        doc_id: Some(outcome.doc.id),
                        error: None,
                    });
                }
                Ok(outcome) => {
                    report.accepted += 1;
                    report.results.push(BatchItem {
                        index: i,
                        status: "ingested".to_string(),
                        doc_id: Some(outcome.doc.id),
                        error: None,
                    });
                }
                Err(e) => {
                    report.errors += 1;
                    report.results.push(BatchItem {
                        index: i,
                        status: "error".to_string(),
                        doc_id: None,
                        error: Some(e.to_string()),
                    });
                    if fail_fast {
                        break;
                    }
                }
            }
        }

        report
    }
}

/// Render the single-line canonical document for the index.
fn render_document(event: &InboundEvent, doc_id: &str) -> CanonicalDocument {
    let sender = event
        .peer
        .display_name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(&event.peer.handle);
    let body = event.text.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut text = format!("[{}] {}: {}", event.timestamp, sender, body);
    if !event.attachments.is_empty() {
        let names: Vec<&str> = event
            .attachments
            .iter()
            .map(|a| a.name.as_deref().unwrap_or(a.kind.as_str()))
            .collect();
        text.push_str(&format!(" (attachments: {})", names.join(", ")));
    }

    CanonicalDocument {
        id: doc_id.to_string(),
        text,
        source: event.channel.label().to_string(),
        path: format!("{}://{}", event.channel.scheme(), event.peer.handle),
    }
}

/// A display name "looks auto-generated" when it is empty, equal to the
/// handle, or phone-shaped (digits and formatting only).
fn looks_auto_generated(display_name: &str, handle: &str) -> bool {
    let name = display_name.trim();
    if name.is_empty() || name.eq_ignore_ascii_case(handle.trim()) {
        return true;
    }
    name.chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | ' ' | '.'))
}
