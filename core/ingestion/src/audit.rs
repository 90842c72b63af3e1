use contact_hub_schemas::AuditRecord;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Append-only JSON-lines record of every ingestion decision, kept for
/// replay and diagnosis. Appends are best-effort: a failed write is logged
/// and swallowed so it never changes the primary ingestion outcome.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn append(&self, record: &AuditRecord) {
        let result = (|| -> anyhow::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let line = serde_json::to_string(record)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            writeln!(file, "{}", line)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!("Failed to append audit record (continuing): {}", e);
        }
    }

    /// Read back all records, skipping unparseable lines. Used by tests and
    /// diagnostic tooling.
    pub fn read_all(&self) -> Vec<AuditRecord> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contact_hub_schemas::AuditStatus;
    use tempfile::TempDir;

    fn record(status: AuditStatus, message_id: &str) -> AuditRecord {
        AuditRecord {
            at: "2025-01-01T00:00:00Z".to_string(),
            status,
            channel: "sms".to_string(),
            message_id: message_id.to_string(),
            peer: "+15550001111".to_string(),
            doc: "doc_abc".to_string(),
            reason: None,
            error: None,
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));

        log.append(&record(AuditStatus::Ingested, "m1"));
        log.append(&record(AuditStatus::Duplicate, "m2"));

        let records = log.read_all();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, AuditStatus::Ingested);
        assert_eq!(records[1].message_id, "m2");
    }

    #[test]
    fn test_unparseable_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(&path);

        log.append(&record(AuditStatus::Error, "m1"));
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map(|mut f| writeln!(f, "corrupted line"))
            .unwrap()
            .unwrap();
        log.append(&record(AuditStatus::Ingested, "m2"));

        assert_eq!(log.read_all().len(), 2);
    }
}
