//! JSONL audit log: one JSON object per line, append-only.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use super::types::AuditEvent;
use super::AuditSink;

/// File-backed audit sink.
pub struct JsonlAuditLog {
    path: PathBuf,
    // Serialises appends from concurrent workflows.
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditLog {
    fn emit(&self, event: AuditEvent) {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize audit event: {e}");
                return;
            }
        };

        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{json}") {
                    warn!(path = %self.path.display(), "Failed to append audit event: {e}");
                }
            }
            Err(e) => warn!(path = %self.path.display(), "Failed to open audit log: {e}"),
        }
    }
}

/// Read every well-formed event from a JSONL audit log. Malformed lines are
/// skipped with a warning.
pub fn read_audit_log(path: &Path) -> std::io::Result<Vec<AuditEvent>> {
    let file = std::fs::File::open(path)?;
    let mut events = Vec::new();
    for (idx, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(line = idx + 1, "Skipping malformed audit line: {e}"),
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AuditEventType;

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = JsonlAuditLog::new(&path);

        log.emit(AuditEvent::workflow("wf-1", AuditEventType::WorkflowCreated));
        log.emit(
            AuditEvent::task("wf-1", "t-1", AuditEventType::SpendRecorded)
                .with_payload(serde_json::json!({"amount": 0.25})),
        );

        let events = read_audit_log(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, AuditEventType::SpendRecorded);
        assert_eq!(events[1].payload["amount"], 0.25);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = JsonlAuditLog::new(&path);
        log.emit(AuditEvent::workflow("wf-1", AuditEventType::WorkflowCreated));
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "{{not json").unwrap();
        }
        let events = read_audit_log(&path).unwrap();
        assert_eq!(events.len(), 1);
    }
}
