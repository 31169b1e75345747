//! Append-only audit trail of case lifecycle events.
//!
//! Each line is a JSON object carrying identifiers only (never message
//! bodies or document contents), a snapshot of running counters and,
//! when enabled, a SHA-256 hash chained to the previous line.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::sync::{Mutex, OnceLock};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::AppealAuditConfig;

/// Lifecycle events worth an audit line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppealEvent<'a> {
    CaseCreated {
        case_id: &'a str,
        user_id: &'a str,
    },
    FilesUploaded {
        case_id: &'a str,
        count: usize,
        files_version: u64,
    },
    EmailSent {
        case_id: &'a str,
        message_id: &'a str,
        thread_id: &'a str,
    },
    ReplyLinked {
        case_id: &'a str,
        message_id: &'a str,
        signal: &'a str,
    },
    ReplyParked {
        message_id: &'a str,
        thread_id: &'a str,
    },
    StaleWriteDropped {
        case_id: &'a str,
        stage: &'a str,
    },
    CaseResolved {
        case_id: &'a str,
    },
    CaseDeleted {
        case_id: &'a str,
        files_removed: usize,
        files_failed: usize,
    },
}

impl AppealEvent<'_> {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CaseCreated { .. } => "case_created",
            Self::FilesUploaded { .. } => "files_uploaded",
            Self::EmailSent { .. } => "email_sent",
            Self::ReplyLinked { .. } => "reply_linked",
            Self::ReplyParked { .. } => "reply_parked",
            Self::StaleWriteDropped { .. } => "stale_write_dropped",
            Self::CaseResolved { .. } => "case_resolved",
            Self::CaseDeleted { .. } => "case_deleted",
        }
    }

    fn details(&self) -> serde_json::Value {
        match self {
            Self::CaseCreated { case_id, user_id } => {
                serde_json::json!({ "case_id": case_id, "user_id": user_id })
            }
            Self::FilesUploaded {
                case_id,
                count,
                files_version,
            } => serde_json::json!({
                "case_id": case_id,
                "count": count,
                "files_version": files_version,
            }),
            Self::EmailSent {
                case_id,
                message_id,
                thread_id,
            } => serde_json::json!({
                "case_id": case_id,
                "message_id": message_id,
                "thread_id": thread_id,
            }),
            Self::ReplyLinked {
                case_id,
                message_id,
                signal,
            } => serde_json::json!({
                "case_id": case_id,
                "message_id": message_id,
                "signal": signal,
            }),
            Self::ReplyParked {
                message_id,
                thread_id,
            } => serde_json::json!({ "message_id": message_id, "thread_id": thread_id }),
            Self::StaleWriteDropped { case_id, stage } => {
                serde_json::json!({ "case_id": case_id, "stage": stage })
            }
            Self::CaseResolved { case_id } => serde_json::json!({ "case_id": case_id }),
            Self::CaseDeleted {
                case_id,
                files_removed,
                files_failed,
            } => serde_json::json!({
                "case_id": case_id,
                "files_removed": files_removed,
                "files_failed": files_failed,
            }),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
struct AppealCounters {
    cases_created: u64,
    emails_sent: u64,
    replies_linked: u64,
    replies_parked: u64,
    stale_writes: u64,
}

impl AppealCounters {
    fn count(&mut self, event: &AppealEvent<'_>) {
        match event {
            AppealEvent::CaseCreated { .. } => self.cases_created += 1,
            AppealEvent::EmailSent { .. } => self.emails_sent += 1,
            AppealEvent::ReplyLinked { .. } => self.replies_linked += 1,
            AppealEvent::ReplyParked { .. } => self.replies_parked += 1,
            AppealEvent::StaleWriteDropped { .. } => self.stale_writes += 1,
            _ => {}
        }
    }
}

#[derive(Debug, Serialize)]
struct AuditLine<'a> {
    ts: String,
    event_type: &'a str,
    details: serde_json::Value,
    counters: AppealCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

struct ChainState {
    prev_hash: Option<String>,
    counters: AppealCounters,
}

struct AuditLogger {
    path: PathBuf,
    hash_chain: bool,
    state: Mutex<ChainState>,
}

impl AuditLogger {
    fn new(path: PathBuf, hash_chain: bool) -> Self {
        Self {
            path,
            hash_chain,
            state: Mutex::new(ChainState {
                prev_hash: None,
                counters: AppealCounters::default(),
            }),
        }
    }

    fn write(&self, event: &AppealEvent<'_>) {
        // One lock covers counters, chain head and the append so lines are
        // written in chain order.
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Appeal audit state lock poisoned: {}", e);
                return;
            }
        };
        state.counters.count(event);

        let mut line = AuditLine {
            ts: Utc::now().to_rfc3339(),
            event_type: event.event_type(),
            details: event.details(),
            counters: state.counters.clone(),
            prev_hash: state.prev_hash.clone(),
            hash: None,
        };

        let mut next_hash = None;
        if self.hash_chain {
            let to_hash = match serde_json::to_string(&line) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("Failed to serialize audit event for hashing: {}", e);
                    return;
                }
            };
            let mut hasher = Sha256::new();
            hasher.update(to_hash.as_bytes());
            let hash = format!("{:x}", hasher.finalize());
            line.hash = Some(hash.clone());
            next_hash = Some(hash);
        }

        let serialized = match serde_json::to_string(&line) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Failed to serialize appeal audit event: {}", e);
                return;
            }
        };

        if self.append(&serialized) && next_hash.is_some() {
            state.prev_hash = next_hash;
        }
    }

    fn append(&self, serialized: &str) -> bool {
        if let Some(parent) = self.path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::warn!("Failed to create appeal audit log dir {:?}: {}", parent, e);
            return false;
        }

        let mut open_opts = OpenOptions::new();
        open_opts.create(true).append(true);
        #[cfg(unix)]
        open_opts.mode(0o600);
        let mut file = match open_opts.open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Failed to open appeal audit log {:?}: {}", self.path, e);
                return false;
            }
        };

        // Pre-existing files must not be readable by anyone but the owner.
        #[cfg(unix)]
        {
            let mode = match file.metadata() {
                Ok(meta) => meta.permissions().mode() & 0o777,
                Err(e) => {
                    tracing::warn!("Failed to stat appeal audit log {:?}: {}", self.path, e);
                    return false;
                }
            };
            if mode != 0o600 {
                tracing::warn!(
                    "Refusing to write appeal audit event; insecure mode {:o} on {:?} (expected 600)",
                    mode,
                    self.path
                );
                return false;
            }
        }

        match writeln!(file, "{serialized}") {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to append appeal audit event: {}", e);
                false
            }
        }
    }
}

static LOGGER: OnceLock<AuditLogger> = OnceLock::new();
#[cfg(test)]
static TEST_EVENTS: OnceLock<Mutex<Vec<TestAuditEvent>>> = OnceLock::new();

#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct TestAuditEvent {
    pub event_type: String,
    pub details: serde_json::Value,
}

/// Initialize the process-wide audit logger. Later calls are ignored.
pub fn init(config: &AppealAuditConfig) {
    if !config.enabled {
        return;
    }
    let _ = LOGGER.set(AuditLogger::new(config.path.clone(), config.hash_chain));
}

/// Record a lifecycle event.
pub fn record(event: AppealEvent<'_>) {
    #[cfg(test)]
    push_test_event(&event);
    if let Some(logger) = LOGGER.get() {
        logger.write(&event);
    }
}

/// Returns true if audit logging is active.
pub fn enabled() -> bool {
    LOGGER.get().is_some()
}

#[cfg(test)]
fn push_test_event(event: &AppealEvent<'_>) {
    let events = TEST_EVENTS.get_or_init(|| Mutex::new(Vec::new()));
    if let Ok(mut lock) = events.lock() {
        lock.push(TestAuditEvent {
            event_type: event.event_type().to_string(),
            details: event.details(),
        });
    }
}

/// Events recorded so far that mention `case_id`. Tests run concurrently,
/// so callers filter by an id unique to their test.
#[cfg(test)]
pub(crate) fn test_events_for(case_id: &str) -> Vec<TestAuditEvent> {
    TEST_EVENTS
        .get()
        .and_then(|events| events.lock().ok().map(|lock| lock.clone()))
        .unwrap_or_default()
        .into_iter()
        .filter(|e| e.details.get("case_id").and_then(|v| v.as_str()) == Some(case_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::Value;

    use super::{AppealEvent, AuditLogger, record, test_events_for};

    #[test]
    fn hash_chain_links_consecutive_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::new(path.clone(), true);

        logger.write(&AppealEvent::CaseCreated {
            case_id: "c1",
            user_id: "u1",
        });
        logger.write(&AppealEvent::EmailSent {
            case_id: "c1",
            message_id: "m1",
            thread_id: "t1",
        });

        let raw = fs::read_to_string(path).expect("read audit log");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).expect("first line json");
        let second: Value = serde_json::from_str(lines[1]).expect("second line json");

        let first_hash = first["hash"].as_str().expect("first hash");
        assert!(first.get("prev_hash").is_none());
        assert_eq!(second["prev_hash"].as_str(), Some(first_hash));
        assert_eq!(second["counters"]["cases_created"], 1);
        assert_eq!(second["counters"]["emails_sent"], 1);
    }

    #[test]
    fn lines_carry_identifiers_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::new(path.clone(), false);

        logger.write(&AppealEvent::ReplyParked {
            message_id: "m9",
            thread_id: "t9",
        });

        let raw = fs::read_to_string(path).expect("read audit log");
        let line: Value = serde_json::from_str(raw.trim()).expect("json");
        let details = line["details"].as_object().expect("details object");
        let mut keys: Vec<&str> = details.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["message_id", "thread_id"]);
        assert!(line.get("hash").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn write_refuses_existing_file_with_broad_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        fs::write(&path, "existing\n").expect("seed existing file");
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
            .expect("set permissive mode");

        let logger = AuditLogger::new(path.clone(), false);
        logger.write(&AppealEvent::CaseResolved { case_id: "c1" });

        assert_eq!(fs::read_to_string(&path).expect("read"), "existing\n");
    }

    #[cfg(unix)]
    #[test]
    fn new_files_are_created_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/audit.jsonl");
        let logger = AuditLogger::new(path.clone(), true);
        logger.write(&AppealEvent::CaseResolved { case_id: "c1" });

        let mode = fs::metadata(&path).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn recorded_events_are_captured_for_tests() {
        record(AppealEvent::StaleWriteDropped {
            case_id: "audit-capture-case",
            stage: "extract-denial",
        });
        let events = test_events_for("audit-capture-case");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "stale_write_dropped");
        assert_eq!(events[0].details["stage"], "extract-denial");
    }
}
