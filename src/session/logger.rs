// =============================================================================
// Session Logger — append-only JSONL event stream
// =============================================================================
//
// One JSON record per line. The file is created lazily on the first write so
// that sessions which never produce events leave no artifact.  Raw bytes of
// every read are logged base64-encoded; this is what makes post-hoc
// reinterpretation possible when the emulator or detector misreads a screen.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::warn;

/// Append-only structured log for one session.
#[derive(Debug)]
pub struct SessionLogger {
    session_id: String,
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
    /// Arbitrary structured metadata merged into every record once set.
    context: Mutex<Option<Value>>,
    epoch: Instant,
}

impl SessionLogger {
    /// Create a logger. `path = None` discards all records (used by probes
    /// and unit tests that do not care about the log).
    pub fn new(session_id: &str, path: Option<PathBuf>) -> Self {
        Self {
            session_id: session_id.to_string(),
            path,
            file: Mutex::new(None),
            context: Mutex::new(None),
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since this logger (and its session) started.
    pub fn mono_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Attach context merged into every subsequent record. Logs a
    /// `context_set` event recording the change.
    pub fn set_context(&self, context: Value) {
        *self.context.lock() = Some(context.clone());
        self.log("context_set", json!({ "context": context }));
    }

    /// Append one event record. Failures are reported once via `tracing` and
    /// never propagate: logging must not take a session down.
    pub fn log(&self, event: &str, payload: Value) {
        let Some(path) = &self.path else { return };

        let mut record = json!({
            "ts": Utc::now().to_rfc3339(),
            "mono_ms": self.mono_ms(),
            "event": event,
            "session_id": self.session_id,
        });

        if let (Some(obj), Value::Object(extra)) = (record.as_object_mut(), payload) {
            for (k, v) in extra {
                obj.insert(k, v);
            }
        }
        if let Some(ctx) = self.context.lock().clone() {
            if let Some(obj) = record.as_object_mut() {
                obj.insert("context".to_string(), ctx);
            }
        }

        let mut guard = self.file.lock();
        if guard.is_none() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "session log open failed");
                    return;
                }
            }
        }

        if let Some(f) = guard.as_mut() {
            let line = record.to_string();
            if writeln!(f, "{line}").is_err() {
                warn!(path = %path.display(), "session log write failed");
            }
        }
    }

    /// Log a `read` event. The raw bytes received since the prior read are
    /// always included, base64-encoded.
    pub fn log_read(
        &self,
        screen_hash: &str,
        cursor_col: u16,
        cursor_row: u16,
        raw_bytes: &[u8],
        detection: Option<&Value>,
    ) {
        let mut payload = json!({
            "screen_hash": screen_hash,
            "cursor": { "col": cursor_col, "row": cursor_row },
            "raw_b64": BASE64.encode(raw_bytes),
        });
        if let (Some(obj), Some(det)) = (payload.as_object_mut(), detection) {
            obj.insert("detection".to_string(), det.clone());
        }
        self.log("read", payload);
    }

    /// Log a `send` event with the keys that were transmitted.
    pub fn log_send(&self, keys: &str) {
        self.log("send", json!({ "keys": keys }));
    }

    pub fn log_error(&self, kind: &str, message: &str) {
        self.log("error", json!({ "error_type": kind, "message": message }));
    }

    /// Read back all records from the log file (replay / event queries).
    pub fn read_records(&self) -> Vec<Value> {
        let Some(path) = &self.path else {
            return Vec::new();
        };
        let Ok(content) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}
