// =============================================================================
// Session — one coordinated BBS connection
// =============================================================================
//
// Owns the telnet transport, terminal emulator, JSONL logger, and prompt
// detector for a single live connection.  Exposes `read` (receive -> feed
// emulator -> snapshot -> detect -> log) and `send` (CP437 encode -> IAC
// escaped write -> clear idempotence hash -> log).
//
// Exclusivity: read and send share one tokio Mutex acquired with try_lock,
// so a second in-flight operation fails deterministically with SessionBusy
// instead of interleaving bytes.  Correct callers never trip this.
// =============================================================================

pub mod logger;
pub mod manager;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::detect::{DetectOutcome, PromptDetection, PromptDetector};
use crate::errors::BotError;
use crate::telnet::TelnetTransport;
use crate::terminal::{encode_cp437, Snapshot, TerminalEmulator};
use logger::SessionLogger;

pub use manager::SessionManager;

// =============================================================================
// Parameters
// =============================================================================

/// Everything needed to open a session.
pub struct SessionParams {
    pub host: String,
    pub port: u16,
    pub term_name: String,
    pub cols: u16,
    pub rows: u16,
    pub connect_timeout: Duration,
    /// JSONL log destination; `None` discards events.
    pub log_path: Option<PathBuf>,
    pub rules: crate::detect::rules::RuleSet,
    pub idle_threshold: Duration,
}

impl SessionParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            term_name: "ansi".to_string(),
            cols: 80,
            rows: 25,
            connect_timeout: Duration::from_secs(10),
            log_path: None,
            rules: crate::detect::rules::RuleSet::empty("none"),
            idle_threshold: crate::detect::DEFAULT_IDLE_THRESHOLD,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    /// Serialization primitive for read/send — the transport lives inside.
    io: tokio::sync::Mutex<TelnetTransport>,
    emulator: Mutex<TerminalEmulator>,
    pub logger: SessionLogger,
    detector: PromptDetector,
    /// Idempotent-read guard: hash of the last screen a detection fired on.
    /// Cleared by every successful send.
    last_processed_hash: Mutex<Option<String>>,
    last_activity: Mutex<Instant>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    /// Optional tap receiving a copy of every raw chunk (spy channels).
    raw_tap: Mutex<Option<tokio::sync::mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Session {
    /// Connect and assemble a new session.
    pub async fn connect(params: SessionParams) -> Result<Arc<Self>, BotError> {
        let session_id = Uuid::new_v4().to_string();
        let logger = SessionLogger::new(&session_id, params.log_path.clone());

        let transport = TelnetTransport::connect(
            &params.host,
            params.port,
            params.connect_timeout,
            &params.term_name,
            params.cols,
            params.rows,
        )
        .await?;

        logger.log(
            "connect",
            json!({
                "host": params.host,
                "port": params.port,
                "term_name": params.term_name,
                "cols": params.cols,
                "rows": params.rows,
            }),
        );

        info!(session_id = %session_id, host = %params.host, port = params.port, "session connected");

        Ok(Arc::new(Self {
            session_id,
            io: tokio::sync::Mutex::new(transport),
            emulator: Mutex::new(TerminalEmulator::new(
                params.cols,
                params.rows,
                &params.term_name,
            )),
            logger,
            detector: PromptDetector::new(params.rules, params.idle_threshold),
            last_processed_hash: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            keepalive: Mutex::new(None),
            connected: AtomicBool::new(true),
            raw_tap: Mutex::new(None),
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Attach structured metadata to every subsequent log record.
    pub fn set_context(&self, context: serde_json::Value) {
        self.logger.set_context(context);
    }

    // ── Read ────────────────────────────────────────────────────────────

    /// One read cycle: receive bytes, feed the emulator, snapshot, detect,
    /// log.  A receive timeout yields a snapshot with empty `raw_bytes`.
    pub async fn read(
        &self,
        timeout: Duration,
        max_bytes: usize,
    ) -> Result<(Snapshot, Option<PromptDetection>), BotError> {
        let mut io = self
            .io
            .try_lock()
            .map_err(|_| BotError::SessionBusy(format!("read on {}", self.session_id)))?;

        let raw = match io.receive(max_bytes, timeout).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_disconnect() => {
                self.mark_disconnected(&e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        drop(io);

        *self.last_activity.lock() = Instant::now();

        if !raw.is_empty() {
            if let Some(tap) = self.raw_tap.lock().as_ref() {
                let _ = tap.send(raw.clone());
            }
        }

        let screen = {
            let mut emulator = self.emulator.lock();
            emulator.feed(&raw);
            emulator.screen()
        };

        let snapshot = Snapshot::from_screen(
            screen,
            raw,
            Utc::now().to_rfc3339(),
            self.logger.mono_ms(),
        );

        let last_hash = self.last_processed_hash.lock().clone();
        let outcome = self.detector.detect(&snapshot, last_hash.as_deref());

        if let Some(det) = &outcome.detection {
            *self.last_processed_hash.lock() = Some(snapshot.screen_hash.clone());
            self.logger.log("prompt_detected", det.to_log_value());
        } else if !outcome.partial_matches.is_empty() {
            // Rules that matched their pattern but fell to a later gate,
            // for tracing missing or too-strict rules.
            debug!(
                session_id = %self.session_id,
                partials = ?outcome.partial_matches,
                "prompt partial matches"
            );
        }

        let det_value = outcome.detection.as_ref().map(|d| d.to_log_value());
        self.logger.log_read(
            &snapshot.screen_hash,
            snapshot.cursor.col,
            snapshot.cursor.row,
            &snapshot.raw_bytes,
            det_value.as_ref(),
        );

        Ok((snapshot, outcome.detection))
    }

    /// Install (or clear) the raw-byte tap used by spy channels.
    pub fn set_raw_tap(&self, tap: Option<tokio::sync::mpsc::UnboundedSender<Vec<u8>>>) {
        *self.raw_tap.lock() = tap;
    }

    /// Evaluate the rule pipeline against the current screen without reading
    /// more bytes — the manager's screen-analysis surface.
    pub fn analyze_current(&self) -> (Snapshot, DetectOutcome) {
        let screen = self.emulator.lock().screen();
        let snapshot = Snapshot::from_screen(
            screen,
            Vec::new(),
            Utc::now().to_rfc3339(),
            self.logger.mono_ms(),
        );
        let outcome = self.detector.analyze(&snapshot);
        (snapshot, outcome)
    }

    // ── Send ────────────────────────────────────────────────────────────

    /// Send keystrokes.  Clears the idempotence hash so the next read
    /// re-detects.
    pub async fn send(&self, keys: &str) -> Result<(), BotError> {
        let mut io = self
            .io
            .try_lock()
            .map_err(|_| BotError::SessionBusy(format!("send on {}", self.session_id)))?;

        let bytes = encode_cp437(keys);
        match io.send(&bytes).await {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                self.mark_disconnected(&e);
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        drop(io);

        *self.last_processed_hash.lock() = None;
        *self.last_activity.lock() = Instant::now();
        self.logger.log_send(keys);
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Read repeatedly until `pattern` matches the screen text or the
    /// deadline expires.
    pub async fn read_until_pattern(
        &self,
        pattern: &Regex,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Snapshot, BotError> {
        let deadline = Instant::now() + timeout;
        loop {
            let (snapshot, _) = self.read(interval, 4096).await?;
            if pattern.is_match(&snapshot.screen_text) {
                return Ok(snapshot);
            }
            if Instant::now() >= deadline {
                return Err(BotError::PromptTimeout(format!(
                    "pattern '{pattern}' not seen within {timeout:?}"
                )));
            }
        }
    }

    /// Read until a prompt is detected.  With `prompt_id = None` any
    /// detection satisfies the wait.
    pub async fn wait_for_prompt(
        &self,
        prompt_id: Option<&str>,
        timeout: Duration,
        interval: Duration,
    ) -> Result<PromptDetection, BotError> {
        let deadline = Instant::now() + timeout;
        loop {
            let (_, detection) = self.read(interval, 4096).await?;
            if let Some(det) = detection {
                match prompt_id {
                    None => return Ok(det),
                    Some(id) if det.prompt_id == id => return Ok(det),
                    Some(_) => {}
                }
            }
            if Instant::now() >= deadline {
                return Err(BotError::PromptTimeout(format!(
                    "prompt {:?} not seen within {timeout:?}",
                    prompt_id.unwrap_or("<any>")
                )));
            }
        }
    }

    // ── Keepalive ───────────────────────────────────────────────────────

    /// Periodically send `keys` whenever the session has been idle for
    /// `interval`.  A zero interval disables the keepalive.
    pub fn set_keepalive(self: &Arc<Self>, interval: Duration, keys: String) {
        let mut guard = self.keepalive.lock();
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        if interval.is_zero() {
            debug!(session_id = %self.session_id, "keepalive disabled");
            return;
        }

        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let tick = interval.min(Duration::from_secs(5)).max(Duration::from_millis(250));
            loop {
                tokio::time::sleep(tick).await;
                if !session.is_connected() {
                    break;
                }
                let idle_for = session.last_activity.lock().elapsed();
                if idle_for >= interval {
                    match session.send(&keys).await {
                        Ok(()) => debug!(session_id = %session.session_id, "keepalive sent"),
                        // A bot operation won the lock; the session is not
                        // idle after all.
                        Err(BotError::SessionBusy(_)) => {}
                        Err(e) => {
                            warn!(session_id = %session.session_id, error = %e, "keepalive send failed");
                            break;
                        }
                    }
                }
            }
        });
        *guard = Some(handle);
    }

    /// Resize the emulator grid and advertise the new size via NAWS.
    pub async fn set_size(&self, cols: u16, rows: u16) -> Result<(), BotError> {
        let mut io = self
            .io
            .try_lock()
            .map_err(|_| BotError::SessionBusy(format!("set_size on {}", self.session_id)))?;
        io.set_size(cols, rows).await?;
        drop(io);
        self.emulator.lock().resize(cols, rows);
        self.logger
            .log("note", json!({ "text": format!("resized to {cols}x{rows}") }));
        Ok(())
    }

    // ── Teardown ────────────────────────────────────────────────────────

    fn mark_disconnected(&self, cause: &BotError) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.logger
                .log("disconnect", json!({ "reason": cause.to_string() }));
            warn!(session_id = %self.session_id, cause = %cause, "session disconnected");
        }
    }

    /// Close the transport.  Idempotent.
    pub async fn close(&self) {
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
        let mut io = self.io.lock().await;
        io.close().await;
        if self.connected.swap(false, Ordering::SeqCst) {
            self.logger.log("disconnect", json!({ "reason": "closed" }));
            info!(session_id = %self.session_id, "session closed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::rules::{RuleSet, RulesFile};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn tw_rules() -> RuleSet {
        let file: RulesFile = serde_json::from_str(
            r#"{
                "namespace": "tw2002",
                "rules": [
                    { "id": "sector_command", "pattern": "Command \\[TL=", "input_type": "single_key" }
                ]
            }"#,
        )
        .unwrap();
        RuleSet::compile(file)
    }

    /// A fake BBS that swallows negotiation and pushes `screen` once.
    async fn fake_bbs(screen: &'static [u8]) -> (std::net::SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut drain = [0u8; 128];
            let _ = stream.read(&mut drain).await;
            stream.write_all(screen).await.unwrap();
            // Hold the connection open until the client goes away.
            let mut buf = [0u8; 128];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        (addr, handle)
    }

    fn params(addr: std::net::SocketAddr, rules: RuleSet) -> SessionParams {
        let mut p = SessionParams::new("127.0.0.1", addr.port());
        p.rules = rules;
        p.idle_threshold = Duration::from_millis(0);
        p.connect_timeout = Duration::from_secs(2);
        p
    }

    #[tokio::test]
    async fn read_detects_prompt_and_idempotence_holds() {
        let (addr, _bbs) = fake_bbs(b"Command [TL=00:00:00]:[499] : ").await;
        let session = Session::connect(params(addr, tw_rules())).await.unwrap();

        // First read sees the prompt.
        let mut detection = None;
        for _ in 0..10 {
            let (_, det) = session
                .read(Duration::from_millis(200), 4096)
                .await
                .unwrap();
            if det.is_some() {
                detection = det;
                break;
            }
        }
        assert_eq!(detection.unwrap().prompt_id, "sector_command");

        // With no new bytes the next read must not re-fire.
        let (_, det2) = session
            .read(Duration::from_millis(100), 4096)
            .await
            .unwrap();
        assert!(det2.is_none());

        // A send clears the guard so the same screen detects again.
        session.send(" ").await.unwrap();
        let (_, det3) = session
            .read(Duration::from_millis(100), 4096)
            .await
            .unwrap();
        assert!(det3.is_some());
    }

    /// A BBS that accepts and never says anything.
    async fn silent_bbs() -> (std::net::SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 128];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn concurrent_operations_fail_with_session_busy() {
        let (addr, _bbs) = silent_bbs().await;
        let session = Session::connect(params(addr, RuleSet::empty("t"))).await.unwrap();

        // A long read holds the io lock; the send must fail fast.
        let reader = {
            let s = Arc::clone(&session);
            tokio::spawn(async move { s.read(Duration::from_millis(800), 4096).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;

        let err = session.send("x").await.unwrap_err();
        assert!(matches!(err, BotError::SessionBusy(_)));
        reader.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn read_logs_raw_bytes_base64() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("session.jsonl");
        let (addr, _bbs) = fake_bbs(b"hello bbs").await;
        let mut p = params(addr, RuleSet::empty("t"));
        p.log_path = Some(log_path);
        let session = Session::connect(p).await.unwrap();

        // Poll until the payload shows up.
        for _ in 0..10 {
            let (snap, _) = session
                .read(Duration::from_millis(200), 4096)
                .await
                .unwrap();
            if snap.screen_text.contains("hello bbs") {
                break;
            }
        }

        let records = session.logger.read_records();
        let reads: Vec<_> = records.iter().filter(|r| r["event"] == "read").collect();
        assert!(!reads.is_empty());
        // Concatenated decoded raw bytes must contain the payload.
        use base64::Engine;
        let all: Vec<u8> = reads
            .iter()
            .flat_map(|r| {
                base64::engine::general_purpose::STANDARD
                    .decode(r["raw_b64"].as_str().unwrap())
                    .unwrap()
            })
            .collect();
        let text = String::from_utf8_lossy(&all);
        assert!(text.contains("hello bbs"));
    }

    #[tokio::test]
    async fn wait_for_prompt_times_out() {
        let (addr, _bbs) = fake_bbs(b"nothing interesting").await;
        let session = Session::connect(params(addr, tw_rules())).await.unwrap();
        let err = session
            .wait_for_prompt(Some("sector_command"), Duration::from_millis(300), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::PromptTimeout(_)));
    }

    #[tokio::test]
    async fn keepalive_fires_when_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // First read drains the opening handshake.
            let mut buf = [0u8; 128];
            let _ = stream.read(&mut buf).await;
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let _ = tx.send(buf[..n].to_vec());
                    }
                }
            }
        });

        let session = Session::connect(params(addr, RuleSet::empty("t"))).await.unwrap();
        session.set_keepalive(Duration::from_millis(300), " ".to_string());

        // With no reads or sends, the keepalive must fire on its own.
        let received = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("keepalive never reached the server")
            .unwrap();
        assert!(received.contains(&b' '));

        // Zero interval disables it; no further traffic arrives.
        session.set_keepalive(Duration::ZERO, " ".to_string());
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(rx.try_recv().is_err());
        session.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (addr, _bbs) = fake_bbs(b"x").await;
        let session = Session::connect(params(addr, RuleSet::empty("t"))).await.unwrap();
        session.close().await;
        session.close().await;
        assert!(!session.is_connected());
    }
}
