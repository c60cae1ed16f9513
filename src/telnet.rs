// =============================================================================
// Telnet Transport — async byte stream with RFC 854 option negotiation
// =============================================================================
//
// Presents a clean application byte stream over a raw TCP connection to a
// BBS.  Inbound IAC sequences are parsed and answered inline during
// `receive`; outbound payloads have every 0xFF doubled (IAC escaping).
//
// Negotiation policy (everything else is refused):
//
//   option              we WILL/WONT        we DO/DONT
//   BINARY (0)          WILL                DO
//   ECHO (1)            WONT                DO
//   SUPPRESS_GA (3)     WILL                DO
//   TTYPE (24)          WILL + name reply   DONT
//   NAWS (31)           WILL + size reply   DONT
//
// A receive timeout yields an empty buffer, never an error.
// =============================================================================

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::errors::BotError;

// ── Telnet command bytes ─────────────────────────────────────────────────────

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

// ── Option bytes ─────────────────────────────────────────────────────────────

const OPT_BINARY: u8 = 0;
const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;
const OPT_TTYPE: u8 = 24;
const OPT_NAWS: u8 = 31;

/// TTYPE subnegotiation sub-commands.
const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

// ── Parser state ─────────────────────────────────────────────────────────────

/// Inbound IAC parser state, preserved across `receive` calls so that
/// sequences split over TCP segments are reassembled correctly.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseState {
    Data,
    /// Saw IAC; waiting for the command byte.
    Command,
    /// Saw IAC DO/DONT/WILL/WONT; waiting for the option byte.
    Negotiate(u8),
    /// Inside a subnegotiation; collecting bytes until IAC SE.
    Subneg(Vec<u8>),
    /// Inside a subnegotiation and the last byte was IAC.
    SubnegIac(Vec<u8>),
}

// =============================================================================
// TelnetTransport
// =============================================================================

/// A connected telnet client. One per Session; never shared across bots.
#[derive(Debug)]
pub struct TelnetTransport {
    stream: Option<TcpStream>,
    term_name: String,
    cols: u16,
    rows: u16,
    parse_state: ParseState,
    /// Options we have already agreed to enable locally (keyed by option
    /// byte). Replies are only sent on state changes to avoid negotiation
    /// loops with servers that re-request options.
    local_enabled: [bool; 256],
    /// Options we have agreed the remote may enable.
    remote_enabled: [bool; 256],
    /// True once the server has sent DO NAWS, so later resizes re-advertise.
    naws_active: bool,
}

impl TelnetTransport {
    /// TCP connect with a timeout, then send our initial option requests.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        term_name: &str,
        cols: u16,
        rows: u16,
    ) -> Result<Self, BotError> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| BotError::Transport(format!("connect to {addr} timed out")))?
            .map_err(|e| BotError::Transport(format!("connect to {addr} failed: {e}")))?;

        stream
            .set_nodelay(true)
            .map_err(|e| BotError::Transport(format!("set_nodelay failed: {e}")))?;

        let mut transport = Self {
            stream: Some(stream),
            term_name: term_name.to_string(),
            cols,
            rows,
            parse_state: ParseState::Data,
            local_enabled: [false; 256],
            remote_enabled: [false; 256],
            naws_active: false,
        };

        // Opening handshake: request BINARY both ways and SGA; offer TTYPE
        // and NAWS so the server can ask for them.
        transport
            .send_raw(&[
                IAC, WILL, OPT_BINARY,
                IAC, DO, OPT_BINARY,
                IAC, WILL, OPT_SGA,
                IAC, DO, OPT_SGA,
                IAC, WILL, OPT_TTYPE,
                IAC, WILL, OPT_NAWS,
            ])
            .await?;

        debug!(addr = %addr, term = %transport.term_name, "telnet connected");
        Ok(transport)
    }

    /// Write application bytes, doubling every IAC.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), BotError> {
        let mut escaped = Vec::with_capacity(data.len());
        for &b in data {
            if b == IAC {
                escaped.push(IAC);
            }
            escaped.push(b);
        }
        self.send_raw(&escaped).await
    }

    /// Read up to `max_bytes` of application data or until `timeout`.
    ///
    /// A timeout with no bytes received returns `Ok(vec![])`. Negotiation
    /// sequences are answered inline and stripped from the result.
    pub async fn receive(
        &mut self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, BotError> {
        let mut buf = vec![0u8; max_bytes.max(1)];

        let n = {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| BotError::Disconnected("transport closed".into()))?;

            match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
                Err(_) => return Ok(Vec::new()),
                Ok(Ok(0)) => {
                    self.stream = None;
                    return Err(BotError::Disconnected("peer closed connection".into()));
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    self.stream = None;
                    return Err(BotError::Transport(format!("read failed: {e}")));
                }
            }
        };

        self.process_inbound(&buf[..n]).await
    }

    /// Advertise a new window size. Stored for future NAWS requests and sent
    /// immediately when NAWS is already active.
    pub async fn set_size(&mut self, cols: u16, rows: u16) -> Result<(), BotError> {
        self.cols = cols;
        self.rows = rows;
        if self.naws_active {
            self.send_naws().await?;
        }
        Ok(())
    }

    /// True while the TCP stream is open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the connection. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("telnet transport closed");
        }
    }

    // ── Inbound IAC processing ──────────────────────────────────────────

    /// Run the inbound parser over `data`, answering negotiations and
    /// returning the application bytes.
    async fn process_inbound(&mut self, data: &[u8]) -> Result<Vec<u8>, BotError> {
        let mut out = Vec::with_capacity(data.len());
        let mut replies: Vec<u8> = Vec::new();

        for &b in data {
            let state = std::mem::replace(&mut self.parse_state, ParseState::Data);
            match state {
                ParseState::Data => {
                    if b == IAC {
                        self.parse_state = ParseState::Command;
                    } else {
                        out.push(b);
                    }
                }
                ParseState::Command => match b {
                    IAC => {
                        // Escaped 0xFF data byte.
                        out.push(IAC);
                    }
                    DO | DONT | WILL | WONT => {
                        self.parse_state = ParseState::Negotiate(b);
                    }
                    SB => {
                        self.parse_state = ParseState::Subneg(Vec::new());
                    }
                    SE => {
                        // Stray SE outside a subnegotiation; drop it.
                        trace!("stray IAC SE ignored");
                    }
                    _ => {
                        // NOP, GA, AYT and friends carry no payload.
                        trace!(cmd = b, "telnet command ignored");
                    }
                },
                ParseState::Negotiate(cmd) => {
                    self.answer_negotiation(cmd, b, &mut replies);
                }
                ParseState::Subneg(mut acc) => {
                    if b == IAC {
                        self.parse_state = ParseState::SubnegIac(acc);
                    } else {
                        acc.push(b);
                        self.parse_state = ParseState::Subneg(acc);
                    }
                }
                ParseState::SubnegIac(mut acc) => {
                    if b == SE {
                        self.handle_subnegotiation(&acc, &mut replies);
                    } else if b == IAC {
                        acc.push(IAC);
                        self.parse_state = ParseState::Subneg(acc);
                    } else {
                        // Malformed subnegotiation; abandon it.
                        warn!(byte = b, "malformed subnegotiation terminator");
                    }
                }
            }
        }

        if !replies.is_empty() {
            self.send_raw(&replies).await?;
        }

        Ok(out)
    }

    /// Apply the negotiation policy table for one DO/DONT/WILL/WONT.
    fn answer_negotiation(&mut self, cmd: u8, opt: u8, replies: &mut Vec<u8>) {
        match cmd {
            DO => {
                let accept = matches!(opt, OPT_BINARY | OPT_SGA | OPT_TTYPE | OPT_NAWS);
                if accept {
                    if !self.local_enabled[opt as usize] {
                        self.local_enabled[opt as usize] = true;
                        replies.extend_from_slice(&[IAC, WILL, opt]);
                    }
                    if opt == OPT_NAWS {
                        self.naws_active = true;
                        push_naws(replies, self.cols, self.rows);
                    }
                } else {
                    self.local_enabled[opt as usize] = false;
                    replies.extend_from_slice(&[IAC, WONT, opt]);
                }
                trace!(opt, accept, "answered DO");
            }
            DONT => {
                if self.local_enabled[opt as usize] {
                    self.local_enabled[opt as usize] = false;
                    replies.extend_from_slice(&[IAC, WONT, opt]);
                }
                if opt == OPT_NAWS {
                    self.naws_active = false;
                }
            }
            WILL => {
                let accept = matches!(opt, OPT_BINARY | OPT_ECHO | OPT_SGA);
                if accept {
                    if !self.remote_enabled[opt as usize] {
                        self.remote_enabled[opt as usize] = true;
                        replies.extend_from_slice(&[IAC, DO, opt]);
                    }
                } else {
                    self.remote_enabled[opt as usize] = false;
                    replies.extend_from_slice(&[IAC, DONT, opt]);
                }
                trace!(opt, accept, "answered WILL");
            }
            WONT => {
                if self.remote_enabled[opt as usize] {
                    self.remote_enabled[opt as usize] = false;
                    replies.extend_from_slice(&[IAC, DONT, opt]);
                }
            }
            _ => unreachable!("negotiate state only entered for DO/DONT/WILL/WONT"),
        }
    }

    /// Handle a completed subnegotiation payload (option byte + body).
    fn handle_subnegotiation(&mut self, payload: &[u8], replies: &mut Vec<u8>) {
        match payload.first() {
            Some(&OPT_TTYPE) if payload.get(1) == Some(&TTYPE_SEND) => {
                replies.extend_from_slice(&[IAC, SB, OPT_TTYPE, TTYPE_IS]);
                replies.extend_from_slice(self.term_name.as_bytes());
                replies.extend_from_slice(&[IAC, SE]);
                debug!(term = %self.term_name, "answered TTYPE SEND");
            }
            Some(&opt) => {
                trace!(opt, len = payload.len(), "subnegotiation ignored");
            }
            None => {}
        }
    }

    // ── Raw write ───────────────────────────────────────────────────────

    async fn send_raw(&mut self, data: &[u8]) -> Result<(), BotError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| BotError::Disconnected("transport closed".into()))?;

        match stream.write_all(data).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe
                || e.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                self.stream = None;
                Err(BotError::Disconnected(format!("peer closed on write: {e}")))
            }
            Err(e) => {
                self.stream = None;
                Err(BotError::Transport(format!("write failed: {e}")))
            }
        }
    }

    async fn send_naws(&mut self) -> Result<(), BotError> {
        let mut frame = Vec::new();
        push_naws(&mut frame, self.cols, self.rows);
        self.send_raw(&frame).await
    }
}

/// Append an IAC SB NAWS <cols> <rows> IAC SE frame. Size bytes equal to IAC
/// are doubled per RFC 1073.
fn push_naws(out: &mut Vec<u8>, cols: u16, rows: u16) {
    out.extend_from_slice(&[IAC, SB, OPT_NAWS]);
    for b in [
        (cols >> 8) as u8,
        (cols & 0xFF) as u8,
        (rows >> 8) as u8,
        (rows & 0xFF) as u8,
    ] {
        if b == IAC {
            out.push(IAC);
        }
        out.push(b);
    }
    out.extend_from_slice(&[IAC, SE]);
}
