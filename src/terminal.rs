// =============================================================================
// Terminal Emulator — fixed-grid ANSI/CP437 emulation for BBS screens
// =============================================================================
//
// Applies a received byte stream to a cols x rows character grid and exposes
// immutable screen snapshots.  Only the CSI subset BBS content actually uses
// is implemented: cursor movement (CUP/CUU/CUD/CUF/CUB), erase (ED/EL), SGR
// (parsed, attributes discarded), and save/restore cursor.  Bytes 0x80-0xFF
// map through the CP437 glyph table into Unicode.
//
// Line wrap advances to the next row after the right margin; a line feed on
// the bottom row scrolls the grid up by one.
// =============================================================================

use serde::Serialize;
use sha2::{Digest, Sha256};

// =============================================================================
// CP437 mapping
// =============================================================================

/// Glyphs for CP437 bytes 0x80-0xFF.
const CP437_HIGH: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å',
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ',
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»',
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐',
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧',
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀',
    'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩',
    '≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{00A0}',
];

/// Decode one CP437 byte to its Unicode glyph.
pub fn cp437_to_char(byte: u8) -> char {
    if byte < 0x80 {
        byte as char
    } else {
        CP437_HIGH[(byte - 0x80) as usize]
    }
}

/// Encode a Unicode character back to CP437. Unmappable characters become
/// `?` so outbound keystrokes never fail.
pub fn char_to_cp437(c: char) -> u8 {
    if c.is_ascii() {
        return c as u8;
    }
    CP437_HIGH
        .iter()
        .position(|&g| g == c)
        .map(|i| (i + 0x80) as u8)
        .unwrap_or(b'?')
}

/// Encode a whole string to CP437 bytes.
pub fn encode_cp437(s: &str) -> Vec<u8> {
    s.chars().map(char_to_cp437).collect()
}

// =============================================================================
// Snapshot types
// =============================================================================

/// Cursor position in screen coordinates (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cursor {
    pub col: u16,
    pub row: u16,
}

/// Immutable observation of the terminal grid at one moment in time.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Rows joined by `\n`, each right-padded with spaces to the full width.
    pub screen_text: String,
    /// Hex SHA-256 of `screen_text`. Changes iff the text changes.
    pub screen_hash: String,
    pub cursor: Cursor,
    /// Wall-clock capture time (RFC 3339).
    pub captured_at: String,
    /// Milliseconds since the session started (monotonic).
    pub mono_ms: u64,
    /// Raw bytes received since the previous snapshot.
    #[serde(skip)]
    pub raw_bytes: Vec<u8>,
    /// Cursor lies on or after the last non-blank glyph of the last
    /// non-blank row.
    pub cursor_at_end: bool,
    /// The glyph immediately before the cursor is blank.
    pub has_trailing_space: bool,
}

/// Pure screen portion of a snapshot, produced by the emulator. The session
/// layer attaches raw bytes and timestamps to build a full [`Snapshot`].
#[derive(Debug, Clone)]
pub struct Screen {
    pub text: String,
    pub hash: String,
    pub cursor: Cursor,
    pub cursor_at_end: bool,
    pub has_trailing_space: bool,
}

impl Snapshot {
    pub fn from_screen(screen: Screen, raw_bytes: Vec<u8>, captured_at: String, mono_ms: u64) -> Self {
        Self {
            screen_text: screen.text,
            screen_hash: screen.hash,
            cursor: screen.cursor,
            captured_at,
            mono_ms,
            raw_bytes,
            cursor_at_end: screen.cursor_at_end,
            has_trailing_space: screen.has_trailing_space,
        }
    }
}

// =============================================================================
// Emulator
// =============================================================================

/// ANSI escape parser state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AnsiState {
    Ground,
    Escape,
    Csi { params: String },
}

/// Fixed-grid terminal emulator. One per session; never shared.
#[derive(Debug)]
pub struct TerminalEmulator {
    cols: u16,
    rows: u16,
    term_name: String,
    grid: Vec<Vec<char>>,
    cursor: Cursor,
    saved_cursor: Option<Cursor>,
    state: AnsiState,
}

impl TerminalEmulator {
    pub fn new(cols: u16, rows: u16, term_name: &str) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        Self {
            cols,
            rows,
            term_name: term_name.to_string(),
            grid: vec![vec![' '; cols as usize]; rows as usize],
            cursor: Cursor { col: 0, row: 0 },
            saved_cursor: None,
            state: AnsiState::Ground,
        }
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn term_name(&self) -> &str {
        &self.term_name
    }

    // ── Feeding ─────────────────────────────────────────────────────────

    /// Apply a chunk of received bytes to the grid.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.feed_byte(b);
        }
    }

    fn feed_byte(&mut self, b: u8) {
        let state = std::mem::replace(&mut self.state, AnsiState::Ground);
        match state {
            AnsiState::Ground => match b {
                0x1B => self.state = AnsiState::Escape,
                b'\r' => self.cursor.col = 0,
                b'\n' => self.line_feed(),
                0x08 => self.cursor.col = self.cursor.col.saturating_sub(1),
                b'\t' => {
                    let next = ((self.cursor.col / 8) + 1) * 8;
                    self.cursor.col = next.min(self.cols - 1);
                }
                0x07 => {}
                0x00..=0x1F => {}
                _ => self.print_char(cp437_to_char(b)),
            },
            AnsiState::Escape => match b {
                b'[' => {
                    self.state = AnsiState::Csi {
                        params: String::new(),
                    }
                }
                b'7' => self.saved_cursor = Some(self.cursor),
                b'8' => {
                    if let Some(saved) = self.saved_cursor {
                        self.cursor = saved;
                        self.clamp_cursor();
                    }
                }
                b'c' => self.reset(),
                // Unsupported escape: swallow the final byte and recover.
                _ => {}
            },
            AnsiState::Csi { mut params } => {
                if (0x30..=0x3F).contains(&b) || (0x20..=0x2F).contains(&b) {
                    // Parameter and intermediate bytes accumulate; a runaway
                    // sequence is abandoned rather than growing unbounded.
                    if params.len() < 64 {
                        params.push(b as char);
                        self.state = AnsiState::Csi { params };
                    }
                } else if (0x40..=0x7E).contains(&b) {
                    self.dispatch_csi(&params, b);
                }
                // Anything else aborts the sequence back to ground.
            }
        }
    }

    fn dispatch_csi(&mut self, params: &str, final_byte: u8) {
        // Private-mode sequences (e.g. `?25l`) are parsed and discarded.
        let params = params.trim_start_matches(|c| c == '?' || c == '>');
        let args: Vec<u16> = params
            .split(';')
            .map(|p| p.parse::<u16>().unwrap_or(0))
            .collect();
        let arg = |i: usize, default: u16| -> u16 {
            match args.get(i) {
                Some(&0) | None => default,
                Some(&v) => v,
            }
        };

        match final_byte {
            // Cursor position (1-based row;col).
            b'H' | b'f' => {
                self.cursor.row = arg(0, 1).saturating_sub(1).min(self.rows - 1);
                self.cursor.col = arg(1, 1).saturating_sub(1).min(self.cols - 1);
            }
            b'A' => self.cursor.row = self.cursor.row.saturating_sub(arg(0, 1)),
            b'B' => self.cursor.row = (self.cursor.row + arg(0, 1)).min(self.rows - 1),
            b'C' => self.cursor.col = (self.cursor.col + arg(0, 1)).min(self.cols - 1),
            b'D' => self.cursor.col = self.cursor.col.saturating_sub(arg(0, 1)),
            // Erase in display.
            b'J' => match args.first().copied().unwrap_or(0) {
                0 => self.erase_display_from_cursor(),
                1 => self.erase_display_to_cursor(),
                2 | 3 => {
                    for row in self.grid.iter_mut() {
                        row.fill(' ');
                    }
                }
                _ => {}
            },
            // Erase in line.
            b'K' => match args.first().copied().unwrap_or(0) {
                0 => {
                    let row = &mut self.grid[self.cursor.row as usize];
                    for c in row.iter_mut().skip(self.cursor.col as usize) {
                        *c = ' ';
                    }
                }
                1 => {
                    let row = &mut self.grid[self.cursor.row as usize];
                    for c in row.iter_mut().take(self.cursor.col as usize + 1) {
                        *c = ' ';
                    }
                }
                2 => self.grid[self.cursor.row as usize].fill(' '),
                _ => {}
            },
            // SGR: visual attributes are not tracked for snapshots.
            b'm' => {}
            b's' => self.saved_cursor = Some(self.cursor),
            b'u' => {
                if let Some(saved) = self.saved_cursor {
                    self.cursor = saved;
                    self.clamp_cursor();
                }
            }
            _ => {}
        }
    }

    fn print_char(&mut self, c: char) {
        self.grid[self.cursor.row as usize][self.cursor.col as usize] = c;
        self.cursor.col += 1;
        if self.cursor.col >= self.cols {
            self.cursor.col = 0;
            self.line_feed();
        }
    }

    fn line_feed(&mut self) {
        if self.cursor.row + 1 >= self.rows {
            self.grid.remove(0);
            self.grid.push(vec![' '; self.cols as usize]);
        } else {
            self.cursor.row += 1;
        }
    }

    fn erase_display_from_cursor(&mut self) {
        let (row, col) = (self.cursor.row as usize, self.cursor.col as usize);
        for c in self.grid[row].iter_mut().skip(col) {
            *c = ' ';
        }
        for r in self.grid.iter_mut().skip(row + 1) {
            r.fill(' ');
        }
    }

    fn erase_display_to_cursor(&mut self) {
        let (row, col) = (self.cursor.row as usize, self.cursor.col as usize);
        for r in self.grid.iter_mut().take(row) {
            r.fill(' ');
        }
        for c in self.grid[row].iter_mut().take(col + 1) {
            *c = ' ';
        }
    }

    fn reset(&mut self) {
        for row in self.grid.iter_mut() {
            row.fill(' ');
        }
        self.cursor = Cursor { col: 0, row: 0 };
        self.saved_cursor = None;
    }

    fn clamp_cursor(&mut self) {
        self.cursor.col = self.cursor.col.min(self.cols - 1);
        self.cursor.row = self.cursor.row.min(self.rows - 1);
    }

    // ── Resizing ────────────────────────────────────────────────────────

    /// Change the grid size. Existing content is truncated or right-padded
    /// and the cursor is clamped into the new bounds.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        let cols = cols.max(1);
        let rows = rows.max(1);
        let mut grid = vec![vec![' '; cols as usize]; rows as usize];
        for (r, row) in self.grid.iter().take(rows as usize).enumerate() {
            for (c, &ch) in row.iter().take(cols as usize).enumerate() {
                grid[r][c] = ch;
            }
        }
        self.grid = grid;
        self.cols = cols;
        self.rows = rows;
        self.clamp_cursor();
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// Produce the current screen state (text, hash, cursor, end flags).
    pub fn screen(&self) -> Screen {
        let text = self
            .grid
            .iter()
            .map(|row| row.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join("\n");

        let hash = hex::encode(Sha256::digest(text.as_bytes()));

        // Locate the last non-blank glyph of the last non-blank row.
        let mut end: Option<(u16, u16)> = None;
        for (r, row) in self.grid.iter().enumerate().rev() {
            if let Some(c) = row.iter().rposition(|&ch| ch != ' ' && ch != '\u{00A0}') {
                end = Some((r as u16, c as u16));
                break;
            }
        }
        let cursor_at_end = match end {
            // Lexicographic (row, col): anything on a later row, or at/after
            // the glyph on the same row, counts as "at end".
            Some((er, ec)) => (self.cursor.row, self.cursor.col) >= (er, ec),
            None => true,
        };

        let has_trailing_space = self.cursor.col > 0
            && self.grid[self.cursor.row as usize][self.cursor.col as usize - 1] == ' ';

        Screen {
            text,
            hash,
            cursor: self.cursor,
            cursor_at_end,
            has_trailing_space,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn emu() -> TerminalEmulator {
        TerminalEmulator::new(80, 25, "ansi")
    }

    #[test]
    fn plain_text_lands_on_grid() {
        let mut e = emu();
        e.feed(b"Hello");
        let s = e.screen();
        assert!(s.text.starts_with("Hello"));
        assert_eq!(s.cursor, Cursor { col: 5, row: 0 });
        assert!(s.cursor_at_end);
        assert!(!s.has_trailing_space);
    }

    #[test]
    fn snapshot_is_deterministic() {
        let bytes = b"\x1b[2J\x1b[1;1HSector  : 499\r\nCommand [TL=00:00:00]:[499] (?=Help)? : ";
        let mut a = emu();
        let mut b = emu();
        a.feed(bytes);
        b.feed(bytes);
        let (sa, sb) = (a.screen(), b.screen());
        assert_eq!(sa.text, sb.text);
        assert_eq!(sa.hash, sb.hash);
        assert_eq!(sa.cursor, sb.cursor);
    }

    #[test]
    fn hash_changes_iff_text_changes() {
        let mut e = emu();
        e.feed(b"abc");
        let h1 = e.screen().hash;
        e.feed(b"\x1b[1m"); // SGR only: no text change
        assert_eq!(e.screen().hash, h1);
        e.feed(b"d");
        assert_ne!(e.screen().hash, h1);
    }

    #[test]
    fn cup_moves_cursor_one_based() {
        let mut e = emu();
        e.feed(b"\x1b[5;10Hx");
        let s = e.screen();
        assert_eq!(s.cursor, Cursor { col: 10, row: 4 });
        assert_eq!(s.text.lines().nth(4).unwrap().as_bytes()[9], b'x');
    }

    #[test]
    fn relative_moves_clamp_at_edges() {
        let mut e = emu();
        e.feed(b"\x1b[10A\x1b[10D"); // up/left from origin
        assert_eq!(e.screen().cursor, Cursor { col: 0, row: 0 });
        e.feed(b"\x1b[99B\x1b[200C");
        assert_eq!(e.screen().cursor, Cursor { col: 79, row: 24 });
    }

    #[test]
    fn erase_display_clears_from_cursor() {
        let mut e = emu();
        e.feed(b"AAAA\r\nBBBB\x1b[1;3H\x1b[0J");
        let s = e.screen();
        assert!(s.text.starts_with("AA  "));
        assert!(!s.text.contains('B'));
    }

    #[test]
    fn erase_line_variants() {
        let mut e = emu();
        e.feed(b"ABCDEF\x1b[1;4H\x1b[K");
        assert!(e.screen().text.starts_with("ABC   "));
        e.feed(b"\x1b[2K");
        assert!(e.screen().text.starts_with("      "));
    }

    #[test]
    fn line_wrap_and_scroll() {
        let mut e = TerminalEmulator::new(4, 2, "ansi");
        e.feed(b"abcdefgh"); // fills both rows, wrapping at col 4
        let s = e.screen();
        // After the second wrap the grid scrolled by one row.
        assert_eq!(s.text, "efgh\n    ");
        assert_eq!(s.cursor.row, 1);
    }

    #[test]
    fn cp437_high_bytes_map_to_glyphs() {
        let mut e = emu();
        e.feed(&[0xC9, 0xCD, 0xBB]); // box-drawing corners
        assert!(e.screen().text.starts_with("╔═╗"));
    }

    #[test]
    fn cp437_encode_round_trip() {
        for byte in 0x20u8..=0xFE {
            let c = cp437_to_char(byte);
            assert_eq!(char_to_cp437(c), byte, "byte {byte:#x}");
        }
    }

    #[test]
    fn save_restore_cursor() {
        let mut e = emu();
        e.feed(b"\x1b[3;7H\x1b[s\x1b[10;1H\x1b[u");
        assert_eq!(e.screen().cursor, Cursor { col: 6, row: 2 });
        e.feed(b"\x1b7\x1b[1;1H\x1b8");
        assert_eq!(e.screen().cursor, Cursor { col: 6, row: 2 });
    }

    #[test]
    fn cursor_at_end_false_when_text_follows() {
        let mut e = emu();
        e.feed(b"Please enter your name (ENTER for none): ");
        assert!(e.screen().cursor_at_end);
        assert!(e.screen().has_trailing_space);
        // Move the cursor back into the middle of the prompt.
        e.feed(b"\x1b[1;10H");
        let s = e.screen();
        assert!(!s.cursor_at_end);
    }

    #[test]
    fn resize_truncates_and_clamps() {
        let mut e = emu();
        e.feed(b"\x1b[25;80H"); // park the cursor at the far corner
        e.resize(40, 10);
        let s = e.screen();
        assert_eq!(s.cursor, Cursor { col: 39, row: 9 });
        assert_eq!(s.text.lines().count(), 10);
        assert!(s.text.lines().all(|l| l.chars().count() == 40));
    }

    #[test]
    fn tab_advances_to_eight_column_stops() {
        let mut e = emu();
        e.feed(b"ab\tc");
        let s = e.screen();
        assert_eq!(s.text.lines().next().unwrap().as_bytes()[8], b'c');
    }
}
