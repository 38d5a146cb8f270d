//! Terminal state of a session, for replay to late joiners.
//!
//! Two views of the same output stream are kept:
//!
//! - a `vt100` grid (cells, styles, cursor) that renders to a snapshot blob
//!   which redraws the screen on a terminal of the same size;
//! - a plain-text line history addressed by absolute line number, used for
//!   tail/search replay.
//!
//! There is a single writer, the session's output pump.

use linger_core::text::{self, LineDecoder};
use std::collections::VecDeque;

/// Serialized visible state of a terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub cols: u16,
    pub rows: u16,
    /// `(row, col)`, zero based.
    pub cursor: (u16, u16),
    pub bytes: Vec<u8>,
}

/// Completed lines starting at some absolute offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinesSince {
    /// Offset to pass next time to continue after these lines.
    pub next: u64,
    pub lines: Vec<String>,
}

#[derive(Debug)]
struct LineHistory {
    decoder: LineDecoder,
    lines: VecDeque<String>,
    /// Absolute index of `lines[0]`.
    first: u64,
    capacity: usize,
}

impl LineHistory {
    fn new(capacity: usize) -> Self {
        Self {
            decoder: LineDecoder::new(),
            lines: VecDeque::new(),
            first: 0,
            capacity: capacity.max(1),
        }
    }

    fn feed(&mut self, data: &[u8]) {
        for line in self.decoder.feed(data) {
            self.lines.push_back(line);
            if self.lines.len() > self.capacity {
                self.lines.pop_front();
                self.first += 1;
            }
        }
    }

    fn end(&self) -> u64 {
        self.first + self.lines.len() as u64
    }
}

pub struct TerminalBuffer {
    parser: vt100::Parser,
    history: LineHistory,
}

impl std::fmt::Debug for TerminalBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (cols, rows) = self.size();
        f.debug_struct("TerminalBuffer")
            .field("cols", &cols)
            .field("rows", &rows)
            .field("lines", &self.history.end())
            .finish_non_exhaustive()
    }
}

impl TerminalBuffer {
    /// `scrollback` bounds both the grid scrollback and the line history.
    pub fn new(cols: u16, rows: u16, scrollback: usize) -> Self {
        Self {
            parser: vt100::Parser::new(rows.max(1), cols.max(1), scrollback),
            history: LineHistory::new(scrollback),
        }
    }

    /// Rebuild the state of a session from its raw log.
    pub fn from_log(bytes: &[u8], cols: u16, rows: u16, scrollback: usize) -> Self {
        let mut buffer = Self::new(cols, rows, scrollback);
        buffer.write(bytes);
        buffer
    }

    pub fn write(&mut self, data: &[u8]) {
        self.parser.process(data);
        self.history.feed(data);
    }

    /// `(cols, rows)`
    pub fn size(&self) -> (u16, u16) {
        let (rows, cols) = self.parser.screen().size();
        (cols, rows)
    }

    /// Change the grid size. Line history is unaffected.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.set_scrollback(0);
        self.parser.set_size(rows.max(1), cols.max(1));
    }

    /// Escape-sequence blob that redraws the current screen.
    ///
    /// Layout: reset and clear, up to one screen of styled scrollback rows,
    /// the visible rows, then cursor position, pen attributes and cursor
    /// visibility. Taking a snapshot leaves the grid exactly as it was, so
    /// two snapshots with no write in between are identical.
    pub fn snapshot(&mut self) -> Snapshot {
        let (cols, rows) = self.size();
        let mut out = b"\x1b[m\x1b[H\x1b[2J".to_vec();

        // The grid only exposes scrollback through its view offset; an
        // offset of at most one screen keeps every row of the view defined.
        self.parser.set_scrollback(rows as usize);
        let screen = self.parser.screen();
        let depth = screen.scrollback();
        if depth > 0 {
            for row in screen.rows_formatted(0, cols).take(depth) {
                out.extend_from_slice(b"\x1b[m");
                out.extend_from_slice(&row);
                out.extend_from_slice(b"\r\n");
            }
        }
        self.parser.set_scrollback(0);

        let screen = self.parser.screen();
        for (i, row) in screen.rows_formatted(0, cols).enumerate() {
            if i > 0 {
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\x1b[m");
            out.extend_from_slice(&row);
        }

        let (crow, ccol) = screen.cursor_position();
        out.extend_from_slice(format!("\x1b[{};{}H", crow + 1, ccol + 1).as_bytes());
        out.extend_from_slice(b"\x1b[m");
        out.extend_from_slice(&screen.attributes_formatted());
        out.extend_from_slice(if screen.hide_cursor() {
            b"\x1b[?25l"
        } else {
            b"\x1b[?25h"
        });

        Snapshot {
            cols,
            rows,
            cursor: (crow, ccol),
            bytes: out,
        }
    }

    /// Plain text of the visible screen.
    pub fn contents(&self) -> String {
        self.parser.screen().contents()
    }

    /// Absolute offset one past the last completed line.
    pub fn line_end(&self) -> u64 {
        self.history.end()
    }

    /// Completed lines with absolute index `>= offset`. Lines already evicted
    /// from history are skipped.
    pub fn lines_since(&self, offset: u64) -> LinesSince {
        let start = offset.max(self.history.first);
        let skip = (start - self.history.first) as usize;
        let lines = self.history.lines.iter().skip(skip).cloned().collect();
        LinesSince {
            next: self.history.end().max(offset),
            lines,
        }
    }

    /// The last `n` completed lines.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.history.lines.len().saturating_sub(n);
        self.history.lines.iter().skip(skip).cloned().collect()
    }

    /// Completed lines containing `pattern`.
    pub fn search(&self, pattern: &str) -> Vec<String> {
        self.history
            .lines
            .iter()
            .filter(|l| l.contains(pattern))
            .cloned()
            .collect()
    }

    /// History filtered by `search` then cut to the last `tail` lines,
    /// including the line currently being typed.
    pub fn select(&self, tail: Option<usize>, search: Option<&str>) -> Vec<String> {
        let mut lines: Vec<String> = self.history.lines.iter().cloned().collect();
        if let Some(partial) = self.history.decoder.partial() {
            lines.push(partial);
        }
        text::select_lines(lines, tail, search)
    }
}
