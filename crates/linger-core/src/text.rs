//! Plain-text view of terminal output.
//!
//! Strips escape sequences from a raw output stream and assembles it into
//! lines. A bare carriage return followed by more text overwrites the line,
//! which keeps progress bars from turning into hundreds of lines.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum EscState {
    #[default]
    Ground,
    Escape,
    Csi,
    /// OSC, DCS, APC, PM and SOS strings, terminated by BEL or ST.
    Str,
    StrEscape,
    Charset,
}

/// Incremental decoder from raw output bytes to plain-text lines.
#[derive(Debug, Default, Clone)]
pub struct LineDecoder {
    state: EscState,
    current: Vec<u8>,
    pending_cr: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every line completed by them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            match self.state {
                EscState::Ground => self.ground(byte, &mut lines),
                EscState::Escape => {
                    self.state = match byte {
                        b'[' => EscState::Csi,
                        b']' | b'P' | b'X' | b'^' | b'_' => EscState::Str,
                        b'(' | b')' | b'*' | b'+' | b'#' | b'%' => EscState::Charset,
                        _ => EscState::Ground,
                    };
                }
                EscState::Csi => {
                    if (0x40..=0x7e).contains(&byte) {
                        self.state = EscState::Ground;
                    }
                }
                EscState::Str => match byte {
                    0x07 => self.state = EscState::Ground,
                    0x1b => self.state = EscState::StrEscape,
                    _ => {}
                },
                EscState::StrEscape => {
                    // ST is ESC \; anything else also ends the string.
                    self.state = EscState::Ground;
                }
                EscState::Charset => self.state = EscState::Ground,
            }
        }
        lines
    }

    fn ground(&mut self, byte: u8, lines: &mut Vec<String>) {
        match byte {
            0x1b => self.state = EscState::Escape,
            b'\n' => {
                lines.push(String::from_utf8_lossy(&self.current).into_owned());
                self.current.clear();
                self.pending_cr = false;
            }
            b'\r' => self.pending_cr = true,
            0x08 => self.backspace(),
            b'\t' => self.push(byte),
            0x00..=0x1f | 0x7f => {}
            _ => self.push(byte),
        }
    }

    fn push(&mut self, byte: u8) {
        if self.pending_cr {
            self.current.clear();
            self.pending_cr = false;
        }
        self.current.push(byte);
    }

    fn backspace(&mut self) {
        while let Some(&last) = self.current.last() {
            self.current.pop();
            if last & 0b1100_0000 != 0b1000_0000 {
                break;
            }
        }
    }

    /// The unterminated line currently being assembled, if any.
    pub fn partial(&self) -> Option<String> {
        if self.current.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.current).into_owned())
        }
    }
}

/// Decode a whole buffer into lines, including a trailing partial line.
pub fn plain_lines(data: &[u8]) -> Vec<String> {
    let mut decoder = LineDecoder::new();
    let mut lines = decoder.feed(data);
    if let Some(partial) = decoder.partial() {
        lines.push(partial);
    }
    lines
}

/// Strip escape sequences, keeping line structure.
pub fn strip_ansi(data: &[u8]) -> String {
    plain_lines(data).join("\n")
}

/// Apply the attach-time history filters: keep lines containing `search`,
/// then keep the last `tail` of those.
pub fn select_lines(lines: Vec<String>, tail: Option<usize>, search: Option<&str>) -> Vec<String> {
    let mut lines: Vec<String> = match search.filter(|s| !s.is_empty()) {
        Some(pattern) => lines.into_iter().filter(|l| l.contains(pattern)).collect(),
        None => lines,
    };
    if let Some(n) = tail {
        let skip = lines.len().saturating_sub(n);
        lines.drain(..skip);
    }
    lines
}
