//! Incremental server-sent-events decoder.
//!
//! Feed it response body chunks as they arrive; it returns every event that
//! is complete. Only the `event` and `data` fields are interpreted; comments
//! (keep-alives) and other fields are skipped.

use linger_core::messages::StreamEvent;
use linger_core::LingerResult;

/// A raw SSE event before payload decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Defaults to `message` when the event has no `event:` field.
    pub event: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return all completed raw events.
    pub fn feed_raw(&mut self, chunk: &[u8]) -> Vec<RawEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if !self.data.is_empty() || self.event.is_some() {
                    events.push(RawEvent {
                        event: self.event.take().unwrap_or_else(|| "message".into()),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_ref(), ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }

    /// Feed raw bytes and return all completed linger stream events.
    pub fn feed(&mut self, chunk: &[u8]) -> LingerResult<Vec<StreamEvent>> {
        let mut out = Vec::new();
        for raw in self.feed_raw(chunk) {
            if let Some(event) = StreamEvent::parse(&raw.event, &raw.data)? {
                out.push(event);
            }
        }
        Ok(out)
    }

    /// Reset internal state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.event = None;
        self.data.clear();
    }
}
