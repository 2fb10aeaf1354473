//! Block-streaming coalescer.
//!
//! Sits between the chunker and a transport: buffers adjacent emitted
//! chunks and flushes on stream silence (`idle_ms`), on buffered size, or
//! at end-of-message.  A minimum-size floor prevents micro-flushes.  Time
//! is injected so the policy is testable without timers; the outbound task
//! drives `poll_idle` from a tokio interval.

use std::time::{Duration, Instant};

use sb_domain::config::CoalesceConfig;

use crate::ir::utf16_len;

pub struct Coalescer {
    idle: Duration,
    max_chars: usize,
    min_chars: usize,
    buf: String,
    buf16: usize,
    last_push: Option<Instant>,
}

impl Coalescer {
    /// `chunk_min` is the upstream chunker's emission floor; the size-flush
    /// threshold clamps up to it so the coalescer can delay chunks but
    /// never forces the chunker below its floor.
    pub fn new(config: &CoalesceConfig, chunk_min: usize) -> Self {
        Self {
            idle: Duration::from_millis(config.idle_ms),
            max_chars: config.max_chars.max(chunk_min),
            min_chars: config.min_chars,
            buf: String::new(),
            buf16: 0,
            last_push: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Buffer one chunk.  Returns zero, one, or two flushes: the existing
    /// buffer flushes first when appending would exceed the size bound, and
    /// the new buffer flushes again if it alone reaches the bound.
    pub fn push(&mut self, text: &str, now: Instant) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut flushed = Vec::new();
        let incoming = utf16_len(text);

        if !self.buf.is_empty() && self.buf16 + incoming > self.max_chars {
            flushed.push(self.take());
        }

        if !self.buf.is_empty() && !text.starts_with('\n') {
            self.buf.push('\n');
            self.buf16 += 1;
        }
        self.buf.push_str(text);
        self.buf16 += incoming;
        self.last_push = Some(now);

        if self.buf16 >= self.max_chars {
            flushed.push(self.take());
        }
        flushed
    }

    /// Flush on stream silence.  Honors the minimum-size floor.
    pub fn poll_idle(&mut self, now: Instant) -> Option<String> {
        let last = self.last_push?;
        if self.buf.is_empty() || self.buf16 < self.min_chars {
            return None;
        }
        if now.duration_since(last) >= self.idle {
            return Some(self.take());
        }
        None
    }

    /// Final end-of-message flush; ignores the floor.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> String {
        self.buf16 = 0;
        self.last_push = None;
        std::mem::take(&mut self.buf)
    }
}
