//! Bounded event history for replay on attach.
//!
//! Stores the most recent output events of a session, up to a byte budget,
//! so that a newly attaching viewer can be backfilled without the server
//! keeping unbounded history in memory. Older output lives in the session log.

use std::collections::VecDeque;
use std::sync::Arc;
use webterm_core::GitDelta;

/// One sequenced item of a session's output stream.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputEvent {
    /// Monotonically increasing within one session, starting at 1.
    pub seq: u64,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// Process output, decoded as UTF-8 on character boundaries.
    Output(Arc<str>),
    /// Synthesized repository delta around a submitted command.
    GitDelta(Arc<GitDelta>),
}

impl EventPayload {
    pub fn output(text: impl Into<Arc<str>>) -> Self {
        Self::Output(text.into())
    }

    /// Approximate size in bytes, counted against the replay budget.
    pub fn weight(&self) -> usize {
        match self {
            Self::Output(text) => text.len(),
            Self::GitDelta(delta) => {
                let items = delta.added.iter().chain(&delta.modified).chain(&delta.deleted);
                items.map(String::len).sum::<usize>() + delta.command.as_ref().map_or(0, String::len)
            }
        }
    }
}

/// A byte-bounded FIFO of output events.
#[derive(Debug)]
pub struct RingBuffer {
    events: VecDeque<OutputEvent>,
    /// Byte budget; the newest event is always kept even if it alone exceeds it.
    capacity: usize,
    /// Bytes currently held.
    bytes: usize,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
            bytes: 0,
        }
    }

    /// Append an event, evicting the oldest events once over budget.
    pub fn push(&mut self, event: OutputEvent) {
        if self.capacity == 0 {
            return;
        }
        debug_assert!(self.events.back().map_or(true, |last| last.seq < event.seq));

        self.bytes += event.payload.weight();
        self.events.push_back(event);

        while self.bytes > self.capacity && self.events.len() > 1 {
            if let Some(evicted) = self.events.pop_front() {
                self.bytes -= evicted.payload.weight();
            }
        }
    }

    /// All buffered events, oldest first. Always a contiguous run of sequence numbers.
    pub fn snapshot(&self) -> Vec<OutputEvent> {
        self.events.iter().cloned().collect()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.events.clear();
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(seq: u64, text: &str) -> OutputEvent {
        OutputEvent {
            seq,
            payload: EventPayload::output(text),
        }
    }

    fn texts(rb: &RingBuffer) -> Vec<String> {
        rb.snapshot()
            .into_iter()
            .map(|e| match e.payload {
                EventPayload::Output(t) => t.to_string(),
                EventPayload::GitDelta(_) => "<delta>".into(),
            })
            .collect()
    }

    #[test]
    fn basic_push_snapshot() {
        let mut rb = RingBuffer::new(10);
        rb.push(ev(1, "hello"));
        assert_eq!(texts(&rb), vec!["hello"]);
        assert_eq!(rb.bytes, 5);
        assert_eq!(rb.snapshot().first().map(|e| e.seq), Some(1));
    }

    #[test]
    fn evicts_oldest_when_over_budget() {
        let mut rb = RingBuffer::new(5);
        rb.push(ev(1, "ab"));
        rb.push(ev(2, "cde")); // fills exactly
        rb.push(ev(3, "fg")); // evicts "ab"
        assert_eq!(texts(&rb), vec!["cde", "fg"]);
        assert_eq!(rb.bytes, 5);
        assert_eq!(rb.snapshot().first().map(|e| e.seq), Some(2));
    }

    #[test]
    fn oversized_event_is_kept_alone() {
        let mut rb = RingBuffer::new(4);
        rb.push(ev(1, "ab"));
        rb.push(ev(2, "0123456789"));
        assert_eq!(texts(&rb), vec!["0123456789"]);
    }

    #[test]
    fn snapshot_is_contiguous_suffix() {
        let mut rb = RingBuffer::new(16);
        for seq in 1..=50 {
            rb.push(ev(seq, "xyz"));
        }
        let seqs: Vec<u64> = rb.snapshot().iter().map(|e| e.seq).collect();
        assert_eq!(*seqs.last().unwrap(), 50);
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
        assert!(rb.bytes <= 16);
    }

    #[test]
    fn empty_buffer() {
        let rb = RingBuffer::new(10);
        assert!(rb.snapshot().is_empty());
        assert_eq!(rb.snapshot().first().map(|e| e.seq), None);
    }

    #[test]
    fn zero_capacity() {
        let mut rb = RingBuffer::new(0);
        rb.push(ev(1, "test"));
        assert!(rb.snapshot().is_empty());
    }

    #[test]
    fn clear_resets_budget() {
        let mut rb = RingBuffer::new(10);
        rb.push(ev(1, "abc"));
        rb.clear();
        assert!(rb.snapshot().is_empty());
        assert_eq!(rb.bytes, 0);
    }
}
