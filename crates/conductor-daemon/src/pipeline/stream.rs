//! Per-session stream state: the ring buffer, the not-yet-emitted batch and
//! the arrival counter.

use crate::models::{LogEntry, MessageType};

use super::ring_buffer::RingBuffer;

#[derive(Debug)]
pub struct SessionStream {
    session_id: String,
    buffer: RingBuffer<LogEntry>,
    pending: Vec<LogEntry>,
    last_sequence: i64,
    closed: bool,
}

impl SessionStream {
    pub fn new(session_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            session_id: session_id.into(),
            buffer: RingBuffer::new(capacity),
            pending: Vec::new(),
            last_sequence: 0,
            closed: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record one entry: assign the next sequence number, buffer it and
    /// queue it for the next emission.
    pub fn append(&mut self, message_type: MessageType, content: String, timestamp: i64) -> LogEntry {
        self.last_sequence += 1;
        let entry = LogEntry {
            session_id: self.session_id.clone(),
            sequence: self.last_sequence,
            message_type,
            content,
            timestamp,
        };
        self.buffer.push(entry.clone());
        self.pending.push(entry.clone());
        entry
    }

    /// Entries not yet emitted, in arrival order.
    pub fn take_pending(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.pending)
    }

    pub const fn buffer(&self) -> &RingBuffer<LogEntry> {
        &self.buffer
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    pub const fn close(&mut self) {
        self.closed = true;
    }
}
