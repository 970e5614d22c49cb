//! Per-handle read session state.

use crate::swarm::FileStream;

/// State for one open file handle.
///
/// Tracks the next expected byte position and the forward-only network
/// stream serving it. The stream is discarded (session kept) whenever a read
/// offset breaks sequentiality, and recreated at the new offset.
pub struct ReadSession {
    /// Next expected byte position
    pub offset: u64,
    /// Forward-only byte source, opened lazily on first read
    pub stream: Option<Box<dyn FileStream>>,
}

impl ReadSession {
    pub fn new() -> Self {
        Self {
            offset: 0,
            stream: None,
        }
    }

    /// Drops the stream after a seek; the next read reopens at its offset.
    pub fn invalidate_stream(&mut self) {
        self.stream = None;
    }
}

impl Default for ReadSession {
    fn default() -> Self {
        Self::new()
    }
}
