//! Turns the sensor's fragmented notifications back into whole frames.
//!
//! A frame normally arrives as 20 + 18 + 8 byte notifications but nothing
//! here depends on that split. A partial frame older than the inactivity
//! timeout is dropped: the next broadcast cycle resynchronises the stream.

use std::time::{Duration, Instant};

use crate::crypto::FRAME_LEN;

pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3);

pub type Frame = [u8; FRAME_LEN];

#[derive(Debug)]
pub struct ReassemblyBuffer {
    buffer: Vec<u8>,
    last_chunk: Option<Instant>,
    timeout: Duration,
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_INACTIVITY_TIMEOUT)
    }
}

impl ReassemblyBuffer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(FRAME_LEN * 2),
            last_chunk: None,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Appends one notification and returns every frame it completed.
    ///
    /// A stale partial frame is discarded first, so a missed timer can never
    /// glue two broadcast cycles together.
    pub fn append(&mut self, chunk: &[u8], now: Instant) -> Vec<Frame> {
        self.expire(now);
        self.buffer.extend_from_slice(chunk);
        self.last_chunk = Some(now);

        let mut frames = Vec::new();
        while self.buffer.len() >= FRAME_LEN {
            let mut frame = [0u8; FRAME_LEN];
            frame.copy_from_slice(&self.buffer[..FRAME_LEN]);
            self.buffer.drain(..FRAME_LEN);
            frames.push(frame);
        }
        if self.buffer.is_empty() {
            self.last_chunk = None;
        }
        frames
    }

    /// Drops a partial frame once the inactivity timeout has passed.
    /// Returns the number of bytes discarded.
    pub fn expire(&mut self, now: Instant) -> usize {
        match self.last_chunk {
            Some(last) if now.saturating_duration_since(last) >= self.timeout => {
                let dropped = self.buffer.len();
                self.reset();
                dropped
            }
            _ => 0,
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_chunk = None;
    }
}
