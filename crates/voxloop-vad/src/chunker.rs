use std::collections::VecDeque;

/// Re-blocks arbitrarily sized sample slices into fixed analysis windows.
///
/// Transport audio arrives in whatever block size the client chose; the VAD
/// engine requires exact windows. Residual samples stay buffered until the
/// next push.
pub struct WindowChunker {
    window_size: usize,
    buffer: VecDeque<i16>,
}

impl WindowChunker {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            buffer: VecDeque::with_capacity(window_size * 4),
        }
    }

    pub fn push(&mut self, samples: &[i16]) {
        self.buffer.extend(samples.iter().copied());
    }

    /// Pop the next complete window, if one is buffered.
    pub fn next_window(&mut self) -> Option<Vec<i16>> {
        if self.buffer.len() < self.window_size {
            return None;
        }
        Some(self.buffer.drain(..self.window_size).collect())
    }

    /// Samples waiting for a full window.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
