/*! Bounded byte arenas.

The original hardware shares one big RAM buffer between frame buffers,
modulation buffers, the DMA ring and the trace log, handing out regions
with a bump pointer. Here each consumer gets its own bounded arena with an
explicit reset-on-mode-entry contract; they no longer share semantics,
only the idea of a hard capacity.
*/

use std::ops::Range;

use crate::{Error, Result};

/// Capacity of the precomputed anticollision modulation arena. Seven
/// canned responses, 18 payload bytes total, one symbol byte per data,
/// parity, start, stop and correction bit.
pub const TAG_MODULATION_CAP: usize = 273;

/// Capacity of the on-demand modulation arena for dynamic answers.
pub const DYNAMIC_MODULATION_CAP: usize = 512;

/// A fixed-capacity bump arena of bytes.
#[derive(Debug, Clone)]
pub struct Arena {
    buf: Vec<u8>,
    cap: usize,
    name: &'static str,
}

impl Arena {
    /// New empty arena with a hard capacity.
    #[must_use]
    pub fn new(name: &'static str, cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
            cap,
            name,
        }
    }

    /// Store a byte region, returning its handle.
    pub fn alloc(&mut self, bytes: &[u8]) -> Result<Range<usize>> {
        if self.buf.len() + bytes.len() > self.cap {
            return Err(Error::ArenaExhausted(self.name));
        }
        let start = self.buf.len();
        self.buf.extend_from_slice(bytes);
        Ok(start..self.buf.len())
    }

    /// Borrow a stored region.
    #[must_use]
    pub fn get(&self, r: &Range<usize>) -> &[u8] {
        &self.buf[r.clone()]
    }

    /// Bytes in use.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing is allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop all allocations. Every mode entry calls this.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_reset() -> Result<()> {
        let mut a = Arena::new("test", 8);
        let r1 = a.alloc(&[1, 2, 3])?;
        let r2 = a.alloc(&[4, 5])?;
        assert_eq!(a.get(&r1), &[1, 2, 3]);
        assert_eq!(a.get(&r2), &[4, 5]);
        assert_eq!(a.len(), 5);
        a.reset();
        assert!(a.is_empty());
        Ok(())
    }

    #[test]
    fn exhaustion() {
        let mut a = Arena::new("small", 4);
        assert!(a.alloc(&[0; 4]).is_ok());
        assert_eq!(a.alloc(&[0]), Err(Error::ArenaExhausted("small")));
    }
}
