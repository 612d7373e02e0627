/*! Sample ring buffer.

Models the DMA discipline between the fabric and the long-running loops:
the producer keeps writing regardless, and a full ring is a consumer
failure that has to abort the mode, not silently drop samples.
*/

use crate::{Error, Result};

/// Default ring capacity in samples.
pub const DMA_BUFFER_SIZE: usize = 4096;

/// Bounded circular sample buffer.
#[derive(Debug, Clone)]
pub struct SampleRing {
    buf: Vec<u8>,
    rpos: usize,
    wpos: usize,
}

impl SampleRing {
    /// New ring with the given capacity.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            buf: vec![0; cap],
            rpos: 0,
            wpos: 0,
        }
    }

    /// Samples waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.wpos - self.rpos
    }

    /// True when no samples wait.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rpos == self.wpos
    }

    /// Produce one sample. [`Error::BufferOverrun`] when the consumer has
    /// fallen a full ring behind.
    pub fn push(&mut self, sample: u8) -> Result<()> {
        if self.len() == self.buf.len() {
            return Err(Error::BufferOverrun);
        }
        let cap = self.buf.len();
        self.buf[self.wpos % cap] = sample;
        self.wpos += 1;
        Ok(())
    }

    /// Consume one sample.
    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let s = self.buf[self.rpos % self.buf.len()];
        self.rpos += 1;
        Some(s)
    }

    /// Forget everything buffered.
    pub fn clear(&mut self) {
        self.rpos = self.wpos;
    }
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new(DMA_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() -> Result<()> {
        let mut r = SampleRing::new(4);
        for s in [1, 2, 3] {
            r.push(s)?;
        }
        assert_eq!(r.pop(), Some(1));
        r.push(4)?;
        r.push(5)?;
        assert_eq!(r.len(), 4);
        assert_eq!(r.pop(), Some(2));
        assert_eq!(r.pop(), Some(3));
        assert_eq!(r.pop(), Some(4));
        assert_eq!(r.pop(), Some(5));
        assert_eq!(r.pop(), None);
        Ok(())
    }

    #[test]
    fn overrun_is_fatal() {
        let mut r = SampleRing::new(2);
        r.push(0).unwrap();
        r.push(0).unwrap();
        assert_eq!(r.push(0), Err(Error::BufferOverrun));
    }
}
