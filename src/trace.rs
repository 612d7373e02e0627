/*! Frame trace log.

Every frame in and out of the engine lands here, with timestamps already
corrected for the direction-specific air-to-core delay. The log is a
contiguous bounded arena with a tail offset the host transport reads;
records are only ever appended whole, so a reader following the tail never
sees a partial record. A full log turns tracing off instead of truncating.

Record layout, little endian:
`u32 start, u32 end, u16 length, u8 dir, u16 parity_len, data, parity`.
*/

use log::debug;
use serde::Serialize;

use crate::frame::{Direction, Frame};
use crate::{Error, Result};

/// Default trace capacity in bytes.
pub const TRACE_SIZE: usize = 3000;

const HEADER_LEN: usize = 4 + 4 + 2 + 1 + 2;

/// Append-only bounded trace arena.
#[derive(Debug, Clone)]
pub struct TraceLog {
    buf: Vec<u8>,
    cap: usize,
    enabled: bool,
}

/// One parsed trace record, host-side view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceRecord {
    /// Corrected first-modulation time.
    pub start: u32,
    /// Corrected last-modulation time.
    pub end: u32,
    /// Who talked.
    pub dir: Direction,
    /// Frame bytes.
    pub bytes: Vec<u8>,
    /// Packed parity bytes.
    pub parity: Vec<u8>,
}

impl TraceLog {
    /// New empty log with a byte capacity.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
            cap,
            enabled: true,
        }
    }

    /// Clear and re-enable. Every mode entry calls this.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.enabled = true;
    }

    /// Turn tracing on or off without clearing.
    pub fn set_enabled(&mut self, on: bool) {
        self.enabled = on;
    }

    /// Tail offset: bytes of complete records. The host transport polls
    /// this.
    #[must_use]
    pub fn tail(&self) -> usize {
        self.buf.len()
    }

    /// Raw log bytes up to the tail.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Append one frame with pre-corrected timestamps. Returns false when
    /// tracing is off or the record does not fit (which turns tracing
    /// off, like the log running full mid-capture on the device).
    pub fn log(&mut self, dir: Direction, start: u32, end: u32, frame: &Frame) -> bool {
        if !self.enabled {
            return false;
        }
        let need = HEADER_LEN + frame.len() + frame.parity().len();
        if self.buf.len() + need > self.cap {
            debug!("trace full at {} bytes, tracing off", self.buf.len());
            self.enabled = false;
            return false;
        }
        self.buf.extend_from_slice(&start.to_le_bytes());
        self.buf.extend_from_slice(&end.to_le_bytes());
        self.buf.extend_from_slice(&(frame.len() as u16).to_le_bytes());
        self.buf.push(match dir {
            Direction::ReaderToTag => 1,
            Direction::TagToReader => 0,
        });
        self.buf
            .extend_from_slice(&(frame.parity().len() as u16).to_le_bytes());
        self.buf.extend_from_slice(frame.bytes());
        self.buf.extend_from_slice(frame.parity());
        true
    }

    /// Parse the complete records currently in the log.
    pub fn records(&self) -> Result<Vec<TraceRecord>> {
        let mut out = Vec::new();
        let mut pos = 0;
        let buf = &self.buf;
        while pos < buf.len() {
            if pos + HEADER_LEN > buf.len() {
                return Err(Error::Protocol("truncated trace header"));
            }
            let start = u32::from_le_bytes(buf[pos..pos + 4].try_into()?);
            let end = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into()?);
            let len = u16::from_le_bytes(buf[pos + 8..pos + 10].try_into()?) as usize;
            let dir = match buf[pos + 10] {
                1 => Direction::ReaderToTag,
                _ => Direction::TagToReader,
            };
            let parity_len = u16::from_le_bytes(buf[pos + 11..pos + 13].try_into()?) as usize;
            pos += HEADER_LEN;
            if pos + len + parity_len > buf.len() {
                return Err(Error::Protocol("truncated trace record"));
            }
            out.push(TraceRecord {
                start,
                end,
                dir,
                bytes: buf[pos..pos + len].to_vec(),
                parity: buf[pos + len..pos + len + parity_len].to_vec(),
            });
            pos += len + parity_len;
        }
        Ok(out)
    }

    /// Records as JSON for the host shell.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.records()?).map_err(|_| Error::Protocol("trace export"))
    }
}

impl Default for TraceLog {
    fn default() -> Self {
        Self::new(TRACE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() -> Result<()> {
        let mut t = TraceLog::new(256);
        let f = Frame::new(&[0x93, 0x20]);
        assert!(t.log(Direction::ReaderToTag, 100, 180, &f));
        let g = Frame::new(&[0xde, 0xad, 0xbe, 0xaf, 0x62]);
        assert!(t.log(Direction::TagToReader, 300, 700, &g));
        let recs = t.records()?;
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].dir, Direction::ReaderToTag);
        assert_eq!(recs[0].bytes, vec![0x93, 0x20]);
        assert_eq!(recs[0].start, 100);
        assert_eq!(recs[1].bytes.len(), 5);
        assert_eq!(recs[1].parity.len(), 1);
        assert!(t.to_json()?.contains("\"start\":100"));
        Ok(())
    }

    #[test]
    fn full_log_disables() {
        let mut t = TraceLog::new(20);
        let f = Frame::new(&[0u8; 8]);
        assert!(!t.log(Direction::ReaderToTag, 0, 0, &f));
        // Still off for a record that would fit.
        let tiny = Frame::new(&[1]);
        assert!(!t.log(Direction::ReaderToTag, 0, 0, &tiny));
        t.reset();
        assert!(t.log(Direction::ReaderToTag, 0, 0, &tiny));
    }
}
