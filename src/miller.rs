/*! Miller decoder, reader to tag.

Consumes one 8-sample byte per bit period and assembles framed bytes with
their parity bits and start/end timestamps.

The reader codes bits as pause sequences: X (pause after half a period),
Y (no pause), Z (pause at the start). A frame begins with idle carrier
followed by a Z; the decoder hunts for that signature at all eight
sub-period alignments, then classifies every subsequent slot by which half
carries a pause.
*/

use crate::frame::Frame;

/// Maximum frame size in data bytes.
pub const MAX_FRAME_LEN: usize = 256;

// Idle carrier, then the pause of the start-of-communication Z, seen
// through the demodulator: at least eleven ones, a 2-3 sample pause, ones
// again. Tried at eight alignments.
const SYNC_PATTERN: u32 = 0x07ff_8f80;
const SYNC_MASK: u32 = 0x07ff_ef80;

// A nibble counts as modulated when it contains a 2-3 sample pause
// window, at any placement the demodulator produces.
const MOD_LUT: [bool; 16] = [
    false, true, false, true, false, false, false, true, //
    false, true, false, false, false, false, false, false,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unsynced,
    Start,
    SeqX,
    SeqY,
    SeqZ,
}

/// Reader-to-tag frame decoder.
#[derive(Debug, Clone)]
pub struct MillerDecoder {
    state: State,
    window: u32,
    sync_bit: u32,
    shift_reg: u16,
    bit_count: u16,
    out: Vec<u8>,
    parity: Vec<u8>,
    par_acc: u8,
    tail_bits: usize,
    start_time: u32,
    end_time: u32,
    complete: bool,
}

impl Default for MillerDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MillerDecoder {
    /// New decoder, hunting for a start of communication.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Unsynced,
            window: 0,
            sync_bit: 0,
            shift_reg: 0,
            bit_count: 0,
            out: Vec::new(),
            parity: Vec::new(),
            par_acc: 0,
            tail_bits: 0,
            start_time: 0,
            end_time: 0,
            complete: false,
        }
    }

    /// Drop any partial frame and hunt again. The sample window survives,
    /// so a sync directly after garbage still locks on.
    pub fn reset(&mut self) {
        self.state = State::Unsynced;
        self.shift_reg = 0;
        self.bit_count = 0;
        self.out.clear();
        self.parity.clear();
        self.par_acc = 0;
        self.tail_bits = 0;
        self.complete = false;
    }

    /// True while a frame is being received.
    #[must_use]
    pub fn in_frame(&self) -> bool {
        self.state != State::Unsynced
    }

    /// Complete data bytes decoded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.out.len()
    }

    /// True before any data bit of a frame arrived.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// Bits of the trailing partial byte of a completed frame.
    #[must_use]
    pub fn tail_bits(&self) -> usize {
        self.tail_bits
    }

    /// Feed one sample byte. `tick` is the subcarrier clock at the time
    /// this byte left the fabric. Returns true when a frame completed;
    /// collect it with [`Self::take`] before feeding on.
    pub fn feed(&mut self, sample: u8, tick: u32) -> bool {
        if self.complete {
            return true;
        }
        self.window = (self.window << 8) | u32::from(sample);
        if self.state == State::Unsynced {
            for shift in 0..8 {
                if self.window & (SYNC_MASK >> shift) == SYNC_PATTERN >> shift {
                    self.sync_bit = 7 - shift;
                    self.start_time = (tick & !7).wrapping_sub(self.sync_bit);
                    self.end_time = self.start_time;
                    self.state = State::Start;
                    break;
                }
            }
            return false;
        }

        let aligned = ((self.window >> self.sync_bit) & 0xff) as u8;
        let mod1 = MOD_LUT[(aligned >> 4) as usize];
        let mod2 = MOD_LUT[(aligned & 0xf) as usize];
        match (mod1, mod2) {
            (true, true) => self.reset(), // pause in both halves
            (false, true) => {
                // Sequence X, logic 1.
                self.shift_bit(1);
                self.update_end(2);
                self.state = State::SeqX;
                self.flush_byte();
            }
            (true, false) => {
                if self.state == State::SeqX {
                    // Z must not follow X.
                    self.reset();
                } else {
                    self.shift_bit(0);
                    self.update_end(6);
                    self.state = State::SeqZ;
                    self.flush_byte();
                }
            }
            (false, false) => match self.state {
                State::SeqZ | State::SeqY => return self.end_of_communication(),
                State::Start => self.reset(), // nothing may follow the start bit directly
                _ => {
                    // Sequence Y, logic 0.
                    self.shift_bit(0);
                    self.state = State::SeqY;
                    self.flush_byte();
                }
            },
        }
        false
    }

    /// Take the completed frame and rearm the decoder.
    pub fn take(&mut self) -> Frame {
        let bits = self.out.len() * 8 - if self.tail_bits > 0 { 8 - self.tail_bits } else { 0 };
        let f = Frame::from_decoder(
            std::mem::take(&mut self.out),
            std::mem::take(&mut self.parity),
            bits,
            self.start_time,
            self.end_time,
        );
        self.reset();
        f
    }

    fn shift_bit(&mut self, bit: u16) {
        self.shift_reg = (self.shift_reg >> 1) | (bit << 8);
        self.bit_count += 1;
    }

    fn update_end(&mut self, correction: u32) {
        self.end_time = self
            .start_time
            .wrapping_add(8 * (9 * self.out.len() as u32 + u32::from(self.bit_count) + 1))
            .wrapping_sub(correction);
    }

    fn flush_byte(&mut self) {
        if self.bit_count < 9 {
            return;
        }
        self.out.push((self.shift_reg & 0xff) as u8);
        self.par_acc = (self.par_acc << 1) | ((self.shift_reg >> 8) & 1) as u8;
        self.bit_count = 0;
        self.shift_reg = 0;
        if self.out.len().is_multiple_of(8) {
            self.parity.push(self.par_acc);
            self.par_acc = 0;
        }
        if self.out.len() >= MAX_FRAME_LEN {
            self.reset();
        }
    }

    fn end_of_communication(&mut self) -> bool {
        // The preceding logic 0 was part of the end marker, not data.
        if self.bit_count > 0 {
            self.bit_count -= 1;
        }
        if !self.out.len().is_multiple_of(8) {
            // Left-justify the tail parity bits.
            self.parity
                .push(self.par_acc << (8 - (self.out.len() & 7)));
        }
        if self.bit_count > 0 {
            // Right-align the remaining bits; a partial byte has no
            // parity bit.
            self.tail_bits = usize::from(self.bit_count);
            self.out.push((self.shift_reg >> (8 - self.bit_count)) as u8);
        }
        while self.parity.len() < self.out.len().div_ceil(8) {
            self.parity.push(0);
        }
        if self.out.is_empty() {
            // Nothing received; keep listening.
            self.reset();
            return false;
        }
        self.complete = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader_encoder;
    use crate::sim::{feed_miller, reader_channel};

    #[test]
    fn decode_wupa() {
        let enc = reader_encoder::encode_bits(&[0x52], 7, None, true);
        let mut dec = MillerDecoder::new();
        let f = feed_miller(&mut dec, &reader_channel(&enc.symbols), 0).unwrap();
        assert_eq!(f.bytes(), &[0x52]);
        assert_eq!(f.bits(), 7);
    }

    #[test]
    fn decode_bytes_with_parity() {
        let cmd = [0x93u8, 0x70, 0xde, 0xad, 0xbe, 0xaf, 0x62, 0x11, 0x22];
        let enc = reader_encoder::encode(&Frame::new(&cmd));
        let mut dec = MillerDecoder::new();
        let f = feed_miller(&mut dec, &reader_channel(&enc.symbols), 640).unwrap();
        assert_eq!(f.bytes(), &cmd);
        assert_eq!(f.bits(), 72);
        assert!(f.parity_ok());
    }

    #[test]
    fn airtime_matches_encoder() {
        let enc = reader_encoder::encode(&Frame::new(&[0x26, 0x52, 0x00]));
        let mut dec = MillerDecoder::new();
        let f = feed_miller(&mut dec, &reader_channel(&enc.symbols), 0).unwrap();
        assert_eq!(f.duration(), enc.duration);
    }

    #[test]
    fn idle_stream_never_emits() {
        let mut dec = MillerDecoder::new();
        for _ in 0..1000 {
            assert!(!dec.feed(0xff, 0));
        }
        assert!(!dec.in_frame());
    }

    #[test]
    fn forged_parity_survives_decode() {
        let mut par = crate::parity::parity_bytes(&[0x60, 0x00, 0xf5, 0x7b]);
        par[0] ^= 0x10; // flip the parity bit of the last byte
        let frame = Frame::with_parity(&[0x60, 0x00, 0xf5, 0x7b], &par);
        let enc = reader_encoder::encode(&frame);
        let mut dec = MillerDecoder::new();
        let f = feed_miller(&mut dec, &reader_channel(&enc.symbols), 0).unwrap();
        assert_eq!(f.bytes(), frame.bytes());
        assert_eq!(f.parity()[0], par[0]);
        assert!(!f.parity_ok());
    }
}
