/*! Manchester decoder, tag to reader.

Same shape as the Miller side, with two differences that matter: a slot
with subcarrier in both halves is not an error but a collision between two
tags (the position is reported for bitwise anticollision), and a receive
may start mid-byte so anticollision fragments stay aligned to the UID
byte grid.
*/

use crate::frame::Frame;
use crate::miller::MAX_FRAME_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for a quiet field, then for the start pulse.
    Unsynced,
    InFrame,
}

/// Tag-to-reader frame decoder with collision detection.
#[derive(Debug, Clone)]
pub struct ManchesterDecoder {
    state: State,
    window: u16,
    quiet: u8,
    sync_bit: u32,
    shift_reg: u16,
    bit_count: u16,
    offset: u16,
    out: Vec<u8>,
    parity: Vec<u8>,
    par_acc: u8,
    tail_bits: usize,
    collision_pos: u16,
    start_time: u32,
    end_time: u32,
    complete: bool,
}

impl Default for ManchesterDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ManchesterDecoder {
    /// New decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Unsynced,
            window: 0,
            quiet: 0,
            sync_bit: 0,
            shift_reg: 0,
            bit_count: 0,
            offset: 0,
            out: Vec::new(),
            parity: Vec::new(),
            par_acc: 0,
            tail_bits: 0,
            collision_pos: 0,
            start_time: 0,
            end_time: 0,
            complete: false,
        }
    }

    /// Rearm, expecting the first flushed byte at bit position `offset`
    /// within the UID byte grid (bitwise anticollision). Zero for normal
    /// receives.
    pub fn reset_with_offset(&mut self, offset: u16) {
        self.state = State::Unsynced;
        self.quiet = 0;
        self.shift_reg = 0;
        self.bit_count = 0;
        self.offset = offset & 7;
        self.out.clear();
        self.parity.clear();
        self.par_acc = 0;
        self.tail_bits = 0;
        self.collision_pos = 0;
        self.complete = false;
    }

    /// Rearm for a normal receive.
    pub fn reset(&mut self) {
        self.reset_with_offset(0);
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

    /// True before any data arrived.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// First colliding bit position, 0 when no collision was seen.
    #[must_use]
    pub fn collision_pos(&self) -> u16 {
        self.collision_pos
    }

    /// Feed one sample byte; `tick` as in the Miller decoder. True when a
    /// frame completed; collect with [`Self::take`].
    pub fn feed(&mut self, sample: u8, tick: u32) -> bool {
        if self.complete {
            return true;
        }
        self.window = (self.window << 8) | u16::from(sample);
        if self.state == State::Unsynced {
            if self.quiet < 2 {
                // Wait for a stable unmodulated field first.
                if self.window == 0 {
                    self.quiet += 1;
                } else {
                    self.quiet = 0;
                }
                return false;
            }
            // A one-nibble pulse followed by blank, at eight alignments.
            for k in (0..8).rev() {
                if self.window & (0x00ee << k) == 0x00e0 << k {
                    self.sync_bit = k;
                    self.start_time = (tick & !7).wrapping_sub(self.sync_bit);
                    self.end_time = self.start_time;
                    self.bit_count = self.offset;
                    self.state = State::InFrame;
                    break;
                }
            }
            return false;
        }

        let aligned = ((self.window >> self.sync_bit) & 0xff) as u8;
        let first = aligned & 0xf0 != 0;
        let second = aligned & 0x0f != 0;
        match (first, second) {
            (true, second) => {
                // Sequence D, logic 1. Both halves modulated means two
                // tags disagree here: record the position, keep the 1.
                if second && self.collision_pos == 0 {
                    self.collision_pos = (self.out.len() as u16) * 8 + self.bit_count;
                }
                self.shift_bit(1);
                self.update_end(4);
                self.flush_byte();
            }
            (false, true) => {
                // Sequence E, logic 0.
                self.shift_bit(0);
                self.update_end(0);
                self.flush_byte();
            }
            (false, false) => return self.end_of_communication(),
        }
        false
    }

    /// Take the completed frame and rearm.
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
        if self.out.is_empty() && self.bit_count <= self.offset {
            self.reset();
            return false;
        }
        if !self.out.len().is_multiple_of(8) {
            self.parity
                .push(self.par_acc << (8 - (self.out.len() & 7)));
        }
        if self.bit_count > 0 {
            self.tail_bits = usize::from(self.bit_count);
            self.out.push((self.shift_reg >> (9 - self.bit_count)) as u8);
        }
        while self.parity.len() < self.out.len().div_ceil(8) {
            self.parity.push(0);
        }
        self.complete = true;
        true
    }
}
