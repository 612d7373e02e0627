/*! Software fabric and air interface.

Everything the test suite needs to run the engine without hardware: a
scripted [`SimFabric`], sample-level channel models for both directions,
and [`SimTransceiver`], a frame-level air interface that carries reader
frames through the real codecs into an [`Emulator`] and the answer back.

The channel models mirror what the gate array delivers: reader pauses
arrive inverted (field high = 1) and one sample late; tag subcarrier
samples arrive as modulated, after a quiet field.
*/

use std::collections::VecDeque;

use crate::emulator::{Emulator, encode_response};
use crate::fabric::{Fabric, FabricMode, Led};
use crate::frame::Frame;
use crate::manchester::ManchesterDecoder;
use crate::miller::MillerDecoder;
use crate::reader_encoder;
use crate::transceiver::{Reply, Transceive, TxOpts, TxTiming};
use crate::{Error, Result};

/// Reader-to-tag channel: invert the pause-drive symbols into field
/// samples, delay by one tick, wrap in idle carrier.
#[must_use]
pub fn reader_channel(symbols: &[u8]) -> Vec<u8> {
    let mut out = vec![0xff; 4];
    let mut carry = 1u8;
    for &s in symbols {
        let inv = !s;
        out.push((carry << 7) | (inv >> 1));
        carry = inv & 1;
    }
    out.push((carry << 7) | 0x7f);
    out.push(0xff);
    out
}

/// Tag-to-reader channel: subcarrier samples come through unchanged; the
/// fabric send queue swallows the correction prefix. A quiet field
/// precedes and follows.
#[must_use]
pub fn tag_channel(symbols: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00; 3];
    out.extend(
        symbols
            .iter()
            .copied()
            .skip_while(|&b| b == 0x00 || b == 0xff),
    );
    out.extend_from_slice(&[0x00, 0x00]);
    out
}

/// Delay a sample stream by 0–7 ticks, carrying bits across bytes.
#[must_use]
pub fn shift_stream(stream: &[u8], bits: u32) -> Vec<u8> {
    let bits = bits & 7;
    if bits == 0 {
        return stream.to_vec();
    }
    let mut out = Vec::with_capacity(stream.len() + 1);
    let mut carry = 0u8;
    for &b in stream {
        out.push((carry << (8 - bits)) | (b >> bits));
        carry = b & ((1 << bits) - 1);
    }
    out.push(carry << (8 - bits));
    out
}

/// Interleave separate reader and tag sample streams into the sniffer
/// format: one reader nibble and one tag nibble per stream byte, two
/// bytes per bit period. Shorter streams are padded with their idle.
#[must_use]
pub fn sniff_stream(reader: &[u8], tag: &[u8]) -> Vec<u8> {
    let n = reader.len().max(tag.len());
    let mut out = Vec::with_capacity(2 * n);
    for i in 0..n {
        let r = reader.get(i).copied().unwrap_or(0xff);
        let t = tag.get(i).copied().unwrap_or(0x00);
        out.push((r & 0xf0) | (t >> 4));
        out.push((r << 4) | (t & 0x0f));
    }
    out
}

/// Drive a Miller decoder over a sample stream.
pub fn feed_miller(dec: &mut MillerDecoder, samples: &[u8], mut tick: u32) -> Option<Frame> {
    for &s in samples {
        let done = dec.feed(s, tick);
        tick = tick.wrapping_add(8);
        if done {
            return Some(dec.take());
        }
    }
    None
}

/// Drive a Manchester decoder over a sample stream; returns the frame
/// and the collision position.
pub fn feed_manchester(
    dec: &mut ManchesterDecoder,
    samples: &[u8],
    mut tick: u32,
) -> Option<(Frame, u16)> {
    for &s in samples {
        let done = dec.feed(s, tick);
        tick = tick.wrapping_add(8);
        if done {
            let coll = dec.collision_pos();
            return Some((dec.take(), coll));
        }
    }
    None
}

/// A scripted fabric: queued receive samples, captured transmissions, a
/// deterministic clock that advances as it is observed.
#[derive(Debug, Clone)]
pub struct SimFabric {
    /// Current front-end mode.
    pub mode: FabricMode,
    rx: VecDeque<u8>,
    /// Symbol bytes the engine transmitted.
    pub sent: Vec<u8>,
    tick: u32,
    /// ADC reading handed to the engine.
    pub field: u16,
    press_when_idle: bool,
    button_at: Option<u32>,
    /// LED states, advisory.
    pub leds: [bool; 4],
}

impl SimFabric {
    /// New fabric with the field on.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: FabricMode::Off,
            rx: VecDeque::new(),
            sent: Vec::new(),
            tick: 0,
            field: 2000,
            press_when_idle: false,
            button_at: None,
            leds: [false; 4],
        }
    }

    /// Queue received samples.
    pub fn queue_rx(&mut self, samples: &[u8]) {
        self.rx.extend(samples);
    }

    /// Report the button as pressed once the receive queue runs dry.
    pub fn press_button_when_idle(&mut self) {
        self.press_when_idle = true;
    }

    /// Report the button as pressed from the given tick on.
    pub fn press_button_at(&mut self, tick: u32) {
        self.button_at = Some(tick);
    }
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Fabric for SimFabric {
    fn set_mode(&mut self, mode: FabricMode) {
        self.mode = mode;
    }

    fn rx_ready(&mut self) -> bool {
        if self.rx.is_empty() {
            // An idle bit period passes.
            self.tick = self.tick.wrapping_add(8);
            false
        } else {
            true
        }
    }

    fn rx(&mut self) -> u8 {
        self.tick = self.tick.wrapping_add(8);
        self.rx.pop_front().unwrap_or(0)
    }

    fn tx_ready(&mut self) -> bool {
        true
    }

    fn tx(&mut self, symbol: u8) {
        self.tick = self.tick.wrapping_add(8);
        self.sent.push(symbol);
    }

    fn tick(&mut self) -> u32 {
        self.tick = self.tick.wrapping_add(1);
        self.tick
    }

    fn field_adc(&mut self) -> u16 {
        self.field
    }

    fn led(&mut self, led: Led, on: bool) {
        self.leds[match led {
            Led::A => 0,
            Led::B => 1,
            Led::C => 2,
            Led::D => 3,
        }] = on;
    }

    fn button_pressed(&mut self) -> bool {
        if self.press_when_idle && self.rx.is_empty() {
            return true;
        }
        self.button_at.is_some_and(|t| self.tick >= t)
    }
}

/// Frame-level air interface: reader frames go through the real encoder,
/// channel and Miller decoder into an emulator; its answer comes back
/// through the tag encoder, channel and Manchester decoder.
pub struct SimTransceiver {
    /// The tag on the other side of the air gap.
    pub emulator: Emulator,
    uart: MillerDecoder,
    demod: ManchesterDecoder,
    now: u32,
    timeout: u32,
    cancel_after: Option<u32>,
    exchanges: u32,
}

impl SimTransceiver {
    /// Put an emulator in the field.
    #[must_use]
    pub fn new(emulator: Emulator) -> Self {
        Self {
            emulator,
            uart: MillerDecoder::new(),
            demod: ManchesterDecoder::new(),
            now: 0,
            timeout: crate::timing::DEFAULT_TIMEOUT,
            cancel_after: None,
            exchanges: 0,
        }
    }

    /// Report cancellation after this many exchanges (runaway guard for
    /// driver tests).
    pub fn cancel_after(&mut self, exchanges: u32) {
        self.cancel_after = Some(exchanges);
    }

    /// Exchanges so far.
    #[must_use]
    pub fn exchanges(&self) -> u32 {
        self.exchanges
    }
}

impl Transceive for SimTransceiver {
    fn transceive(&mut self, tx: &Frame, opts: TxOpts) -> Result<Reply> {
        self.exchanges += 1;
        let tx_start = match opts.timing {
            TxTiming::At(t) => {
                if (t.wrapping_sub(self.now) as i32) > 0 {
                    self.now = t;
                }
                t
            }
            _ => {
                let t = (self.now & !7) + 8;
                self.now = t;
                t
            }
        };

        let enc = if opts.parity {
            reader_encoder::encode(tx)
        } else {
            reader_encoder::encode_bits(tx.bytes(), tx.bits(), None, false)
        };
        let samples = reader_channel(&enc.symbols);
        self.uart.reset();
        let decoded = feed_miller(&mut self.uart, &samples, self.now);
        self.now = self.now.wrapping_add(8 * samples.len() as u32);
        let Some(rx) = decoded else {
            return Err(Error::Timeout);
        };

        let Some(resp) = self.emulator.process(&rx) else {
            self.now = self.now.wrapping_add(self.timeout);
            return Err(Error::Timeout);
        };
        let enc = encode_response(&resp.frame);
        let tsamples = tag_channel(&enc.symbols);
        self.demod.reset_with_offset(opts.rx_offset);
        let Some((frame, collision_pos)) = feed_manchester(&mut self.demod, &tsamples, self.now)
        else {
            return Err(Error::Timeout);
        };
        self.now = self.now.wrapping_add(8 * tsamples.len() as u32);
        Ok(Reply {
            frame,
            collision_pos,
            tx_start,
        })
    }

    fn set_timeout(&mut self, ticks: u32) {
        self.timeout = ticks;
    }

    fn timeout(&self) -> u32 {
        self.timeout
    }

    fn now(&mut self) -> u32 {
        self.now = self.now.wrapping_add(1);
        self.now
    }

    fn cancelled(&mut self) -> bool {
        self.cancel_after.is_some_and(|n| self.exchanges >= n)
    }
}
