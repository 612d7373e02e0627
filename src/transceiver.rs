/*! Timed transmit/receive over the fabric.

A single exclusive resource per mode. Reader transmissions are scheduled
on the subcarrier clock against a rolling next-transfer time that encodes
the request guard time; tag receptions run until end-of-frame or the
current frame waiting time expires. The emulated-tag transmit path aligns
answers to the reader's frame-delay grid with the correction prefix.

[`Transceive`] is the seam the selection engine and the attack drivers
are written against; the hardware implementation here has a software twin
in [`crate::sim`].
*/

use log::{debug, trace};

use crate::fabric::{Fabric, FabricMode};
use crate::frame::{Direction, Frame};
use crate::manchester::ManchesterDecoder;
use crate::reader_encoder;
use crate::symbols::{Encoded, SEC_Y};
use crate::timing::{FRAME_DELAY_TIME_PICC_TO_PCD, REQUEST_GUARD_TIME, Timings};
use crate::trace::TraceLog;
use crate::{Error, Result};

/// When to put a transmission on the air.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxTiming {
    /// Next legal slot after the rolling next-transfer time.
    #[default]
    Scheduled,
    /// Next slot after "now", ignoring the guard window; the caller reads
    /// the actual start from the reply.
    Measured,
    /// Absolute tick; the low three bits become a sub-period fine shift.
    At(u32),
}

/// Per-exchange options.
#[derive(Debug, Clone, Copy)]
pub struct TxOpts {
    /// Transmission timing.
    pub timing: TxTiming,
    /// Bit offset for the answer (bitwise anticollision).
    pub rx_offset: u16,
    /// Send parity symbols (off for Topaz raw frames).
    pub parity: bool,
}

impl Default for TxOpts {
    fn default() -> Self {
        Self {
            timing: TxTiming::Scheduled,
            rx_offset: 0,
            parity: true,
        }
    }
}

/// A received tag answer.
#[derive(Debug, Clone)]
pub struct Reply {
    /// The decoded frame.
    pub frame: Frame,
    /// First colliding bit, 0 when clean.
    pub collision_pos: u16,
    /// Measured start of our own transmission.
    pub tx_start: u32,
}

/// One reader-side exchange: transmit a frame, wait for the answer.
pub trait Transceive {
    /// Transmit `tx` and receive one answer.
    fn transceive(&mut self, tx: &Frame, opts: TxOpts) -> Result<Reply>;

    /// Install a new answer timeout in subcarrier ticks.
    fn set_timeout(&mut self, ticks: u32);

    /// Current answer timeout.
    fn timeout(&self) -> u32;

    /// Current subcarrier tick (the darkside driver schedules on it).
    fn now(&mut self) -> u32 {
        0
    }

    /// Operator cancel, polled at every suspension point.
    fn cancelled(&mut self) -> bool {
        false
    }
}

/// The hardware transceiver.
pub struct TimedTransceiver<'a, F: Fabric> {
    fabric: &'a mut F,
    trace: &'a mut TraceLog,
    timings: Timings,
    timeout: u32,
    next_transfer_time: u32,
    decoder: ManchesterDecoder,
}

impl<'a, F: Fabric> TimedTransceiver<'a, F> {
    /// New transceiver session for one reader mode.
    pub fn new(
        fabric: &'a mut F,
        trace: &'a mut TraceLog,
        timings: Timings,
        timeout: u32,
    ) -> Self {
        Self {
            fabric,
            trace,
            timings,
            timeout,
            next_transfer_time: 0,
            decoder: ManchesterDecoder::new(),
        }
    }

    fn wait_until(&mut self, t: u32) {
        while (t.wrapping_sub(self.fabric.tick()) as i32) > 0 {
            self.fabric.kick_watchdog();
        }
    }

    fn transmit(&mut self, enc: &mut Encoded, timing: TxTiming) -> u32 {
        self.fabric.set_mode(FabricMode::ReaderModulating);
        let start = match timing {
            TxTiming::At(t) => {
                // Fine shift first, then the 8-tick grid.
                enc.prepare_delayed_transfer(t & 7);
                if (self.fabric.tick().wrapping_sub(t & !7) as i32) > 0 {
                    debug!("transmit: missed timing goal {t}");
                }
                self.wait_until(t & !7);
                t
            }
            TxTiming::Measured => {
                let t = (self.fabric.tick() + 8) & !7;
                self.wait_until(t);
                t
            }
            TxTiming::Scheduled => {
                let now = self.fabric.tick();
                let t = (self.next_transfer_time.max(now) & !7) + 8;
                self.wait_until(t);
                t
            }
        };
        // Prime the hold register with a quiet period.
        self.fabric.tx(SEC_Y);
        for i in 0..enc.symbols.len() {
            while !self.fabric.tx_ready() {
                self.fabric.kick_watchdog();
            }
            self.fabric.tx(enc.symbols[i]);
        }
        self.next_transfer_time = self
            .next_transfer_time
            .max(start.wrapping_add(REQUEST_GUARD_TIME));
        start
    }

    fn receive(&mut self, offset: u16) -> Result<(Frame, u16)> {
        self.fabric.set_mode(FabricMode::ReaderListening);
        self.decoder.reset_with_offset(offset);
        let t0 = self.fabric.tick();
        let mut samples: u32 = 0;
        loop {
            self.fabric.kick_watchdog();
            if self.fabric.rx_ready() {
                let b = self.fabric.rx();
                let tick = self.fabric.tick();
                samples += 1;
                if self.decoder.feed(b, tick) {
                    let collision = self.decoder.collision_pos();
                    let frame = self.decoder.take();
                    self.next_transfer_time = self.next_transfer_time.max(
                        frame
                            .end
                            .wrapping_sub(
                                (self.timings.air2arm_as_reader + self.timings.arm2air_as_reader)
                                    / 16,
                            )
                            .wrapping_add(FRAME_DELAY_TIME_PICC_TO_PCD),
                    );
                    let d = self.timings.air2arm_as_reader / 16;
                    self.trace.log(
                        Direction::TagToReader,
                        frame.start.wrapping_sub(d),
                        frame.end.wrapping_sub(d),
                        &frame,
                    );
                    return Ok((frame, collision));
                }
            }
            if !self.decoder.in_frame()
                && (samples > self.timeout
                    || self.fabric.tick().wrapping_sub(t0) > self.timeout * 8)
            {
                trace!("receive: timed out after {samples} samples");
                return Err(Error::Timeout);
            }
        }
    }
}

impl<F: Fabric> Transceive for TimedTransceiver<'_, F> {
    fn transceive(&mut self, tx: &Frame, opts: TxOpts) -> Result<Reply> {
        let mut enc = if opts.parity {
            reader_encoder::encode(tx)
        } else {
            reader_encoder::encode_bits(tx.bytes(), tx.bits(), None, false)
        };
        let duration = enc.duration;
        let start = self.transmit(&mut enc, opts.timing);
        let d = self.timings.arm2air_as_reader / 16;
        self.trace.log(
            Direction::ReaderToTag,
            start.wrapping_add(d),
            start.wrapping_add(d).wrapping_add(duration),
            tx,
        );
        let (frame, collision_pos) = self.receive(opts.rx_offset)?;
        Ok(Reply {
            frame,
            collision_pos,
            tx_start: start,
        })
    }

    fn set_timeout(&mut self, ticks: u32) {
        debug!("timeout set to {ticks} ticks (~{} ms)", ticks / 106);
        self.timeout = ticks;
    }

    fn timeout(&self) -> u32 {
        self.timeout
    }

    fn now(&mut self) -> u32 {
        self.fabric.tick()
    }

    fn cancelled(&mut self) -> bool {
        self.fabric.button_pressed()
    }
}

/// Emulated-tag transmit: wait for the fabric delay queue, start on the
/// 8-tick grid, drop the first correction byte unless the reader's last
/// parity bit put us in the long frame-delay slot, and drain the queue
/// before going back to listening. Returns the start tick.
pub fn em_transmit<F: Fabric>(fabric: &mut F, enc: &Encoded, correction_needed: bool) -> u32 {
    fabric.set_mode(FabricMode::TagModulating);
    let skip = usize::from(!correction_needed);
    // Wait for the next 8-tick boundary.
    let mut start = fabric.tick();
    while start & 7 != 0 {
        start = fabric.tick();
    }
    for &b in &enc.symbols[skip..] {
        while !fabric.tx_ready() {
            fabric.kick_watchdog();
        }
        fabric.tx(b);
    }
    while !fabric.tx_queue_empty() {
        fabric.kick_watchdog();
    }
    fabric.set_mode(FabricMode::TagListening);
    start
}
