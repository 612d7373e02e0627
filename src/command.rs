/*! Host command surface.

The host transport hands the engine one [`Request`] at a time; the
dispatcher is a single `match`. Every mode entry resets the trace arena,
every mode exit restores the fabric to OFF and clears the LEDs, except a
reader exchange asked to keep the field up for a follow-up command.

```no_run
use proxa::command::{Engine, ReaderRequest, Request};
use proxa::sim::SimFabric;

let mut engine = Engine::new(SimFabric::new());
let outcome = engine.handle(Request::Reader(ReaderRequest {
    connect: true,
    ..ReaderRequest::default()
}))?;
# let _ = outcome;
# Ok::<(), proxa::Error>(())
```
*/

use serde::Serialize;

use crate::crc::{append_crc_a, append_crc_b};
use crate::darkside::{self, DarksideOutcome, DarksideState};
use crate::emulator::{EmOutcome, Emulator, EmulatorConfig, TagType};
use crate::fabric::{Fabric, FabricMode, Led};
use crate::frame::Frame;
use crate::reader::{ApduSession, CardInfo, select_card};
use crate::sniffer::{self, SniffParams, SniffSummary};
use crate::timing::{DEFAULT_TIMEOUT, Timings};
use crate::trace::TraceLog;
use crate::transceiver::{TimedTransceiver, Transceive, TxOpts};
use crate::Result;

/// Raw reader exchange parameters.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    /// Bytes to put on the air.
    pub data: Vec<u8>,
    /// Exact bit count for a partial frame; 0 sends whole bytes.
    pub bits: usize,
    /// Append a CRC before sending.
    pub append_crc: bool,
    /// Topaz framing: CRC-B and no parity bits.
    pub topaz: bool,
}

/// Reader mode options, one flag per host option bit.
#[derive(Debug, Clone, Default)]
pub struct ReaderRequest {
    /// Power the field and start a transaction.
    pub connect: bool,
    /// Skip the select when connecting.
    pub no_select: bool,
    /// Exchange an I-block wrapped payload.
    pub apdu: Option<Vec<u8>>,
    /// Exchange a raw frame.
    pub raw: Option<RawRequest>,
    /// Install a new answer timeout first.
    pub set_timeout: Option<u32>,
    /// Keep the field up afterwards.
    pub no_disconnect: bool,
    /// Drive the trigger LED during the exchange.
    pub request_trigger: bool,
}

/// Plain tag simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulateRequest {
    /// Personality to present.
    pub tag_type: TagType,
    /// 4, 7 or 10 byte UID.
    pub uid: Vec<u8>,
    /// Memory image, may be empty.
    pub data: Vec<u8>,
}

/// MIFARE Classic 1K simulation parameters.
#[derive(Debug, Clone)]
pub struct MifareSimRequest {
    /// 4, 7 or 10 byte UID.
    pub uid: Vec<u8>,
    /// Collect reader {nr, ar} pairs.
    pub nr_ar_attack: bool,
    /// Pseudo-random tag nonces.
    pub random_nonce: bool,
    /// Stop after this many reads, 0 to keep going.
    pub exit_after_reads: u8,
    /// 1K card image; short images are zero-padded.
    pub data: Vec<u8>,
}

/// One host command for the protocol core.
#[derive(Debug, Clone)]
pub enum Request {
    /// Act as a reader.
    Reader(ReaderRequest),
    /// Emulate a plain tag.
    Simulate(SimulateRequest),
    /// Emulate a MIFARE Classic 1K.
    SimulateMifare(MifareSimRequest),
    /// Sniff a live exchange.
    Sniff(SniffParams),
    /// Run the darkside attack.
    Darkside {
        /// Restart clock calibration instead of resuming.
        first_try: bool,
    },
}

/// What a reader-mode request produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReaderOutcome {
    /// Selected card, when a select ran.
    pub card: Option<CardInfo>,
    /// I-block answer.
    pub apdu: Option<Vec<u8>>,
    /// Raw exchange answer.
    pub raw: Option<Vec<u8>>,
}

/// Result of one request.
#[derive(Debug, Clone, Serialize)]
pub enum Outcome {
    /// Reader-mode results.
    Reader(ReaderOutcome),
    /// Emulation statistics and harvest.
    Simulation(EmOutcome),
    /// Sniffer summary; the trace holds the frames.
    Sniff(SniffSummary),
    /// Darkside harvest.
    Darkside(DarksideOutcome),
}

/// The protocol engine: owns the fabric, the trace and the state that
/// survives between host commands.
pub struct Engine<F: Fabric> {
    fabric: F,
    /// Frame trace of the last mode; the host transport reads its tail.
    pub trace: TraceLog,
    timings: Timings,
    timeout: u32,
    darkside: DarksideState,
    apdu: ApduSession,
}

impl<F: Fabric> Engine<F> {
    /// New engine over a fabric.
    pub fn new(fabric: F) -> Self {
        Self {
            fabric,
            trace: TraceLog::default(),
            timings: Timings::default(),
            timeout: DEFAULT_TIMEOUT,
            darkside: DarksideState::default(),
            apdu: ApduSession::new(),
        }
    }

    /// Access the fabric (tests, host diagnostics).
    pub fn fabric_mut(&mut self) -> &mut F {
        &mut self.fabric
    }

    /// Dispatch one host command.
    pub fn handle(&mut self, req: Request) -> Result<Outcome> {
        match req {
            Request::Reader(r) => self.reader(r),
            Request::Simulate(s) => {
                self.trace.reset();
                let mut em = Emulator::new(EmulatorConfig {
                    tag_type: s.tag_type,
                    uid: s.uid,
                    data: s.data,
                    ..EmulatorConfig::default()
                })?;
                let res = em.run(&mut self.fabric, &mut self.trace, &self.timings);
                self.shutdown();
                Ok(Outcome::Simulation(res?))
            }
            Request::SimulateMifare(m) => {
                self.trace.reset();
                let mut em = Emulator::new(EmulatorConfig {
                    tag_type: TagType::MifareClassic,
                    uid: m.uid,
                    crypto: true,
                    nr_ar_attack: m.nr_ar_attack,
                    random_nonce: m.random_nonce,
                    exit_after_reads: m.exit_after_reads,
                    data: m.data,
                    ..EmulatorConfig::default()
                })?;
                let res = em.run(&mut self.fabric, &mut self.trace, &self.timings);
                self.shutdown();
                Ok(Outcome::Simulation(res?))
            }
            Request::Sniff(p) => {
                self.trace.reset();
                let res = sniffer::run(&mut self.fabric, p, &mut self.trace, &self.timings);
                self.shutdown();
                Ok(Outcome::Sniff(res?))
            }
            Request::Darkside { first_try } => {
                if first_try {
                    self.trace.reset();
                }
                let mut trx = TimedTransceiver::new(
                    &mut self.fabric,
                    &mut self.trace,
                    self.timings,
                    self.timeout,
                );
                let res = darkside::run(&mut trx, &mut self.darkside, first_try);
                drop(trx);
                self.shutdown();
                Ok(Outcome::Darkside(res?))
            }
        }
    }

    fn reader(&mut self, r: ReaderRequest) -> Result<Outcome> {
        if r.connect {
            self.trace.reset();
            self.apdu = ApduSession::new();
        }
        if r.request_trigger {
            self.fabric.led(Led::C, true);
        }
        let mut out = ReaderOutcome::default();
        let mut trx = TimedTransceiver::new(
            &mut self.fabric,
            &mut self.trace,
            self.timings,
            self.timeout,
        );
        let res = reader_exchanges(&mut trx, &mut self.apdu, &r, &mut out);
        self.timeout = trx.timeout();
        drop(trx);
        if res.is_err() || !r.no_disconnect {
            self.shutdown();
        }
        res?;
        Ok(Outcome::Reader(out))
    }

    fn shutdown(&mut self) {
        self.fabric.set_mode(FabricMode::Off);
        self.fabric.leds_off();
    }
}

fn reader_exchanges<F: Fabric>(
    trx: &mut TimedTransceiver<'_, F>,
    apdu: &mut ApduSession,
    r: &ReaderRequest,
    out: &mut ReaderOutcome,
) -> Result<()> {
    if let Some(t) = r.set_timeout {
        trx.set_timeout(t);
    }
    if r.connect && !r.no_select {
        out.card = Some(select_card(trx, None)?);
    }
    if let Some(payload) = &r.apdu {
        out.apdu = Some(apdu.exchange(trx, payload)?);
    }
    if let Some(raw) = &r.raw {
        let mut data = raw.data.clone();
        let mut bits = raw.bits;
        if raw.append_crc {
            if raw.topaz {
                append_crc_b(&mut data);
            } else {
                append_crc_a(&mut data);
            }
            if bits > 0 {
                bits += 16;
            }
        }
        let frame = if bits > 0 {
            Frame::with_bits(&data, bits)
        } else {
            Frame::new(&data)
        };
        let reply = trx.transceive(
            &frame,
            TxOpts {
                parity: !raw.topaz,
                ..TxOpts::default()
            },
        )?;
        out.raw = Some(reply.frame.bytes().to_vec());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::append_crc_a;
    use crate::sim::{SimFabric, tag_channel};
    use crate::tag_encoder;

    fn queue_tag_answer(fabric: &mut SimFabric, frame: &Frame) {
        let enc = tag_encoder::encode(frame);
        fabric.queue_rx(&tag_channel(&enc.symbols));
    }

    #[test]
    fn reader_connect_selects_card() -> Result<()> {
        let mut fabric = SimFabric::new();
        queue_tag_answer(&mut fabric, &Frame::new(&[0x04, 0x00]));
        queue_tag_answer(
            &mut fabric,
            &Frame::new(&[0xde, 0xad, 0xbe, 0xaf, 0x62]),
        );
        let mut sak = vec![0x08];
        append_crc_a(&mut sak);
        queue_tag_answer(&mut fabric, &Frame::new(&sak));

        let mut engine = Engine::new(fabric);
        let outcome = engine.handle(Request::Reader(ReaderRequest {
            connect: true,
            ..ReaderRequest::default()
        }))?;
        let Outcome::Reader(r) = outcome else {
            panic!("wrong outcome kind");
        };
        let card = r.card.expect("card");
        assert_eq!(card.uid, vec![0xde, 0xad, 0xbe, 0xaf]);
        assert_eq!(card.sak, 0x08);
        assert!(card.ats.is_empty());
        // Field released afterwards.
        assert_eq!(engine.fabric_mut().mode, FabricMode::Off);
        // The trace saw both directions: WUPA, ATQA, two selects and
        // their answers.
        assert_eq!(engine.trace.records()?.len(), 6);
        Ok(())
    }

    #[test]
    fn reader_timeout_without_tag() {
        let mut engine = Engine::new(SimFabric::new());
        let res = engine.handle(Request::Reader(ReaderRequest {
            connect: true,
            ..ReaderRequest::default()
        }));
        assert_eq!(res.err(), Some(crate::Error::Timeout));
        assert_eq!(engine.fabric_mut().mode, FabricMode::Off);
    }
}
