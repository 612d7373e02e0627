/*! Passive sniffer for live reader/tag exchanges.

The fabric's sniffer mode interleaves both directions into one stream:
every byte carries a reader nibble (high) and a tag nibble (low), so two
stream bytes make one bit period for each decoder. Both decoders run side
by side; whichever side is mid-frame wins the slot, since the two never
talk at the same time. When either emits, the frame is logged and both
decoders reset; the paired partial was a false trigger from the other
side's modulation.

Trigger rules select when logging starts: immediately, at the first tag
answer, or at the first 7-bit reader request.
*/

use log::{debug, info};
use serde::Serialize;

use crate::dma::SampleRing;
use crate::fabric::{Fabric, FabricMode, Led};
use crate::frame::Direction;
use crate::manchester::ManchesterDecoder;
use crate::miller::MillerDecoder;
use crate::timing::Timings;
use crate::trace::TraceLog;
use crate::Result;

/// Two seconds of subcarrier ticks: idle long enough to hand the trace
/// to the host.
const IDLE_FLUSH_TICKS: u32 = 1_695_000;

/// What starts the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SniffParams {
    /// Start logging at the first tag answer.
    pub trigger_on_tag: bool,
    /// Start logging at the first 7-bit reader request.
    pub trigger_on_reader_short: bool,
}

/// Why the sniffer returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SniffEnd {
    /// Operator button.
    Cancelled,
    /// Nothing on the air for two seconds; trace handed to the host.
    IdleFlush,
    /// The trace arena filled up.
    TraceFull,
}

/// Result of a sniffer run.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SniffSummary {
    /// Why the run ended.
    pub end: SniffEnd,
    /// Reader frames logged.
    pub reader_frames: u32,
    /// Tag frames logged.
    pub tag_frames: u32,
}

/// Sniff until the button, an idle flush, or a full trace.
pub fn run<F: Fabric>(
    fabric: &mut F,
    params: SniffParams,
    trace: &mut TraceLog,
    timings: &Timings,
) -> Result<SniffSummary> {
    fabric.set_mode(FabricMode::Sniffer);
    fabric.led(Led::D, true);
    let mut ring = SampleRing::default();
    let mut uart = MillerDecoder::new();
    let mut demod = ManchesterDecoder::new();
    let mut triggered = !(params.trigger_on_tag || params.trigger_on_reader_short);
    let mut reader_active = false;
    let mut tag_active = false;
    let mut previous: Option<u8> = None;
    let mut period_tick: u32 = 0;
    let mut last_activity = fabric.tick();
    let mut reader_frames = 0u32;
    let mut tag_frames = 0u32;

    let end = 'outer: loop {
        fabric.kick_watchdog();
        if fabric.button_pressed() {
            break SniffEnd::Cancelled;
        }
        while fabric.rx_ready() {
            ring.push(fabric.rx()).inspect_err(|_| {
                debug!("sniffer fell behind the sample stream");
            })?;
        }
        let Some(cur) = ring.pop() else {
            if fabric.tick().wrapping_sub(last_activity) > IDLE_FLUSH_TICKS {
                break SniffEnd::IdleFlush;
            }
            continue;
        };
        // Pair up: two interleaved bytes per bit period.
        let Some(prev) = previous.take() else {
            previous = Some(cur);
            continue;
        };
        period_tick = period_tick.wrapping_add(8);

        if !tag_active {
            let readerdata = (prev & 0xf0) | (cur >> 4);
            if uart.feed(readerdata, period_tick) {
                let f = uart.take();
                if !triggered
                    && params.trigger_on_reader_short
                    && f.len() == 1
                    && f.bits() == 7
                {
                    triggered = true;
                }
                if triggered {
                    let d = timings.reader_air2arm_as_sniffer / 16;
                    if !trace.log(
                        Direction::ReaderToTag,
                        f.start.wrapping_sub(d),
                        f.end.wrapping_sub(d),
                        &f,
                    ) {
                        break 'outer SniffEnd::TraceFull;
                    }
                    reader_frames += 1;
                }
                last_activity = fabric.tick();
                // The tag decoder was chewing on reader modulation.
                demod.reset();
            }
            reader_active = uart.in_frame();
        }
        if !reader_active {
            let tagdata = (prev << 4) | (cur & 0x0f);
            if demod.feed(tagdata, period_tick) {
                let f = demod.take();
                let d = timings.tag_air2arm_as_sniffer / 16;
                if !trace.log(
                    Direction::TagToReader,
                    f.start.wrapping_sub(d),
                    f.end.wrapping_sub(d),
                    &f,
                ) {
                    break 'outer SniffEnd::TraceFull;
                }
                tag_frames += 1;
                if !triggered && params.trigger_on_tag {
                    triggered = true;
                }
                last_activity = fabric.tick();
                uart.reset();
            }
            tag_active = demod.in_frame();
        }
        if uart.in_frame() || demod.in_frame() {
            last_activity = fabric.tick();
        }
    };

    fabric.set_mode(FabricMode::Off);
    fabric.leds_off();
    info!("sniffer done: {reader_frames} reader frames, {tag_frames} tag frames");
    Ok(SniffSummary {
        end,
        reader_frames,
        tag_frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::reader_encoder;
    use crate::sim::{SimFabric, reader_channel, sniff_stream, tag_channel};
    use crate::tag_encoder;

    fn sniff_bytes(reader_frames: &[&[u8]], tag_frames: &[Frame]) -> Vec<u8> {
        // One reader frame, then its tag answer, with idle in between.
        let mut reader_stream = Vec::new();
        let mut tag_stream = Vec::new();
        for (r, t) in reader_frames.iter().zip(tag_frames.iter()) {
            let enc = reader_encoder::encode(&Frame::new(r));
            let r_samples = reader_channel(&enc.symbols);
            reader_stream.extend_from_slice(&r_samples);
            tag_stream.resize(reader_stream.len(), 0x00);

            let enc = tag_encoder::encode(t);
            let t_samples = tag_channel(&enc.symbols);
            tag_stream.extend_from_slice(&t_samples);
            reader_stream.resize(tag_stream.len(), 0xff);
        }
        sniff_stream(&reader_stream, &tag_stream)
    }

    #[test]
    fn logs_reader_then_tag() -> Result<()> {
        let stream = sniff_bytes(&[&[0x93, 0x20]], &[Frame::new(&[0xde, 0xad, 0xbe, 0xaf, 0x62])]);
        let mut fabric = SimFabric::new();
        fabric.queue_rx(&stream);
        fabric.press_button_when_idle();
        let mut trace = TraceLog::default();
        let summary = run(
            &mut fabric,
            SniffParams::default(),
            &mut trace,
            &Timings::default(),
        )?;
        assert_eq!(summary.reader_frames, 1);
        assert_eq!(summary.tag_frames, 1);
        let recs = trace.records()?;
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].dir, Direction::ReaderToTag);
        assert_eq!(recs[0].bytes, vec![0x93, 0x20]);
        assert_eq!(recs[1].dir, Direction::TagToReader);
        assert_eq!(recs[1].bytes, vec![0xde, 0xad, 0xbe, 0xaf, 0x62]);
        Ok(())
    }

    #[test]
    fn tag_trigger_suppresses_leading_reader_frames() -> Result<()> {
        let stream = sniff_bytes(
            &[&[0x26u8], &[0x93, 0x20]],
            &[Frame::new(&[0x04, 0x00]), Frame::new(&[0xde, 0xad, 0xbe, 0xaf, 0x62])],
        );
        let mut fabric = SimFabric::new();
        fabric.queue_rx(&stream);
        fabric.press_button_when_idle();
        let mut trace = TraceLog::default();
        let summary = run(
            &mut fabric,
            SniffParams {
                trigger_on_tag: true,
                trigger_on_reader_short: false,
            },
            &mut trace,
            &Timings::default(),
        )?;
        // The first reader frame came before the first tag answer.
        assert_eq!(summary.reader_frames, 1);
        assert_eq!(summary.tag_frames, 2);
        Ok(())
    }
}
