/*! Tag-side symbol encoder.

Manchester sequences: D for '1', E for '0', parity after every byte, F as
the end marker. The buffer is prefixed with eight stuff bytes (the last
one all ones) so the transmitter can align the answer to either legal
frame delay time by dropping or keeping the first byte: the "correction
bit".
*/

use crate::frame::Frame;
use crate::symbols::{Encoded, SEC_D, SEC_E, SEC_F};

/// Length of the correction-bit prefix.
pub const CORRECTION_PREFIX: usize = 8;

fn prefix(e: &mut Encoded) {
    e.symbols.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0xff]);
    // Start bit.
    e.symbols.push(SEC_D);
    e.duration = 8 * e.symbols.len() as u32 - 4;
}

fn push_bit(e: &mut Encoded, bit: bool) {
    if bit {
        e.symbols.push(SEC_D);
        e.duration = 8 * e.symbols.len() as u32 - 4;
    } else {
        e.symbols.push(SEC_E);
        e.duration = 8 * e.symbols.len() as u32;
    }
}

/// Encode a tag answer; parity bits come from the frame (encrypted
/// sessions carry keystream-adjusted parity).
#[must_use]
pub fn encode(frame: &Frame) -> Encoded {
    let mut e = Encoded::default();
    prefix(&mut e);
    for (i, b) in frame.bytes().iter().enumerate() {
        for j in 0..8 {
            push_bit(&mut e, b >> j & 1 != 0);
        }
        push_bit(&mut e, frame.parity_bit(i) != 0);
    }
    e.symbols.push(SEC_F);
    e
}

/// Encode a 4-bit answer (ACK/NACK), no parity.
#[must_use]
pub fn encode_nibble(cmd: u8) -> Encoded {
    let mut e = Encoded::default();
    prefix(&mut e);
    for j in 0..4 {
        push_bit(&mut e, cmd >> j & 1 != 0);
    }
    e.symbols.push(SEC_F);
    e
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibble_symbols() {
        let e = encode_nibble(0x05); // 1,0,1,0
        let body = &e.symbols[CORRECTION_PREFIX..];
        assert_eq!(body, &[SEC_D, SEC_D, SEC_E, SEC_D, SEC_E, SEC_F]);
    }

    #[test]
    fn byte_frame_has_parity_symbol() {
        let e = encode(&Frame::new(&[0x00]));
        let body = &e.symbols[CORRECTION_PREFIX..];
        // Start, eight E, parity 1 as D, end.
        assert_eq!(body.len(), 1 + 8 + 1 + 1);
        assert_eq!(body[9], SEC_D);
        assert_eq!(*body.last().unwrap(), SEC_F);
    }

    #[test]
    fn duration_tracks_last_modulation() {
        // Ending in a 0 bit: duration lands on the full period.
        let e = encode(&Frame::new(&[0x80])); // parity of 0x80 is 0
        assert_eq!(e.duration, 8 * (e.symbols.len() as u32 - 1));
        assert_eq!(crate::parity::odd_parity8(0x80), 0);
    }
}
