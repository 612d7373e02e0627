/*! Reader-side symbol encoder.

Frames host bytes into Miller sequences: start of communication is a Z,
a '1' is an X, a '0' is a Z unless the previous symbol was an X (then a
Y), and the end of communication is a logic 0 followed by a Y. One parity
symbol follows every complete byte unless suppressed (Topaz raw frames).
*/

use crate::frame::Frame;
use crate::parity;
use crate::symbols::{Encoded, SEC_X, SEC_Y, SEC_Z};

/// Encode a frame, parity bits taken from the frame itself (so forged
/// parity goes out exactly as forged).
#[must_use]
pub fn encode(frame: &Frame) -> Encoded {
    encode_bits(frame.bytes(), frame.bits(), Some(frame.parity()), true)
}

/// Bit-granular encoder. `bits` may stop mid-byte; `par` overrides the
/// generated parity; `with_parity` off skips parity symbols entirely.
#[must_use]
pub fn encode_bits(cmd: &[u8], bits: usize, par: Option<&[u8]>, with_parity: bool) -> Encoded {
    let computed;
    let par = match par {
        Some(p) => p,
        None => {
            computed = parity::parity_bytes(cmd);
            &computed
        }
    };
    let mut e = Encoded::default();
    // Start of communication.
    e.symbols.push(SEC_Z);
    e.duration = 8 - 6;
    let mut last_was_x = false;

    let mut push = |e: &mut Encoded, bit: bool, last_was_x: &mut bool| {
        if bit {
            e.symbols.push(SEC_X);
            e.duration = 8 * e.symbols.len() as u32 - 2;
            *last_was_x = true;
        } else if *last_was_x {
            e.symbols.push(SEC_Y);
            *last_was_x = false;
        } else {
            e.symbols.push(SEC_Z);
            e.duration = 8 * e.symbols.len() as u32 - 6;
        }
    };

    for (i, b) in cmd.iter().enumerate() {
        let bits_left = (bits - i * 8).min(8);
        for j in 0..bits_left {
            push(&mut e, b >> j & 1 != 0, &mut last_was_x);
        }
        // Only a complete byte gets its parity bit.
        if bits_left == 8 && with_parity {
            push(&mut e, parity::parity_bit(par, i) != 0, &mut last_was_x);
        }
        if bits <= (i + 1) * 8 {
            break;
        }
    }
    // End of communication: logic 0, then sequence Y.
    push(&mut e, false, &mut last_was_x);
    e.symbols.push(SEC_Y);
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{SEC_X, SEC_Y, SEC_Z};

    #[test]
    fn empty_payload_is_z_y() {
        let e = encode_bits(&[], 0, None, true);
        // Start of communication, then immediate end of communication.
        assert_eq!(e.symbols, vec![SEC_Z, SEC_Z, SEC_Y]);
    }

    #[test]
    fn wupa_symbols() {
        // 0x52 LSB first: 0,1,0,0,1,0,1. Seven bits, no parity.
        let e = encode_bits(&[0x52], 7, None, true);
        assert_eq!(
            e.symbols,
            vec![
                SEC_Z, // start
                SEC_Z, SEC_X, SEC_Y, SEC_Z, SEC_X, SEC_Y, SEC_X, // data
                SEC_Y, SEC_Y, // end
            ]
        );
        // Duration ends at the trailing X.
        assert_eq!(e.duration, 8 * 8 - 2);
    }

    #[test]
    fn zero_after_x_is_y_zero_after_z_is_z() {
        // 0x01: 1,0,0,0,0,0,0,0 then parity 0.
        let e = encode_bits(&[0x01], 8, None, true);
        assert_eq!(
            e.symbols,
            vec![
                SEC_Z, // start
                SEC_X, SEC_Y, SEC_Z, SEC_Z, SEC_Z, SEC_Z, SEC_Z, SEC_Z, // data
                SEC_Z, // parity 0
                SEC_Z, SEC_Y, // end
            ]
        );
    }

    #[test]
    fn no_parity_variant() {
        let with = encode_bits(&[0xaa], 8, None, true);
        let without = encode_bits(&[0xaa], 8, None, false);
        assert_eq!(with.symbols.len(), without.symbols.len() + 1);
    }
}
