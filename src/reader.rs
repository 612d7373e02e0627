/*! Reader-side ISO 14443-3/-4 procedures.

Wakeup, bitwise anticollision over up to three cascade levels, SELECT,
RATS with the ATS-driven frame-waiting-time update, and the I-block path
with its block-number toggle. Everything is written against the
[`Transceive`] seam, so the same engine runs on hardware and against the
software air interface.
*/

use log::{debug, info};
use serde::Serialize;

use crate::crc::append_crc_a;
use crate::frame::Frame;
use crate::timing::ats_timeout;
use crate::transceiver::{Transceive, TxOpts};
use crate::{Error, Result};

/// Cascade level SELECT command codes.
const SEL_CL: [u8; 3] = [0x93, 0x95, 0x97];

/// Result of a successful selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardInfo {
    /// Complete UID, cascade tags stripped: 4, 7 or 10 bytes.
    pub uid: Vec<u8>,
    /// Answer to request.
    pub atqa: [u8; 2],
    /// Final select acknowledge.
    pub sak: u8,
    /// Answer to select (with its CRC), empty when the card is not
    /// 14443-4 compliant.
    pub ats: Vec<u8>,
}

impl CardInfo {
    /// The UID word CRYPTO1 is keyed with: always the last four bytes.
    #[must_use]
    pub fn cuid(&self) -> u32 {
        let n = self.uid.len();
        u32::from_be_bytes(self.uid[n - 4..].try_into().unwrap_or([0; 4]))
    }
}

/// Wake up and select the card in the field.
///
/// With `known_uid` the anticollision loop is skipped and the card is
/// selected directly (the darkside driver re-selects this way on every
/// sync round).
pub fn select_card<T: Transceive>(trx: &mut T, known_uid: Option<&[u8]>) -> Result<CardInfo> {
    // 7-bit WUPA wakes HALTed cards too.
    let reply = trx.transceive(&Frame::short(0x52, 7), TxOpts::default())?;
    if reply.frame.len() != 2 {
        return Err(Error::Protocol("short ATQA"));
    }
    let atqa = [reply.frame.bytes()[0], reply.frame.bytes()[1]];
    if atqa[0] & 0x1f == 0 {
        // No standard bit-frame anticollision advertised.
        return Err(Error::ProprietaryAnticollision);
    }

    let mut uid = Vec::with_capacity(10);
    let mut sak;
    let mut cascade = 0usize;
    loop {
        let sel = SEL_CL[cascade];
        let frag: [u8; 4] = if let Some(known) = known_uid {
            known_fragment(known, cascade)?
        } else {
            let reply = trx.transceive(&Frame::new(&[sel, 0x20]), TxOpts::default())?;
            if reply.collision_pos != 0 {
                anticollision(trx, sel, &reply)?
            } else {
                if reply.frame.len() < 5 {
                    return Err(Error::Protocol("short anticollision answer"));
                }
                reply.frame.bytes()[..4].try_into().unwrap_or([0; 4])
            }
        };

        // Select this fragment: NVB 0x70, BCC, CRC.
        let mut cmd = vec![sel, 0x70, frag[0], frag[1], frag[2], frag[3]];
        cmd.push(frag[0] ^ frag[1] ^ frag[2] ^ frag[3]);
        append_crc_a(&mut cmd);
        let reply = trx.transceive(&Frame::new(&cmd), TxOpts::default())?;
        if reply.frame.is_empty() {
            return Err(Error::Protocol("no SAK"));
        }
        sak = reply.frame.bytes()[0];
        if sak & 0x04 != 0 {
            // Cascade bit: drop the CT byte, keep three UID bytes, go
            // around again.
            uid.extend_from_slice(&frag[1..4]);
            cascade += 1;
            if cascade >= SEL_CL.len() {
                return Err(Error::Protocol("cascade level overflow"));
            }
        } else {
            uid.extend_from_slice(&frag);
            break;
        }
    }

    let mut info = CardInfo {
        uid,
        atqa,
        sak,
        ats: Vec::new(),
    };
    info!(
        "selected card uid={:02x?} atqa={:02x?} sak={:02x}",
        info.uid, info.atqa, info.sak
    );

    if sak & 0x20 != 0 {
        // 14443-4 compliant: request the ATS, FSD 256, CID 0.
        let mut rats = vec![0xe0, 0x80];
        append_crc_a(&mut rats);
        let reply = trx.transceive(&Frame::new(&rats), TxOpts::default())?;
        info.ats = reply.frame.bytes().to_vec();
        if let Some(t) = ats_timeout(&info.ats) {
            trx.set_timeout(t);
        }
    }
    Ok(info)
}

fn known_fragment(known: &[u8], cascade: usize) -> Result<[u8; 4]> {
    let f = match (known.len(), cascade) {
        (4, 0) => [known[0], known[1], known[2], known[3]],
        (7, 0) | (10, 0) => [0x88, known[0], known[1], known[2]],
        (7, 1) => [known[3], known[4], known[5], known[6]],
        (10, 1) => [0x88, known[3], known[4], known[5]],
        (10, 2) => [known[6], known[7], known[8], known[9]],
        _ => return Err(Error::Protocol("bad UID length for cascade")),
    };
    Ok(f)
}

/// Bitwise anticollision: walk collisions, forcing a 1 at every collision
/// position, until a clean fragment plus BCC arrives.
fn anticollision<T: Transceive>(
    trx: &mut T,
    sel: u8,
    first: &crate::transceiver::Reply,
) -> Result<[u8; 4]> {
    let mut frag = [0u8; 4];
    let mut uid_bits: usize = 0;
    let mut offset: usize = 0;
    let mut resp = first.frame.clone();
    let mut coll = usize::from(first.collision_pos);
    loop {
        debug!("collision after bit {coll}");
        for i in offset..coll.min(resp.bits()) {
            if uid_bits >= 32 {
                return Err(Error::Protocol("anticollision ran past the UID"));
            }
            let bit = resp.bytes()[i / 8] >> (i % 8) & 1;
            frag[uid_bits / 8] |= bit << (uid_bits % 8);
            uid_bits += 1;
        }
        if uid_bits >= 32 {
            return Err(Error::Protocol("anticollision ran past the UID"));
        }
        // Prefer the card with a 1 in the collision position.
        frag[uid_bits / 8] |= 1 << (uid_bits % 8);
        uid_bits += 1;

        let nvb = (((2 + uid_bits / 8) << 4) | (uid_bits % 8)) as u8;
        let mut cmd = vec![sel, nvb];
        cmd.extend_from_slice(&frag[..uid_bits.div_ceil(8)]);
        offset = uid_bits % 8;
        let reply = trx.transceive(
            &Frame::with_bits(&cmd, 16 + uid_bits),
            TxOpts {
                rx_offset: offset as u16,
                ..TxOpts::default()
            },
        )?;
        if reply.collision_pos == 0 {
            // Collect the rest of the fragment; the last byte is the BCC.
            if reply.frame.len() < 2 {
                return Err(Error::Protocol("short anticollision answer"));
            }
            for i in offset..(reply.frame.len() - 1) * 8 {
                let bit = reply.frame.bytes()[i / 8] >> (i % 8) & 1;
                if uid_bits >= 32 {
                    return Err(Error::Protocol("anticollision ran past the UID"));
                }
                frag[uid_bits / 8] |= bit << (uid_bits % 8);
                uid_bits += 1;
            }
            return Ok(frag);
        }
        resp = reply.frame;
        coll = usize::from(reply.collision_pos);
    }
}

/// I-block exchange state: the PCB block number.
#[derive(Debug, Default)]
pub struct ApduSession {
    block_num: u8,
}

impl ApduSession {
    /// Fresh session, block number 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current block number (tests and trace tooling).
    #[must_use]
    pub fn block_num(&self) -> u8 {
        self.block_num
    }

    /// Wrap a payload in an I-block, exchange it, and toggle the block
    /// number when the answer is an I-block or R(ACK) with our number.
    pub fn exchange<T: Transceive>(&mut self, trx: &mut T, payload: &[u8]) -> Result<Vec<u8>> {
        let mut cmd = vec![0x0a | self.block_num, 0x00];
        cmd.extend_from_slice(payload);
        append_crc_a(&mut cmd);
        let reply = trx.transceive(&Frame::new(&cmd), TxOpts::default())?;
        let b = reply.frame.bytes();
        if b.len() >= 4
            && (b[0] & 0xc0 == 0 || b[0] & 0xd0 == 0x80)
            && b[0] & 0x01 == self.block_num
        {
            self.block_num ^= 1;
        }
        Ok(b.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transceiver::Reply;

    /// Canned-answer transceiver for protocol-level tests.
    struct Script {
        answers: Vec<Frame>,
        sent: Vec<Vec<u8>>,
        timeout: u32,
    }

    impl Script {
        fn new(answers: Vec<Frame>) -> Self {
            Self {
                answers,
                sent: Vec::new(),
                timeout: 1050,
            }
        }
    }

    impl Transceive for Script {
        fn transceive(&mut self, tx: &Frame, _opts: TxOpts) -> Result<Reply> {
            self.sent.push(tx.bytes().to_vec());
            if self.answers.is_empty() {
                return Err(Error::Timeout);
            }
            Ok(Reply {
                frame: self.answers.remove(0),
                collision_pos: 0,
                tx_start: 0,
            })
        }
        fn set_timeout(&mut self, ticks: u32) {
            self.timeout = ticks;
        }
        fn timeout(&self) -> u32 {
            self.timeout
        }
    }

    #[test]
    fn block_number_toggles_mod_2() -> Result<()> {
        let ack = |n: u8| Frame::new(&[0xa0 | n, 0x00, 0x12, 0x34]);
        let mut trx = Script::new(vec![ack(0), ack(1), ack(0)]);
        let mut apdu = ApduSession::new();
        for k in 1..=3u8 {
            apdu.exchange(&mut trx, &[0x00, 0xa4])?;
            assert_eq!(apdu.block_num(), k % 2);
        }
        // Every I-block we sent carried the matching number.
        assert_eq!(trx.sent[0][0], 0x0a);
        assert_eq!(trx.sent[1][0], 0x0b);
        assert_eq!(trx.sent[2][0], 0x0a);
        Ok(())
    }

    #[test]
    fn r_nak_does_not_toggle() -> Result<()> {
        // R(NAK) has bit 4 set.
        let mut trx = Script::new(vec![Frame::new(&[0xb2, 0x00, 0x12, 0x34])]);
        let mut apdu = ApduSession::new();
        apdu.exchange(&mut trx, &[0x00])?;
        assert_eq!(apdu.block_num(), 0);
        Ok(())
    }

    #[test]
    fn proprietary_anticollision_detected() {
        let mut trx = Script::new(vec![Frame::new(&[0x00, 0x0c])]);
        assert_eq!(
            select_card(&mut trx, None),
            Err(Error::ProprietaryAnticollision)
        );
    }

    /// Two tags in the field at once: answers to SELECT_ALL and partial
    /// SELECTs are the bitwise OR of every tag matching the prefix, with
    /// the first disagreeing bit reported as the collision.
    struct TwoTags {
        tags: [[u8; 5]; 2],
    }

    impl Transceive for TwoTags {
        fn transceive(&mut self, tx: &Frame, opts: TxOpts) -> Result<Reply> {
            let b = tx.bytes();
            let reply = |frame: Frame, collision_pos: u16| {
                Ok(Reply {
                    frame,
                    collision_pos,
                    tx_start: 0,
                })
            };
            if tx.bits() == 7 {
                return reply(Frame::new(&[0x04, 0x00]), 0);
            }
            let nvb = b[1];
            if nvb == 0x70 {
                if !self.tags.iter().any(|t| b[2..7] == t[..]) {
                    return Err(Error::Timeout);
                }
                let mut sak = vec![0x08];
                append_crc_a(&mut sak);
                return reply(Frame::new(&sak), 0);
            }
            let k = usize::from(nvb >> 4).saturating_sub(2) * 8 + usize::from(nvb & 0x07);
            assert_eq!(usize::from(opts.rx_offset), k % 8, "receive offset");
            let matching: Vec<&[u8; 5]> = self
                .tags
                .iter()
                .filter(|t| (0..k).all(|i| t[i / 8] >> (i % 8) & 1 == b[2 + i / 8] >> (i % 8) & 1))
                .collect();
            if matching.is_empty() {
                return Err(Error::Timeout);
            }
            let base = k / 8;
            let mut bytes = vec![0u8; 5 - base];
            let mut coll = 0u16;
            for g in k..40 {
                let r = g - base * 8;
                let bits: Vec<u8> = matching.iter().map(|t| t[g / 8] >> (g % 8) & 1).collect();
                if coll == 0 && bits.iter().any(|&x| x != bits[0]) {
                    coll = r as u16;
                }
                bytes[r / 8] |= bits.iter().fold(0u8, |a, x| a | x) << (r % 8);
            }
            reply(Frame::new(&bytes), coll)
        }
        fn set_timeout(&mut self, _ticks: u32) {}
        fn timeout(&self) -> u32 {
            1050
        }
    }

    #[test]
    fn bitwise_anticollision_resolves_two_tags() -> Result<()> {
        // First difference at bit 1; the engine prefers the 1, so the
        // second tag wins.
        let mut trx = TwoTags {
            tags: [
                [0x88, 0x04, 0x51, 0xf1, 0x2c],
                [0xde, 0xad, 0xbe, 0xaf, 0x62],
            ],
        };
        let card = select_card(&mut trx, None)?;
        assert_eq!(card.uid, vec![0xde, 0xad, 0xbe, 0xaf]);
        assert_eq!(card.sak, 0x08);
        Ok(())
    }

    #[test]
    fn plain_4b_selection() -> Result<()> {
        let uid = [0xde, 0xad, 0xbe, 0xaf];
        let bcc = uid.iter().fold(0, |a, b| a ^ b);
        let mut sak8 = vec![0x08];
        append_crc_a(&mut sak8);
        let mut trx = Script::new(vec![
            Frame::new(&[0x04, 0x00]),
            Frame::new(&[uid[0], uid[1], uid[2], uid[3], bcc]),
            Frame::new(&sak8),
        ]);
        let card = select_card(&mut trx, None)?;
        assert_eq!(card.uid, uid);
        assert_eq!(card.sak, 0x08);
        assert!(card.ats.is_empty());
        // The SELECT carried UID, BCC and CRC.
        assert_eq!(trx.sent[2][..7], [0x93, 0x70, 0xde, 0xad, 0xbe, 0xaf, 0x62]);
        assert_eq!(card.cuid(), 0xdead_beaf);
        Ok(())
    }
}
