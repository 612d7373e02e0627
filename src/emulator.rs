/*! Tag emulation.

A state machine that impersonates a Type A card: ATQA/UID/SAK/ATS for
four UID lengths and five personalities, and for MIFARE Classic 1K the
full CRYPTO1 session: authentication, encrypted READ/WRITE, the value
block operations, HALT, plus the two nonce-collection modes used by the
reader attack.

The anticollision answers are pre-encoded into a bounded modulation arena
at start (there is no time to encode them once the reader is clocking);
everything else is encoded on demand into a second arena.

The frame-level core is [`Emulator::process`]; [`Emulator::run`] wraps it
with field sensing, the Miller decoder and the timed tag transmitter.
*/

use std::ops::Range;

use log::{debug, info, trace as trace_log, warn};
use serde::Serialize;

use crate::arena::{Arena, DYNAMIC_MODULATION_CAP, TAG_MODULATION_CAP};
use crate::crc::{append_crc_a, check_crc_a};
use crate::crypto1::{Crypto1, prng_successor};
use crate::fabric::{Fabric, FabricMode, Led};
use crate::frame::{Direction, Frame};
use crate::miller::MillerDecoder;
use crate::parity::{odd_parity8, set_parity_bit};
use crate::symbols::Encoded;
use crate::tag_encoder;
use crate::timing::Timings;
use crate::trace::TraceLog;
use crate::transceiver::em_transmit;
use crate::{Error, Result};

/// MIFARE 4-bit acknowledge.
pub const CARD_ACK: u8 = 0x0a;
/// MIFARE 4-bit "not allowed" answer.
pub const CARD_NACK_NA: u8 = 0x04;
/// MIFARE 4-bit "transmission error" answer.
pub const CARD_NACK_TR: u8 = 0x05;

/// Slots per half of the nonce collector.
pub const ATTACK_KEY_COUNT: usize = 7;

/// Field must stay below threshold this long before the card powers
/// down: 50 ms of subcarrier ticks.
const FIELD_OFF_TICKS: u32 = 42_375;

/// Emulated personalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TagType {
    /// MIFARE Classic 1K.
    MifareClassic,
    /// MIFARE Ultralight.
    Ultralight,
    /// MIFARE DESFire.
    Desfire,
    /// Plain ISO 14443-4 card.
    Iso14443_4,
    /// MIFARE TNP3xxx (toy tags).
    Tnp3xxx,
}

impl TagType {
    /// (ATQA, SAK) the personality advertises.
    fn identity(self) -> ([u8; 2], u8) {
        match self {
            TagType::MifareClassic => ([0x04, 0x00], 0x08),
            TagType::Ultralight => ([0x44, 0x00], 0x00),
            TagType::Desfire => ([0x44, 0x03], 0x20),
            TagType::Iso14443_4 => ([0x08, 0x00], 0x20),
            TagType::Tnp3xxx => ([0x01, 0x0f], 0x01),
        }
    }
}

/// Emulator configuration, from the host command.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Personality.
    pub tag_type: TagType,
    /// 4, 7 or 10 byte UID.
    pub uid: Vec<u8>,
    /// Run the CRYPTO1 engine (MIFARE Classic simulation command).
    pub crypto: bool,
    /// Collect reader {nr, ar} pairs instead of finishing authentication
    /// honestly.
    pub nr_ar_attack: bool,
    /// Fresh pseudo-random tag nonce per authentication.
    pub random_nonce: bool,
    /// Stop after this many successful reads; 0 keeps running.
    pub exit_after_reads: u8,
    /// Card memory image.
    pub data: Vec<u8>,
    /// ADC threshold for "field present".
    pub field_threshold: u16,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            tag_type: TagType::MifareClassic,
            uid: vec![0xde, 0xad, 0xbe, 0xaf],
            crypto: false,
            nr_ar_attack: false,
            random_nonce: false,
            exit_after_reads: 0,
            data: Vec::new(),
            field_threshold: 1000,
        }
    }
}

/// A blank 1K image for a UID: trailers carry transport keys FF..FF and
/// transport access conditions.
#[must_use]
pub fn blank_1k(uid: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; 1024];
    for sector in 0..16 {
        let t = (sector * 4 + 3) * 16;
        data[t..t + 6].fill(0xff);
        data[t + 6..t + 10].copy_from_slice(&[0xff, 0x07, 0x80, 0x69]);
        data[t + 10..t + 16].fill(0xff);
    }
    let n = uid.len().min(10);
    data[..n].copy_from_slice(&uid[..n]);
    if n == 4 {
        data[4] = uid.iter().fold(0, |a, b| a ^ b);
    }
    data
}

/// Where the modulation for an answer lives.
#[derive(Debug, Clone)]
pub enum Modulation {
    /// Pre-encoded into the anticollision arena.
    Canned(Range<usize>),
    /// Encode on demand into the dynamic arena.
    Dynamic,
}

/// One answer from the state machine.
#[derive(Debug, Clone)]
pub struct Response {
    /// The frame to put on the air.
    pub frame: Frame,
    /// Where its modulation comes from.
    pub modulation: Modulation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueOp {
    Inc,
    Dec,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardState {
    NoField,
    Idle,
    Halted,
    Select(usize),
    Auth1,
    Work,
    WriteBl2(u8),
    IntReg(ValueOp, u8),
}

/// Why an emulation run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    /// Operator button.
    Cancelled,
    /// `exit_after_reads` reached.
    ReadsExhausted,
    /// The nonce collector filled both halves.
    AttackComplete,
}

/// Statistics and harvest of one emulation run.
#[derive(Debug, Clone, Serialize)]
pub struct EmOutcome {
    /// Why the run ended.
    pub reason: ExitReason,
    /// Successful READs served.
    pub reads: u32,
    /// The nonce harvest, when the attack mode ran.
    pub collector: Option<NonceCollector>,
}

/// One collected authentication attempt pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NonceSlot {
    /// Card UID word the reader authenticated against.
    pub cuid: u32,
    /// Sector of the authentication.
    pub sector: u8,
    /// 0x60 for key A, 0x61 for key B.
    pub keytype: u8,
    /// First tag nonce.
    pub nt: u32,
    /// First reader nonce, as seen on the wire.
    pub nr: u32,
    /// First reader response, as seen on the wire.
    pub ar: u32,
    /// Second tag nonce.
    pub nt2: u32,
    /// Second reader nonce.
    pub nr2: u32,
    /// Second reader response.
    pub ar2: u32,
    /// 0, 1 or 2 attempts stored.
    pub collected: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Recorded,
    Ignored,
    SwitchToMoebius,
    Finished,
}

/// Collected {nr, ar} pairs, a standard half and a Moebius half.
#[derive(Debug, Clone, Serialize)]
pub struct NonceCollector {
    /// Slot 0..7 standard, 7..14 Moebius.
    pub slots: Vec<NonceSlot>,
    /// Currently filling the Moebius half.
    pub moebius: bool,
    /// Both halves full.
    pub finished: bool,
    first_count: usize,
    second_count: usize,
    moebius_count: usize,
}

impl NonceCollector {
    fn new() -> Self {
        Self {
            slots: vec![NonceSlot::default(); 2 * ATTACK_KEY_COUNT],
            moebius: false,
            finished: false,
            first_count: 0,
            second_count: 0,
            moebius_count: 0,
        }
    }

    fn record(
        &mut self,
        cuid: u32,
        sector: u8,
        keytype: u8,
        nt: u32,
        nr: u32,
        ar: u32,
    ) -> RecordOutcome {
        let base = if self.moebius { ATTACK_KEY_COUNT } else { 0 };
        for i in base..base + ATTACK_KEY_COUNT {
            let slot = &mut self.slots[i];
            let fresh = slot.collected == 0;
            if !fresh && (slot.sector != sector || slot.keytype != keytype) {
                continue;
            }
            if slot.collected >= 2 {
                return RecordOutcome::Ignored;
            }
            if slot.collected == 1 && slot.nr == nr && slot.ar == ar {
                // Same reader attempt replayed; useless for the attack.
                return RecordOutcome::Ignored;
            }
            if fresh {
                *slot = NonceSlot {
                    cuid,
                    sector,
                    keytype,
                    nt,
                    nr,
                    ar,
                    collected: 1,
                    ..NonceSlot::default()
                };
                if !self.moebius {
                    self.first_count += 1;
                    // Pre-assign the paired Moebius slot.
                    let m = &mut self.slots[i + ATTACK_KEY_COUNT];
                    m.cuid = cuid;
                    m.sector = sector;
                    m.keytype = keytype;
                } else {
                    // A Moebius slot starts from its pre-assignment.
                }
                return RecordOutcome::Recorded;
            }
            slot.nt2 = nt;
            slot.nr2 = nr;
            slot.ar2 = ar;
            slot.collected = 2;
            if !self.moebius {
                self.second_count += 1;
                if self.second_count == self.first_count {
                    self.moebius = true;
                    return RecordOutcome::SwitchToMoebius;
                }
            } else {
                self.moebius_count += 1;
                if self.moebius_count == self.first_count {
                    self.finished = true;
                    return RecordOutcome::Finished;
                }
            }
            return RecordOutcome::Recorded;
        }
        RecordOutcome::Ignored
    }
}

struct Canned {
    frame: Frame,
    range: Range<usize>,
    duration: u32,
}

/// The tag state machine.
pub struct Emulator {
    cfg: EmulatorConfig,
    state: CardState,
    atqa: [u8; 2],
    ats: Vec<u8>,
    arena: Arena,
    canned_atqa: Canned,
    canned_uid: Vec<Canned>,
    canned_sak_cl: Canned,
    canned_sak: Canned,
    crypto: Option<Crypto1>,
    authenticated: bool,
    cur_sector: u8,
    cur_keytype: u8,
    nonce: u32,
    transfer_reg: i32,
    reads: u32,
    auth_attempts: u32,
    collector: Option<NonceCollector>,
}

impl Emulator {
    /// Build the emulator and pre-encode the anticollision answers.
    pub fn new(cfg: EmulatorConfig) -> Result<Self> {
        let (mut atqa, sak_final) = cfg.tag_type.identity();
        let cascades = match cfg.uid.len() {
            4 => 1,
            7 => 2,
            10 => 3,
            _ => return Err(Error::Protocol("UID must be 4, 7 or 10 bytes")),
        };
        match cascades {
            2 => atqa[0] |= 0x40,
            3 => atqa[0] |= 0x80,
            _ => {}
        }

        let mut cfg = cfg;
        if cfg.crypto && cfg.data.len() < 1024 {
            cfg.data.resize(1024, 0);
        }

        let mut arena = Arena::new("tag modulation", TAG_MODULATION_CAP);
        let canned_atqa = Self::precompute(&mut arena, Frame::new(&atqa))?;
        let mut canned_uid = Vec::new();
        for level in 0..cascades {
            let mut b = uid_fragment(&cfg.uid, level, cascades);
            let bcc = b.iter().fold(0, |a, x| a ^ x);
            b.push(bcc);
            canned_uid.push(Self::precompute(&mut arena, Frame::new(&b))?);
        }
        let mut sak_cl = vec![0x04];
        append_crc_a(&mut sak_cl);
        let canned_sak_cl = Self::precompute(&mut arena, Frame::new(&sak_cl))?;
        let mut sak = vec![sak_final];
        append_crc_a(&mut sak);
        let canned_sak = Self::precompute(&mut arena, Frame::new(&sak))?;

        // Canned ATS echo: FSC 256, TA(1), TB(1) with FWI 7, TC(1).
        let mut ats = vec![0x05, 0x78, 0x80, 0x71, 0x02];
        append_crc_a(&mut ats);

        let collector = cfg.nr_ar_attack.then(NonceCollector::new);
        let nonce = if cfg.random_nonce {
            rand::random::<u32>()
        } else {
            0x0102_0304
        };
        Ok(Self {
            cfg,
            state: CardState::Idle,
            atqa,
            ats,
            arena,
            canned_atqa,
            canned_uid,
            canned_sak_cl,
            canned_sak,
            crypto: None,
            authenticated: false,
            cur_sector: 0,
            cur_keytype: 0x60,
            nonce,
            transfer_reg: 0,
            reads: 0,
            auth_attempts: 0,
            collector,
        })
    }

    fn precompute(arena: &mut Arena, frame: Frame) -> Result<Canned> {
        let enc = tag_encoder::encode(&frame);
        let range = arena.alloc(&enc.symbols)?;
        Ok(Canned {
            frame,
            range,
            duration: enc.duration,
        })
    }

    /// ATQA this emulator answers with.
    #[must_use]
    pub fn atqa(&self) -> [u8; 2] {
        self.atqa
    }

    /// The nonce harvest so far.
    #[must_use]
    pub fn collector(&self) -> Option<&NonceCollector> {
        self.collector.as_ref()
    }

    /// Card memory image.
    #[must_use]
    pub fn memory(&self) -> &[u8] {
        &self.cfg.data
    }

    /// The field disappeared: power down and lose the session.
    pub fn field_lost(&mut self) {
        self.drop_session();
        self.state = CardState::NoField;
    }

    /// The field came back: power up into IDLE.
    pub fn field_restored(&mut self) {
        if self.state == CardState::NoField {
            self.state = CardState::Idle;
        }
    }

    fn drop_session(&mut self) {
        self.crypto = None;
        self.authenticated = false;
    }

    fn cuid(&self) -> u32 {
        let n = self.cfg.uid.len();
        u32::from_be_bytes(self.cfg.uid[n - 4..].try_into().unwrap_or([0; 4]))
    }

    fn key(&self, sector: u8, keytype: u8) -> u64 {
        let t = (usize::from(sector) * 4 + 3) * 16;
        let off = if keytype == 0x61 { 10 } else { 0 };
        self.cfg.data[t + off..t + off + 6]
            .iter()
            .fold(0u64, |a, b| a << 8 | u64::from(*b))
    }

    fn canned_answer(&self, c: &Canned) -> Response {
        Response {
            frame: c.frame.clone(),
            modulation: Modulation::Canned(c.range.clone()),
        }
    }

    fn dynamic(frame: Frame) -> Option<Response> {
        Some(Response {
            frame,
            modulation: Modulation::Dynamic,
        })
    }

    fn nack(&mut self, code: u8) -> Option<Response> {
        let nib = match (self.authenticated, &mut self.crypto) {
            (true, Some(cs)) => cs.encrypt_nibble(code),
            _ => code,
        };
        Self::dynamic(Frame::short(nib, 4))
    }

    fn ack(&mut self) -> Option<Response> {
        self.nack(CARD_ACK)
    }

    /// Feed one decoded reader frame through the state machine.
    pub fn process(&mut self, rx: &Frame) -> Option<Response> {
        // 7-bit wakeups work from every powered state; REQA is ignored
        // while HALTed.
        if rx.bits() == 7 && rx.len() == 1 {
            let cmd = rx.bytes()[0];
            let wakes = match (cmd, self.state) {
                (_, CardState::NoField) => false,
                (0x52, _) => true,
                (0x26, CardState::Halted) => false,
                (0x26, _) => true,
                _ => false,
            };
            if !wakes {
                return None;
            }
            self.drop_session();
            self.state = CardState::Select(0);
            return Some(self.canned_answer(&self.canned_atqa));
        }
        match self.state {
            CardState::NoField | CardState::Idle | CardState::Halted => None,
            CardState::Select(level) => self.process_select(level, rx),
            CardState::Auth1 => self.process_auth1(rx),
            CardState::Work => self.process_work(rx),
            CardState::WriteBl2(block) => self.process_write_data(block, rx),
            CardState::IntReg(op, block) => self.process_value_data(op, block, rx),
        }
    }

    fn process_select(&mut self, level: usize, rx: &Frame) -> Option<Response> {
        let b = rx.bytes();
        let sel = [0x93, 0x95, 0x97][level];
        if b.len() == 2 && b[0] == sel && b[1] == 0x20 {
            return Some(self.canned_answer(&self.canned_uid[level]));
        }
        if b.len() == 9 && b[0] == sel && b[1] == 0x70 && check_crc_a(b) {
            let uidbcc = self.canned_uid[level].frame.bytes();
            if b[2..7] == *uidbcc {
                return if level + 1 == self.canned_uid.len() {
                    self.state = CardState::Work;
                    Some(self.canned_answer(&self.canned_sak))
                } else {
                    self.state = CardState::Select(level + 1);
                    Some(self.canned_answer(&self.canned_sak_cl))
                };
            }
            // Somebody else's UID.
            self.state = CardState::Idle;
            return None;
        }
        trace_log!("unexpected frame during select: {b:02x?}");
        self.state = CardState::Idle;
        None
    }

    fn start_auth(&mut self, cmd: &[u8]) -> Option<Response> {
        let keytype = cmd[0];
        let block = cmd[1];
        let sector = block / 4;
        if usize::from(block) * 16 + 16 > self.cfg.data.len() {
            return self.nack(CARD_NACK_NA);
        }
        self.auth_attempts += 1;
        if self.cfg.random_nonce {
            self.nonce = rand::random::<u32>();
        }
        let was_authenticated = self.authenticated;
        let mut cs = Crypto1::new(self.key(sector, keytype));
        self.authenticated = false;
        self.cur_sector = sector;
        self.cur_keytype = keytype;
        self.state = CardState::Auth1;
        let resp = if !was_authenticated {
            // First authentication: plain nonce, keystream primed with
            // uid ⊕ nt.
            cs.word(self.cuid() ^ self.nonce, false);
            Frame::new(&self.nonce.to_be_bytes())
        } else {
            // Nested: the new keystream encrypts the nonce while it is
            // being fed.
            let input = self.cuid() ^ self.nonce;
            let mut out = [0u8; 4];
            let mut par = vec![0u8];
            for (i, (ib, nb)) in input
                .to_be_bytes()
                .into_iter()
                .zip(self.nonce.to_be_bytes())
                .enumerate()
            {
                out[i] = cs.byte(ib, false) ^ nb;
                set_parity_bit(&mut par, i, cs.peek_bit() ^ odd_parity8(nb));
            }
            Frame::with_parity(&out, &par)
        };
        self.crypto = Some(cs);
        Self::dynamic(resp)
    }

    fn process_auth1(&mut self, rx: &Frame) -> Option<Response> {
        if rx.len() != 8 {
            self.drop_session();
            self.state = CardState::Idle;
            return None;
        }
        let Some(mut cs) = self.crypto.take() else {
            self.state = CardState::Idle;
            return None;
        };
        let enc = rx.bytes();
        let mut plain = [0u8; 8];
        let mut par_ok = true;
        for i in 0..8 {
            let ks = if i < 4 {
                cs.byte(enc[i], true)
            } else {
                cs.byte(0, false)
            };
            plain[i] = enc[i] ^ ks;
            par_ok &= rx.parity_bit(i) == cs.peek_bit() ^ odd_parity8(plain[i]);
        }
        let nr = u32::from_be_bytes(enc[..4].try_into().unwrap_or([0; 4]));
        let ar = u32::from_be_bytes(enc[4..8].try_into().unwrap_or([0; 4]));

        let (cuid, sector, keytype, nonce) =
            (self.cuid(), self.cur_sector, self.cur_keytype, self.nonce);
        let recorded = self
            .collector
            .as_mut()
            .map(|col| col.record(cuid, sector, keytype, nonce, nr, ar));
        match recorded {
            Some(RecordOutcome::SwitchToMoebius) => {
                self.nonce = if self.cfg.random_nonce {
                    rand::random::<u32>()
                } else {
                    self.nonce.wrapping_mul(7)
                };
                debug!("nonce collector: switching to the second half");
            }
            Some(RecordOutcome::Finished) => info!("nonce collector full"),
            _ => {}
        }

        if !par_ok {
            // A real card stays silent on bad parity.
            trace_log!("auth parity mismatch, staying quiet");
            self.state = CardState::Idle;
            return None;
        }
        let card_rr = u32::from_be_bytes(plain[4..8].try_into().unwrap_or([0; 4]));
        if card_rr != prng_successor(self.nonce, 64) {
            // Wrong secret, valid parity: the 4-bit NACK leak.
            debug!(
                "auth failed for sector {} key {:02x}",
                self.cur_sector, self.cur_keytype
            );
            let nib = cs.encrypt_nibble(CARD_NACK_TR);
            self.state = CardState::Idle;
            return Self::dynamic(Frame::short(nib, 4));
        }
        let at = prng_successor(self.nonce, 96);
        let (cipher, par) = cs.encrypt_frame(&at.to_be_bytes());
        self.crypto = Some(cs);
        self.authenticated = true;
        self.state = CardState::Work;
        Self::dynamic(Frame::with_parity(&cipher, &par))
    }

    /// Decrypt an incoming WORK-state frame under the session, if any.
    /// Returns the plaintext and whether the encrypted parity held.
    fn decrypt_rx(&mut self, rx: &Frame) -> (Vec<u8>, bool) {
        match (self.authenticated, &mut self.crypto) {
            (true, Some(cs)) => cs.decrypt_frame(rx.bytes(), rx.parity()),
            _ => (rx.bytes().to_vec(), true),
        }
    }

    fn valid_block(&self, block: u8) -> bool {
        usize::from(block) * 16 + 16 <= self.cfg.data.len()
    }

    fn allowed(&self, block: u8) -> bool {
        self.authenticated && block / 4 == self.cur_sector
    }

    fn read_block(&mut self, block: u8) -> Option<Response> {
        let off = usize::from(block) * 16;
        let mut out = self.cfg.data[off..off + 16].to_vec();
        append_crc_a(&mut out);
        self.reads += 1;
        match (self.authenticated, &mut self.crypto) {
            (true, Some(cs)) => {
                let (cipher, par) = cs.encrypt_frame(&out);
                Self::dynamic(Frame::with_parity(&cipher, &par))
            }
            _ => Self::dynamic(Frame::new(&out)),
        }
    }

    fn process_work(&mut self, rx: &Frame) -> Option<Response> {
        let (cmd, par_ok) = self.decrypt_rx(rx);
        if !par_ok {
            return self.nack(CARD_NACK_TR);
        }
        if cmd.len() == 4 && (cmd[0] == 0x60 || cmd[0] == 0x61) {
            if !self.cfg.crypto {
                return self.nack(CARD_NACK_NA);
            }
            if !check_crc_a(&cmd) {
                return self.nack(CARD_NACK_TR);
            }
            return self.start_auth(&cmd);
        }
        match (cmd.first().copied(), cmd.len()) {
            (Some(0x30), 4) => {
                // READ
                if !check_crc_a(&cmd) {
                    return self.nack(CARD_NACK_TR);
                }
                let block = cmd[1];
                if !self.valid_block(block) {
                    return self.nack(CARD_NACK_NA);
                }
                match self.cfg.tag_type {
                    TagType::MifareClassic if self.cfg.crypto => {
                        if !self.allowed(block) {
                            return self.nack(CARD_NACK_NA);
                        }
                        self.read_block(block)
                    }
                    TagType::Ultralight | TagType::Tnp3xxx => self.read_block(block),
                    _ => self.nack(CARD_NACK_NA),
                }
            }
            (Some(0xa0), 4) => {
                // WRITE, data part follows
                if !check_crc_a(&cmd) {
                    return self.nack(CARD_NACK_TR);
                }
                let block = cmd[1];
                if !self.valid_block(block) || !self.allowed(block) {
                    return self.nack(CARD_NACK_NA);
                }
                self.state = CardState::WriteBl2(block);
                self.ack()
            }
            (Some(op @ (0xc0 | 0xc1 | 0xc2)), 4) => {
                if !check_crc_a(&cmd) {
                    return self.nack(CARD_NACK_TR);
                }
                let block = cmd[1];
                if !self.valid_block(block) || !self.allowed(block) {
                    return self.nack(CARD_NACK_NA);
                }
                if parse_value_block(self.block(block)).is_none() {
                    return self.nack(CARD_NACK_NA);
                }
                let vop = match op {
                    0xc1 => ValueOp::Inc,
                    0xc0 => ValueOp::Dec,
                    _ => ValueOp::Restore,
                };
                self.state = CardState::IntReg(vop, block);
                self.ack()
            }
            (Some(0xb0), 4) => {
                // TRANSFER: write the internal register back.
                if !check_crc_a(&cmd) {
                    return self.nack(CARD_NACK_TR);
                }
                let block = cmd[1];
                if !self.valid_block(block) || !self.allowed(block) {
                    return self.nack(CARD_NACK_NA);
                }
                let v = make_value_block(self.transfer_reg, block);
                self.block_mut(block).copy_from_slice(&v);
                self.ack()
            }
            (Some(0x50), 4) if cmd[1] == 0x00 && check_crc_a(&cmd) => {
                // HALT
                debug!("halted");
                self.drop_session();
                self.state = CardState::Halted;
                None
            }
            (Some(0xe0), 4) => {
                // RATS: canned ATS echo.
                Self::dynamic(Frame::new(&self.ats.clone()))
            }
            _ => {
                warn!("unhandled command {:02x?}", cmd.first());
                self.nack(CARD_NACK_NA)
            }
        }
    }

    fn process_write_data(&mut self, block: u8, rx: &Frame) -> Option<Response> {
        self.state = CardState::Work;
        let (data, par_ok) = self.decrypt_rx(rx);
        if data.len() != 18 || !par_ok || !check_crc_a(&data) {
            return self.nack(CARD_NACK_TR);
        }
        self.block_mut(block).copy_from_slice(&data[..16]);
        self.ack()
    }

    fn process_value_data(&mut self, op: ValueOp, block: u8, rx: &Frame) -> Option<Response> {
        self.state = CardState::Work;
        let (data, par_ok) = self.decrypt_rx(rx);
        if data.len() != 6 || !par_ok || !check_crc_a(&data) {
            return self.nack(CARD_NACK_TR);
        }
        let operand = i32::from_le_bytes(data[..4].try_into().unwrap_or([0; 4]));
        let Some(value) = parse_value_block(self.block(block)) else {
            return self.nack(CARD_NACK_NA);
        };
        self.transfer_reg = match op {
            ValueOp::Inc => value.wrapping_add(operand),
            ValueOp::Dec => value.wrapping_sub(operand),
            ValueOp::Restore => value,
        };
        // The data part of a value operation is not acknowledged.
        None
    }

    fn block(&self, block: u8) -> &[u8] {
        let off = usize::from(block) * 16;
        &self.cfg.data[off..off + 16]
    }

    fn block_mut(&mut self, block: u8) -> &mut [u8] {
        let off = usize::from(block) * 16;
        &mut self.cfg.data[off..off + 16]
    }

    fn exit_reason(&self) -> Option<ExitReason> {
        if self.cfg.exit_after_reads > 0 && self.reads >= u32::from(self.cfg.exit_after_reads) {
            return Some(ExitReason::ReadsExhausted);
        }
        if self.collector.as_ref().is_some_and(|c| c.finished) {
            return Some(ExitReason::AttackComplete);
        }
        None
    }

    fn outcome(&self, reason: ExitReason) -> EmOutcome {
        EmOutcome {
            reason,
            reads: self.reads,
            collector: self.collector.clone(),
        }
    }

    /// Run the emulation loop against a fabric until the button, the
    /// read budget, or a finished nonce harvest ends it.
    pub fn run<F: Fabric>(
        &mut self,
        fabric: &mut F,
        trace: &mut TraceLog,
        timings: &Timings,
    ) -> Result<EmOutcome> {
        fabric.set_mode(FabricMode::TagListening);
        fabric.led(Led::A, true);
        self.state = CardState::NoField;
        let mut miller = MillerDecoder::new();
        let mut dynamic = Arena::new("dynamic modulation", DYNAMIC_MODULATION_CAP);
        let mut adc_sum: u32 = 0;
        let mut adc_cnt: u32 = 0;
        let mut field_low_since: Option<u32> = None;

        let reason = loop {
            fabric.kick_watchdog();
            if fabric.button_pressed() {
                break ExitReason::Cancelled;
            }

            // Field strength, averaged over 32 samples.
            adc_sum += u32::from(fabric.field_adc());
            adc_cnt += 1;
            if adc_cnt >= 32 {
                let avg = adc_sum / adc_cnt;
                adc_sum = 0;
                adc_cnt = 0;
                let now = fabric.tick();
                if avg < u32::from(self.cfg.field_threshold) {
                    match field_low_since {
                        None => field_low_since = Some(now),
                        Some(t0) if now.wrapping_sub(t0) > FIELD_OFF_TICKS => {
                            if self.state != CardState::NoField {
                                debug!("field lost");
                                self.field_lost();
                                miller.reset();
                            }
                        }
                        Some(_) => {}
                    }
                } else {
                    field_low_since = None;
                    self.field_restored();
                }
            }
            if self.state == CardState::NoField || !fabric.rx_ready() {
                continue;
            }

            let b = fabric.rx();
            let tick = fabric.tick();
            if !miller.feed(b, tick) {
                continue;
            }
            let rx = miller.take();
            let d = timings.air2arm_as_tag / 16;
            trace.log(
                Direction::ReaderToTag,
                rx.start.wrapping_sub(d),
                rx.end.wrapping_sub(d),
                &rx,
            );
            // A trailing 1 parity bit from the reader puts our answer in
            // the long frame-delay slot.
            let correction_needed = rx.last_parity_bit() == 1;
            if let Some(resp) = self.process(&rx) {
                fabric.led(Led::B, true);
                let enc = match &resp.modulation {
                    Modulation::Canned(r) => Encoded {
                        symbols: self.arena.get(r).to_vec(),
                        duration: self.canned_duration(r),
                    },
                    Modulation::Dynamic => {
                        dynamic.reset();
                        let e = encode_response(&resp.frame);
                        dynamic.alloc(&e.symbols)?;
                        e
                    }
                };
                let start = em_transmit(fabric, &enc, correction_needed);
                let d = (timings.arm2air_as_tag + 2 * fabric.send_queue_delay()) / 16;
                trace.log(
                    Direction::TagToReader,
                    start.wrapping_add(d),
                    start.wrapping_add(d).wrapping_add(enc.duration),
                    &resp.frame,
                );
                fabric.led(Led::B, false);
            }
            if let Some(r) = self.exit_reason() {
                break r;
            }
        };
        fabric.set_mode(FabricMode::Off);
        fabric.leds_off();
        Ok(self.outcome(reason))
    }

    fn canned_duration(&self, r: &Range<usize>) -> u32 {
        for c in std::iter::once(&self.canned_atqa)
            .chain(self.canned_uid.iter())
            .chain([&self.canned_sak_cl, &self.canned_sak])
        {
            if c.range == *r {
                return c.duration;
            }
        }
        8 * (r.end - r.start) as u32
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        info!(
            "emulator: {} reads, {} auth attempts, {} nonce pairs",
            self.reads,
            self.auth_attempts,
            self.collector
                .as_ref()
                .map_or(0, |c| c.slots.iter().filter(|s| s.collected == 2).count())
        );
    }
}

/// Encode a tag answer, picking the 4-bit coder for nibble frames.
#[must_use]
pub fn encode_response(frame: &Frame) -> Encoded {
    if frame.bits() == 4 {
        tag_encoder::encode_nibble(frame.bytes()[0])
    } else {
        tag_encoder::encode(frame)
    }
}

fn uid_fragment(uid: &[u8], level: usize, cascades: usize) -> Vec<u8> {
    if level + 1 == cascades {
        uid[level * 3..level * 3 + 4].to_vec()
    } else {
        let mut v = vec![0x88];
        v.extend_from_slice(&uid[level * 3..level * 3 + 3]);
        v
    }
}

/// Parse a MIFARE value block: value, ~value, value, addr pattern.
#[must_use]
pub fn parse_value_block(b: &[u8]) -> Option<i32> {
    if b.len() < 16 {
        return None;
    }
    let v = i32::from_le_bytes(b[..4].try_into().ok()?);
    let vi = i32::from_le_bytes(b[4..8].try_into().ok()?);
    let v2 = i32::from_le_bytes(b[8..12].try_into().ok()?);
    if v != v2 || v != !vi {
        return None;
    }
    if b[12] != !b[13] || b[12] != b[14] || b[13] != b[15] {
        return None;
    }
    Some(v)
}

/// Build a MIFARE value block.
#[must_use]
pub fn make_value_block(value: i32, addr: u8) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..4].copy_from_slice(&value.to_le_bytes());
    out[4..8].copy_from_slice(&(!value).to_le_bytes());
    out[8..12].copy_from_slice(&value.to_le_bytes());
    out[12] = addr;
    out[13] = !addr;
    out[14] = addr;
    out[15] = !addr;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mifare_emulator(uid: &[u8]) -> Emulator {
        Emulator::new(EmulatorConfig {
            uid: uid.to_vec(),
            crypto: true,
            data: blank_1k(uid),
            ..EmulatorConfig::default()
        })
        .unwrap()
    }

    fn select_4b(em: &mut Emulator, uid: &[u8; 4]) {
        assert!(em.process(&Frame::short(0x26, 7)).is_some());
        let mut sel = vec![0x93, 0x70];
        sel.extend_from_slice(uid);
        sel.push(uid.iter().fold(0, |a, b| a ^ b));
        append_crc_a(&mut sel);
        let sak = em.process(&Frame::new(&sel)).expect("SAK");
        assert_eq!(sak.frame.bytes()[0], 0x08);
    }

    #[test]
    fn wakeup_and_cascade1() {
        let uid = [0xde, 0xad, 0xbe, 0xaf];
        let mut em = mifare_emulator(&uid);
        let atqa = em.process(&Frame::short(0x26, 7)).expect("ATQA");
        assert_eq!(atqa.frame.bytes(), &[0x04, 0x00]);
        let all = em.process(&Frame::new(&[0x93, 0x20])).expect("UIDBCC");
        assert_eq!(all.frame.bytes(), &[0xde, 0xad, 0xbe, 0xaf, 0x62]);
    }

    #[test]
    fn seven_byte_uid_two_cascades() {
        let uid = [0x04, 0x51, 0xf1, 0xa2, 0xb3, 0xc4, 0xd5];
        let mut em = Emulator::new(EmulatorConfig {
            uid: uid.to_vec(),
            ..EmulatorConfig::default()
        })
        .unwrap();
        assert_eq!(em.atqa(), [0x44, 0x00]);
        let atqa = em.process(&Frame::short(0x52, 7)).expect("ATQA");
        assert_eq!(atqa.frame.bytes(), &[0x44, 0x00]);

        let cl1 = em.process(&Frame::new(&[0x93, 0x20])).expect("CL1");
        let frag = cl1.frame.bytes().to_vec();
        assert_eq!(&frag[..4], &[0x88, 0x04, 0x51, 0xf1]);

        let mut sel = vec![0x93, 0x70];
        sel.extend_from_slice(&frag);
        append_crc_a(&mut sel);
        let sak1 = em.process(&Frame::new(&sel)).expect("cascade SAK");
        assert_eq!(sak1.frame.bytes()[0], 0x04);

        let cl2 = em.process(&Frame::new(&[0x95, 0x20])).expect("CL2");
        assert_eq!(&cl2.frame.bytes()[..4], &[0xa2, 0xb3, 0xc4, 0xd5]);

        let mut sel2 = vec![0x95, 0x70];
        sel2.extend_from_slice(cl2.frame.bytes());
        append_crc_a(&mut sel2);
        let sak = em.process(&Frame::new(&sel2)).expect("final SAK");
        assert_eq!(sak.frame.bytes()[0], 0x08);
    }

    #[test]
    fn reqa_ignored_while_halted() {
        let uid = [0xde, 0xad, 0xbe, 0xaf];
        let mut em = mifare_emulator(&uid);
        select_4b(&mut em, &uid);
        let mut halt = vec![0x50, 0x00];
        append_crc_a(&mut halt);
        assert!(em.process(&Frame::new(&halt)).is_none());
        assert!(em.process(&Frame::short(0x26, 7)).is_none());
        // WUPA still works.
        assert!(em.process(&Frame::short(0x52, 7)).is_some());
    }

    #[test]
    fn double_reqa_answers_twice_without_session() {
        let uid = [0xde, 0xad, 0xbe, 0xaf];
        let mut em = mifare_emulator(&uid);
        assert!(em.process(&Frame::short(0x26, 7)).is_some());
        assert!(em.process(&Frame::short(0x26, 7)).is_some());
        assert!(em.crypto.is_none());
    }

    #[test]
    fn unauthenticated_read_is_refused() {
        let uid = [0xde, 0xad, 0xbe, 0xaf];
        let mut em = mifare_emulator(&uid);
        select_4b(&mut em, &uid);
        let mut read = vec![0x30, 0x00];
        append_crc_a(&mut read);
        let r = em.process(&Frame::new(&read)).expect("NACK");
        assert_eq!(r.frame.bits(), 4);
        assert_eq!(r.frame.bytes()[0], CARD_NACK_NA);
    }

    #[test]
    fn value_block_roundtrip() {
        let b = make_value_block(-1234, 6);
        assert_eq!(parse_value_block(&b), Some(-1234));
        let mut bad = b;
        bad[5] ^= 1;
        assert_eq!(parse_value_block(&bad), None);
    }

    #[test]
    fn run_loop_answers_reqa() -> Result<()> {
        let uid = [0xde, 0xad, 0xbe, 0xaf];
        let mut em = mifare_emulator(&uid);
        let mut fabric = crate::sim::SimFabric::new();
        let enc = crate::reader_encoder::encode_bits(&[0x26], 7, None, true);
        fabric.queue_rx(&crate::sim::reader_channel(&enc.symbols));
        fabric.press_button_when_idle();
        let mut trace = TraceLog::default();
        let out = em.run(&mut fabric, &mut trace, &Timings::default())?;
        assert_eq!(out.reason, ExitReason::Cancelled);

        // The ATQA went out as tag modulation and decodes back.
        assert!(!fabric.sent.is_empty());
        let air = crate::sim::tag_channel(&fabric.sent);
        let mut dec = crate::manchester::ManchesterDecoder::new();
        let (f, _) = crate::sim::feed_manchester(&mut dec, &air, 0).expect("ATQA on the air");
        assert_eq!(f.bytes(), &[0x04, 0x00]);

        // Both frames traced, reader request first.
        let recs = trace.records()?;
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].dir, Direction::ReaderToTag);
        assert_eq!(recs[0].bytes, vec![0x26]);
        assert_eq!(recs[1].dir, Direction::TagToReader);
        Ok(())
    }

    #[test]
    fn collector_halves_and_moebius() {
        let mut c = NonceCollector::new();
        let nt = 0x0102_0304;
        assert_eq!(
            c.record(1, 0, 0x60, nt, 0x11, 0x22),
            RecordOutcome::Recorded
        );
        // Duplicate attempt ignored.
        assert_eq!(c.record(1, 0, 0x60, nt, 0x11, 0x22), RecordOutcome::Ignored);
        assert_eq!(
            c.record(1, 0, 0x60, nt, 0x33, 0x44),
            RecordOutcome::SwitchToMoebius
        );
        assert!(c.moebius);
        let nt2 = nt.wrapping_mul(7);
        assert_eq!(
            c.record(1, 0, 0x60, nt2, 0x55, 0x66),
            RecordOutcome::Recorded
        );
        assert_eq!(
            c.record(1, 0, 0x60, nt2, 0x77, 0x88),
            RecordOutcome::Finished
        );
        assert!(c.finished);
        assert_eq!(c.slots[0].nr, 0x11);
        assert_eq!(c.slots[0].nr2, 0x33);
        assert_eq!(c.slots[ATTACK_KEY_COUNT].nt, nt2);
        assert_eq!(c.slots[ATTACK_KEY_COUNT].ar2, 0x88);
    }
}
