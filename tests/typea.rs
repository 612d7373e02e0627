//! End-to-end selection scenarios: a software reader against the
//! emulator, every frame passing through the real codecs and channel
//! models in both directions.

use anyhow::Result;

use proxa::emulator::{Emulator, EmulatorConfig, TagType, blank_1k};
use proxa::reader::select_card;
use proxa::sim::SimTransceiver;
use proxa::transceiver::Transceive;
use proxa::{Error, Frame};

fn mifare_1k(uid: &[u8]) -> Emulator {
    Emulator::new(EmulatorConfig {
        uid: uid.to_vec(),
        crypto: true,
        data: blank_1k(uid),
        ..EmulatorConfig::default()
    })
    .expect("emulator")
}

#[test]
fn select_4b_uid() -> Result<()> {
    let uid = [0xde, 0xad, 0xbe, 0xaf];
    let mut air = SimTransceiver::new(mifare_1k(&uid));
    let card = select_card(&mut air, None)?;
    assert_eq!(card.uid, uid);
    assert_eq!(card.atqa, [0x04, 0x00]);
    assert_eq!(card.sak, 0x08);
    assert!(card.ats.is_empty(), "no RATS for a non-14443-4 SAK");
    assert_eq!(card.cuid(), 0xdead_beaf);
    Ok(())
}

#[test]
fn select_7b_uid_two_cascades() -> Result<()> {
    let uid = [0x04, 0x51, 0xf1, 0xa2, 0xb3, 0xc4, 0xd5];
    let em = Emulator::new(EmulatorConfig {
        uid: uid.to_vec(),
        ..EmulatorConfig::default()
    })?;
    assert_eq!(em.atqa(), [0x44, 0x00]);
    let mut air = SimTransceiver::new(em);
    let card = select_card(&mut air, None)?;
    assert_eq!(card.atqa, [0x44, 0x00]);
    assert_eq!(card.uid, uid);
    assert_eq!(card.sak, 0x08);
    Ok(())
}

#[test]
fn select_10b_uid_three_cascades() -> Result<()> {
    let uid = [0x04, 0x51, 0xf1, 0xa2, 0xb3, 0xc4, 0xd5, 0xe6, 0xf7, 0x08];
    let em = Emulator::new(EmulatorConfig {
        uid: uid.to_vec(),
        ..EmulatorConfig::default()
    })?;
    assert_eq!(em.atqa(), [0x84, 0x00]);
    let mut air = SimTransceiver::new(em);
    let card = select_card(&mut air, None)?;
    assert_eq!(card.uid, uid);
    Ok(())
}

#[test]
fn known_uid_reselect_skips_anticollision() -> Result<()> {
    let uid = [0xde, 0xad, 0xbe, 0xaf];
    let mut air = SimTransceiver::new(mifare_1k(&uid));
    let first = select_card(&mut air, None)?;
    let again = select_card(&mut air, Some(&first.uid))?;
    assert_eq!(again.uid, first.uid);
    Ok(())
}

#[test]
fn desfire_gets_rats_and_fwt_update() -> Result<()> {
    let uid = [0x04, 0x51, 0xf1, 0xa2, 0xb3, 0xc4, 0xd5];
    let em = Emulator::new(EmulatorConfig {
        tag_type: TagType::Desfire,
        uid: uid.to_vec(),
        ..EmulatorConfig::default()
    })?;
    let mut air = SimTransceiver::new(em);
    let card = select_card(&mut air, None)?;
    assert_eq!(card.sak, 0x20);
    assert!(!card.ats.is_empty());
    // TB(1) carries FWI 7: 256·16·2⁷ carrier cycles in ticks.
    assert_eq!(air.timeout(), 4096);
    Ok(())
}

#[test]
fn halted_card_needs_wupa() -> Result<()> {
    let uid = [0xde, 0xad, 0xbe, 0xaf];
    let mut air = SimTransceiver::new(mifare_1k(&uid));
    select_card(&mut air, None)?;
    // HALT, no answer expected.
    let mut halt = vec![0x50, 0x00];
    proxa::crc::append_crc_a(&mut halt);
    assert_eq!(
        air.transceive(&Frame::new(&halt), Default::default()).err(),
        Some(Error::Timeout)
    );
    // A fresh select still works: WUPA wakes the halted card.
    let card = select_card(&mut air, None)?;
    assert_eq!(card.uid, uid);
    Ok(())
}

#[test]
fn field_loss_resets_to_idle() -> Result<()> {
    let uid = [0xde, 0xad, 0xbe, 0xaf];
    let mut air = SimTransceiver::new(mifare_1k(&uid));
    select_card(&mut air, None)?;
    air.emulator.field_lost();
    // Card is dark while the field is down.
    assert_eq!(select_card(&mut air, None).err(), Some(Error::Timeout));
    air.emulator.field_restored();
    let card = select_card(&mut air, None)?;
    assert_eq!(card.uid, uid);
    Ok(())
}
