mod common;

use std::error::Error as _;
use std::thread;

use nfcard::apdu::SelectMode;
use nfcard::nfc::{ConnectMode, TransportError};
use nfcard::{
    AccessBits, Card, CardFamily, CardOptions, Code, ErrorKind, KeyType, Padding,
    SectorDiscovery, TrailerBlock, WriteMode, DEFAULT_KEYS,
};

use common::{assert_no_interleaving, ins, key, key_type_of, SimCard, UID};

fn connected(sim: &SimCard) -> Card<&SimCard> {
    let card = Card::new(sim, CardFamily::MifareClassic1K);
    card.connect(ConnectMode::Card).unwrap();
    card
}

#[test]
fn test_connect_fetches_uid() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);

    assert_eq!(Some(UID.to_vec()), card.uid());

    card.disconnect().unwrap();
    let error = card.disconnect().unwrap_err();
    assert_eq!(ErrorKind::Disconnect, error.kind());
    assert_eq!(Code::CardNotConnected, error.code());
}

#[test]
fn test_connect_with_unknown_mode() {
    let sim = SimCard::mifare_1k();
    let card = Card::new(&sim, CardFamily::MifareClassic1K);

    let error = card.session().connect_named("exclusive").unwrap_err();
    assert_eq!(ErrorKind::Connect, error.kind());
    assert_eq!(Code::CardNotConnected, error.code());
}

#[test]
fn test_card_info() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();

    let info = card.card_info().unwrap();

    assert_eq!(UID, info.uid);
    assert_eq!(0x08, info.sak);
    assert!(info.is_bcc_valid());
}

#[test]
fn test_round_trip() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();

    let data = (0..144).map(|i| i as u8).collect::<Vec<_>>();
    card.write_data_with(&data, 1, None, Padding::None, WriteMode::Write)
        .unwrap();

    assert_eq!(data, card.read_data(1, Some(3), None).unwrap());
    for sector in 1..=3 {
        let trailer = sim.block(sector * 4 + 3);
        assert_eq!(AccessBits::TRANSPORT.bytes(), trailer[6..10]);
    }
}

#[test]
fn test_write_data_skips_reserved_blocks() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();

    let manufacturer = sim.block(0);
    let data = vec![0x5A; 80];
    card.write_data(&data, 0, None).unwrap();

    assert_eq!(manufacturer, sim.block(0));
    for block in [1, 2, 4, 5, 6] {
        assert_eq!([0x5A; 16], sim.block(block), "block {}", block);
    }
    assert_eq!(DEFAULT_KEYS[0].as_bytes()[..], sim.block(3)[..6]);
    assert_eq!(DEFAULT_KEYS[0].as_bytes()[..], sim.block(7)[10..]);
}

#[test]
fn test_padding() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();
    let data = [0xAB; 20];

    sim.clear_log();
    card.write_sector_with(2, &data, None, Padding::Block, WriteMode::Write)
        .unwrap();
    assert_eq!(2, sim.count(ins::WRITE_BINARY));
    assert_eq!(
        [&[0xAB; 4][..], &[0; 12][..]].concat(),
        sim.block(9).to_vec()
    );

    sim.clear_log();
    card.write_sector_with(2, &data, None, Padding::SectorData, WriteMode::Update)
        .unwrap();
    assert_eq!(3, sim.count(ins::UPDATE_BINARY));

    sim.clear_log();
    let error = card
        .write_sector_with(2, &data, None, Padding::None, WriteMode::Write)
        .unwrap_err();
    assert_eq!(Code::InvalidDataSize, error.code());
    assert!(sim.log().is_empty());
}

#[test]
fn test_write_beyond_capacity() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();

    sim.clear_log();
    let error = card.write_data(&[0; 721], 1, None).unwrap_err();

    assert_eq!(ErrorKind::Write, error.kind());
    assert_eq!(Code::InvalidDataSize, error.code());
    assert!(sim.log().is_empty());
}

#[test]
fn test_read_sectors_range() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_all_keys(None, Some(DEFAULT_KEYS[0])).unwrap();

    let sectors = card.read_sectors(13, None, None).unwrap();
    assert_eq!(
        vec![13, 14, 15],
        sectors.iter().map(|s| s.sector()).collect::<Vec<_>>()
    );

    let error = card.read_sectors(5, Some(3), None).unwrap_err();
    assert_eq!(Code::InvalidSector, error.code());
}

#[test]
fn test_read_large_sector() {
    let sim = SimCard::new(CardFamily::MifareClassic4K);
    let card = Card::new(&sim, CardFamily::MifareClassic4K);
    card.connect(ConnectMode::Card).unwrap();
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();

    let sector = card.read_sector(39, None).unwrap();

    assert_eq!(240, sector.start_block());
    assert_eq!(256, sector.raw().len());
    assert_eq!(240, sector.data().len());
    assert_eq!(16, sim.count(ins::READ_BINARY));
    assert_eq!(
        Some(AccessBits::TRANSPORT),
        card.sector_keys(39).unwrap().access
    );
}

#[test]
fn test_explicit_credential() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);

    let error = card.read_sector(2, None).unwrap_err();
    assert_eq!(Code::InvalidKeyOrKeyType, error.code());

    let sector = card
        .read_sector(2, Some((KeyType::B, DEFAULT_KEYS[0])))
        .unwrap();
    assert_eq!(2, sector.sector());
}

#[test]
fn test_key_resolved_from_access_bits() {
    let sim = SimCard::mifare_1k();
    let access = AccessBits::from_codes([0b001, 0b001, 0b001, 0b100], 0x69);
    sim.set_trailer(4, key(0x0A), access, key(0x0B));

    let card = connected(&sim);
    card.set_keys(Some(key(0x0A)), Some(key(0x0B)), 4).unwrap();
    card.read_sector(4, None).unwrap();
    assert_eq!(Some(access), card.sector_keys(4).unwrap().access);

    sim.clear_log();
    card.write_sector(4, &[0x01; 48], None).unwrap();

    let key_types = sim.log().iter().filter_map(key_type_of).collect::<Vec<_>>();
    assert_eq!(vec![KeyType::B], key_types);
    assert_eq!([0x01; 16], sim.block(16));
}

#[test]
fn test_access_denied_without_permitted_key() {
    let sim = SimCard::mifare_1k();
    let access = AccessBits::from_codes([0b001, 0b001, 0b001, 0b100], 0x69);
    sim.set_trailer(4, key(0x0A), access, key(0x0B));

    let card = connected(&sim);
    card.set_key(KeyType::A, key(0x0A), 4).unwrap();
    card.read_sector(4, None).unwrap();

    sim.clear_log();
    let error = card.write_sector(4, &[0x01; 48], None).unwrap_err();

    assert_eq!(ErrorKind::Access, error.kind());
    assert_eq!(Code::AccessDenied, error.code());
    assert!(sim.log().is_empty());
}

#[test]
fn test_write_trailer() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();

    let trailer = TrailerBlock::new(key(0x66), AccessBits::TRANSPORT, key(0x67));
    card.write_trailer(6, &trailer, None).unwrap();

    let keys = card.sector_keys(6).unwrap();
    assert_eq!(Some(key(0x66)), keys.key_a);
    assert_eq!(Some(key(0x67)), keys.key_b);
    assert_eq!(trailer.to_bytes(), sim.block(27));

    card.read_sector(6, None).unwrap();

    let broken = TrailerBlock::new(key(0x66), AccessBits::new([0xFF; 4]), key(0x67));
    sim.clear_log();
    assert!(card.write_trailer(6, &broken, None).is_err());
    assert!(sim.log().is_empty());
}

#[test]
fn test_legacy_authenticate() {
    let sim = SimCard::mifare_1k();
    let options = CardOptions {
        legacy_auth: true,
        ..Default::default()
    };
    let card = Card::with_options(&sim, CardFamily::MifareClassic1K, options);
    card.connect(ConnectMode::Card).unwrap();
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();

    card.read_sector(1, None).unwrap();

    assert_eq!(1, sim.count(ins::AUTHENTICATE_OLD));
    assert_eq!(0, sim.count(ins::AUTHENTICATE));
}

#[test]
fn test_no_interleaving_across_threads() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);

    for sector in 1..=4 {
        sim.set_trailer(sector, key(sector), AccessBits::TRANSPORT, key(sector));
        card.set_keys(Some(key(sector)), Some(key(sector)), sector)
            .unwrap();
    }

    let card = &card;
    thread::scope(|s| {
        for sector in 1..=4 {
            s.spawn(move || {
                for _ in 0..5 {
                    card.read_sector(sector, None).unwrap();
                    card.write_sector(sector, &[sector; 48], None).unwrap();
                }
            });
        }
    });

    assert_no_interleaving(&sim.log());
    for sector in 1..=4 {
        assert_eq!([sector; 16], sim.block(sector * 4));
    }
}

#[test]
fn test_single_load_for_concurrent_callers() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();

    let card = &card;
    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(move || card.read_sector(1, None).unwrap());
        }
    });

    assert_eq!(1, sim.loads_of(DEFAULT_KEYS[0]));
    assert_eq!(8, sim.count(ins::AUTHENTICATE));
}

#[test]
fn test_transport_fault_is_classified() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();

    sim.fail_on(ins::READ_BINARY);
    let error = card.read_sector(1, None).unwrap_err();

    assert_eq!(ErrorKind::Transmit, error.kind());
    assert_eq!(Code::Failure, error.code());
    assert!(matches!(
        error.source().and_then(|e| e.downcast_ref::<TransportError>()),
        Some(TransportError::Reader(_)),
    ));

    card.read_sector(1, None).unwrap();
}

#[test]
fn test_wrong_key_is_verify_failed() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_key(KeyType::A, key(0x42), 1).unwrap();

    let error = card.read_sector(1, None).unwrap_err();

    assert!(error.is_verify_failed());
    assert_eq!(ErrorKind::Authentication, error.kind());
    assert_eq!(Code::VerifyFailed, error.code());
}

#[test]
fn test_select_unknown_application() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);

    let error = card
        .select(&[0xD2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01], SelectMode::Name)
        .unwrap_err();
    assert_eq!(Code::OperationFailed, error.code());

    assert_eq!(vec![0x01, 0x90, 0x00], card.control(&[0x01], 16).unwrap());
}

#[test]
fn test_card_leaving_the_field() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();
    card.read_sector(1, None).unwrap();

    sim.remove();
    let error = card.read_sector(1, None).unwrap_err();
    assert_eq!(ErrorKind::Transmit, error.kind());
    assert_eq!(Code::Failure, error.code());
    assert!(matches!(
        error.source().and_then(|e| e.downcast_ref::<TransportError>()),
        Some(TransportError::CardRemoved),
    ));

    let error = card.read_sector(1, None).unwrap_err();
    assert_eq!(Code::CardNotConnected, error.code());
}

#[test]
fn test_card_removed() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();
    card.read_sector(1, None).unwrap();

    card.card_removed();

    assert_eq!(None, card.uid());
    assert_eq!([None, None], card.slots().resident());

    sim.clear_log();
    let error = card.read_sector(1, None).unwrap_err();
    assert_eq!(Code::CardNotConnected, error.code());
    assert!(sim.log().is_empty());
}

#[test]
fn test_try_get_keys() {
    let sim = SimCard::mifare_1k();
    sim.set_trailer(5, key(3), AccessBits::TRANSPORT, key(1));
    let card = connected(&sim);

    let candidates = [key(1), key(2), key(3), key(4)];
    sim.clear_log();

    let keys = card.try_get_keys(&candidates, 5).unwrap().unwrap();

    assert_eq!(Some(key(3)), keys.key_a);
    assert_eq!(Some(key(1)), keys.key_b);
    assert!(sim.count(ins::AUTHENTICATE) <= 2 * candidates.len());

    let known = card.sector_keys(5).unwrap();
    assert_eq!(Some(key(3)), known.key_a);
    assert_eq!(Some(key(1)), known.key_b);
    assert_eq!(Some(AccessBits::TRANSPORT), known.access);
}

#[test]
fn test_try_get_keys_not_found() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);

    assert_eq!(None, card.try_get_keys(&[key(7), key(8)], 6).unwrap());
    assert_eq!(None, card.sector_keys(6).unwrap().key_a);
}

#[test]
fn test_try_get_keys_aborts_on_transport_fault() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);

    sim.fail_on(ins::AUTHENTICATE);
    let error = card.try_get_keys(&DEFAULT_KEYS, 1).unwrap_err();

    assert_eq!(ErrorKind::Transmit, error.kind());
}

#[test]
fn test_try_get_all_keys_promotes_found_keys() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);

    let candidates = [key(1), key(2), key(3), DEFAULT_KEYS[0]];
    sim.clear_log();

    let results = card.try_get_all_keys(&candidates);

    assert_eq!(16, results.len());
    assert!(results.values().all(|r| matches!(
        r,
        SectorDiscovery::Found(keys) if keys.key_a == Some(DEFAULT_KEYS[0]) && keys.key_b == Some(DEFAULT_KEYS[0])
    )));

    // Sector 0 goes through the list for both keys, later sectors find them first.
    assert_eq!(4 + 4 + 1 + 15 * 3, sim.count(ins::AUTHENTICATE));
    assert_eq!(16, card.known_keys().values().filter(|k| k.access.is_some()).count());
}

#[test]
fn test_try_get_all_keys_records_failures() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);

    sim.remove();
    let results = card.try_get_all_keys(&DEFAULT_KEYS);

    assert_eq!(16, results.len());
    assert!(results
        .values()
        .all(|r| matches!(r, SectorDiscovery::Failed(_))));
}

#[test]
fn test_block_range_past_the_card() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();
    sim.clear_log();

    for (block, len) in [(0, 65536 * 16), (255, 65535 * 16), (60, 5 * 16)] {
        let error = card.read_blocks(block, len, None).unwrap_err();
        assert_eq!(ErrorKind::Sector, error.kind());
        assert_eq!(Code::InvalidSector, error.code());
    }

    let error = card
        .write_blocks(0, &vec![0; 1 << 20], None, WriteMode::Write)
        .unwrap_err();
    assert_eq!(ErrorKind::Write, error.kind());
    assert_eq!(Code::InvalidDataSize, error.code());

    assert!(sim.log().is_empty());
    assert_eq!(64, card.read_blocks(60, 4 * 16, None).unwrap().len());
}

#[test]
fn test_long_read_reply_is_invalid_response() {
    let sim = SimCard::mifare_1k();
    let card = connected(&sim);
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();

    sim.answer_long_reads();
    let error = card.read_sector(1, None).unwrap_err();

    assert_eq!(ErrorKind::Read, error.kind());
    assert_eq!(Code::InvalidResponse, error.code());
}

#[test]
fn test_round_trip_without_trailers() {
    let family = CardFamily::Iso14443_3A;
    let sim = SimCard::new(family);
    let card = Card::new(&sim, family);
    card.connect(ConnectMode::Card).unwrap();
    card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();

    let data = (0..128).map(|i| i as u8).collect::<Vec<_>>();
    card.write_data_with(&data, 0, None, Padding::None, WriteMode::Write)
        .unwrap();

    assert_eq!(data[..16], sim.block(0));
    assert_eq!(data, card.read_data(0, Some(1), None).unwrap());

    let sector = card.read_sector(1, None).unwrap();
    assert_eq!(None, sector.trailer());
    assert_eq!(None, card.sector_keys(1).unwrap().access);
    assert_eq!(8, sim.count(ins::WRITE_BINARY));
}
