//! An in-memory Mifare Classic card behind a PC/SC part 3 reader.

#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use nfcard::nfc::{ConnectMode, Protocol, Transport, TransportError};
use nfcard::{AccessBits, CardFamily, Key, KeyType, DEFAULT_KEYS};

pub const UID: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

pub mod ins {
    pub const GET_DATA: u8 = 0xCA;
    pub const READ_BINARY: u8 = 0xB0;
    pub const WRITE_BINARY: u8 = 0xD0;
    pub const UPDATE_BINARY: u8 = 0xD6;
    pub const LOAD_KEY: u8 = 0x82;
    pub const AUTHENTICATE: u8 = 0x86;
    pub const AUTHENTICATE_OLD: u8 = 0x88;
    pub const SELECT: u8 = 0xA4;
}

const SW_SUCCESS: [u8; 2] = [0x90, 0x00];
const SW_VERIFY_FAILED: [u8; 2] = [0x63, 0x00];
const SW_NOT_ALLOWED: [u8; 2] = [0x69, 0x82];
const SW_FILE_NOT_FOUND: [u8; 2] = [0x6A, 0x82];
const SW_WRONG_PARAMETERS: [u8; 2] = [0x6B, 0x00];
const SW_INS_NOT_SUPPORTED: [u8; 2] = [0x6D, 0x00];

/// A command received by the card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub ins: u8,
    pub thread: ThreadId,
    pub tx: Vec<u8>,
}

struct State {
    family: CardFamily,
    blocks: Vec<[u8; 16]>,
    slots: [Option<[u8; 6]>; 2],
    authenticated: Option<u8>,
    connected: bool,
    removed: bool,
    fail_on: Option<u8>,
    long_reads: bool,
    log: Vec<Entry>,
}

pub struct SimCard {
    state: Mutex<State>,
    latency: Duration,
}

impl SimCard {
    /// A blank card: every sector uses the transport configuration with `FFFFFFFFFFFF`.
    /// Cards without trailers accept any key.
    pub fn new(family: CardFamily) -> Self {
        let total_blocks = (0..family.total_sectors())
            .map(|s| family.blocks_in_sector(s) as usize)
            .sum();

        let mut blocks = vec![[0u8; 16]; total_blocks];
        blocks[0][..4].copy_from_slice(&UID);
        blocks[0][4] = UID.iter().fold(0, |acc, b| acc ^ b);
        blocks[0][5] = 0x08;
        blocks[0][6..8].copy_from_slice(&[0x04, 0x00]);

        let card = Self {
            state: Mutex::new(State {
                family,
                blocks,
                slots: [None; 2],
                authenticated: None,
                connected: false,
                removed: false,
                fail_on: None,
                long_reads: false,
                log: Vec::new(),
            }),
            latency: Duration::from_micros(200),
        };

        for sector in (0..family.total_sectors()).filter(|_| family.has_trailer()) {
            card.set_trailer(sector, DEFAULT_KEYS[0], AccessBits::TRANSPORT, DEFAULT_KEYS[0]);
        }

        card
    }

    pub fn mifare_1k() -> Self {
        Self::new(CardFamily::MifareClassic1K)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn set_trailer(&self, sector: u8, key_a: Key, access: AccessBits, key_b: Key) {
        let mut state = self.state();
        let block = state.family.trailer_block(sector).unwrap() as usize;

        let trailer = &mut state.blocks[block];
        trailer[..6].copy_from_slice(key_a.as_bytes());
        trailer[6..10].copy_from_slice(&access.bytes());
        trailer[10..].copy_from_slice(key_b.as_bytes());
    }

    pub fn block(&self, block: u8) -> [u8; 16] {
        self.state().blocks[block as usize]
    }

    /// Makes the next command with the instruction fail on the transport.
    pub fn fail_on(&self, ins: u8) {
        self.state().fail_on = Some(ins);
    }

    /// Makes every read answer one octet more than requested.
    pub fn answer_long_reads(&self) {
        self.state().long_reads = true;
    }

    /// Takes the card out of the field.
    pub fn remove(&self) {
        self.state().removed = true;
    }

    pub fn log(&self) -> Vec<Entry> {
        self.state().log.clone()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    pub fn count(&self, ins: u8) -> usize {
        self.state().log.iter().filter(|e| e.ins == ins).count()
    }

    /// Number of times the key was loaded into a slot.
    pub fn loads_of(&self, key: Key) -> usize {
        self.state()
            .log
            .iter()
            .filter(|e| e.ins == ins::LOAD_KEY && e.tx[5..11] == key.as_bytes()[..])
            .count()
    }

    fn authenticate(state: &mut State, block: u8, key_type: u8, slot: u8) -> [u8; 2] {
        let Some(key) = state.slots.get(slot as usize).copied().flatten() else {
            return SW_NOT_ALLOWED;
        };

        let Some(sector) = state.family.sector_of_block(block) else {
            return SW_WRONG_PARAMETERS;
        };

        let Some(trailer_block) = state.family.trailer_block(sector) else {
            state.authenticated = Some(sector);
            return SW_SUCCESS;
        };

        let trailer = state.blocks[trailer_block as usize];
        let expected = match key_type {
            0x60 => &trailer[..6],
            0x61 => &trailer[10..],
            _ => return SW_WRONG_PARAMETERS,
        };

        state.authenticated = None;
        if expected != &key[..] {
            return SW_VERIFY_FAILED;
        }

        state.authenticated = Some(sector);
        SW_SUCCESS
    }

    fn is_authenticated(state: &State, block: u8) -> bool {
        state.authenticated.is_some() && state.authenticated == state.family.sector_of_block(block)
    }

    fn process(state: &mut State, tx: &[u8]) -> Vec<u8> {
        let (ins, p1, p2) = (tx[1], tx[2], tx[3]);

        match ins {
            ins::GET_DATA => [&UID[..], &SW_SUCCESS].concat(),
            ins::LOAD_KEY => match (p2 as usize, tx.get(5..11)) {
                (slot @ 0..=1, Some(key)) => {
                    state.slots[slot] = key.try_into().ok();
                    SW_SUCCESS.to_vec()
                }
                _ => SW_WRONG_PARAMETERS.to_vec(),
            },
            ins::AUTHENTICATE => Self::authenticate(state, tx[7], tx[8], tx[9]).to_vec(),
            ins::AUTHENTICATE_OLD => Self::authenticate(state, p2, tx[4], tx[5]).to_vec(),
            ins::READ_BINARY => {
                let block = u16::from_be_bytes([p1, p2]) as u8;
                let len = tx[4] as usize;
                if !Self::is_authenticated(state, block) || len > 16 {
                    return SW_NOT_ALLOWED.to_vec();
                }

                let mut data = state.blocks[block as usize];
                let sector = state.family.sector_of_block(block).unwrap();
                if state.family.trailer_block(sector) == Some(block) {
                    data[..6].fill(0);
                }

                let len = match state.long_reads {
                    true => len + 1,
                    _ => len,
                };
                let data = [&data[..], &[0xEE][..]].concat();

                [&data[..len], &SW_SUCCESS].concat()
            }
            ins::WRITE_BINARY | ins::UPDATE_BINARY => {
                let block = p2;
                if !Self::is_authenticated(state, block) || tx[4] != 16 || tx.len() != 21 {
                    return SW_NOT_ALLOWED.to_vec();
                }

                state.blocks[block as usize].copy_from_slice(&tx[5..21]);
                SW_SUCCESS.to_vec()
            }
            ins::SELECT => SW_FILE_NOT_FOUND.to_vec(),
            _ => SW_INS_NOT_SUPPORTED.to_vec(),
        }
    }
}

impl Transport for SimCard {
    fn connect(&self, _mode: ConnectMode) -> Result<Protocol, TransportError> {
        let mut state = self.state();
        if state.removed {
            return Err(TransportError::NoCard);
        }

        state.connected = true;
        Ok(Protocol::T1)
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.state().connected = false;
        Ok(())
    }

    fn transmit(&self, tx: &[u8], max_len: usize, _: Protocol) -> Result<Vec<u8>, TransportError> {
        let rx = {
            let mut state = self.state();
            state.log.push(Entry {
                ins: tx[1],
                thread: thread::current().id(),
                tx: tx.to_vec(),
            });

            if state.removed {
                return Err(TransportError::CardRemoved);
            }

            if !state.connected {
                return Err(TransportError::NoCard);
            }

            if state.fail_on == Some(tx[1]) {
                state.fail_on = None;
                return Err(TransportError::Reader(Box::new(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "reader unplugged",
                ))));
            }

            Self::process(&mut state, tx)
        };

        // Widens the window in which unsynchronised callers would interleave.
        thread::sleep(self.latency);

        if rx.len() > max_len {
            return Err(TransportError::ResponseTooLong(max_len));
        }

        Ok(rx)
    }

    fn control(&self, tx: &[u8], _max_len: usize) -> Result<Vec<u8>, TransportError> {
        Ok([tx, &SW_SUCCESS].concat())
    }
}

/// Asserts that between an authentication and each read or write that follows it, the
/// card only received commands from the same thread.
pub fn assert_no_interleaving(log: &[Entry]) {
    for (i, entry) in log.iter().enumerate() {
        if !matches!(
            entry.ins,
            ins::READ_BINARY | ins::WRITE_BINARY | ins::UPDATE_BINARY
        ) {
            continue;
        }

        for previous in log[..i].iter().rev() {
            assert_eq!(
                entry.thread, previous.thread,
                "command {} interleaved with another thread",
                i,
            );

            if matches!(previous.ins, ins::AUTHENTICATE | ins::AUTHENTICATE_OLD) {
                break;
            }
        }
    }
}

pub fn key(byte: u8) -> Key {
    Key::new([byte; 6])
}

pub fn key_type_of(entry: &Entry) -> Option<KeyType> {
    match (entry.ins, entry.tx.get(8)) {
        (ins::AUTHENTICATE, Some(0x60)) => Some(KeyType::A),
        (ins::AUTHENTICATE, Some(0x61)) => Some(KeyType::B),
        _ => None,
    }
}
