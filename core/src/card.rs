use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::access::AccessBits;
use crate::apdu::{SelectMode, CLA_STORAGE};
use crate::atr::StorageCard;
use crate::error::{Code, Error, ErrorKind, Result};
use crate::family::CardFamily;
use crate::keys::{Key, KeyStore, KeyType, SectorKeys};
use crate::nfc::{ConnectMode, Transport};
use crate::sector::{Padding, WriteMode};
use crate::session::CardSession;
use crate::slots::KeySlotManager;

/// Settings of a card session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CardOptions {
    /// Class byte of the commands.
    pub class: u8,

    /// Uses the obsolete authenticate command of PC/SC 2.01.
    pub legacy_auth: bool,

    /// Padding of the last chunk of data writes.
    pub padding: Padding,

    /// Command used by data writes.
    pub write_mode: WriteMode,
}

impl Default for CardOptions {
    fn default() -> Self {
        Self {
            class: CLA_STORAGE,
            legacy_auth: false,
            padding: Padding::default(),
            write_mode: WriteMode::default(),
        }
    }
}

/// Identification stored by the manufacturer in block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CardInfo {
    pub uid: [u8; 4],
    pub bcc: u8,
    pub sak: u8,
    pub atqa: [u8; 2],
}

impl CardInfo {
    /// Decodes the manufacturer block.
    pub fn parse(block: &[u8]) -> Option<Self> {
        if block.len() < 8 {
            return None;
        }

        Some(Self {
            uid: [block[0], block[1], block[2], block[3]],
            bcc: block[4],
            sak: block[5],
            atqa: [block[6], block[7]],
        })
    }

    /// Determines whether the check byte matches the UID.
    pub fn is_bcc_valid(&self) -> bool {
        self.uid.iter().fold(0, |acc, b| acc ^ b) == self.bcc
    }
}

/// A session with a contactless storage card.
///
/// Every method takes `&self`; a card can be shared between threads, while exchanges
/// that need an authenticated sector are serialised by the key slot manager.
pub struct Card<T> {
    pub(crate) session: CardSession<T>,
    pub(crate) family: CardFamily,
    pub(crate) slots: KeySlotManager,
    pub(crate) options: CardOptions,
    keys: Mutex<KeyStore>,
    uid: RwLock<Option<Vec<u8>>>,
}

impl<T> Card<T>
where
    T: Transport,
{
    /// Initiates a session with the default options.
    pub fn new(transport: T, family: CardFamily) -> Self {
        Self::with_options(transport, family, CardOptions::default())
    }

    pub fn with_options(transport: T, family: CardFamily, options: CardOptions) -> Self {
        Self {
            session: CardSession::new(transport, options.class),
            family,
            slots: KeySlotManager::new(options.legacy_auth),
            options,
            keys: Mutex::new(KeyStore::new(family.total_sectors())),
            uid: RwLock::new(None),
        }
    }

    /// Initiates a session with the family identified by the ATR of the card.
    pub fn from_atr(transport: T, atr: &[u8], options: CardOptions) -> Result<Self> {
        let card = StorageCard::parse(atr).ok_or_else(|| {
            Error::new(
                ErrorKind::Connect,
                Code::OperationFailed,
                format!("Not a storage card: ATR {}", hex::encode_upper(atr)),
            )
        })?;

        let family = card.family().ok_or_else(|| {
            Error::new(
                ErrorKind::Connect,
                Code::OperationFailed,
                format!("Unsupported card: {} (standard {:#04x})", card.name(), card.standard),
            )
        })?;

        debug!("Detected {} as {}", card.name(), family);

        Ok(Self::with_options(transport, family, options))
    }

    pub fn family(&self) -> CardFamily {
        self.family
    }

    pub fn options(&self) -> &CardOptions {
        &self.options
    }

    pub fn session(&self) -> &CardSession<T> {
        &self.session
    }

    pub fn slots(&self) -> &KeySlotManager {
        &self.slots
    }

    fn keys(&self) -> MutexGuard<'_, KeyStore> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connects to the card. In card mode, the UID is fetched on the way; failing to
    /// fetch it does not fail the connection.
    pub fn connect(&self, mode: ConnectMode) -> Result<()> {
        self.session.connect(mode)?;

        if mode == ConnectMode::Card {
            match self.session.get_uid() {
                Ok(uid) => {
                    debug!("UID: {}", hex::encode_upper(&uid));
                    *self.uid.write().unwrap_or_else(PoisonError::into_inner) = Some(uid);
                }
                Err(_e) => {
                    warn!("Could not fetch the UID: {}", _e);
                }
            }
        }

        Ok(())
    }

    /// Releases the connection, leaving the card in the field.
    pub fn disconnect(&self) -> Result<()> {
        self.session.disconnect()?;
        self.slots.clear();

        Ok(())
    }

    /// Forgets the connection after the card has left the field. Exchanges waiting for
    /// the key slots fail afterwards instead of reaching the transport.
    pub fn card_removed(&self) {
        self.session.invalidate();
        *self.uid.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.slots.clear();
    }

    /// UID fetched on connection.
    pub fn uid(&self) -> Option<Vec<u8>> {
        self.uid
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetches the UID from the card.
    pub fn get_uid(&self) -> Result<Vec<u8>> {
        let uid = self.session.get_uid()?;
        *self.uid.write().unwrap_or_else(PoisonError::into_inner) = Some(uid.clone());

        Ok(uid)
    }

    /// Sends an escape command to the reader.
    pub fn control(&self, tx: &[u8], max_len: usize) -> Result<Vec<u8>> {
        self.session.control(tx, max_len)
    }

    pub fn select(&self, aid: &[u8], mode: SelectMode) -> Result<Vec<u8>> {
        self.session.select(aid, mode)
    }

    /// Loads the key into a slot of the reader (0 or 1).
    pub fn load_authentication_key(&self, slot: u8, key: Key) -> Result<()> {
        self.slots
            .load_authentication_key(&self.session, slot, key)
    }

    /// Authenticates against the block, loading the key into a slot if needed.
    pub fn authenticate(&self, block: u8, key_type: KeyType, key: Key) -> Result<()> {
        self.slots
            .authenticate(&self.session, block, key_type, key)
    }

    /// Remembers a key of the sector.
    pub fn set_key(&self, key_type: KeyType, key: Key, sector: u8) -> Result<()> {
        self.keys().set_key(key_type, key, sector)
    }

    /// Remembers the keys of the sector. A `None` key leaves the known one untouched.
    pub fn set_keys(&self, key_a: Option<Key>, key_b: Option<Key>, sector: u8) -> Result<()> {
        self.keys().set_keys(key_a, key_b, Some(sector))
    }

    /// Remembers the keys of every sector.
    pub fn set_all_keys(&self, key_a: Option<Key>, key_b: Option<Key>) -> Result<()> {
        self.keys().set_keys(key_a, key_b, None)
    }

    /// Keys and access bits known for the sector.
    pub fn sector_keys(&self, sector: u8) -> Result<SectorKeys> {
        self.keys().sector(sector)
    }

    /// Keys and access bits known for every sector accessed so far.
    pub fn known_keys(&self) -> BTreeMap<u8, SectorKeys> {
        self.keys().known()
    }

    pub(crate) fn set_access(&self, sector: u8, access: AccessBits) -> Result<()> {
        self.keys().set_access(sector, access)
    }

    /// Reads the identification of the card from its manufacturer block.
    pub fn card_info(&self) -> Result<CardInfo> {
        let sector = self.read_sector(0, None)?;

        CardInfo::parse(sector.raw()).ok_or_else(|| {
            Error::new(
                ErrorKind::Read,
                Code::InvalidResponse,
                "Manufacturer block is too short.",
            )
        })
    }
}
