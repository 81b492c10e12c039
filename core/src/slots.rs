//! The two volatile key slots of the reader.
//!
//! Loading a key, authenticating with it and the transmissions that follow form one
//! critical section, guarded by a single lock for the whole session. A request for a key
//! that another caller is loading waits on that lock, then finds the key resident.

use std::sync::{Mutex, MutexGuard, PoisonError};

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::apdu::{Command, SW_SUCCESS, SW_VERIFY_FAILED};
use crate::error::{Code, Error, ErrorKind, Result};
use crate::keys::{Key, KeyType};
use crate::nfc::Transport;
use crate::session::CardSession;

/// Number of volatile key slots on the reader.
pub const KEY_SLOTS: usize = 2;

/// Status word only.
const STATUS_SIZE: usize = 2;

type Slots = [Option<Key>; KEY_SLOTS];

pub struct KeySlotManager {
    slots: Mutex<Slots>,
    legacy_auth: bool,
}

impl KeySlotManager {
    /// Creates a manager with both slots empty. `legacy_auth` selects the obsolete
    /// authenticate command of PC/SC 2.01.
    pub fn new(legacy_auth: bool) -> Self {
        Self {
            slots: Mutex::new([None; KEY_SLOTS]),
            legacy_auth,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keys currently resident in the slots.
    pub fn resident(&self) -> Slots {
        *self.lock()
    }

    /// Forgets the content of both slots.
    /// Blocks until the critical section in progress, if any, completes.
    pub fn clear(&self) {
        *self.lock() = [None; KEY_SLOTS];
    }

    /// Loads the key into the slot of the reader.
    pub fn load_authentication_key<T>(
        &self,
        session: &CardSession<T>,
        slot: u8,
        key: Key,
    ) -> Result<()>
    where
        T: Transport,
    {
        let mut slots = self.lock();

        Self::load(&mut slots, session, slot, key)
    }

    fn load<T>(slots: &mut Slots, session: &CardSession<T>, slot: u8, key: Key) -> Result<()>
    where
        T: Transport,
    {
        let index = slot as usize;
        if index >= KEY_SLOTS {
            return Err(Error::new(
                ErrorKind::LoadAuthenticationKey,
                Code::InvalidKeyType,
                format!("Key slot must be 0 or 1, got {}", slot),
            ));
        }

        // The slot content is unknown until the load settles.
        slots[index] = None;

        let response = session.send(
            Command::load_key(session.class(), slot, key.as_bytes()),
            STATUS_SIZE,
        )?;

        if !response.is_ok() {
            return Err(Error::new(
                ErrorKind::LoadAuthenticationKey,
                Code::OperationFailed,
                format!(
                    "Load authentication key operation failed: Status code: {:04X?}",
                    response.status(),
                ),
            ));
        }

        debug!("Loaded key into slot {}", slot);
        slots[index] = Some(key);

        Ok(())
    }

    /// Finds the slot holding the key, loading it first if needed.
    fn ensure_loaded<T>(slots: &mut Slots, session: &CardSession<T>, key: Key) -> Result<u8>
    where
        T: Transport,
    {
        if let Some(slot) = slots.iter().position(|k| *k == Some(key)) {
            return Ok(slot as u8);
        }

        // Prefers an empty slot, then evicts the first one.
        let slot = slots.iter().position(Option::is_none).unwrap_or(0) as u8;
        if slots[slot as usize].is_some() {
            debug!("Evicting the key in slot {}", slot);
        }

        Self::load(slots, session, slot, key).map_err(|e| {
            Error::new(
                ErrorKind::Authentication,
                Code::UnableToLoadKey,
                "Could not load authentication key into reader.",
            )
            .with_source(e)
        })?;

        Ok(slot)
    }

    fn authenticate_slot<T>(
        &self,
        session: &CardSession<T>,
        block: u8,
        key_type: KeyType,
        slot: u8,
    ) -> Result<()>
    where
        T: Transport,
    {
        let command = match self.legacy_auth {
            true => Command::authenticate_old(session.class(), block, key_type.code(), slot),
            _ => Command::authenticate(session.class(), block, key_type.code(), slot),
        };

        let response = session.send(command, STATUS_SIZE)?;

        match response.status() {
            Some(SW_SUCCESS) => Ok(()),
            Some(SW_VERIFY_FAILED) => Err(Error::new(
                ErrorKind::Authentication,
                Code::VerifyFailed,
                "Invalid Credentials.",
            )),
            status => Err(Error::new(
                ErrorKind::Authentication,
                Code::OperationFailed,
                format!(
                    "Authentication operation failed: Status code: {:04X?}",
                    status,
                ),
            )),
        }
    }

    /// Authenticates against the block, then runs `f` before any other caller may touch
    /// the slots or the card.
    pub fn with_authenticated<T, R, F>(
        &self,
        session: &CardSession<T>,
        block: u8,
        key_type: KeyType,
        key: Key,
        f: F,
    ) -> Result<R>
    where
        T: Transport,
        F: FnOnce(&CardSession<T>) -> Result<R>,
    {
        let mut slots = self.lock();

        // The card may have left the field while this caller was waiting.
        if !session.is_connected() {
            return Err(Error::new(
                ErrorKind::Transmit,
                Code::CardNotConnected,
                "No card or connection available.",
            ));
        }

        let slot = Self::ensure_loaded(&mut slots, session, key)?;
        self.authenticate_slot(session, block, key_type, slot)?;

        f(session)
    }

    /// Authenticates against the block with the key.
    pub fn authenticate<T>(
        &self,
        session: &CardSession<T>,
        block: u8,
        key_type: KeyType,
        key: Key,
    ) -> Result<()>
    where
        T: Transport,
    {
        self.with_authenticated(session, block, key_type, key, |_| Ok(()))
    }
}
