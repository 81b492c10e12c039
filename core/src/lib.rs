//! A crate to read and write contactless storage cards (ISO 14443-3A, Mifare Classic)
//! through a PC/SC-style reader transport.
//!
//! The entry point is [`Card`], a session bound to one [`nfc::Transport`] and one
//! [`CardFamily`]. It authenticates against sectors using the reader's two volatile key
//! slots, reads and writes blocks in chunks, resolves which key an operation needs from
//! the sector's access bits, and can search for unknown keys.

#[cfg(not(feature = "tracing"))]
macro_rules! debug {
    ($($t: tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! info {
    ($($t: tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn {
    ($($t: tt)*) => {};
}

#[cfg(feature = "pcsc")]
pub mod pcsc;

pub mod access;
pub mod apdu;
pub mod atr;
pub mod card;
pub mod discovery;
pub mod error;
pub mod family;
pub mod io;
pub mod keys;
pub mod nfc;
pub mod sector;
pub mod session;
pub mod slots;

pub use access::{AccessBits, AccessGroup, AccessType};
pub use card::{Card, CardInfo, CardOptions};
pub use discovery::{DiscoveredKeys, SectorDiscovery};
pub use error::{Code, Error, ErrorKind, Result};
pub use family::CardFamily;
pub use io::Credential;
pub use keys::{Key, KeyType, SectorKeys, DEFAULT_KEYS};
pub use sector::{CardSector, Padding, TrailerBlock, WriteMode};
