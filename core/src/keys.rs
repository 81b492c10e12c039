//! Keys of Mifare Classic sectors, and the per-sector record of known keys.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use crate::access::AccessBits;
use crate::error::{Code, Error, ErrorKind, Result};

pub const KEY_SIZE: usize = 6;

/// Keys commonly found on blank and NDEF-formatted cards.
pub const DEFAULT_KEYS: [Key; 4] = [
    Key([0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
    Key([0xD3, 0xF7, 0xD3, 0xF7, 0xD3, 0xF7]),
    Key([0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
    Key([0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]),
];

/// A 6-byte credential of a sector.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parses a key from 12 hexadecimal characters.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| {
            Error::new(
                ErrorKind::LoadAuthenticationKey,
                Code::InvalidKey,
                "Key must be in hex and have 12 characters.",
            )
            .with_source(e)
        })?;

        Self::try_from(bytes.as_slice())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Key {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            Error::new(
                ErrorKind::LoadAuthenticationKey,
                Code::InvalidKey,
                "Key length must be 6 bytes.",
            )
        })?;

        Ok(Self(bytes))
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({})", self)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Key {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Key {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Which of the two keys of a sector is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum KeyType {
    A,
    B,
}

impl KeyType {
    /// Code of the key type in authenticate commands.
    pub fn code(self) -> u8 {
        match self {
            Self::A => 0x60,
            Self::B => 0x61,
        }
    }
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "a" | "A" => Ok(Self::A),
            "b" | "B" => Ok(Self::B),
            _ => Err(Error::new(
                ErrorKind::LoadAuthenticationKey,
                Code::InvalidKeyType,
                format!("Unknown key type {}", s),
            )),
        }
    }
}

impl Display for KeyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::A => "KEY_A",
            Self::B => "KEY_B",
        })
    }
}

/// Keys and access bits known for a sector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SectorKeys {
    pub key_a: Option<Key>,
    pub key_b: Option<Key>,
    pub access: Option<AccessBits>,
}

impl SectorKeys {
    pub fn get(&self, key_type: KeyType) -> Option<Key> {
        match key_type {
            KeyType::A => self.key_a,
            KeyType::B => self.key_b,
        }
    }

    pub fn set(&mut self, key_type: KeyType, key: Key) {
        match key_type {
            KeyType::A => self.key_a = Some(key),
            KeyType::B => self.key_b = Some(key),
        }
    }
}

/// Per-session record of the keys known for each sector.
/// Records are created on first access and live as long as the session.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    total_sectors: u8,
    sectors: BTreeMap<u8, SectorKeys>,
}

impl KeyStore {
    pub fn new(total_sectors: u8) -> Self {
        Self {
            total_sectors,
            sectors: BTreeMap::new(),
        }
    }

    fn check(&self, sector: u8) -> Result<()> {
        match sector < self.total_sectors {
            true => Ok(()),
            _ => Err(Error::invalid_sector(sector)),
        }
    }

    /// Returns a copy of the record of the sector, creating it if needed.
    pub fn sector(&mut self, sector: u8) -> Result<SectorKeys> {
        self.check(sector)?;

        Ok(*self.sectors.entry(sector).or_default())
    }

    pub fn set_key(&mut self, key_type: KeyType, key: Key, sector: u8) -> Result<()> {
        self.check(sector)?;
        self.sectors.entry(sector).or_default().set(key_type, key);

        Ok(())
    }

    /// Sets both keys of the sector, or of every sector if `sector` is `None`.
    /// A `None` key leaves the current one untouched.
    pub fn set_keys(&mut self, key_a: Option<Key>, key_b: Option<Key>, sector: Option<u8>) -> Result<()> {
        let sectors = match sector {
            Some(s) => {
                self.check(s)?;
                s..=s
            }
            None => 0..=self.total_sectors.saturating_sub(1),
        };

        for s in sectors {
            let record = self.sectors.entry(s).or_default();
            if let Some(key) = key_a {
                record.key_a = Some(key);
            }
            if let Some(key) = key_b {
                record.key_b = Some(key);
            }
        }

        Ok(())
    }

    pub fn set_access(&mut self, sector: u8, access: AccessBits) -> Result<()> {
        self.check(sector)?;
        self.sectors.entry(sector).or_default().access = Some(access);

        Ok(())
    }

    /// Snapshot of every record created so far.
    pub fn known(&self) -> BTreeMap<u8, SectorKeys> {
        self.sectors.clone()
    }

    pub fn clear(&mut self) {
        self.sectors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_hex() {
        let key = Key::from_hex("a0a1a2a3a4a5").unwrap();

        assert_eq!(DEFAULT_KEYS[3], key);
        assert_eq!("A0A1A2A3A4A5", key.to_string());
    }

    #[test]
    fn test_invalid_keys() {
        let error = Key::from_hex("FFFFFFFFFF").unwrap_err();
        assert_eq!(Code::InvalidKey, error.code());
        assert_eq!(ErrorKind::LoadAuthenticationKey, error.kind());

        let error = Key::from_hex("GGGGGGGGGGGG").unwrap_err();
        assert_eq!(Code::InvalidKey, error.code());
    }

    #[test]
    fn test_set_keys_on_every_sector() {
        let mut store = KeyStore::new(16);
        store
            .set_keys(None, Some(DEFAULT_KEYS[0]), None)
            .unwrap();
        store.set_key(KeyType::A, DEFAULT_KEYS[1], 4).unwrap();

        let known = store.known();
        assert_eq!(16, known.len());
        assert_eq!(Some(DEFAULT_KEYS[0]), known[&15].key_b);
        assert_eq!(None, known[&15].key_a);
        assert_eq!(Some(DEFAULT_KEYS[1]), known[&4].key_a);
    }

    #[test]
    fn test_sector_out_of_range() {
        let mut store = KeyStore::new(16);

        assert_eq!(
            Code::InvalidSector,
            store.set_key(KeyType::A, DEFAULT_KEYS[0], 16).unwrap_err().code(),
        );
        assert!(store.sector(16).is_err());
    }
}
