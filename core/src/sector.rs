//! Sectors as read from the card, and the policies to write them.

use std::str::FromStr;

use crate::access::AccessBits;
use crate::apdu::Command;
use crate::error::{Code, Error, ErrorKind, Result};
use crate::family::{CardFamily, BLOCK_SIZE};
use crate::keys::{Key, KEY_SIZE};

/// How the last chunk of a write is completed when it is shorter than the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Padding {
    /// Rejects data that does not end on a block boundary.
    None,

    /// Pads with zeros up to the next block boundary.
    Block,

    /// Pads with zeros up to the end of the data region of the sector.
    #[default]
    SectorData,
}

impl Padding {
    /// Completes the chunk written to a region of `region_size` octets.
    pub fn apply(self, mut chunk: Vec<u8>, region_size: usize) -> Result<Vec<u8>> {
        let aligned = chunk.len() % BLOCK_SIZE == 0;

        match self {
            Self::None if !aligned => {
                return Err(Error::new(
                    ErrorKind::Write,
                    Code::InvalidDataSize,
                    format!(
                        "Data of {} bytes does not end on a block boundary",
                        chunk.len(),
                    ),
                ))
            }
            Self::None => {}
            Self::Block => {
                let len = (chunk.len() + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;
                chunk.resize(len, 0);
            }
            Self::SectorData => chunk.resize(region_size.max(chunk.len()), 0),
        }

        Ok(chunk)
    }
}

impl FromStr for Padding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "block" => Ok(Self::Block),
            "sector" | "sector-data" => Ok(Self::SectorData),
            _ => Err(Error::new(
                ErrorKind::Write,
                Code::InvalidMode,
                format!("Unknown padding {}", s),
            )),
        }
    }
}

/// Command used to store blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum WriteMode {
    /// `WRITE BINARY`: the target must already hold data no shorter than the payload.
    #[default]
    Write,

    /// `UPDATE BINARY`: overwrites whatever the target holds.
    Update,
}

impl WriteMode {
    pub(crate) fn command(self, cla: u8, block: u8, data: Vec<u8>) -> Command {
        match self {
            Self::Write => Command::write_binary(cla, block, data),
            Self::Update => Command::update_binary(cla, block, data),
        }
    }
}

/// The last block of a Mifare Classic sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TrailerBlock {
    /// Reads back as zeros, the card never discloses it.
    pub key_a: Key,
    pub access: AccessBits,
    pub key_b: Key,
}

impl TrailerBlock {
    pub fn new(key_a: Key, access: AccessBits, key_b: Key) -> Self {
        Self {
            key_a,
            access,
            key_b,
        }
    }

    /// Splits a 16-octet block into its regions.
    pub fn parse(block: &[u8]) -> Option<Self> {
        if block.len() != BLOCK_SIZE {
            return None;
        }

        let (key_a, rest) = block.split_at(KEY_SIZE);
        let (access, key_b) = rest.split_at(4);

        Some(Self {
            key_a: Key::try_from(key_a).ok()?,
            access: AccessBits::new(access.try_into().ok()?),
            key_b: Key::try_from(key_b).ok()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[..KEY_SIZE].copy_from_slice(self.key_a.as_bytes());
        block[KEY_SIZE..KEY_SIZE + 4].copy_from_slice(&self.access.bytes());
        block[KEY_SIZE + 4..].copy_from_slice(self.key_b.as_bytes());

        block
    }
}

/// Content of a sector, immutable once read.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CardSector {
    sector: u8,
    start_block: u8,
    #[cfg_attr(feature = "serde", serde(with = "hex_bytes"))]
    raw: Vec<u8>,
    data_offset: usize,
    data_len: usize,
    trailer: Option<TrailerBlock>,
}

impl CardSector {
    /// Lays the raw octets of the sector out according to the family.
    pub fn parse(family: CardFamily, sector: u8, raw: Vec<u8>) -> Result<Self> {
        let size = family.sector_size(sector);
        if raw.len() != size {
            return Err(Error::new(
                ErrorKind::Read,
                Code::InvalidResponse,
                format!(
                    "Incorrect response size. Expected {}, Received {}",
                    size,
                    raw.len(),
                ),
            ));
        }

        let trailer = match family.has_trailer() {
            true => TrailerBlock::parse(&raw[size - BLOCK_SIZE..]),
            _ => None,
        };

        Ok(Self {
            sector,
            start_block: family.start_block(sector),
            raw,
            data_offset: family.data_offset(sector),
            data_len: family.sector_data_size(sector),
            trailer,
        })
    }

    pub fn sector(&self) -> u8 {
        self.sector
    }

    pub fn start_block(&self) -> u8 {
        self.start_block
    }

    /// Every octet of the sector, manufacturer block and trailer included.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The region of the sector that holds user data.
    pub fn data(&self) -> &[u8] {
        &self.raw[self.data_offset..self.data_offset + self.data_len]
    }

    pub fn trailer(&self) -> Option<&TrailerBlock> {
        self.trailer.as_ref()
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }
}

#[cfg(feature = "serde")]
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
