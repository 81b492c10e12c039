//! Access conditions of Mifare Classic sectors.
//!
//! The access word occupies bytes 6 to 9 of the sector trailer. It holds three condition
//! bits C1, C2 and C3 per block group, each stored both plain and inverted; byte 9 is
//! free for the user. Groups 0 to 2 cover the data blocks, group 3 the trailer itself.
//!
//! Read as a big-endian `u32`, the plain bits of group `g` sit at positions `20 + g`
//! (C1), `8 + g` (C2) and `12 + g` (C3). The 3-bit code of a group is
//! `C1 | C2 << 1 | C3 << 2`, and both tables below are indexed by that code.

use std::fmt::{Display, Formatter};

use crate::error::{Code, Error, ErrorKind, Result};
use crate::family::CardFamily;
use crate::keys::{Key, KeyType, SectorKeys};

const TRAILER_GROUP: u8 = 3;

/// Operation to perform on a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Increment,
    /// Decrement, transfer and restore.
    Dtr,
}

/// Part of a block the operation applies to. Only trailers have several parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessGroup {
    Data,
    KeyA,
    AccessBits,
    KeyB,
}

/// The 4-byte access word of a sector trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct AccessBits([u8; 4]);

impl AccessBits {
    /// Access word of blank cards: keys A or B rule the data, key A rules the trailer.
    pub const TRANSPORT: Self = Self([0xFF, 0x07, 0x80, 0x69]);

    /// Access word of NFC Forum sectors holding an NDEF message.
    pub const NDEF: Self = Self([0x7F, 0x07, 0x88, 0x40]);

    /// Access word of the MAD sector of NFC Forum cards.
    pub const MAD: Self = Self([0x78, 0x77, 0x88, 0xC1]);

    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }

    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    fn bit(&self, position: u32) -> u8 {
        (self.as_u32().checked_shr(position).unwrap_or(0) & 1) as u8
    }

    /// Decodes the 3-bit access code of the block group (0 to 3).
    /// Groups past the trailer hold no bits and decode as 0.
    pub fn code(&self, group: u8) -> u8 {
        if group > TRAILER_GROUP {
            return 0;
        }

        let group = group as u32;
        self.bit(20 + group) | self.bit(8 + group) << 1 | self.bit(12 + group) << 2
    }

    /// Decodes the access codes of the four block groups.
    pub fn codes(&self) -> [u8; 4] {
        [self.code(0), self.code(1), self.code(2), self.code(3)]
    }

    /// Encodes an access word from the codes of the four block groups.
    pub fn from_codes(codes: [u8; 4], user: u8) -> Self {
        let nibble = |shift: u8| {
            codes
                .iter()
                .enumerate()
                .fold(0u8, |acc, (g, code)| acc | ((code >> shift) & 1) << g)
        };

        let (c1, c2, c3) = (nibble(0), nibble(1), nibble(2));

        Self([
            (!c2 & 0x0F) << 4 | (!c1 & 0x0F),
            c1 << 4 | (!c3 & 0x0F),
            c3 << 4 | c2,
            user,
        ])
    }

    /// Determines whether every inverted bit matches its plain counterpart.
    /// Writing an invalid access word makes the sector unusable.
    pub fn is_valid(&self) -> bool {
        let [b6, b7, b8, _] = self.0;

        (b6 & 0x0F) == (!(b7 >> 4) & 0x0F)
            && (b6 >> 4) == (!b8 & 0x0F)
            && (b7 & 0x0F) == (!(b8 >> 4) & 0x0F)
    }
}

impl Display for AccessBits {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

const AB: &[KeyType] = &[KeyType::A, KeyType::B];
const A: &[KeyType] = &[KeyType::A];
const B: &[KeyType] = &[KeyType::B];
const NEVER: &[KeyType] = &[];

/// Holders of the keys allowed to read and write a part of the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rights {
    pub read: &'static [KeyType],
    pub write: &'static [KeyType],
}

const fn rights(read: &'static [KeyType], write: &'static [KeyType]) -> Rights {
    Rights { read, write }
}

/// Holders of the keys allowed to operate on a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAccess {
    pub read: &'static [KeyType],
    pub write: &'static [KeyType],
    pub increment: &'static [KeyType],
    pub dtr: &'static [KeyType],
}

const fn data(
    read: &'static [KeyType],
    write: &'static [KeyType],
    increment: &'static [KeyType],
    dtr: &'static [KeyType],
) -> DataAccess {
    DataAccess {
        read,
        write,
        increment,
        dtr,
    }
}

/// Holders of the keys allowed to operate on each part of the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailerAccess {
    pub key_a: Rights,
    pub access_bits: Rights,
    pub key_b: Rights,
}

const fn trailer(key_a: Rights, access_bits: Rights, key_b: Rights) -> TrailerAccess {
    TrailerAccess {
        key_a,
        access_bits,
        key_b,
    }
}

/// Access to data blocks, by code.
pub const DATA_TABLE: [DataAccess; 8] = [
    data(AB, AB, AB, AB),          // C1 C2 C3 = 0 0 0 (transport)
    data(AB, B, NEVER, NEVER),     // 1 0 0
    data(AB, NEVER, NEVER, NEVER), // 0 1 0
    data(AB, B, B, AB),            // 1 1 0
    data(AB, NEVER, NEVER, AB),    // 0 0 1
    data(B, NEVER, NEVER, NEVER),  // 1 0 1
    data(B, B, NEVER, NEVER),      // 0 1 1
    data(NEVER, NEVER, NEVER, NEVER),
];

/// Access to the parts of the trailer, by code. Key A is never readable.
pub const TRAILER_TABLE: [TrailerAccess; 8] = [
    trailer(rights(NEVER, A), rights(A, NEVER), rights(A, A)), // 0 0 0
    trailer(rights(NEVER, B), rights(AB, NEVER), rights(NEVER, B)), // 1 0 0
    trailer(rights(NEVER, NEVER), rights(A, NEVER), rights(A, NEVER)), // 0 1 0
    trailer(rights(NEVER, NEVER), rights(AB, NEVER), rights(NEVER, NEVER)), // 1 1 0
    trailer(rights(NEVER, A), rights(A, A), rights(A, A)), // 0 0 1 (transport)
    trailer(rights(NEVER, NEVER), rights(AB, B), rights(NEVER, NEVER)), // 1 0 1
    trailer(rights(NEVER, B), rights(AB, B), rights(NEVER, B)), // 0 1 1
    trailer(rights(NEVER, NEVER), rights(AB, NEVER), rights(NEVER, NEVER)), // 1 1 1
];

/// Block group of the block within its sector: 0 to 2 for data blocks, 3 for the trailer.
/// Data blocks of 16-block sectors are grouped by five.
pub fn block_group(family: CardFamily, sector: u8, block: u8) -> u8 {
    if family.trailer_block(sector) == Some(block) {
        return TRAILER_GROUP;
    }

    let offset = block.saturating_sub(family.start_block(sector));
    match family.blocks_in_sector(sector) {
        4 => offset,
        _ => offset / 5,
    }
}

/// Looks up the key types allowed to perform the operation on the part of a block of
/// the given group. No key is permitted on groups past the trailer.
pub fn permitted(
    access: &AccessBits,
    group: u8,
    access_type: AccessType,
    access_group: AccessGroup,
) -> &'static [KeyType] {
    if group > TRAILER_GROUP {
        return NEVER;
    }

    let code = access.code(group) as usize;

    if group != TRAILER_GROUP {
        let entry = &DATA_TABLE[code];

        return match (access_group, access_type) {
            (AccessGroup::Data, AccessType::Read) => entry.read,
            (AccessGroup::Data, AccessType::Write) => entry.write,
            (AccessGroup::Data, AccessType::Increment) => entry.increment,
            (AccessGroup::Data, AccessType::Dtr) => entry.dtr,
            _ => NEVER,
        };
    }

    let entry = &TRAILER_TABLE[code];
    let rights = match access_group {
        AccessGroup::KeyA => entry.key_a,
        AccessGroup::Data | AccessGroup::AccessBits => entry.access_bits,
        AccessGroup::KeyB => entry.key_b,
    };

    match access_type {
        AccessType::Read => rights.read,
        AccessType::Write => rights.write,
        _ => NEVER,
    }
}

/// Resolves the key to authenticate with, to perform the operation on the block.
///
/// While the access word of the sector is unknown, any known key is returned, preferring
/// key A. Once known, the first permitted key type whose key is known is returned.
pub fn resolve(
    family: CardFamily,
    block: u8,
    sector: u8,
    keys: &SectorKeys,
    access_type: AccessType,
    access_group: AccessGroup,
) -> Result<(KeyType, Key)> {
    let access = match (family.has_trailer(), keys.access) {
        (true, Some(access)) => access,
        _ => {
            return keys
                .key_a
                .map(|k| (KeyType::A, k))
                .or_else(|| keys.key_b.map(|k| (KeyType::B, k)))
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::Access,
                        Code::InvalidKeyOrKeyType,
                        format!("Invalid KeyType or Key for Sector {}", sector),
                    )
                });
        }
    };

    if family.sector_of_block(block) != Some(sector) {
        return Err(Error::new(
            ErrorKind::Access,
            Code::InvalidSector,
            format!("Block {} is not in sector {}", block, sector),
        ));
    }

    let group = block_group(family, sector, block);
    let holders = permitted(&access, group, access_type, access_group);

    holders
        .iter()
        .find_map(|&key_type| keys.get(key_type).map(|key| (key_type, key)))
        .ok_or_else(|| {
            Error::new(
                ErrorKind::Access,
                Code::AccessDenied,
                format!(
                    "No known key may {:?} {:?} of block {} in sector {} (access code {:03b}, allowed {:?})",
                    access_type,
                    access_group,
                    block,
                    sector,
                    access.code(group),
                    holders,
                ),
            )
        })
}
