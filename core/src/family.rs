//! Memory layout of each supported card family.

use std::fmt::{Display, Formatter};

use crate::error::{Error, Result};

/// Size of a block, in octets.
pub const BLOCK_SIZE: usize = 16;

/// Largest chunk transferred by a single `READ BINARY`.
pub const PACKET_SIZE: usize = 16;

/// Block and packet size of ISO 14443-4 devices, which are not driven by this crate.
pub const LARGE_BLOCK_SIZE: usize = 64;

const BLOCKS_IN_SMALL_SECTOR: u8 = 4;
const BLOCKS_IN_LARGE_SECTOR: u8 = 16;

const ISO_14443_3A_TOTAL_SECTORS: u8 = 16;
const MIFARE_1K_TOTAL_SECTORS: u8 = 16;
const MIFARE_4K_TOTAL_SMALL_SECTORS: u8 = 32;
const MIFARE_4K_TOTAL_LARGE_SECTORS: u8 = 8;

/// Layout strategy of a card; every sizing query of a session goes through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum CardFamily {
    /// Generic ISO 14443-3A storage: 16 sectors of 4 plain blocks.
    Iso14443_3A,

    /// Mifare Classic 1K: 16 sectors of 4 blocks, the last one being the trailer.
    MifareClassic1K,

    /// Mifare Classic 4K: 32 sectors of 4 blocks followed by 8 sectors of 16 blocks.
    MifareClassic4K,
}

impl CardFamily {
    /// Determines whether sectors end with a trailer holding keys and access bits.
    pub fn has_trailer(self) -> bool {
        !matches!(self, Self::Iso14443_3A)
    }

    pub fn total_sectors(self) -> u8 {
        match self {
            Self::Iso14443_3A => ISO_14443_3A_TOTAL_SECTORS,
            Self::MifareClassic1K => MIFARE_1K_TOTAL_SECTORS,
            Self::MifareClassic4K => MIFARE_4K_TOTAL_SMALL_SECTORS + MIFARE_4K_TOTAL_LARGE_SECTORS,
        }
    }

    /// Fails unless the sector exists on this family.
    pub fn check_sector(self, sector: u8) -> Result<()> {
        match sector < self.total_sectors() {
            true => Ok(()),
            _ => Err(Error::invalid_sector(sector)),
        }
    }

    /// Number of blocks on the card.
    pub fn total_blocks(self) -> usize {
        (0..self.total_sectors())
            .map(|s| self.blocks_in_sector(s) as usize)
            .sum()
    }

    pub fn block_size(self, _block: u8) -> usize {
        BLOCK_SIZE
    }

    pub fn packet_size(self) -> usize {
        PACKET_SIZE
    }

    pub fn blocks_in_sector(self, sector: u8) -> u8 {
        match self {
            Self::MifareClassic4K if sector >= MIFARE_4K_TOTAL_SMALL_SECTORS => {
                BLOCKS_IN_LARGE_SECTOR
            }
            _ => BLOCKS_IN_SMALL_SECTOR,
        }
    }

    /// First block of the sector. The sector must exist on this family.
    pub fn start_block(self, sector: u8) -> u8 {
        let sector = sector as u16;
        let small = MIFARE_4K_TOTAL_SMALL_SECTORS as u16;

        let block = match self {
            Self::MifareClassic4K if sector >= small => {
                small * BLOCKS_IN_SMALL_SECTOR as u16
                    + (sector - small) * BLOCKS_IN_LARGE_SECTOR as u16
            }
            _ => sector * BLOCKS_IN_SMALL_SECTOR as u16,
        };

        block as u8
    }

    pub fn sector_size(self, sector: u8) -> usize {
        self.blocks_in_sector(sector) as usize * BLOCK_SIZE
    }

    /// Size of the region of the sector available for user data; excludes the trailer
    /// and, in sector 0, the manufacturer block.
    pub fn sector_data_size(self, sector: u8) -> usize {
        if !self.has_trailer() {
            return self.sector_size(sector);
        }

        let size = self.sector_size(sector) - BLOCK_SIZE;
        match sector {
            0 => size - BLOCK_SIZE,
            _ => size,
        }
    }

    /// First block of the data region of the sector.
    pub fn data_start_block(self, sector: u8) -> u8 {
        match (self.has_trailer(), sector) {
            (true, 0) => 1,
            _ => self.start_block(sector),
        }
    }

    /// Offset of the data region within the raw bytes of the sector.
    pub fn data_offset(self, sector: u8) -> usize {
        (self.data_start_block(sector) - self.start_block(sector)) as usize * BLOCK_SIZE
    }

    pub fn trailer_block(self, sector: u8) -> Option<u8> {
        match self.has_trailer() {
            true => Some(self.start_block(sector) + (self.blocks_in_sector(sector) - 1)),
            _ => None,
        }
    }

    /// Finds the sector holding the block.
    pub fn sector_of_block(self, block: u8) -> Option<u8> {
        (0..self.total_sectors()).find(|&sector| {
            let start = self.start_block(sector) as u16;
            let end = start + self.blocks_in_sector(sector) as u16;

            (start..end).contains(&(block as u16))
        })
    }
}

impl Display for CardFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Iso14443_3A => "ISO 14443-3A",
            Self::MifareClassic1K => "Mifare Classic 1K",
            Self::MifareClassic4K => "Mifare Classic 4K",
        })
    }
}
