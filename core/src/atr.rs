//! ATR (Answer-To-Reset) of contactless cards, as synthesised by PC/SC readers.
//!
//! For storage cards, PC/SC part 3 places an application identifier in the historical
//! bytes: `80 4F 0C` followed by the RID (5 octets), the standard (1 octet) and the card
//! name (2 octets).

use crate::family::CardFamily;

const CATEGORY_INDEX: usize = 5;
const CATEGORY_STORAGE: u8 = 0x4F;
const RID_RANGE: std::ops::Range<usize> = 7..12;
const STANDARD_INDEX: usize = 12;
const CARD_NAME_RANGE: std::ops::Range<usize> = 13..15;

/// Standard (and part) the card complies with.
pub mod standard {
    pub const ISO_14443_3A: u8 = 0x03;
    pub const ISO_14443_3B: u8 = 0x07;
    pub const ISO_15693_3: u8 = 0x0B;
    pub const FELICA: u8 = 0x11;
}

/// Card names registered in PC/SC part 3.
pub mod card_type {
    pub const MIFARE_1K: u16 = 0x0001;
    pub const MIFARE_4K: u16 = 0x0002;
    pub const MIFARE_ULTRALIGHT: u16 = 0x0003;
    pub const MIFARE_MINI: u16 = 0x0026;
    pub const TOPAZ_AND_JEWEL: u16 = 0xF004;
    pub const FELICA_212K: u16 = 0xF011;
    pub const FELICA_424K: u16 = 0xF012;
}

/// Identification of a storage card, decoded from the ATR.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct StorageCard {
    pub rid: [u8; 5],
    pub standard: u8,
    pub card_type: u16,
}

impl StorageCard {
    /// Decodes the ATR, returning `None` for cards that are not storage cards
    /// (such as ISO 14443-4 devices).
    pub fn parse(atr: &[u8]) -> Option<Self> {
        if atr.len() < CARD_NAME_RANGE.end || atr[CATEGORY_INDEX] != CATEGORY_STORAGE {
            return None;
        }

        let mut rid = [0u8; 5];
        rid.copy_from_slice(&atr[RID_RANGE]);

        Some(Self {
            rid,
            standard: atr[STANDARD_INDEX],
            card_type: u16::from_be_bytes([atr[CARD_NAME_RANGE.start], atr[CARD_NAME_RANGE.start + 1]]),
        })
    }

    /// Human-readable name of the card type.
    pub fn name(&self) -> &'static str {
        match self.card_type {
            card_type::MIFARE_1K => "Mifare 1K",
            card_type::MIFARE_4K => "Mifare 4K",
            card_type::MIFARE_ULTRALIGHT => "Mifare Ultralight",
            card_type::MIFARE_MINI => "Mifare Mini",
            card_type::TOPAZ_AND_JEWEL => "Topaz and Jewel",
            card_type::FELICA_212K => "FeliCa 212K",
            card_type::FELICA_424K => "FeliCa 424K",
            _ => "Unknown",
        }
    }

    /// Chooses the family to drive the card with, if it is supported.
    pub fn family(&self) -> Option<CardFamily> {
        if self.standard != standard::ISO_14443_3A {
            return None;
        }

        Some(match self.card_type {
            card_type::MIFARE_1K => CardFamily::MifareClassic1K,
            card_type::MIFARE_4K => CardFamily::MifareClassic4K,
            _ => CardFamily::Iso14443_3A,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATR_MIFARE_1K: [u8; 20] = [
        0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06, 0x03, 0x00,
        0x01, 0x00, 0x00, 0x00, 0x00, 0x6A,
    ];

    #[test]
    fn test_parse_mifare_1k() {
        let card = StorageCard::parse(&ATR_MIFARE_1K).unwrap();

        assert_eq!([0xA0, 0x00, 0x00, 0x03, 0x06], card.rid);
        assert_eq!(standard::ISO_14443_3A, card.standard);
        assert_eq!("Mifare 1K", card.name());
        assert_eq!(Some(CardFamily::MifareClassic1K), card.family());
    }

    #[test]
    fn test_unknown_type_falls_back_to_generic() {
        let mut atr = ATR_MIFARE_1K;
        atr[14] = 0x03;

        let card = StorageCard::parse(&atr).unwrap();
        assert_eq!(Some(CardFamily::Iso14443_3A), card.family());
    }

    #[test]
    fn test_non_storage_card() {
        let atr = [0x3B, 0x80, 0x80, 0x01, 0x01];
        assert_eq!(None, StorageCard::parse(&atr));
    }
}
