//! Searching the keys of sectors among candidates.

use std::collections::BTreeMap;

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

use crate::card::Card;
use crate::error::Result;
use crate::family::BLOCK_SIZE;
use crate::keys::{Key, KeyType};
use crate::nfc::Transport;
use crate::sector::TrailerBlock;

/// Keys found for a sector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct DiscoveredKeys {
    pub key_a: Option<Key>,
    pub key_b: Option<Key>,
}

/// Outcome of the search on one sector.
#[derive(Debug)]
pub enum SectorDiscovery {
    Found(DiscoveredKeys),

    /// Every candidate was rejected for both key types.
    NotFound,

    /// The search could not complete.
    Failed(crate::error::Error),
}

impl<T> Card<T>
where
    T: Transport,
{
    /// Tries each candidate in order against the sector until one authenticates.
    /// Rejected keys move the search to the next candidate; any other error aborts it.
    fn find_key(&self, candidates: &[Key], sector: u8, key_type: KeyType) -> Result<Option<Key>> {
        let block = self.family.start_block(sector);

        for &key in candidates {
            match self.authenticate(block, key_type, key) {
                Ok(()) => {
                    info!("Found {} of sector {}: {}", key_type, sector, key);
                    self.set_key(key_type, key, sector)?;

                    return Ok(Some(key));
                }
                Err(e) if e.is_verify_failed() => {
                    debug!("Rejected {} of sector {}: {}", key_type, sector, key);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Reads the trailer with a found key to remember the access bits of the sector.
    fn fetch_access(&self, sector: u8, keys: &DiscoveredKeys) {
        let Some(block) = self.family.trailer_block(sector) else {
            return;
        };

        let credential = keys
            .key_a
            .map(|k| (KeyType::A, k))
            .or_else(|| keys.key_b.map(|k| (KeyType::B, k)));

        let trailer = self
            .read_blocks(block, BLOCK_SIZE, credential)
            .map(|raw| TrailerBlock::parse(&raw).filter(|t| t.access.is_valid()));

        match trailer {
            Ok(Some(trailer)) => {
                if let Err(_e) = self.set_access(sector, trailer.access) {
                    warn!("Could not remember the access bits of sector {}: {}", sector, _e);
                }
            }
            Ok(None) => {
                warn!("Sector {} returned invalid access bits", sector);
            }
            Err(_e) => {
                warn!("Could not read the trailer of sector {}: {}", sector, _e);
            }
        }
    }

    /// Searches key A then key B of the sector among the candidates, each over the whole
    /// list. Returns `None` if no candidate authenticates as either key.
    pub fn try_get_keys(&self, candidates: &[Key], sector: u8) -> Result<Option<DiscoveredKeys>> {
        self.family.check_sector(sector)?;

        let keys = DiscoveredKeys {
            key_a: self.find_key(candidates, sector, KeyType::A)?,
            key_b: self.find_key(candidates, sector, KeyType::B)?,
        };

        if keys.key_a.is_none() && keys.key_b.is_none() {
            return Ok(None);
        }

        self.fetch_access(sector, &keys);

        Ok(Some(keys))
    }

    /// Searches the keys of every sector. After each sector, the keys found are moved to
    /// the front of the candidates, as cards tend to share keys across sectors.
    pub fn try_get_all_keys(&self, candidates: &[Key]) -> BTreeMap<u8, SectorDiscovery> {
        let mut candidates = candidates.to_vec();
        let mut results = BTreeMap::new();

        for sector in 0..self.family.total_sectors() {
            let result = match self.try_get_keys(&candidates, sector) {
                Ok(Some(keys)) => {
                    for key in [keys.key_b, keys.key_a].into_iter().flatten() {
                        candidates.retain(|k| *k != key);
                        candidates.insert(0, key);
                    }

                    SectorDiscovery::Found(keys)
                }
                Ok(None) => SectorDiscovery::NotFound,
                Err(e) => {
                    warn!("Could not search the keys of sector {}: {}", sector, e);
                    SectorDiscovery::Failed(e)
                }
            };

            results.insert(sector, result);
        }

        results
    }
}
