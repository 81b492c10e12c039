//! Authenticated block I/O, chunked by packets and split by sectors.
//!
//! Every exchange runs inside the critical section of the key slot manager. A range of
//! blocks is cut into runs sharing one sector and one credential; each run is a critical
//! section of its own, and runs are issued one after the other.

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::access::{self, AccessGroup, AccessType};
use crate::apdu::Command;
use crate::card::Card;
use crate::error::{Code, Error, ErrorKind, Result};
use crate::keys::{Key, KeyType};
use crate::nfc::Transport;
use crate::sector::{CardSector, Padding, TrailerBlock, WriteMode};
use crate::session::CardSession;

/// Key type and key to authenticate with, instead of resolving them from the access bits.
pub type Credential = Option<(KeyType, Key)>;

const STATUS_SIZE: usize = 2;

/// Longest response of a short APDU. Replies up to this size reach the length check of
/// the caller instead of failing on the transport.
const MAX_RESPONSE_SIZE: usize = 256 + STATUS_SIZE;

/// Consecutive blocks of one sector, accessed with the same credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    block: u16,
    blocks: u16,
    sector: u8,
    key_type: KeyType,
    key: Key,
}

impl<T> Card<T>
where
    T: Transport,
{
    /// Resolves the credential of each block of the range, then groups them into runs.
    fn plan(
        &self,
        block: u16,
        blocks: u16,
        credential: Credential,
        access_type: AccessType,
    ) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = Vec::new();

        for b in block..block + blocks {
            let sector = u8::try_from(b)
                .ok()
                .and_then(|b| self.family.sector_of_block(b))
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::Sector,
                        Code::InvalidSector,
                        format!("Block {} is out of the card", b),
                    )
                })?;

            let group = match self.family.trailer_block(sector) == Some(b as u8) {
                true => AccessGroup::AccessBits,
                _ => AccessGroup::Data,
            };

            let (key_type, key) = match credential {
                Some(c) => c,
                None => access::resolve(
                    self.family,
                    b as u8,
                    sector,
                    &self.sector_keys(sector)?,
                    access_type,
                    group,
                )?,
            };

            match runs.last_mut() {
                Some(run)
                    if run.sector == sector && run.key_type == key_type && run.key == key =>
                {
                    run.blocks += 1;
                }
                _ => runs.push(Run {
                    block: b,
                    blocks: 1,
                    sector,
                    key_type,
                    key,
                }),
            }
        }

        Ok(runs)
    }

    fn read_raw(&self, session: &CardSession<T>, block: u16, len: usize) -> Result<Vec<u8>> {
        let packet_size = self.family.packet_size();
        let mut buffer = Vec::with_capacity(len);

        while buffer.len() < len {
            let offset = buffer.len();
            let size = packet_size.min(len - offset);
            let target = block + (offset / self.family.block_size(block as u8)) as u16;

            let response = session.send(
                Command::read_binary(session.class(), target, size as u8),
                MAX_RESPONSE_SIZE,
            )?;

            if !response.is_ok() {
                return Err(Error::new(
                    ErrorKind::Read,
                    Code::OperationFailed,
                    format!(
                        "Read operation failed on block {}: Status code: {:04X?}",
                        target,
                        response.status(),
                    ),
                ));
            }

            let chunk = response.into_payload();
            if chunk.len() != size {
                return Err(Error::new(
                    ErrorKind::Read,
                    Code::InvalidResponse,
                    format!(
                        "Incorrect response size. Expected {}, Received {}",
                        size,
                        chunk.len(),
                    ),
                ));
            }

            buffer.extend(chunk);
        }

        Ok(buffer)
    }

    fn write_raw(
        &self,
        session: &CardSession<T>,
        block: u16,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        for (i, chunk) in data.chunks(self.family.block_size(block as u8)).enumerate() {
            let target = (block + i as u16) as u8;

            let response = session.send(
                mode.command(session.class(), target, chunk.to_vec()),
                STATUS_SIZE,
            )?;

            if !response.is_ok() {
                return Err(Error::new(
                    ErrorKind::Write,
                    Code::OperationFailed,
                    format!(
                        "Write operation failed on block {}: Status code: {:04X?}",
                        target,
                        response.status(),
                    ),
                ));
            }
        }

        Ok(())
    }

    /// Number of blocks from the block onwards, failing unless they all exist on the card.
    fn block_count(&self, block: u8, blocks: usize, kind: ErrorKind, code: Code) -> Result<u16> {
        let total = self.family.total_blocks();

        match (block as usize).checked_add(blocks) {
            Some(end) if end <= total => Ok(blocks as u16),
            _ => Err(Error::new(
                kind,
                code,
                format!(
                    "{} blocks from block {} run past the {} blocks of the card",
                    blocks, block, total,
                ),
            )),
        }
    }

    /// Reads `len` octets from the block onwards.
    pub fn read_blocks(&self, block: u8, len: usize, credential: Credential) -> Result<Vec<u8>> {
        let block_size = self.family.block_size(block);
        let blocks = self.block_count(
            block,
            len.div_ceil(block_size),
            ErrorKind::Sector,
            Code::InvalidSector,
        )?;
        let mut buffer = Vec::with_capacity(len);

        for run in self.plan(block as u16, blocks, credential, AccessType::Read)? {
            let size = (run.blocks as usize * block_size).min(len - buffer.len());

            let chunk = self.slots.with_authenticated(
                &self.session,
                run.block as u8,
                run.key_type,
                run.key,
                |session| self.read_raw(session, run.block, size),
            )?;

            buffer.extend(chunk);
        }

        Ok(buffer)
    }

    /// Writes whole blocks from the block onwards.
    pub fn write_blocks(
        &self,
        block: u8,
        data: &[u8],
        credential: Credential,
        mode: WriteMode,
    ) -> Result<()> {
        let block_size = self.family.block_size(block);
        if data.len() % block_size != 0 {
            return Err(Error::new(
                ErrorKind::Write,
                Code::InvalidDataSize,
                format!(
                    "Data of {} bytes is not a multiple of the block size",
                    data.len(),
                ),
            ));
        }

        let blocks = self.block_count(
            block,
            data.len() / block_size,
            ErrorKind::Write,
            Code::InvalidDataSize,
        )?;
        let mut offset = 0;

        for run in self.plan(block as u16, blocks, credential, AccessType::Write)? {
            let size = run.blocks as usize * block_size;
            let chunk = &data[offset..offset + size];

            self.slots.with_authenticated(
                &self.session,
                run.block as u8,
                run.key_type,
                run.key,
                |session| self.write_raw(session, run.block, chunk, mode),
            )?;

            offset += size;
        }

        Ok(())
    }

    /// Reads the whole sector, trailer included, and remembers its access bits.
    pub fn read_sector(&self, sector: u8, credential: Credential) -> Result<CardSector> {
        self.family.check_sector(sector)?;

        let raw = self.read_blocks(
            self.family.start_block(sector),
            self.family.sector_size(sector),
            credential,
        )?;
        let sector = CardSector::parse(self.family, sector, raw)?;

        if let Some(trailer) = sector.trailer().filter(|t| t.access.is_valid()) {
            self.set_access(sector.sector(), trailer.access)?;
        }

        Ok(sector)
    }

    fn check_range(&self, start: u8, end: Option<u8>) -> Result<std::ops::RangeInclusive<u8>> {
        let total = self.family.total_sectors();
        let end = end.unwrap_or(total - 1);

        if start >= total {
            return Err(Error::new(
                ErrorKind::Sector,
                Code::InvalidSector,
                format!("Invalid Start Sector Id {}", start),
            ));
        }

        if end < start || end >= total {
            return Err(Error::new(
                ErrorKind::Sector,
                Code::InvalidSector,
                format!("Invalid End Sector Id {}", end),
            ));
        }

        Ok(start..=end)
    }

    /// Reads the sectors from `start` to `end` inclusive, or to the last one if `end` is
    /// `None`, one after the other.
    pub fn read_sectors(
        &self,
        start: u8,
        end: Option<u8>,
        credential: Credential,
    ) -> Result<Vec<CardSector>> {
        self.check_range(start, end)?
            .map(|sector| self.read_sector(sector, credential))
            .collect()
    }

    /// Reads the data regions of the sectors, concatenated.
    pub fn read_data(&self, start: u8, end: Option<u8>, credential: Credential) -> Result<Vec<u8>> {
        let sectors = self.read_sectors(start, end, credential)?;

        Ok(sectors.iter().flat_map(|s| s.data().iter().copied()).collect())
    }

    /// Writes into the data region of the sector with the given policies.
    pub fn write_sector_with(
        &self,
        sector: u8,
        data: &[u8],
        credential: Credential,
        padding: Padding,
        mode: WriteMode,
    ) -> Result<()> {
        self.family.check_sector(sector)?;

        let region = self.family.sector_data_size(sector);
        if data.len() > region {
            return Err(Error::new(
                ErrorKind::Write,
                Code::InvalidDataSize,
                format!(
                    "Data of {} bytes exceeds the {} bytes of sector {}",
                    data.len(),
                    region,
                    sector,
                ),
            ));
        }

        let chunk = padding.apply(data.to_vec(), region)?;
        debug!("Writing {} bytes into sector {}", chunk.len(), sector);

        self.write_blocks(
            self.family.data_start_block(sector),
            &chunk,
            credential,
            mode,
        )
    }

    /// Writes into the data region of the sector.
    pub fn write_sector(&self, sector: u8, data: &[u8], credential: Credential) -> Result<()> {
        self.write_sector_with(
            sector,
            data,
            credential,
            self.options.padding,
            self.options.write_mode,
        )
    }

    /// Updates the data region of the sector, whatever it holds.
    pub fn update_sector(&self, sector: u8, data: &[u8], credential: Credential) -> Result<()> {
        self.write_sector_with(
            sector,
            data,
            credential,
            self.options.padding,
            WriteMode::Update,
        )
    }

    fn write_sectors_with<'a, I>(&self, sectors: I, credential: Credential, mode: WriteMode) -> Result<()>
    where
        I: IntoIterator<Item = (u8, &'a [u8])>,
    {
        for (sector, data) in sectors {
            self.write_sector_with(sector, data, credential, self.options.padding, mode)?;
        }

        Ok(())
    }

    /// Writes into the data regions of several sectors, one after the other.
    pub fn write_sectors<'a, I>(&self, sectors: I, credential: Credential) -> Result<()>
    where
        I: IntoIterator<Item = (u8, &'a [u8])>,
    {
        self.write_sectors_with(sectors, credential, self.options.write_mode)
    }

    pub fn update_sectors<'a, I>(&self, sectors: I, credential: Credential) -> Result<()>
    where
        I: IntoIterator<Item = (u8, &'a [u8])>,
    {
        self.write_sectors_with(sectors, credential, WriteMode::Update)
    }

    /// Writes the data across the data regions of the sectors from `start` onwards,
    /// never touching a trailer. Each sector resolves its own credential unless one is
    /// given.
    pub fn write_data_with(
        &self,
        data: &[u8],
        start: u8,
        credential: Credential,
        padding: Padding,
        mode: WriteMode,
    ) -> Result<()> {
        self.family.check_sector(start)?;

        let capacity: usize = (start..self.family.total_sectors())
            .map(|s| self.family.sector_data_size(s))
            .sum();
        if data.len() > capacity {
            return Err(Error::new(
                ErrorKind::Write,
                Code::InvalidDataSize,
                format!(
                    "Data of {} bytes exceeds the {} bytes available from sector {}",
                    data.len(),
                    capacity,
                    start,
                ),
            ));
        }

        let mut rest = data;
        let mut sector = start;

        while !rest.is_empty() {
            let (chunk, next) = rest.split_at(self.family.sector_data_size(sector).min(rest.len()));

            self.write_sector_with(sector, chunk, credential, padding, mode)?;

            rest = next;
            sector += 1;
        }

        Ok(())
    }

    pub fn write_data(&self, data: &[u8], start: u8, credential: Credential) -> Result<()> {
        self.write_data_with(
            data,
            start,
            credential,
            self.options.padding,
            self.options.write_mode,
        )
    }

    pub fn update_data(&self, data: &[u8], start: u8, credential: Credential) -> Result<()> {
        self.write_data_with(
            data,
            start,
            credential,
            self.options.padding,
            WriteMode::Update,
        )
    }

    /// Replaces the keys and access bits of the sector, then remembers them.
    pub fn write_trailer(
        &self,
        sector: u8,
        trailer: &TrailerBlock,
        credential: Credential,
    ) -> Result<()> {
        self.family.check_sector(sector)?;

        let block = self.family.trailer_block(sector).ok_or_else(|| {
            Error::new(
                ErrorKind::Sector,
                Code::InvalidSector,
                format!("Sector {} of {} has no trailer", sector, self.family),
            )
        })?;

        if !trailer.access.is_valid() {
            return Err(Error::new(
                ErrorKind::Access,
                Code::OperationFailed,
                format!(
                    "Access bits {} would lock sector {} for good",
                    trailer.access, sector,
                ),
            ));
        }

        self.write_blocks(block, &trailer.to_bytes(), credential, WriteMode::Write)?;

        self.set_keys(Some(trailer.key_a), Some(trailer.key_b), sector)?;
        self.set_access(sector, trailer.access)
    }
}
