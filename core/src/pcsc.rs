//! PC/SC support for nfcard library.
//! Can be enabled by turning `pcsc` feature on.
//!
//! ## What is PC/SC?
//! PC/SC (Personal Computer/Smart Card) is an abstraction layer for communicating with Smart Cards
//! from Windows. Using this layer, applications can connect to any devices that supports PC/SC,
//! without depending on their driver implementation. Windows and macOS supports PC/SC by themselves,
//! Linux also supports by installing pcsc-lite shared library.
//!
//! Contactless readers complying with PC/SC part 3 expose storage cards through pseudo-APDUs
//! of class `0xFF`, which is what this crate speaks.
//!
//! ## Supported platform
//! Platforms that supports PC/SC are limited because they are subjected to use devices on PCs.
//! Linux, Windows and macOS are supported by pcsc-rust, backend of this implementation.
//! Refer the documentation of pcsc-rust for details:
//! <https://github.com/bluetech/pcsc-rust>
//!
//! ## Usage
//! ```rust,no_run
//! use nfcard::nfc::ConnectMode;
//! use nfcard::pcsc::Context;
//! use nfcard::{Card, CardOptions, DEFAULT_KEYS};
//!
//! let ctx = Context::try_new().unwrap();
//! let device = ctx.open(None).unwrap();
//! let atr = device.wait_for_card().unwrap();
//!
//! let card = Card::from_atr(device.transport(), &atr, CardOptions::default()).unwrap();
//! card.connect(ConnectMode::Card).unwrap();
//! card.set_all_keys(Some(DEFAULT_KEYS[0]), None).unwrap();
//!
//! let sector = card.read_sector(1, None).unwrap();
//! ```

use std::ffi::{CStr, CString};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pcsc::{Disposition, Protocols, ReaderState, Scope, ShareMode, State, MAX_BUFFER_SIZE};

#[cfg(feature = "tracing")]
use tracing::{debug, info};

use crate::nfc::{ConnectMode, Protocol, Transport, TransportError};

/// `IOCTL_CCID_ESCAPE` of the CCID driver of pcsc-lite.
const IOCTL_CCID_ESCAPE: u32 = 3500;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error occurred while communicating with PC/SC: {0}")]
    PcscError(#[from] pcsc::Error),

    #[error("Reader not found on PC/SC service")]
    ReaderNotFound,
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// PC/SC context.
pub struct Context {
    ctx: pcsc::Context,
}

impl Context {
    /// Creates a PC/SC context in user scope.
    pub fn try_new() -> Result<Self> {
        Ok(Self {
            ctx: pcsc::Context::establish(Scope::User).map_err(Error::PcscError)?,
        })
    }

    /// Lists the names of the readers known to the PC/SC service.
    pub fn readers(&self) -> Result<Vec<CString>> {
        let mut buf = [0u8; 2048];

        Ok(self
            .ctx
            .list_readers(&mut buf)
            .map_err(Error::PcscError)?
            .map(CStr::to_owned)
            .collect())
    }

    /// Finds the reader with the name, or the first one, then opens a handle to it.
    pub fn open(&self, name: Option<&str>) -> Result<Device> {
        let reader = self
            .readers()?
            .into_iter()
            .find(|r| match name {
                Some(n) => r.to_str().map(|s| s == n).unwrap_or_default(),
                None => true,
            })
            .ok_or(Error::ReaderNotFound)?;

        Ok(Device::new(self.ctx.clone(), reader))
    }
}

/// PC/SC device handle.
pub struct Device {
    ctx: pcsc::Context,
    reader: CString,
}

impl Device {
    fn new(ctx: pcsc::Context, reader: CString) -> Self {
        debug!("Using device: {}", reader.to_str().unwrap_or_default());

        Self { ctx, reader }
    }

    pub fn name(&self) -> &str {
        self.reader.to_str().unwrap_or_default()
    }

    /// Waits for a card to enter the field, returning its ATR.
    pub fn wait_for_card(&self) -> Result<Vec<u8>> {
        debug!("Waiting for a card");

        let mut states = [ReaderState::new(self.reader.clone(), State::UNAWARE)];

        loop {
            match self.ctx.get_status_change(POLL_INTERVAL, &mut states) {
                Ok(()) => {}
                Err(pcsc::Error::Timeout) => {}
                Err(e) => return Err(Error::PcscError(e)),
            }

            let state = states[0].event_state();
            if state.contains(State::PRESENT) && !state.contains(State::MUTE) {
                let atr = states[0].atr().to_vec();
                debug!("Card entered the field, ATR: {}", hex::encode(&atr));

                return Ok(atr);
            }

            info!("Still waiting for your card...");
            states[0].sync_current_state();
        }
    }

    /// Creates a transport to the cards of this reader.
    pub fn transport(&self) -> PcscTransport {
        PcscTransport {
            ctx: self.ctx.clone(),
            reader: self.reader.clone(),
            card: Mutex::new(None),
        }
    }
}

/// A transport to the card in the field of a reader, through PC/SC.
pub struct PcscTransport {
    ctx: pcsc::Context,
    reader: CString,
    card: Mutex<Option<pcsc::Card>>,
}

impl PcscTransport {
    fn card(&self) -> MutexGuard<'_, Option<pcsc::Card>> {
        self.card.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl From<pcsc::Error> for TransportError {
    fn from(e: pcsc::Error) -> Self {
        match e {
            pcsc::Error::RemovedCard | pcsc::Error::ResetCard => Self::CardRemoved,
            pcsc::Error::NoSmartcard => Self::NoCard,
            pcsc::Error::InsufficientBuffer => Self::ResponseTooLong(MAX_BUFFER_SIZE),
            e => Self::Reader(Box::new(e)),
        }
    }
}

impl Transport for PcscTransport {
    fn connect(&self, mode: ConnectMode) -> std::result::Result<Protocol, TransportError> {
        let (share, protocols) = match mode {
            ConnectMode::Direct => (ShareMode::Direct, Protocols::UNDEFINED),
            ConnectMode::Card => (ShareMode::Shared, Protocols::ANY),
        };

        let card = self.ctx.connect(&self.reader, share, protocols)?;
        *self.card() = Some(card);

        // pcsc-lite applies the active protocol on each transmission by itself.
        Ok(Protocol::Undefined)
    }

    fn disconnect(&self) -> std::result::Result<(), TransportError> {
        match self.card().take() {
            Some(card) => card
                .disconnect(Disposition::LeaveCard)
                .map_err(|(_, e)| e.into()),
            None => Err(TransportError::NoCard),
        }
    }

    fn transmit(
        &self,
        tx: &[u8],
        max_len: usize,
        _protocol: Protocol,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        let guard = self.card();
        let card = guard.as_ref().ok_or(TransportError::NoCard)?;

        let mut rx = [0u8; MAX_BUFFER_SIZE];
        let rx = card.transmit(tx, &mut rx)?;

        if rx.len() > max_len {
            return Err(TransportError::ResponseTooLong(max_len));
        }

        Ok(Vec::from(rx))
    }

    fn control(&self, tx: &[u8], max_len: usize) -> std::result::Result<Vec<u8>, TransportError> {
        let guard = self.card();
        let card = guard.as_ref().ok_or(TransportError::NoCard)?;

        let mut rx = vec![0u8; max_len];
        let rx = card.control(pcsc::ctl_code(IOCTL_CCID_ESCAPE.into()), tx, &mut rx)?;

        Ok(Vec::from(rx))
    }
}
