//! Connection lifecycle and raw exchanges with the card.

use std::sync::{PoisonError, RwLock};

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::apdu::{Command, DataType, Response, SelectMode, SW_FILE_NOT_FOUND, SW_SUCCESS};
use crate::error::{Code, Error, ErrorKind, Result};
use crate::nfc::{ConnectMode, Protocol, Transport, TransportError};

/// Longest UID (10 octets) followed by the status word.
const UID_RESPONSE_SIZE: usize = 12;

/// Largest response of a `SELECT`, status word included.
const SELECT_RESPONSE_SIZE: usize = 258;

/// A live connection to the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardHandle {
    pub mode: ConnectMode,
    pub protocol: Protocol,
}

/// Owns the connection handle and performs the exchanges every other part builds on.
pub struct CardSession<T> {
    transport: T,
    class: u8,
    handle: RwLock<Option<CardHandle>>,
}

impl<T> CardSession<T>
where
    T: Transport,
{
    pub fn new(transport: T, class: u8) -> Self {
        Self {
            transport,
            class,
            handle: RwLock::new(None),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Class byte of the commands sent to the card.
    pub fn class(&self) -> u8 {
        self.class
    }

    pub fn handle(&self) -> Option<CardHandle> {
        *self.handle.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.handle().is_some()
    }

    fn set_handle(&self, handle: Option<CardHandle>) {
        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = handle;
    }

    /// Establishes the connection.
    pub fn connect(&self, mode: ConnectMode) -> Result<CardHandle> {
        let protocol = self.transport.connect(mode).map_err(|e| {
            Error::new(
                ErrorKind::Connect,
                Code::Failure,
                "An error occurred while connecting.",
            )
            .with_source(e)
        })?;

        let handle = CardHandle { mode, protocol };
        debug!("Connected in {} mode with protocol {:?}", mode, protocol);
        self.set_handle(Some(handle));

        Ok(handle)
    }

    /// Establishes the connection in the mode given by its name.
    pub fn connect_named(&self, mode: &str) -> Result<CardHandle> {
        let mode = mode.parse::<ConnectMode>().map_err(|e| {
            Error::new(ErrorKind::Connect, Code::CardNotConnected, e)
        })?;

        self.connect(mode)
    }

    /// Releases the connection, leaving the card in the field.
    pub fn disconnect(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::new(
                ErrorKind::Disconnect,
                Code::CardNotConnected,
                "Trying to disconnect card which is not connected.",
            ));
        }

        let result = self.transport.disconnect();
        self.set_handle(None);

        result.map_err(|e| {
            Error::new(
                ErrorKind::Disconnect,
                Code::Failure,
                "An error occurred while disconnecting.",
            )
            .with_source(e)
        })
    }

    /// Drops the handle without touching the transport, after the card left the field.
    pub fn invalidate(&self) {
        self.set_handle(None);
    }

    /// Transmits raw octets, returning the raw response with its status word.
    pub fn transmit(&self, tx: &[u8], max_len: usize) -> Result<Vec<u8>> {
        let handle = self.handle().ok_or_else(|| {
            Error::new(
                ErrorKind::Transmit,
                Code::CardNotConnected,
                "No card or connection available.",
            )
        })?;

        debug!("TX: {}", hex::encode(tx));

        let rx = self
            .transport
            .transmit(tx, max_len, handle.protocol)
            .map_err(|e| {
                if let TransportError::CardRemoved = e {
                    warn!("The card has left the field");
                    self.invalidate();
                }

                Error::new(
                    ErrorKind::Transmit,
                    Code::Failure,
                    "An error occurred while transmitting.",
                )
                .with_source(e)
            })?;

        debug!("RX: {}", hex::encode(&rx));

        Ok(rx)
    }

    /// Transmits a command, splitting the status word off the response.
    pub fn send(&self, command: Command, max_len: usize) -> Result<Response> {
        let tx = command.into_bytes();

        self.transmit(&tx, max_len).map(Response::from_bytes)
    }

    /// Sends an escape command to the reader.
    pub fn control(&self, tx: &[u8], max_len: usize) -> Result<Vec<u8>> {
        if !self.is_connected() {
            return Err(Error::new(
                ErrorKind::Control,
                Code::CardNotConnected,
                "No card or connection available.",
            ));
        }

        debug!("CTRL TX: {}", hex::encode(tx));

        let rx = self.transport.control(tx, max_len).map_err(|e| {
            Error::new(
                ErrorKind::Control,
                Code::Failure,
                "An error occurred while transmitting control.",
            )
            .with_source(e)
        })?;

        debug!("CTRL RX: {}", hex::encode(&rx));

        Ok(rx)
    }

    /// Fetches the UID of the card.
    pub fn get_uid(&self) -> Result<Vec<u8>> {
        let response = self.send(
            Command::get_data(self.class, DataType::Uid),
            UID_RESPONSE_SIZE,
        )?;

        match response.status() {
            None => Err(Error::new(
                ErrorKind::GetUid,
                Code::InvalidResponse,
                format!(
                    "Invalid response length {}. Expected minimal length is 2 bytes.",
                    response.payload().len(),
                ),
            )),
            Some(SW_SUCCESS) => Ok(response.into_payload()),
            Some(_) => Err(Error::new(
                ErrorKind::GetUid,
                Code::OperationFailed,
                "Could not get card UID.",
            )),
        }
    }

    /// Selects an application or a file, returning the payload of the response.
    pub fn select(&self, aid: &[u8], mode: SelectMode) -> Result<Vec<u8>> {
        let response = self.send(
            Command::select(self.class, mode, aid.to_vec()),
            SELECT_RESPONSE_SIZE,
        )?;

        match response.status() {
            Some(SW_SUCCESS) => Ok(response.into_payload()),
            Some(SW_FILE_NOT_FOUND) => Err(Error::new(
                ErrorKind::Transmit,
                Code::OperationFailed,
                format!("Card is not compatible with AID {}", hex::encode_upper(aid)),
            )),
            status => Err(Error::new(
                ErrorKind::Transmit,
                Code::OperationFailed,
                format!("Select operation failed: Status code: {:04X?}", status),
            )),
        }
    }
}
