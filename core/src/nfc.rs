//! Communicating with the card through a PC/SC-style reader

use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Sharing mode of the connection to the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    /// Talks to the reader itself, even with no card in the field.
    Direct,

    /// Talks to the card, sharing it with other applications.
    #[default]
    Card,
}

impl FromStr for ConnectMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "card" | "shared" => Ok(Self::Card),
            _ => Err(format!("Invalid mode: {}", s)),
        }
    }
}

/// Protocol negotiated with the card on connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    T0,
    T1,
    Raw,
    #[default]
    Undefined,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("The card has been removed from the field")]
    CardRemoved,

    #[error("No card is present in the field")]
    NoCard,

    #[error("Response exceeds the expected length of {0} bytes")]
    ResponseTooLong(usize),

    #[error("Error occurred on the reader: {0}")]
    Reader(Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// A delegate to reach the reader outside.
///
/// Implementations own the physical channel. A session calls these methods one at a
/// time per critical section, but may call them from several threads over its lifetime.
pub trait Transport {
    /// Connects to the card in the field, returning the negotiated protocol.
    fn connect(&self, mode: ConnectMode) -> Result<Protocol, TransportError>;

    /// Releases the connection, leaving the card powered in the field.
    fn disconnect(&self) -> Result<(), TransportError>;

    /// Transmits an APDU command to the card, then receives a response of at most
    /// `max_len` octets, status word included.
    fn transmit(
        &self,
        tx: &[u8],
        max_len: usize,
        protocol: Protocol,
    ) -> Result<Vec<u8>, TransportError>;

    /// Sends an escape command to the reader itself.
    fn control(&self, tx: &[u8], max_len: usize) -> Result<Vec<u8>, TransportError>;
}

impl<T> Transport for &T
where
    T: Transport + ?Sized,
{
    fn connect(&self, mode: ConnectMode) -> Result<Protocol, TransportError> {
        (**self).connect(mode)
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        (**self).disconnect()
    }

    fn transmit(
        &self,
        tx: &[u8],
        max_len: usize,
        protocol: Protocol,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).transmit(tx, max_len, protocol)
    }

    fn control(&self, tx: &[u8], max_len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).control(tx, max_len)
    }
}

impl Display for ConnectMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Card => "card",
        })
    }
}
