//! Errors raised while talking to the card.

use std::fmt::{Display, Formatter};

/// A boxed error attached to an [`Error`] as its cause.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

/// Operation that raised the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connect,
    Disconnect,
    Transmit,
    Control,
    Read,
    Write,
    Authentication,
    LoadAuthenticationKey,
    GetUid,
    Sector,
    Access,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Connect => "ConnectError",
            Self::Disconnect => "DisconnectError",
            Self::Transmit => "TransmitError",
            Self::Control => "ControlError",
            Self::Read => "ReadError",
            Self::Write => "WriteError",
            Self::Authentication => "AuthenticationError",
            Self::LoadAuthenticationKey => "LoadAuthenticationKeyError",
            Self::GetUid => "GetUIDError",
            Self::Sector => "SectorError",
            Self::Access => "AccessError",
        })
    }
}

/// Reason of the error, from a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Code {
    CardNotConnected,
    Failure,
    OperationFailed,
    InvalidResponse,
    InvalidKey,
    InvalidKeyType,
    InvalidKeyOrKeyType,
    InvalidDataSize,
    InvalidMode,
    InvalidSector,
    AccessDenied,
    UnableToLoadKey,

    /// The card answered 0x6300 to an authentication: the key is wrong.
    VerifyFailed,
}

impl Display for Code {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::CardNotConnected => "Card Not Connected",
            Self::Failure => "Failure",
            Self::OperationFailed => "Operation Failed",
            Self::InvalidResponse => "Invalid Response",
            Self::InvalidKey => "Invalid Key",
            Self::InvalidKeyType => "Invalid KeyType",
            Self::InvalidKeyOrKeyType => "Invalid Key or KeyType",
            Self::InvalidDataSize => "Invalid Data Size",
            Self::InvalidMode => "Invalid Mode",
            Self::InvalidSector => "Invalid Sector",
            Self::AccessDenied => "Access Denied",
            Self::UnableToLoadKey => "Unable To Load Key",
            Self::VerifyFailed => "Verify Failed",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("[{kind}] {code}: {message}")]
pub struct Error {
    kind: ErrorKind,
    code: Code,
    message: String,
    #[source]
    source: Option<Cause>,
}

impl Error {
    pub fn new(kind: ErrorKind, code: Code, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches the underlying cause.
    pub fn with_source(mut self, source: impl Into<Cause>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Determines whether the card rejected the key, as opposed to the exchange failing.
    pub fn is_verify_failed(&self) -> bool {
        self.kind == ErrorKind::Authentication && self.code == Code::VerifyFailed
    }

    pub(crate) fn invalid_sector(sector: u8) -> Self {
        Self::new(
            ErrorKind::Sector,
            Code::InvalidSector,
            format!("Invalid Sector ID {}", sector),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let error = Error::new(
            ErrorKind::Authentication,
            Code::VerifyFailed,
            "Invalid Credentials.",
        );

        assert_eq!(
            "[AuthenticationError] Verify Failed: Invalid Credentials.",
            error.to_string(),
        );
        assert!(error.is_verify_failed());
    }

    #[test]
    fn test_source_is_kept() {
        use std::error::Error as _;

        let cause = std::io::Error::new(std::io::ErrorKind::Other, "gone");
        let error = Error::new(ErrorKind::Transmit, Code::Failure, "lost").with_source(cause);

        assert_eq!("gone", error.source().unwrap().to_string());
        assert!(!error.is_verify_failed());
    }
}
