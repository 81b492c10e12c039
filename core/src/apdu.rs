//! APDU commands of PC/SC part 3 storage cards, and their responses.

/// Class of the pseudo-APDUs interpreted by the reader.
pub const CLA_STORAGE: u8 = 0xFF;

pub const SW_SUCCESS: u16 = 0x9000;
pub const SW_VERIFY_FAILED: u16 = 0x6300;
pub const SW_FILE_NOT_FOUND: u16 = 0x6A82;

mod ins {
    pub const GET_DATA: u8 = 0xCA;
    pub const READ_BINARY: u8 = 0xB0;
    pub const WRITE_BINARY: u8 = 0xD0;
    pub const UPDATE_BINARY: u8 = 0xD6;
    pub const LOAD_KEY: u8 = 0x82;
    pub const AUTHENTICATE: u8 = 0x86;
    pub const AUTHENTICATE_OLD: u8 = 0x88;
    pub const SELECT: u8 = 0xA4;
}

const AUTH_VERSION: u8 = 0x01;
const KEY_STRUCTURE_VOLATILE: u8 = 0x00;

/// Data type requested through `GET DATA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Uid,
    Ats,
    Atr,
    SerialNumber,
}

impl DataType {
    fn p1p2(self) -> [u8; 2] {
        match self {
            Self::Uid => [0x00, 0x00],
            Self::Ats => [0x01, 0x00],
            Self::Atr => [0xFA, 0x00],
            Self::SerialNumber => [0xFF, 0x00],
        }
    }
}

/// Addressing mode of `SELECT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectMode {
    #[default]
    Name,
    Id,
}

/// An APDU command to be transmitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    payload: Option<Vec<u8>>,
    le: Option<u8>,
}

impl Command {
    /// Constructs an command with CLA, INS, P1, and P2.
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            payload: None,
            le: None,
        }
    }

    /// Constructs an command with CLA, INS, P1, P2, and Le.
    pub fn new_with_le(cla: u8, ins: u8, p1: u8, p2: u8, le: u8) -> Self {
        Self {
            le: Some(le),
            ..Self::new(cla, ins, p1, p2)
        }
    }

    /// Constructs an command with CLA, INS, P1, P2, and a payload preceded by its length.
    pub fn new_with_payload(cla: u8, ins: u8, p1: u8, p2: u8, payload: Vec<u8>) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(cla, ins, p1, p2)
        }
    }

    /// Constructs a `GET DATA` command.
    pub fn get_data(cla: u8, ty: DataType) -> Self {
        let [p1, p2] = ty.p1p2();

        Self::new_with_le(cla, ins::GET_DATA, p1, p2, 0x00)
    }

    /// Constructs a `READ BINARY` command for `len` octets from the block.
    pub fn read_binary(cla: u8, block: u16, len: u8) -> Self {
        let [p1, p2] = block.to_be_bytes();

        Self::new_with_le(cla, ins::READ_BINARY, p1, p2, len)
    }

    /// Constructs a `WRITE BINARY` command for a whole block.
    pub fn write_binary(cla: u8, block: u8, data: Vec<u8>) -> Self {
        Self::new_with_payload(cla, ins::WRITE_BINARY, 0x00, block, data)
    }

    /// Constructs an `UPDATE BINARY` command for a whole block.
    pub fn update_binary(cla: u8, block: u8, data: Vec<u8>) -> Self {
        Self::new_with_payload(cla, ins::UPDATE_BINARY, 0x00, block, data)
    }

    /// Constructs a `LOAD KEYS` command storing the key in a volatile slot of the reader.
    pub fn load_key(cla: u8, slot: u8, key: &[u8]) -> Self {
        Self::new_with_payload(
            cla,
            ins::LOAD_KEY,
            KEY_STRUCTURE_VOLATILE,
            slot,
            key.to_vec(),
        )
    }

    /// Constructs a `GENERAL AUTHENTICATE` command (PC/SC 2.07).
    pub fn authenticate(cla: u8, block: u8, key_type: u8, slot: u8) -> Self {
        Self::new_with_payload(
            cla,
            ins::AUTHENTICATE,
            KEY_STRUCTURE_VOLATILE,
            0x00,
            vec![AUTH_VERSION, 0x00, block, key_type, slot],
        )
    }

    /// Constructs the obsolete `AUTHENTICATE` command (PC/SC 2.01).
    pub fn authenticate_old(cla: u8, block: u8, key_type: u8, slot: u8) -> Self {
        Self {
            payload: Some(vec![slot]),
            ..Self::new_with_le(cla, ins::AUTHENTICATE_OLD, 0x00, block, key_type)
        }
    }

    /// Constructs a `SELECT` command.
    pub fn select(cla: u8, mode: SelectMode, aid: Vec<u8>) -> Self {
        let p1 = match mode {
            SelectMode::Name => 0x04,
            SelectMode::Id => 0x00,
        };

        Self::new_with_payload(cla, ins::SELECT, p1, 0x00, aid)
    }

    /// Converts the command into octets.
    pub fn into_bytes(self) -> Vec<u8> {
        let Self {
            cla,
            ins,
            p1,
            p2,
            payload,
            le,
        } = self;

        let mut buffer: Vec<u8> = vec![cla, ins, p1, p2];

        // The obsolete authenticate carries P3 in place of Le, followed by raw data.
        if ins == ins::AUTHENTICATE_OLD {
            buffer.extend(le);
            buffer.extend(payload.unwrap_or_default());
            return buffer;
        }

        if let Some(mut p) = payload {
            buffer.push(p.len() as u8);
            buffer.append(&mut p);
        }

        if let Some(l) = le {
            buffer.push(l);
        }

        buffer
    }
}

impl From<Command> for Vec<u8> {
    fn from(command: Command) -> Self {
        command.into_bytes()
    }
}

/// An response that was received from the card
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    payload: Vec<u8>,
    status: Option<u16>,
}

impl Response {
    /// Parses a response from the octets; the trailing two are the status word.
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        if bytes.len() < 2 {
            return Self {
                payload: bytes,
                status: None,
            };
        }

        let sw2 = bytes.pop().unwrap_or_default();
        let sw1 = bytes.pop().unwrap_or_default();

        Self {
            payload: bytes,
            status: Some(u16::from_be_bytes([sw1, sw2])),
        }
    }

    /// Status word, unless the response was too short to carry one.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Determines whether the response indicates success or not.
    pub fn is_ok(&self) -> bool {
        self.status == Some(SW_SUCCESS)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl From<Vec<u8>> for Response {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}
