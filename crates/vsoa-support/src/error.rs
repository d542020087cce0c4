use std::io;
use std::net;

/// Magic nibble that must occupy the top 4 bits of every frame's first byte.
pub const VSOA_MAGIC: u8 = 0x9;
/// Version nibble that must occupy the low 4 bits of every frame's first byte.
pub const VSOA_VERSION: u8 = 0x2;

pub type VsoaResult<T> = Result<T, VsoaError>;

/// Mirrors the two-tier retry/fatal split the codec and transport use throughout:
/// `Wait` means "try again later", anything else tears the connection down.
#[derive(Debug, Eq, PartialEq)]
pub enum VsoaError {
    Wait,
    Fatal(VsoaErrorKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum VsoaErrorKind {
    BadMagic,
    BadVersion,
    UnknownType,
    PacketTooLarge,
    DuplicateListener,
    InvalidUrl,
    BadPassword,
    NoSuchClient,
    NoSuchSlot,
    SlotTooSmall,
    QueueFull,
    PoolExhausted,
    ProtocolError,
    InUse,
    AddrParse,
    NotFound,
    Timeout,
    Io(io::ErrorKind),
}

impl From<io::Error> for VsoaError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => VsoaError::Wait,
            kind => VsoaError::Fatal(VsoaErrorKind::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for VsoaError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        VsoaError::Fatal(VsoaErrorKind::AddrParse)
    }
}

impl std::fmt::Display for VsoaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for VsoaError {}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for VsoaResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(VsoaError::Wait) => false,
            _ => true,
        }
    }
}
