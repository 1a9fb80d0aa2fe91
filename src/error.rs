//! Library and application errors

use std::{fmt, io};

use miette::Diagnostic;
use strum_macros::Display;
use thiserror::Error;

use crate::{command::CommandType, slip::SlipError, spiffs::SpiffsError, stub::StubCommandType};

/// Coarse classification of an [Error], used by callers that only care
/// about the failure class (retryable, user error, data corruption, ...)
/// rather than the precise variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusKind {
    InvalidArgument,
    FailedPrecondition,
    NotFound,
    Unavailable,
    Unknown,
    DataLoss,
    Internal,
}

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("Flasher stub returned error {code:#04x} while running {command} command")]
    #[diagnostic(code(espflasher::stub::status))]
    StubStatus { command: StubCommandType, code: u8 },

    #[error("Flasher stub reported framing error {code:#04x} while running {command} command")]
    #[diagnostic(
        code(espflasher::stub::framing),
        help("The serial line dropped or corrupted bytes, try lowering the flashing baud rate")
    )]
    StubFraming { command: StubCommandType, code: u8 },

    #[error("Unexpected {len} byte response while running {command} command")]
    #[diagnostic(code(espflasher::stub::response))]
    StubResponse { command: StubCommandType, len: usize },

    #[error("Digest mismatch while running {command} command")]
    #[diagnostic(code(espflasher::stub::digest))]
    StubDigestMismatch { command: StubCommandType },

    #[error("Error while accessing the SPIFFS filesystem image")]
    #[diagnostic(code(espflasher::spiffs))]
    Spiffs(#[from] SpiffsError),

    #[error("No firmware loaded")]
    #[diagnostic(
        code(espflasher::no_firmware),
        help("Load a firmware bundle before starting a flashing run")
    )]
    NoFirmware,

    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(espflasher::serial_not_found),
        help("Make sure the correct device is connected to the host system")
    )]
    SerialNotFound(String),

    #[error("Failed to open serial port '{port}'")]
    #[diagnostic(code(espflasher::serial_open))]
    SerialOpen {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Part '{0}' has no address specified")]
    #[diagnostic(code(espflasher::bundle::no_address))]
    PartWithoutAddress(String),

    #[error("Part '{part}' has invalid address specified ({value})")]
    #[diagnostic(code(espflasher::bundle::bad_address))]
    InvalidPartAddress { part: String, value: String },

    #[error("{name}: {reason}")]
    #[diagnostic(code(espflasher::invalid_option))]
    InvalidOption { name: String, reason: String },

    #[error("Unknown option '{0}'")]
    #[diagnostic(code(espflasher::unknown_option))]
    UnknownOption(String),

    #[error("Invalid numeric value '{0}'")]
    #[diagnostic(code(espflasher::invalid_number))]
    InvalidNumber(String),

    #[error("The flash mode '{0}' is not valid")]
    #[diagnostic(
        code(espflasher::invalid_flash_mode),
        help("The accepted values are: qio, qout, dio, dout")
    )]
    InvalidFlashMode(String),

    #[error("The flash size '{0}' is not valid")]
    #[diagnostic(
        code(espflasher::invalid_flash_size),
        help("The accepted values are: 2m, 4m, 8m, 16m, 32m, 16m-c1, 32m-c1, 32m-c2")
    )]
    InvalidFlashSize(String),

    #[error("The flash frequency '{0}' is not valid")]
    #[diagnostic(
        code(espflasher::invalid_flash_frequency),
        help("The accepted values are: 40m, 26m, 20m, 80m")
    )]
    InvalidFlashFrequency(String),

    #[error("The flash params '{0}' are not valid")]
    #[diagnostic(
        code(espflasher::invalid_flash_params),
        help("Provide either a 16-bit number or a mode,size,freq triple")
    )]
    InvalidFlashParams(String),

    #[error("Unrecognized flash size id {0:#x}")]
    #[diagnostic(code(espflasher::unknown_flash_size_id))]
    UnknownFlashSizeId(u8),

    #[error("Image {len} @ {addr:#x} will not fit in flash (size {flash_size})")]
    #[diagnostic(code(espflasher::layout::image_too_big))]
    ImageTooBig {
        addr: u32,
        len: usize,
        flash_size: u32,
    },

    #[error("Image starting address ({addr:#x}) is not on flash sector boundary (sector size {sector_size})")]
    #[diagnostic(code(espflasher::layout::unaligned))]
    UnalignedImage { addr: u32, sector_size: u32 },

    #[error("Invalid magic byte in the first image")]
    #[diagnostic(
        code(espflasher::layout::bad_magic),
        help("The image flashed at offset 0 must start with the byte 0xE9")
    )]
    InvalidImageMagic,

    #[error("Image {addr:#x} overlaps with system params area ({region_size} @ {region_start:#x})")]
    #[diagnostic(code(espflasher::layout::sys_params_overlap))]
    SysParamsOverlap {
        addr: u32,
        region_size: u32,
        region_start: u32,
    },

    #[error("Images at offsets {first:#x} and {second:#x} overlap")]
    #[diagnostic(code(espflasher::layout::overlap))]
    ImagesOverlap { first: u32, second: u32 },

    #[error("Failed to flash image at {addr:#x}")]
    #[diagnostic(code(espflasher::write_failed))]
    FlashWrite {
        addr: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Digest mismatch for image {0:#x}")]
    #[diagnostic(
        code(espflasher::verification),
        help("The flash contents do not match the written image, the device may be failing")
    )]
    DigestMismatch(u32),

    #[error("Flash chip returned an invalid chip id")]
    #[diagnostic(code(espflasher::invalid_chip_id))]
    InvalidChipId,

    #[error("Canceled by user")]
    #[diagnostic(code(espflasher::canceled))]
    Canceled,

    #[error("Internal error")]
    #[diagnostic(code(espflasher::internal))]
    InternalError,
}

impl Error {
    /// The coarse status tag for this error.
    pub fn kind(&self) -> StatusKind {
        match self {
            Error::Connection(ConnectionError::DeviceNotFound) => StatusKind::NotFound,
            Error::Connection(_) | Error::Flashing(_) | Error::RomError(_) => {
                StatusKind::Unavailable
            }
            Error::StubStatus { .. } | Error::StubFraming { .. } => StatusKind::Unavailable,
            Error::StubResponse { .. } => StatusKind::Internal,
            Error::StubDigestMismatch { .. } | Error::DigestMismatch(_) => StatusKind::DataLoss,
            Error::Spiffs(_) => StatusKind::Internal,
            Error::NoFirmware => StatusKind::FailedPrecondition,
            Error::SerialNotFound(_) => StatusKind::NotFound,
            Error::SerialOpen { .. } => StatusKind::Unknown,
            Error::PartWithoutAddress(_)
            | Error::InvalidPartAddress { .. }
            | Error::InvalidOption { .. }
            | Error::UnknownOption(_)
            | Error::InvalidNumber(_)
            | Error::InvalidFlashMode(_)
            | Error::InvalidFlashSize(_)
            | Error::InvalidFlashFrequency(_)
            | Error::InvalidFlashParams(_)
            | Error::UnknownFlashSizeId(_)
            | Error::ImageTooBig { .. }
            | Error::UnalignedImage { .. }
            | Error::InvalidImageMagic
            | Error::SysParamsOverlap { .. }
            | Error::ImagesOverlap { .. } => StatusKind::InvalidArgument,
            Error::FlashWrite { .. } | Error::Canceled => StatusKind::Unavailable,
            Error::InvalidChipId | Error::InternalError => StatusKind::Internal,
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(espflasher::serial_error))]
    Serial(#[source] serialport::Error),

    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(espflasher::connection_failed),
        help(
            "Ensure that the device is connected and the reset and boot pins are not being held down. \
             Alternatively, put the device into flashing mode (GPIO0 low, reset) manually and retry."
        )
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(espflasher::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(espflasher::timeout))]
    Timeout(TimedOutCommand),

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(espflasher::slip_framing),
        help("Try hard-resetting the device and try again, if the error persists your rom might be corrupted")
    )]
    FramingError,

    #[error("Received packet too large for buffer")]
    #[diagnostic(
        code(espflasher::oversized_packet),
        help("Try hard-resetting the device and try again, if the error persists your rom might be corrupted")
    )]
    OverSizedPacket,

    #[error("Invalid stub handshake response received")]
    #[diagnostic(code(espflasher::stub_handshake))]
    InvalidStubHandshake,
}

#[derive(Debug, Default, Clone)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl From<CommandType> for TimedOutCommand {
    fn from(c: CommandType) -> Self {
        TimedOutCommand { command: Some(c) }
    }
}

impl fmt::Display for TimedOutCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => from_error_kind(kind, err),
            serialport::ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

fn from_error_kind<E: Into<serialport::Error>>(kind: io::ErrorKind, err: E) -> ConnectionError {
    match kind {
        io::ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
        io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
        _ => ConnectionError::Serial(err.into()),
    }
}

impl From<SlipError> for ConnectionError {
    fn from(err: SlipError) -> Self {
        match err {
            SlipError::FramingError => Self::FramingError,
            SlipError::OversizedPacket => Self::OverSizedPacket,
            SlipError::ReadError(io) => Self::from(io),
        }
    }
}

impl From<SlipError> for Error {
    fn from(err: SlipError) -> Self {
        Self::Connection(err.into())
    }
}

/// Error codes returned by the boot ROM.
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[repr(u8)]
#[non_exhaustive]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(espflasher::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(espflasher::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid crc")]
    #[diagnostic(code(espflasher::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(espflasher::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(espflasher::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(espflasher::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(espflasher::rom::deflate))]
    DeflateError = 0x0b,

    #[error("Other")]
    #[diagnostic(code(espflasher::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        match raw {
            0x05 => RomErrorKind::InvalidMessage,
            0x06 => RomErrorKind::FailedToAct,
            0x07 => RomErrorKind::InvalidCrc,
            0x08 => RomErrorKind::FlashWriteError,
            0x09 => RomErrorKind::FlashReadError,
            0x0a => RomErrorKind::FlashReadLengthError,
            0x0b => RomErrorKind::DeflateError,
            _ => RomErrorKind::Other,
        }
    }
}

/// An error originating from a ROM command.
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[non_exhaustive]
#[error("Error while running {command} command")]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }
}

pub(crate) trait ResultExt {
    /// mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}
