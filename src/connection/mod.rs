//! Establish a connection with the ESP8266 boot ROM
//!
//! The [Connection] struct abstracts over the serial connection and
//! sending/decoding of ROM commands, and provides the higher-level
//! operations the flasher builds on: register access, RAM uploads (used
//! to launch the flasher stub), MAC readout and resets.
//!
//! A connection owns up to two serial channels: the *control* channel,
//! whose DTR/RTS lines drive the reset circuitry, and an optional *data*
//! channel used for protocol traffic when the user has wired up a second,
//! faster adapter. With a single channel both roles share it.

use std::{
    io::{BufWriter, Write},
    iter::zip,
    thread::sleep,
    time::Duration,
};

use log::debug;

use self::reset::{strategy_sequence, ResetStrategy};
use crate::{
    command::{Command, CommandType},
    error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind},
    interface::Interface,
    slip::{SlipDecoder, SlipEncoder},
    stub::blob::FlashStub,
};

pub mod reset;

const MAX_CONNECT_ATTEMPTS: usize = 7;
const MAX_SYNC_ATTEMPTS: usize = 5;

/// Largest chunk the ROM accepts in a single MEM_DATA command.
const ESP_RAM_BLOCK: usize = 0x1800;
/// Block size advertised in FLASH_BEGIN during the soft reset dance.
const FLASH_WRITE_SIZE: u32 = 0x400;

const UART_CLKDIV_REG: u32 = 0x6000_0014;
const UART_CLKDIV_MASK: u32 = 0xfffff;
/// APB frequency feeding the UART divider.
const UART_CLK_FREQ: u32 = 80_000_000;

const OTP_MAC0_REG: u32 = 0x3ff0_0050;
const OTP_MAC1_REG: u32 = 0x3ff0_0054;

/// A response from a target device following a command
#[derive(Debug, Copy, Clone)]
pub struct CommandResponse {
    pub resp: u8,
    pub return_op: u8,
    pub return_length: u16,
    pub value: u32,
    pub status: u8,
    pub error: u8,
}

/// An established connection with a target device
pub struct Connection {
    control: Interface,
    data: Option<Interface>,
    decoder: SlipDecoder,
}

impl Connection {
    pub fn new(control: Interface, data: Option<Interface>) -> Self {
        Connection {
            control,
            data,
            decoder: SlipDecoder::new(),
        }
    }

    /// The channel protocol traffic runs over.
    pub(crate) fn data_port_mut(&mut self) -> &mut Interface {
        match self.data.as_mut() {
            Some(data) => data,
            None => &mut self.control,
        }
    }

    /// Put the chip into boot-ROM mode and synchronize with it.
    ///
    /// Cycles through the reset strategies, draining stale bytes between
    /// attempts. Idempotent: calling this on an already synchronized chip
    /// simply resets it back into the ROM and syncs again.
    pub fn connect(&mut self) -> Result<(), Error> {
        let sequence = strategy_sequence();

        for (_, reset_strategy) in zip(0..MAX_CONNECT_ATTEMPTS, sequence.iter().cycle()) {
            match self.connect_attempt(reset_strategy.as_ref()) {
                Ok(_) => {
                    return Ok(());
                }
                Err(e) => {
                    debug!("Failed to reset, error {:#?}, retrying", e);
                }
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Try to connect to a device with a single reset
    fn connect_attempt(&mut self, reset_strategy: &dyn ResetStrategy) -> Result<(), Error> {
        reset_strategy.reset(&mut self.control)?;
        self.drain()?;

        for _ in 0..MAX_SYNC_ATTEMPTS {
            if self.sync().is_ok() {
                return Ok(());
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Try to sync with the device for a given timeout
    pub(crate) fn sync(&mut self) -> Result<(), Error> {
        self.with_timeout(CommandType::Sync.timeout(), |connection| {
            connection.write_command(Command::Sync)?;

            sleep(Duration::from_millis(10));

            // The ROM answers a sync with a burst of identical responses,
            // drain as many as arrive before the timeout.
            let mut synced = false;
            for _ in 0..8 {
                match connection.read_response() {
                    Ok(Some(response)) if response.return_op == CommandType::Sync as u8 => {
                        if response.status == 0 {
                            synced = true;
                        } else {
                            return Err(Error::RomError(RomError::new(
                                CommandType::Sync,
                                RomErrorKind::from(response.error),
                            )));
                        }
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }

            if synced {
                Ok(())
            } else {
                Err(Error::Connection(ConnectionError::ConnectionFailed))
            }
        })
    }

    /// Discard any stale bytes sitting in the receive buffer.
    pub(crate) fn drain(&mut self) -> Result<(), Error> {
        sleep(Duration::from_millis(10));
        self.data_port_mut()
            .serial_port_mut()
            .clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    /// Set timeout for the serial port
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.data_port_mut().serial_port_mut().set_timeout(timeout)?;
        Ok(())
    }

    /// Set baud rate for the data channel
    pub fn set_baud(&mut self, speed: u32) -> Result<(), Error> {
        self.data_port_mut().serial_port_mut().set_baud_rate(speed)?;

        Ok(())
    }

    /// Get the current baud rate of the data channel
    pub fn get_baud(&mut self) -> Result<u32, Error> {
        Ok(self.data_port_mut().serial_port().baud_rate()?)
    }

    /// Run an operation with a temporary serial timeout
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        let old_timeout = {
            let serial = self.data_port_mut().serial_port_mut();
            let old_timeout = serial.timeout();
            serial.set_timeout(timeout)?;
            old_timeout
        };

        let result = f(self);

        self.data_port_mut()
            .serial_port_mut()
            .set_timeout(old_timeout)?;

        result
    }

    /// Read a single SLIP frame from the data channel.
    pub(crate) fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        let Connection {
            control,
            data,
            decoder,
        } = self;
        let port = match data.as_mut() {
            Some(data) => data,
            None => control,
        };

        let mut frame = Vec::new();
        decoder.decode(port, &mut frame)?;
        Ok(frame)
    }

    /// Read the response to a ROM command from the serial port
    pub fn read_response(&mut self) -> Result<Option<CommandResponse>, Error> {
        let frame = self.read_frame()?;

        // Direction byte, opcode, u16 length, u32 value and two status
        // bytes; anything shorter is boot noise rather than a response.
        if frame.len() < 10 || frame[0] != 0x01 {
            return Ok(None);
        }

        let header = CommandResponse {
            resp: frame[0],
            return_op: frame[1],
            return_length: u16::from_le_bytes(frame[2..][..2].try_into().unwrap()),
            value: u32::from_le_bytes(frame[4..][..4].try_into().unwrap()),
            status: frame[frame.len() - 2],
            error: frame[frame.len() - 1],
        };

        Ok(Some(header))
    }

    /// Write a command to the serial port
    pub fn write_command(&mut self, command: Command) -> Result<(), Error> {
        debug!("Writing command: {:?}", command);
        let serial = self.data_port_mut().serial_port_mut();

        serial.clear(serialport::ClearBuffer::Input)?;
        let mut writer = BufWriter::new(serial);
        let mut encoder = SlipEncoder::new(&mut writer)?;
        command.write(&mut encoder)?;
        encoder.finish()?;
        writer.flush()?;
        Ok(())
    }

    /// Write a command and read the response
    pub fn command(&mut self, command: Command) -> Result<u32, Error> {
        let ty = command.command_type();
        self.write_command(command).for_command(ty)?;

        for _ in 0..100 {
            match self.read_response().for_command(ty)? {
                Some(response) if response.return_op == ty as u8 => {
                    return if response.status != 0 {
                        Err(Error::RomError(RomError::new(
                            ty,
                            RomErrorKind::from(response.error),
                        )))
                    } else {
                        Ok(response.value)
                    }
                }
                _ => {
                    continue;
                }
            }
        }
        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Read a register with a timeout
    pub fn read_reg(&mut self, reg: u32) -> Result<u32, Error> {
        self.with_timeout(CommandType::ReadReg.timeout(), |connection| {
            connection.command(Command::ReadReg { address: reg })
        })
    }

    /// Write a register with a timeout
    pub fn write_reg(
        &mut self,
        addr: u32,
        value: u32,
        mask: Option<u32>,
        delay_us: u32,
    ) -> Result<(), Error> {
        self.with_timeout(CommandType::WriteReg.timeout(), |connection| {
            connection.command(Command::WriteReg {
                address: addr,
                value,
                mask,
                delay_us,
            })
        })?;

        Ok(())
    }

    /// Start a RAM upload.
    pub fn mem_begin(
        &mut self,
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    ) -> Result<(), Error> {
        self.with_timeout(CommandType::MemBegin.timeout(), |connection| {
            connection.command(Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            })
        })
        .flashing()?;
        Ok(())
    }

    /// Upload one chunk of a RAM image.
    pub fn mem_data(&mut self, sequence: u32, data: &[u8]) -> Result<(), Error> {
        self.with_timeout(CommandType::MemData.timeout(), |connection| {
            connection.command(Command::MemData {
                data,
                pad_to: 0,
                pad_byte: 0xff,
                sequence,
            })
        })
        .flashing()?;
        Ok(())
    }

    /// Finish a RAM upload; a non-zero entry point jumps execution there.
    pub fn mem_end(&mut self, entry: u32) -> Result<(), Error> {
        self.with_timeout(CommandType::MemEnd.timeout(), |connection| {
            connection.command(Command::MemEnd {
                no_entry: entry == 0,
                entry,
            })
        })
        .flashing()?;
        Ok(())
    }

    /// Upload the flasher stub to RAM and jump to its entry point.
    pub fn run_stub(&mut self, stub: &FlashStub) -> Result<(), Error> {
        debug!("Loading flasher stub");

        for (addr, payload) in [stub.text(), stub.data()] {
            if payload.is_empty() {
                continue;
            }
            let blocks = (payload.len() + ESP_RAM_BLOCK - 1) / ESP_RAM_BLOCK;
            self.mem_begin(payload.len() as u32, blocks as u32, ESP_RAM_BLOCK as u32, addr)?;
            for (sequence, chunk) in payload.chunks(ESP_RAM_BLOCK).enumerate() {
                self.mem_data(sequence as u32, chunk)?;
            }
        }

        self.mem_end(stub.entry())
    }

    /// Read the factory MAC address from the OTP words.
    pub fn read_mac(&mut self) -> Result<[u8; 6], Error> {
        let word0 = self.read_reg(OTP_MAC0_REG)?;
        let word1 = self.read_reg(OTP_MAC1_REG)?;

        // The OUI is not stored; it is implied by the NIC range.
        let oui: [u8; 3] = if ((word1 >> 16) & 0xff) == 0 {
            [0x18, 0xfe, 0x34]
        } else {
            [0xac, 0xd0, 0x74]
        };

        Ok([
            oui[0],
            oui[1],
            oui[2],
            ((word1 >> 8) & 0xff) as u8,
            (word1 & 0xff) as u8,
            ((word0 >> 24) & 0xff) as u8,
        ])
    }

    /// Reprogram the chip's UART divider and retune the host port.
    pub fn change_baud(&mut self, speed: u32) -> Result<(), Error> {
        self.write_reg(
            UART_CLKDIV_REG,
            UART_CLK_FREQ / speed,
            Some(UART_CLKDIV_MASK),
            0,
        )?;
        self.set_baud(speed)?;
        self.drain()?;
        Ok(())
    }

    /// Return control to the ROM loader; used after probing.
    pub fn soft_reset(&mut self) -> Result<(), Error> {
        self.command(Command::FlashBegin {
            size: 0,
            blocks: 0,
            block_size: FLASH_WRITE_SIZE,
            offset: 0,
        })?;

        // The chip reboots before answering, so only write the command.
        self.with_timeout(CommandType::FlashEnd.timeout(), |connection| {
            connection.write_command(Command::FlashEnd { reboot: true })
        })
    }

    /// Reset into the firmware via the control lines.
    ///
    /// GPIO0 is released first, then RTS is pulsed, so the chip samples
    /// "boot from flash" on its strapping pins.
    pub fn reboot_into_firmware(&mut self) -> Result<(), Error> {
        reset::reset_into_firmware(&mut self.control)?;
        Ok(())
    }
}
