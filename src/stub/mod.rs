//! Client for the RAM-resident flasher stub
//!
//! Once [Connection::run_stub] has uploaded the stub and jumped to it, the
//! chip stops speaking the ROM protocol. The stub protocol is much
//! simpler: every command is one SLIP frame carrying a single opcode
//! byte, optionally followed by a frame of little-endian `u32` arguments,
//! and every exchange ends with a two byte status frame (`00 00` ok,
//! `00 <code>` stub error, `01 <code>` framing error).

use std::{io::Write, thread::sleep, time::Duration};

use log::{debug, info};
use strum_macros::{Display, EnumIter};

use self::blob::FlashStub;
use crate::{
    connection::Connection,
    error::{ConnectionError, Error},
    progress::ProgressCallbacks,
    slip,
};

pub mod blob;

/// Smallest erasable unit of ESP8266 flash.
pub const FLASH_SECTOR_SIZE: u32 = 4096;
/// 16 sectors; the granularity at which bulk erase is noticeably cheaper
/// than per-sector erase.
pub const FLASH_BLOCK_SIZE: u32 = 65536;

// Rather conservative estimates, used in timeout calculations.
const FLASH_BLOCK_READ_WRITE_TIME_MS: u64 = 250;
const FLASH_BLOCK_ERASE_TIME_MS: u64 = 900;
const FLASH_ERASE_MIN_TIMEOUT_MS: u64 = 5000;
const FLASH_CHIP_ERASE_TIME_MS: u64 = 20_000;

/// Chunk size the stub uses when streaming flash contents back.
const FLASH_READ_BLOCK_SIZE: u32 = 1024;

/// Serial write granularity while streaming data to the stub.
const WRITE_CHUNK_SIZE: usize = 1024;
/// How far ahead of the stub's acks the host is allowed to run.
const MAX_IN_FLIGHT: usize = 5120;

const STUB_GREETING: &[u8] = b"OHAI";
const STATUS_TIMEOUT: Duration = Duration::from_secs(3);

/// Opcodes understood by the flasher stub.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumIter)]
#[repr(u8)]
#[non_exhaustive]
pub enum StubCommandType {
    FlashErase = 0x00,
    FlashWrite = 0x01,
    FlashRead = 0x02,
    FlashDigest = 0x03,
    FlashReadChipId = 0x04,
    FlashEraseChip = 0x05,
    BootFirmware = 0x06,
    Reboot = 0x07,
    ChangeBaud = 0x08,
    Sync = 0x09,
}

/// MD5 digests of a flash range, as computed on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestResult {
    /// Digest over the whole range.
    pub digest: [u8; 16],
    /// One digest per block when a non-zero block size was requested.
    pub block_digests: Vec<[u8; 16]>,
}

/// A connection to a running flasher stub.
///
/// Borrows the ROM connection for its whole lifetime; the stub owns the
/// serial line until [StubClient::boot_firmware] or a hard reset.
pub struct StubClient<'a> {
    rom: &'a mut Connection,
    old_baud_rate: u32,
}

impl<'a> StubClient<'a> {
    /// Upload the stub, wait for its greeting and optionally move the
    /// serial line to a faster baud rate.
    pub fn connect(rom: &'a mut Connection, speed: u32) -> Result<StubClient<'a>, Error> {
        let stub = FlashStub::get();
        rom.run_stub(&stub)?;

        let greeting = rom.with_timeout(Duration::from_millis(500), |c| c.read_frame())?;
        if greeting != STUB_GREETING {
            return Err(Error::Connection(ConnectionError::InvalidStubHandshake));
        }

        info!("Connected to flasher stub");

        let mut client = StubClient {
            rom,
            old_baud_rate: 0,
        };

        let prior_baud = client.rom.get_baud()?;
        if speed != prior_baud {
            client.change_baud(speed, prior_baud)?;
        }

        Ok(client)
    }

    /// Restore the baud rate the connection had before [StubClient::connect].
    /// The stub stays running.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        if self.old_baud_rate > 0 {
            self.rom.set_baud(self.old_baud_rate)?;
            self.old_baud_rate = 0;
        }
        Ok(())
    }

    /// Ask the stub to retune its UART, then follow it on the host side.
    ///
    /// The stub needs the prior rate as well: it calibrates its clock from
    /// the rate the ROM was synchronized at.
    fn change_baud(&mut self, new_baud: u32, prior_baud: u32) -> Result<(), Error> {
        debug!("change_baud({} -> {})", prior_baud, new_baud);

        self.send_command(StubCommandType::ChangeBaud)?;
        self.send_args(&[new_baud, prior_baud])?;
        self.read_status(StubCommandType::ChangeBaud, STATUS_TIMEOUT)?;

        self.rom.set_baud(new_baud)?;
        self.old_baud_rate = prior_baud;

        // Let the line settle, discard anything the stub said while
        // switching, then confirm liveness with a no-op round trip.
        sleep(Duration::from_millis(50));
        self.rom.drain()?;
        self.sync()?;

        Ok(())
    }

    /// No-op round trip.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.simple_cmd(StubCommandType::Sync, 500)
    }

    /// Read the SPI flash chip id: `mfg << 16 | type << 8 | capacity`.
    pub fn get_flash_chip_id(&mut self) -> Result<u32, Error> {
        debug!("get_flash_chip_id()");
        self.send_command(StubCommandType::FlashReadChipId)?;

        let frame = self.recv_frame(Duration::from_millis(1000))?;
        if frame.len() != 4 {
            return Err(Error::StubResponse {
                command: StubCommandType::FlashReadChipId,
                len: frame.len(),
            });
        }
        // Big-endian to preserve the JEDEC byte order; the low byte is
        // padding.
        let chip_id = u32::from_be_bytes(frame.try_into().unwrap()) >> 8;
        if chip_id == 0 {
            return Err(Error::InvalidChipId);
        }

        self.read_status(StubCommandType::FlashReadChipId, STATUS_TIMEOUT)?;
        Ok(chip_id)
    }

    /// Write a region of SPI flash, erasing it first if `erase` is set.
    /// Address and length must be aligned to [FLASH_SECTOR_SIZE].
    pub fn write(
        &mut self,
        addr: u32,
        data: &[u8],
        erase: bool,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        debug!("write({:#x}, {}, {})", addr, data.len(), erase);

        self.send_command(StubCommandType::FlashWrite)?;
        self.send_args(&[addr, data.len() as u32, erase as u32])?;

        if let Some(cb) = progress.as_mut() {
            cb.init(addr, data.len())
        }

        let ack_timeout = Duration::from_millis(FLASH_BLOCK_ERASE_TIME_MS);
        let mut num_sent = 0usize;
        let mut num_written = 0usize;

        while num_written < data.len() {
            let frame = self.recv_frame(ack_timeout)?;
            match frame.len() {
                4 => {
                    num_written = u32::from_le_bytes(frame.try_into().unwrap()) as usize;
                    if let Some(cb) = progress.as_mut() {
                        cb.update(num_written)
                    }
                }
                2 => {
                    // A status frame before all data was acked is always a
                    // failure report.
                    check_status_frame(StubCommandType::FlashWrite, &frame)?;
                    return Err(Error::StubResponse {
                        command: StubCommandType::FlashWrite,
                        len: frame.len(),
                    });
                }
                len => {
                    return Err(Error::StubResponse {
                        command: StubCommandType::FlashWrite,
                        len,
                    })
                }
            }

            while num_sent.saturating_sub(num_written) <= MAX_IN_FLIGHT && num_sent < data.len() {
                let to_send = (data.len() - num_sent).min(WRITE_CHUNK_SIZE);
                let port = self.rom.data_port_mut().serial_port_mut();
                port.write_all(&data[num_sent..num_sent + to_send])?;
                num_sent += to_send;
            }
        }

        let digest = self.recv_frame(ack_timeout)?;
        if digest.len() != 16 {
            return Err(Error::StubResponse {
                command: StubCommandType::FlashWrite,
                len: digest.len(),
            });
        }
        if digest.as_slice() != &md5::compute(data).0[..] {
            return Err(Error::StubDigestMismatch {
                command: StubCommandType::FlashWrite,
            });
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish()
        }

        self.read_status(StubCommandType::FlashWrite, ack_timeout)
    }

    /// Read a region of SPI flash. No alignment requirements.
    pub fn read(
        &mut self,
        addr: u32,
        size: u32,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<Vec<u8>, Error> {
        debug!("read({:#x}, {})", addr, size);

        self.send_command(StubCommandType::FlashRead)?;
        self.send_args(&[addr, size, FLASH_READ_BLOCK_SIZE])?;

        if let Some(cb) = progress.as_mut() {
            cb.init(addr, size as usize)
        }

        let mut data = Vec::with_capacity(size as usize);
        while (data.len() as u32) < size {
            let frame = self.recv_frame(STATUS_TIMEOUT)?;
            data.extend_from_slice(&frame);
            if let Some(cb) = progress.as_mut() {
                cb.update(data.len())
            }
        }
        if data.len() as u32 > size {
            return Err(Error::StubResponse {
                command: StubCommandType::FlashRead,
                len: data.len(),
            });
        }

        let digest = self.recv_frame(STATUS_TIMEOUT)?;
        if digest.len() != 16 {
            return Err(Error::StubResponse {
                command: StubCommandType::FlashRead,
                len: digest.len(),
            });
        }
        if digest.as_slice() != &md5::compute(&data).0[..] {
            return Err(Error::StubDigestMismatch {
                command: StubCommandType::FlashRead,
            });
        }

        // The hash already matched, the trailing status carries nothing new.
        let _ = self.recv_frame(STATUS_TIMEOUT)?;

        if let Some(cb) = progress.as_mut() {
            cb.finish()
        }

        Ok(data)
    }

    /// Compute MD5 digests of a flash range on the device.
    ///
    /// With a non-zero `digest_block_size` the stub sends one digest per
    /// block followed by the digest of the whole range; with zero only the
    /// overall digest.
    pub fn digest(
        &mut self,
        addr: u32,
        size: u32,
        digest_block_size: u32,
    ) -> Result<DigestResult, Error> {
        debug!("digest({:#x}, {}, {})", addr, size, digest_block_size);

        self.send_command(StubCommandType::FlashDigest)?;
        self.send_args(&[addr, size, digest_block_size])?;

        let timeout_ms = FLASH_BLOCK_READ_WRITE_TIME_MS
            * if digest_block_size > 0 {
                10
            } else {
                (size / FLASH_BLOCK_SIZE + 1) as u64
            };
        let timeout = Duration::from_millis(timeout_ms);

        let mut digest: Option<[u8; 16]> = None;
        let mut block_digests = Vec::new();
        loop {
            let frame = self.recv_frame(timeout)?;
            match frame.len() {
                16 => {
                    // Whatever digest arrived previously turned out to be a
                    // block digest; the overall one is always last.
                    let frame: [u8; 16] = frame.try_into().unwrap();
                    if let Some(prev) = digest.replace(frame) {
                        block_digests.push(prev);
                    }
                }
                2 => {
                    check_status_frame(StubCommandType::FlashDigest, &frame)?;
                    let digest = digest.ok_or(Error::StubResponse {
                        command: StubCommandType::FlashDigest,
                        len: 0,
                    })?;
                    return Ok(DigestResult {
                        digest,
                        block_digests,
                    });
                }
                len => {
                    return Err(Error::StubResponse {
                        command: StubCommandType::FlashDigest,
                        len,
                    })
                }
            }
        }
    }

    /// Erase a region of SPI flash.
    /// Address and size must be aligned to [FLASH_SECTOR_SIZE].
    pub fn erase(&mut self, addr: u32, size: u32) -> Result<(), Error> {
        debug!("erase({:#x}, {})", addr, size);

        self.send_command(StubCommandType::FlashErase)?;
        self.send_args(&[addr, size])?;

        let timeout_ms = FLASH_ERASE_MIN_TIMEOUT_MS
            .max(FLASH_BLOCK_ERASE_TIME_MS * (size / FLASH_BLOCK_SIZE + 1) as u64);
        self.read_status(StubCommandType::FlashErase, Duration::from_millis(timeout_ms))
    }

    /// Erase the entire flash chip.
    pub fn erase_chip(&mut self) -> Result<(), Error> {
        self.simple_cmd(StubCommandType::FlashEraseChip, FLASH_CHIP_ERASE_TIME_MS)
    }

    /// Jump to the flash loader routine; after this the stub is gone.
    pub fn boot_firmware(&mut self) -> Result<(), Error> {
        self.simple_cmd(StubCommandType::BootFirmware, 200)
    }

    /// Reboot the chip.
    pub fn reboot(&mut self) -> Result<(), Error> {
        self.simple_cmd(StubCommandType::Reboot, 200)
    }

    fn simple_cmd(&mut self, cmd: StubCommandType, timeout_ms: u64) -> Result<(), Error> {
        debug!("{}", cmd);
        self.send_command(cmd)?;
        self.read_status(cmd, Duration::from_millis(timeout_ms))
    }

    fn send_command(&mut self, cmd: StubCommandType) -> Result<(), Error> {
        let mut port = self.rom.data_port_mut().serial_port_mut();
        slip::send(&mut port, &[cmd as u8])?;
        port.flush()?;
        Ok(())
    }

    fn send_args(&mut self, args: &[u32]) -> Result<(), Error> {
        let payload = args_payload(args);
        let mut port = self.rom.data_port_mut().serial_port_mut();
        slip::send(&mut port, &payload)?;
        port.flush()?;
        Ok(())
    }

    fn recv_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        self.rom.with_timeout(timeout, |c| c.read_frame())
    }

    fn read_status(&mut self, cmd: StubCommandType, timeout: Duration) -> Result<(), Error> {
        let frame = self.recv_frame(timeout)?;
        check_status_frame(cmd, &frame)
    }
}

fn args_payload(args: &[u32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(args.len() * 4);
    for arg in args {
        payload.extend_from_slice(&arg.to_le_bytes());
    }
    payload
}

fn check_status_frame(cmd: StubCommandType, frame: &[u8]) -> Result<(), Error> {
    if frame.len() != 2 {
        return Err(Error::StubResponse {
            command: cmd,
            len: frame.len(),
        });
    }
    match (frame[0], frame[1]) {
        (0x00, 0x00) => Ok(()),
        (0x00, code) => Err(Error::StubStatus { command: cmd, code }),
        (_, code) => Err(Error::StubFraming { command: cmd, code }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_frames() {
        let cmd = StubCommandType::FlashWrite;

        assert!(check_status_frame(cmd, &[0x00, 0x00]).is_ok());
        assert!(matches!(
            check_status_frame(cmd, &[0x00, 0x07]),
            Err(Error::StubStatus { code: 0x07, .. })
        ));
        assert!(matches!(
            check_status_frame(cmd, &[0x01, 0x02]),
            Err(Error::StubFraming { code: 0x02, .. })
        ));
        assert!(matches!(
            check_status_frame(cmd, &[0x00]),
            Err(Error::StubResponse { len: 1, .. })
        ));
    }

    #[test]
    fn args_are_little_endian() {
        assert_eq!(
            args_payload(&[0xec000, 65536]),
            vec![0x00, 0xc0, 0x0e, 0x00, 0x00, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn opcodes_are_unique() {
        use strum::IntoEnumIterator;

        let mut opcodes: Vec<u8> = StubCommandType::iter().map(|c| c as u8).collect();
        opcodes.sort_unstable();
        opcodes.dedup();
        assert_eq!(opcodes.len(), StubCommandType::iter().count());
    }
}
