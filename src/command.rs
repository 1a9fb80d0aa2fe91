//! Boot ROM protocol commands
//!
//! Every request is a single SLIP frame of the form
//! `00 <cmd> <len:le16> <checksum:le32> <payload>`. The checksum is only
//! meaningful for the data-bearing commands; everything else sends zero.

use std::io::Write;
use std::mem::size_of;
use std::time::Duration;

use bytemuck::{bytes_of, Pod, Zeroable};
use strum_macros::Display;

pub(crate) const CHECKSUM_INIT: u8 = 0xEF;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);

/// XOR checksum over `data`, seeded with `seed` (use [CHECKSUM_INIT]).
pub(crate) fn checksum(data: &[u8], mut seed: u8) -> u8 {
    for byte in data {
        seed ^= *byte;
    }
    seed
}

/// Command opcodes understood by the ESP8266 boot ROM.
#[derive(Copy, Clone, Debug, Display)]
#[repr(u8)]
#[non_exhaustive]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0a,
}

impl CommandType {
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::MemEnd => MEM_END_TIMEOUT,
            CommandType::Sync => SYNC_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn calc_timeout(timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            std::cmp::max(
                DEFAULT_TIMEOUT,
                Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
            )
        }
        match self {
            CommandType::FlashBegin => calc_timeout(ERASE_REGION_TIMEOUT_PER_MB, size),
            _ => self.timeout(),
        }
    }
}

/// A ROM command together with its payload.
#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    MemEnd {
        no_entry: bool,
        entry: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
        delay_us: u32,
    },
    ReadReg {
        address: u32,
    },
}

impl<'a> Command<'a> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
        }
    }

    pub fn timeout_for_size(&self, size: u32) -> Duration {
        self.command_type().timeout_for_size(size)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(writer, size, blocks, block_size, offset)?;
            }
            Command::FlashEnd { reboot } => {
                write_basic(writer, &[if reboot { 0 } else { 1 }], 0)?;
            }
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(writer, size, blocks, block_size, offset)?;
            }
            Command::MemData {
                pad_to,
                pad_byte,
                data,
                sequence,
            } => {
                data_command(writer, data, pad_to, pad_byte, sequence)?;
            }
            Command::MemEnd { no_entry, entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams {
                    no_entry: if no_entry { 1 } else { 0 },
                    entry,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::Sync => {
                write_basic(
                    writer,
                    &[
                        0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                    ],
                    0,
                )?;
            }
            Command::WriteReg {
                address,
                value,
                mask,
                delay_us,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct WriteRegParams {
                    addr: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                let params = WriteRegParams {
                    addr: address,
                    value,
                    mask: mask.unwrap_or(0xFFFFFFFF),
                    delay_us,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
        };
        Ok(())
    }
}

fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&((data.len() as u16).to_le_bytes()))?;
    writer.write_all(&(checksum.to_le_bytes()))?;
    writer.write_all(data)?;
    Ok(())
}

fn begin_command<W: Write>(
    writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    }
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
    };

    write_basic(writer, bytes_of(&params), 0)
}

fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);
    for _ in 0..pad_length {
        check = checksum(&[pad_byte], check);
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&((total_length as u16).to_le_bytes()))?;
    writer.write_all(&((check as u32).to_le_bytes()))?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[pad_byte])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_reg_frame_layout() {
        let mut buf = Vec::new();
        Command::ReadReg { address: 0x6000_0014 }.write(&mut buf).unwrap();

        // direction, opcode, length, checksum, payload
        assert_eq!(buf[0], 0x00);
        assert_eq!(buf[1], CommandType::ReadReg as u8);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 4);
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
        assert_eq!(&buf[8..], &0x6000_0014u32.to_le_bytes());
    }

    #[test]
    fn sync_frame_is_36_bytes_of_pattern() {
        let mut buf = Vec::new();
        Command::Sync.write(&mut buf).unwrap();

        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 36);
        assert_eq!(&buf[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(buf[12..].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn mem_data_checksum_covers_padding() {
        let mut buf = Vec::new();
        Command::MemData {
            data: &[0x01, 0x02],
            pad_to: 4,
            pad_byte: 0xff,
            sequence: 3,
        }
        .write(&mut buf)
        .unwrap();

        let expected = CHECKSUM_INIT ^ 0x01 ^ 0x02 ^ 0xff ^ 0xff;
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), expected as u32);
        // 16 byte block header plus the padded payload
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 16 + 4);
    }
}
