//! SLIP framing as spoken by the ESP8266 boot ROM and the flasher stub
//!
//! This is the RFC 1055 variant used by the ROM serial protocol: a frame is
//! `END payload' END`, where every `0xC0` in the payload is replaced by
//! `ESC ESC_END` and every `0xDB` by `ESC ESC_ESC`.

use std::io::{Read, Write};

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Upper bound on a decoded frame. The largest frames we ever expect are
/// 1024-byte data frames from the stub, so this leaves generous headroom.
const MAX_FRAME_SIZE: usize = 32 * 1024;

/// SLIP decoder error type
#[derive(Debug)]
pub enum SlipError {
    FramingError,
    OversizedPacket,
    ReadError(std::io::Error),
}

#[derive(Debug)]
enum State {
    Normal,
    Escape,
    Error,
}

/// Streaming SLIP frame writer.
///
/// The opening `END` is written on construction, the closing one by
/// [SlipEncoder::finish].
pub struct SlipEncoder<'a, W: Write> {
    writer: &'a mut W,
    len: usize,
}

impl<'a, W: Write> SlipEncoder<'a, W> {
    /// Creates a new encoder context
    pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
        writer.write_all(&[END])?;
        Ok(Self { writer, len: 1 })
    }

    pub fn finish(self) -> std::io::Result<usize> {
        self.writer.write_all(&[END])?;
        Ok(self.len + 1)
    }
}

impl<'a, W: Write> Write for SlipEncoder<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for value in buf.iter() {
            match *value {
                END => {
                    self.writer.write_all(&[ESC, ESC_END])?;
                    self.len += 2;
                }
                ESC => {
                    self.writer.write_all(&[ESC, ESC_ESC])?;
                    self.len += 2;
                }
                _ => {
                    self.writer.write_all(&[*value])?;
                    self.len += 1;
                }
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Encode `payload` as a single frame into `writer`.
pub fn send<W: Write>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let mut encoder = SlipEncoder::new(writer)?;
    encoder.write_all(payload)?;
    encoder.finish()?;
    Ok(())
}

/// Encode `payload` as a single frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    // Writing into a Vec cannot fail.
    send(&mut out, payload).unwrap();
    out
}

/// SLIP frame reader.
///
/// Reads one byte at a time so that bytes belonging to the next frame are
/// never consumed; the stub streams frames back to back.
#[derive(Debug)]
pub struct SlipDecoder {
    state: State,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Normal,
        }
    }

    /// Decode a single frame from `source` into `sink`, returning its
    /// length. Empty frames (back to back `END` bytes) are skipped.
    pub fn decode<R: Read>(
        &mut self,
        source: &mut R,
        sink: &mut Vec<u8>,
    ) -> Result<usize, SlipError> {
        let start = sink.len();
        loop {
            let mut byte = [0u8; 1];
            source
                .read_exact(&mut byte)
                .map_err(SlipError::ReadError)?;
            let value = byte[0];

            match self.state {
                State::Normal => match value {
                    END => {
                        if sink.len() > start {
                            return Ok(sink.len() - start);
                        }
                    }
                    ESC => {
                        self.state = State::Escape;
                    }
                    _ => {
                        sink.push(value);
                    }
                },
                State::Escape => match value {
                    ESC_END => {
                        sink.push(END);
                        self.state = State::Normal;
                    }
                    ESC_ESC => {
                        sink.push(ESC);
                        self.state = State::Normal;
                    }
                    _ => {
                        self.state = State::Error;
                        return Err(SlipError::FramingError);
                    }
                },
                State::Error => {
                    // Discard until the next frame boundary.
                    if value == END {
                        sink.truncate(start);
                        self.state = State::Normal;
                    }
                }
            }

            if sink.len() - start > MAX_FRAME_SIZE {
                return Err(SlipError::OversizedPacket);
            }
        }
    }
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(input: &[u8]) -> Vec<u8> {
        let mut slip = SlipDecoder::new();
        let mut buf = Vec::new();
        let mut reader = input;
        slip.decode(&mut reader, &mut buf).unwrap();
        buf
    }

    #[test]
    fn simple_decode() {
        const INPUT: [u8; 7] = [0xc0, 0x01, 0x02, 0x03, 0x04, 0x05, 0xc0];
        const DATA: [u8; 5] = [0x01, 0x02, 0x03, 0x04, 0x05];

        assert_eq!(&DATA, decode_one(&INPUT).as_slice());
    }

    /// Ensure that [ESC, ESC_END] -> [END]
    #[test]
    fn decode_esc_then_esc_end_sequence() {
        const INPUT: [u8; 6] = [0xc0, 0x01, 0xdb, 0xdc, 0x03, 0xc0];
        const DATA: [u8; 3] = [0x01, 0xc0, 0x03];

        assert_eq!(&DATA, decode_one(&INPUT).as_slice());
    }

    /// Ensure that [ESC, ESC_ESC] -> [ESC]
    #[test]
    fn decode_esc_then_esc_esc_sequence() {
        const INPUT: [u8; 6] = [0xc0, 0x01, 0xdb, 0xdd, 0x03, 0xc0];
        const DATA: [u8; 3] = [0x01, 0xdb, 0x03];

        assert_eq!(&DATA, decode_one(&INPUT).as_slice());
    }

    #[test]
    fn decode_skips_empty_frames() {
        const INPUT: [u8; 6] = [0xc0, 0xc0, 0xc0, 0x42, 0x43, 0xc0];

        assert_eq!(&[0x42, 0x43], decode_one(&INPUT).as_slice());
    }

    #[test]
    fn decode_bad_escape_is_framing_error() {
        const INPUT: [u8; 5] = [0xc0, 0x01, 0xdb, 0x01, 0xc0];

        let mut slip = SlipDecoder::new();
        let mut buf = Vec::new();
        let mut reader = INPUT.as_ref();
        assert!(matches!(
            slip.decode(&mut reader, &mut buf),
            Err(SlipError::FramingError)
        ));
    }

    #[test]
    fn compound_decode() {
        const INPUT: [u8; 13] = [
            0xc0, 0x01, 0x02, 0x03, 0x04, 0x05, 0xc0, 0x05, 0x06, 0x07, 0x08, 0x09, 0xc0,
        ];
        const DATA_1: [u8; 5] = [0x01, 0x02, 0x03, 0x04, 0x05];
        const DATA_2: [u8; 5] = [0x05, 0x06, 0x07, 0x08, 0x09];

        let mut slip = SlipDecoder::new();
        let mut reader = INPUT.as_ref();

        let mut buf = Vec::new();
        slip.decode(&mut reader, &mut buf).unwrap();
        assert_eq!(&DATA_1, buf.as_slice());

        let mut buf = Vec::new();
        slip.decode(&mut reader, &mut buf).unwrap();
        assert_eq!(&DATA_2, buf.as_slice());
    }

    #[test]
    fn encode_escapes_delimiters() {
        let encoded = encode(&[0x01, 0xc0, 0xdb, 0x02]);
        assert_eq!(
            encoded,
            vec![0xc0, 0x01, 0xdb, 0xdc, 0xdb, 0xdd, 0x02, 0xc0]
        );

        // No END bytes other than the frame delimiters.
        assert!(!encoded[1..encoded.len() - 1].contains(&0xc0));
    }

    #[test]
    fn round_trip() {
        // Cover all byte values plus both escape-sensitive ones repeated.
        let mut payload: Vec<u8> = (0u8..=255).collect();
        payload.extend_from_slice(&[0xc0, 0xdb, 0xc0, 0xdb, 0xdc, 0xdd]);

        let encoded = encode(&payload);
        assert_eq!(decode_one(&encoded), payload);
    }
}
