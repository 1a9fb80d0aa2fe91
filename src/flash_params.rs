//! The flash-params word stored in the firmware image header
//!
//! Bytes 2 and 3 of the image at offset 0 tell the boot ROM how to talk
//! to the SPI flash chip: `mode << 8 | size << 4 | freq`. The size and
//! frequency fields are named in megabits, matching the vendor tools.

use crate::{error::Error, image::parse_u32};

fn mode_id(s: &str) -> Option<u16> {
    match s {
        "qio" => Some(0),
        "qout" => Some(1),
        "dio" => Some(2),
        "dout" => Some(3),
        _ => None,
    }
}

fn size_id(s: &str) -> Option<u16> {
    match s {
        "4m" => Some(0),
        "2m" => Some(1),
        "8m" => Some(2),
        "16m" => Some(3),
        "32m" => Some(4),
        "16m-c1" => Some(5),
        "32m-c1" => Some(6),
        "32m-c2" => Some(7),
        _ => None,
    }
}

fn freq_id(s: &str) -> Option<u16> {
    match s {
        "40m" => Some(0),
        "26m" => Some(1),
        "20m" => Some(2),
        "80m" => Some(0xf),
        _ => None,
    }
}

/// Flash size in bytes for each size id.
fn size_by_id(id: u8) -> Option<u32> {
    match id {
        0 => Some(524288),
        1 => Some(262144),
        2 => Some(1048576),
        3 => Some(2097152),
        4 => Some(4194304),
        5 => Some(2097152),
        6 => Some(4194304),
        7 => Some(4194304),
        _ => None,
    }
}

/// Parse a flash-params word from its string form.
///
/// Accepts either a bare number (the low 16 bits are used) or a
/// `mode,size,freq` triple such as `dio,4m,40m`.
pub fn flash_params_from_str(s: &str) -> Result<u16, Error> {
    let parts: Vec<&str> = s.split(',').collect();
    match parts.len() {
        1 => {
            let value = parse_u32(parts[0])?;
            Ok((value & 0xffff) as u16)
        }
        3 => {
            let mode =
                mode_id(parts[0]).ok_or_else(|| Error::InvalidFlashMode(parts[0].to_string()))?;
            let size =
                size_id(parts[1]).ok_or_else(|| Error::InvalidFlashSize(parts[1].to_string()))?;
            let freq = freq_id(parts[2])
                .ok_or_else(|| Error::InvalidFlashFrequency(parts[2].to_string()))?;
            Ok((mode << 8) | (size << 4) | freq)
        }
        _ => Err(Error::InvalidFlashParams(s.to_string())),
    }
}

/// Flash chip size in bytes encoded in a flash-params word.
pub fn flash_size_from_params(params: u16) -> Result<u32, Error> {
    let size_id = ((params & 0xff) >> 4) as u8;
    size_by_id(size_id).ok_or(Error::UnknownFlashSizeId(size_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_triples() {
        assert_eq!(flash_params_from_str("dio,4m,40m").unwrap(), 0x0200);
        assert_eq!(flash_params_from_str("qio,32m,80m").unwrap(), 0x004f);
        assert_eq!(flash_params_from_str("dout,16m-c1,20m").unwrap(), 0x0352);
    }

    #[test]
    fn parses_numbers() {
        assert_eq!(flash_params_from_str("0x1234").unwrap(), 0x1234);
        assert_eq!(flash_params_from_str("4660").unwrap(), 0x1234);
        // Only the low 16 bits are used.
        assert_eq!(flash_params_from_str("0x21234").unwrap(), 0x1234);
    }

    #[test]
    fn rejects_bad_components() {
        assert!(matches!(
            flash_params_from_str("qio,bad,40m"),
            Err(Error::InvalidFlashSize(_))
        ));
        assert!(matches!(
            flash_params_from_str("bad,4m,40m"),
            Err(Error::InvalidFlashMode(_))
        ));
        assert!(matches!(
            flash_params_from_str("qio,4m,41m"),
            Err(Error::InvalidFlashFrequency(_))
        ));
        assert!(matches!(
            flash_params_from_str("qio,4m"),
            Err(Error::InvalidFlashParams(_))
        ));
        assert!(flash_params_from_str("notanumber").is_err());
    }

    #[test]
    fn size_round_trips_through_params() {
        for (name, bytes) in [
            ("4m", 524288),
            ("2m", 262144),
            ("8m", 1048576),
            ("16m", 2097152),
            ("32m", 4194304),
            ("16m-c1", 2097152),
            ("32m-c1", 4194304),
            ("32m-c2", 4194304),
        ] {
            let params = flash_params_from_str(&format!("dio,{},40m", name)).unwrap();
            assert_eq!(flash_size_from_params(params).unwrap(), bytes, "{}", name);
        }
    }

    #[test]
    fn unknown_size_id_is_rejected() {
        assert!(matches!(
            flash_size_from_params(0x0080),
            Err(Error::UnknownFlashSizeId(8))
        ));
    }
}
