//! Flash images and the ordered image map

use std::collections::BTreeMap;

use crate::error::Error;

/// A contiguous blob destined for a flash offset.
///
/// `attrs` carries the part attributes from the firmware bundle; the
/// recognized keys are `addr` and `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub addr: u32,
    pub data: Vec<u8>,
    pub attrs: BTreeMap<String, String>,
}

impl Image {
    pub fn new(addr: u32, data: Vec<u8>) -> Self {
        Image {
            addr,
            data,
            attrs: BTreeMap::new(),
        }
    }

    /// End offset (exclusive) of this image in flash.
    pub fn end(&self) -> u32 {
        self.addr + self.data.len() as u32
    }
}

/// Images keyed by address. Ascending iteration order is what makes the
/// adjacent-pair overlap check and the write order correct.
pub type ImageMap = BTreeMap<u32, Image>;

/// Parse a decimal or `0x`-prefixed hexadecimal `u32`.
pub fn parse_u32(s: &str) -> Result<u32, Error> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    };
    parsed.map_err(|_| Error::InvalidNumber(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_u32_accepts_hex_and_decimal() {
        assert_eq!(parse_u32("0xec000").unwrap(), 0xec000);
        assert_eq!(parse_u32("0X1000").unwrap(), 0x1000);
        assert_eq!(parse_u32("65536").unwrap(), 65536);
        assert_eq!(parse_u32(" 12 ").unwrap(), 12);
        assert!(parse_u32("").is_err());
        assert!(parse_u32("0xzz").is_err());
        assert!(parse_u32("-1").is_err());
    }

    #[test]
    fn image_map_iterates_in_ascending_address_order() {
        let mut images = ImageMap::new();
        images.insert(0x10000, Image::new(0x10000, vec![0; 4]));
        images.insert(0x0, Image::new(0x0, vec![0; 4]));
        images.insert(0x7c000, Image::new(0x7c000, vec![0; 4]));

        let addrs: Vec<u32> = images.keys().copied().collect();
        assert_eq!(addrs, vec![0x0, 0x10000, 0x7c000]);
    }
}
