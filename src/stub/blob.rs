use serde::{Deserialize, Serialize};

/// Flasher stub object, deserialized from the JSON blob produced by the
/// stub build.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FlashStub {
    /// Entry point (address)
    entry: u32,
    /// Text (b64 encoded)
    text: String,
    /// Start of text section address
    text_start: u32,
    /// Data
    data: String,
    /// Start of data section address
    data_start: u32,
}

// Include stub object in binary
const STUB_8266: &str = include_str!("../../resources/stubs/stub_flasher_8266.json");

impl FlashStub {
    /// Fetch the flasher stub shipped with this build
    pub fn get() -> FlashStub {
        let stub: FlashStub = serde_json::from_str(STUB_8266).unwrap();

        stub
    }

    /// Fetch stub entry point
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Fetch text start address and bytes
    pub fn text(&self) -> (u32, Vec<u8>) {
        let v = base64::decode(&self.text).unwrap();
        (self.text_start, v)
    }

    /// Fetch data start address and bytes
    pub fn data(&self) -> (u32, Vec<u8>) {
        let v = base64::decode(&self.data).unwrap();
        (self.data_start, v)
    }
}

#[cfg(test)]
mod tests {
    use super::FlashStub;

    #[test]
    fn check_stub_encoding() {
        // Stub must be valid json
        let s = FlashStub::get();

        // Data decoded from b64, loaded into instruction and data RAM
        let (text_start, text) = s.text();
        let (data_start, data) = s.data();
        assert!(!text.is_empty());
        assert!(!data.is_empty());
        assert!(text_start >= 0x4010_0000);
        assert!(data_start < 0x4000_0000);
        assert!(s.entry() > text_start);
    }
}
