//! Device backends
//!
//! Every supported chip family implements the same four operations:
//! probe the device, build a flasher for it, report its name, and reboot
//! it into firmware. Backends are a plain enum with dispatch methods, so
//! adding a sibling chip means adding a variant and extending the
//! matches.

use std::str::FromStr;

use log::{debug, info};

use crate::{
    connection::Connection,
    error::Error,
    flasher::Flasher,
    interface::{Interface, ROM_BAUD_RATE},
    progress::Notifier,
    prompter::Prompter,
};

/// Supported chip families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Backend {
    Esp8266,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "esp8266" => Ok(Backend::Esp8266),
            _ => Err(Error::InvalidOption {
                name: "platform".to_string(),
                reason: format!("unknown platform '{}'", s),
            }),
        }
    }
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Esp8266 => "ESP8266",
        }
    }

    /// Check that a device is present and answering: sync to the ROM,
    /// read the MAC address, and return control to the loader.
    pub fn probe(&self, port_name: &str) -> Result<String, Error> {
        match self {
            Backend::Esp8266 => {
                let control = Interface::open(port_name, ROM_BAUD_RATE)?;
                let mut rom = Connection::new(control, None);

                rom.connect()?;
                let mac = rom.read_mac()?;
                let mac = format_mac(&mac);
                info!("MAC address: {}", mac);

                if let Err(e) = rom.soft_reset() {
                    debug!("soft reset failed: {}", e);
                }

                Ok(mac)
            }
        }
    }

    /// Build a flasher for a device on `port_name`.
    pub fn flasher(
        &self,
        port_name: &str,
        prompter: Box<dyn Prompter>,
        notifier: Notifier,
    ) -> Flasher {
        match self {
            Backend::Esp8266 => Flasher::new(port_name, prompter, notifier),
        }
    }

    /// Reboot the device into its firmware.
    pub fn reboot(&self, port_name: &str) -> Result<(), Error> {
        match self {
            Backend::Esp8266 => {
                let control = Interface::open(port_name, ROM_BAUD_RATE)?;
                let mut rom = Connection::new(control, None);

                // Connect first to make sure we actually control things.
                rom.connect()?;
                rom.reboot_into_firmware()
            }
        }
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!("esp8266".parse::<Backend>().unwrap(), Backend::Esp8266);
        assert_eq!("ESP8266".parse::<Backend>().unwrap(), Backend::Esp8266);
        assert!("cc3200x".parse::<Backend>().is_err());
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(
            format_mac(&[0x18, 0xfe, 0x34, 0x01, 0xab, 0xcd]),
            "18:fe:34:01:ab:cd"
        );
    }
}
