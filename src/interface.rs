//! Wrapper around the serial port providing the control lines used to
//! drive the ESP8266 reset circuitry.

use std::io::Read;
use std::time::Duration;

use serialport::{FlowControl, SerialPort};

use crate::error::Error;

/// Baud rate the boot ROM listens at after reset.
pub const ROM_BAUD_RATE: u32 = 115_200;

/// Wrapper around SerialPort where platform-specific modifications can be
/// implemented.
pub struct Interface {
    serial_port: Box<dyn SerialPort>,
}

impl Interface {
    /// Open the named serial port at the given baud rate.
    pub fn open(port_name: &str, baud: u32) -> Result<Self, Error> {
        let serial = serialport::new(port_name, baud)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_secs(3))
            .open()
            .map_err(|source| Error::SerialOpen {
                port: port_name.to_string(),
                source,
            })?;

        Ok(Self {
            serial_port: serial,
        })
    }

    pub fn write_data_terminal_ready(&mut self, pin_state: bool) -> serialport::Result<()> {
        self.serial_port.write_data_terminal_ready(pin_state)
    }

    pub fn write_request_to_send(&mut self, pin_state: bool) -> serialport::Result<()> {
        self.serial_port.write_request_to_send(pin_state)
    }

    pub fn serial_port(&self) -> &dyn SerialPort {
        self.serial_port.as_ref()
    }

    pub fn serial_port_mut(&mut self) -> &mut dyn SerialPort {
        self.serial_port.as_mut()
    }
}

// Note: this impl is necessary because using `dyn SerialPort` as `dyn Read`
// requires trait_upcasting which isn't stable yet.
impl Read for Interface {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.serial_port.read(buf)
    }
}
