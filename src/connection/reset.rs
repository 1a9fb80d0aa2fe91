//! DTR/RTS sequences for moving the ESP8266 in and out of the boot ROM
//!
//! On the common auto-reset wiring DTR drives GPIO0 and RTS drives the
//! chip reset (EN), both through inverting transistors.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{error::Error, interface::Interface};

/// Default time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: u64 = 50; // ms
/// Amount of time to wait if the default reset delay does not work
const EXTRA_RESET_DELAY: u64 = 500; // ms

/// Some strategy for resetting a target device into its boot ROM
pub trait ResetStrategy {
    fn reset(&self, interface: &mut Interface) -> Result<(), Error>;

    fn set_dtr(&self, interface: &mut Interface, level: bool) -> Result<(), Error> {
        interface.write_data_terminal_ready(level)?;

        Ok(())
    }

    fn set_rts(&self, interface: &mut Interface, level: bool) -> Result<(), Error> {
        interface.write_request_to_send(level)?;

        Ok(())
    }
}

/// Classic reset sequence, sets DTR and RTS sequentially.
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset {
    delay: u64,
}

impl ClassicReset {
    pub fn new(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self { delay }
    }
}

impl ResetStrategy for ClassicReset {
    fn reset(&self, interface: &mut Interface) -> Result<(), Error> {
        debug!(
            "Using Classic reset strategy with delay of {}ms",
            self.delay
        );
        self.set_rts(interface, false)?;
        self.set_dtr(interface, false)?;

        self.set_rts(interface, true)?;
        self.set_dtr(interface, true)?;

        self.set_rts(interface, true)?; // EN = LOW, chip in reset
        self.set_dtr(interface, false)?; // IO0 = HIGH

        sleep(Duration::from_millis(100));

        self.set_rts(interface, false)?; // EN = HIGH, chip out of reset
        self.set_dtr(interface, true)?; // IO0 = LOW

        sleep(Duration::from_millis(self.delay));

        self.set_rts(interface, false)?;
        self.set_dtr(interface, false)?; // IO0 = HIGH, done

        Ok(())
    }
}

/// Construct the sequence of reset strategies to attempt, cycled through
/// until the device answers.
pub fn strategy_sequence() -> Vec<Box<dyn ResetStrategy>> {
    vec![
        Box::new(ClassicReset::new(false)),
        Box::new(ClassicReset::new(true)),
    ]
}

/// Reset the target device into its firmware when flashing has completed.
///
/// GPIO0 is released first so that the strapping pins sample "boot from
/// flash" when the RTS pulse resets the chip.
pub fn reset_into_firmware(serial: &mut Interface) -> Result<(), serialport::Error> {
    serial.write_data_terminal_ready(false)?;

    sleep(Duration::from_millis(100));

    serial.write_request_to_send(true)?;

    sleep(Duration::from_millis(100));

    serial.write_request_to_send(false)?;

    Ok(())
}
