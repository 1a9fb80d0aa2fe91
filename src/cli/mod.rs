//! Types and functions for the command-line interface
//!
//! The contents of this module are intended for use by the [espflasher]
//! command-line application, and are likely not of much use otherwise.
//!
//! [espflasher]: https://crates.io/crates/espflasher

use std::{fs, path::PathBuf, sync::mpsc::Receiver, thread};

use clap::Args;
use dialoguer::Select;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use miette::{bail, miette, IntoDiagnostic, Result, WrapErr};

use crate::{
    backend::Backend,
    bundle::{FirmwareBundle, FirmwarePart},
    connection::Connection,
    flasher::{self, Flasher, OptionValue},
    idblock::make_id_block,
    image::parse_u32,
    interface::{Interface, ROM_BAUD_RATE},
    progress::{Event, Notifier},
    prompter::Prompter,
    stub::StubClient,
};

/// Establish a connection with a target device
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[arg(short = 'p', long)]
    pub port: String,
}

/// Flash a firmware bundle to a target device
#[derive(Debug, Args)]
#[group(skip)]
pub struct FlashArgs {
    /// Firmware parts to write, as `ADDR=PATH` specs; append `:sys_params`
    /// to mark the system-params part
    #[arg(value_name = "ADDR=PATH", required = true, num_args = 1..)]
    pub parts: Vec<String>,
    /// Size of the flash chip, e.g. `1M` or `4194304`. Auto-detected when
    /// not specified
    #[arg(long, value_name = "SIZE")]
    pub flash_size: Option<String>,
    /// Override the params bytes of the image at offset 0. Either a
    /// `mode,size,freq` triple such as `dio,4m,40m` or a 16-bit number
    #[arg(long, value_name = "PARAMS")]
    pub flash_params: Option<String>,
    /// Perform protocol traffic over another serial port. DTR/RTS signals
    /// for rebooting still use the main port
    #[arg(long, value_name = "PORT")]
    pub flashing_data_port: Option<String>,
    /// Baud rate to use while flashing
    #[arg(long, value_name = "BAUD", default_value_t = flasher::DEFAULT_FLASH_BAUD_RATE)]
    pub flash_baud_rate: u32,
    /// Location of the SPIFFS filesystem block in flash
    #[arg(long, value_name = "OFFSET", default_value = "0xec000")]
    pub spiffs_offset: String,
    /// Size of the SPIFFS region in flash
    #[arg(long, value_name = "SIZE", default_value_t = flasher::DEFAULT_SPIFFS_SIZE as u64)]
    pub spiffs_size: u64,
    /// Merge the filesystem shipped in the bundle with the one currently
    /// on the device
    #[arg(long)]
    pub merge_flash_filesystem: bool,
    /// Dump the filesystem read back from the device into this file
    #[arg(long, value_name = "FILE")]
    pub dump_fs: Option<PathBuf>,
    /// Write everything instead of comparing flash contents with the
    /// images first
    #[arg(long)]
    pub no_minimize_writes: bool,
    /// Erase the entire chip before flashing
    #[arg(long)]
    pub erase_chip: bool,
}

/// Erase the flash chip entirely
#[derive(Debug, Args)]
pub struct EraseFlashArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Baud rate to run the flasher stub at
    #[arg(long, value_name = "BAUD", default_value_t = flasher::DEFAULT_FLASH_BAUD_RATE)]
    pub flash_baud_rate: u32,
}

/// Generate a device ID block
#[derive(Debug, Args)]
pub struct GenIdArgs {
    /// File to write the ID block to
    pub output: PathBuf,
    /// Domain the device ID is scoped to
    #[arg(long)]
    pub domain: String,
}

/// Prompter backed by an interactive terminal selection.
struct InteractivePrompter;

impl Prompter for InteractivePrompter {
    fn prompt(&self, text: &str, choices: &[&str]) -> usize {
        eprintln!("{}", text);
        match Select::new().items(choices).default(0).interact() {
            Ok(choice) => choice,
            Err(e) => {
                log::error!("Prompt failed ({}), using default: {}", e, choices[0]);
                0
            }
        }
    }
}

/// Write a firmware bundle assembled from the part specs.
pub fn flash(connect: &ConnectArgs, args: &FlashArgs) -> Result<()> {
    let bundle = bundle_from_specs(&args.parts)?;

    let (notifier, events) = Notifier::channel(64);
    let flasher = Backend::Esp8266.flasher(&connect.port, Box::new(InteractivePrompter), notifier);

    apply_flash_options(&flasher, args)?;
    flasher.set_firmware(&bundle)?;

    let total_bytes = flasher.total_bytes();
    info!("Flashing {} bytes", total_bytes);

    thread::scope(|scope| {
        scope.spawn(|| flasher.run());
        render_events(events, total_bytes)
    })
}

/// Detect a connected device and print its MAC address.
pub fn probe(connect: &ConnectArgs) -> Result<()> {
    let backend = Backend::Esp8266;
    let mac = backend.probe(&connect.port)?;
    println!("{} found, MAC address {}", backend.name(), mac);
    Ok(())
}

/// Reboot the device into its firmware.
pub fn reboot(connect: &ConnectArgs) -> Result<()> {
    Backend::Esp8266.reboot(&connect.port)?;
    info!("Rebooted into firmware");
    Ok(())
}

/// Bulk-erase the flash chip.
pub fn erase_flash(args: &EraseFlashArgs) -> Result<()> {
    let control = Interface::open(&args.connect.port, ROM_BAUD_RATE)?;
    let mut rom = Connection::new(control, None);
    rom.connect()?;

    let mut stub = StubClient::connect(&mut rom, args.flash_baud_rate)?;
    info!("Erasing chip...");
    stub.erase_chip()?;
    stub.disconnect()?;
    rom.reboot_into_firmware()?;

    info!("Flash erased");
    Ok(())
}

/// Generate an ID block and write it to a file.
pub fn generate_id(args: &GenIdArgs) -> Result<()> {
    let block = make_id_block(&args.domain);
    fs::write(&args.output, block)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write {}", args.output.display()))?;
    info!("Wrote ID block to {}", args.output.display());
    Ok(())
}

fn apply_flash_options(flasher: &Flasher, args: &FlashArgs) -> Result<()> {
    // Booleans are always passed through explicitly so that a false from
    // the user is respected rather than treated as unset.
    flasher.set_option(
        flasher::MERGE_FS_OPTION,
        OptionValue::Bool(args.merge_flash_filesystem),
    )?;
    flasher.set_option(
        flasher::NO_MINIMIZE_WRITES_OPTION,
        OptionValue::Bool(args.no_minimize_writes),
    )?;
    flasher.set_option(
        flasher::FLASH_ERASE_CHIP_OPTION,
        OptionValue::Bool(args.erase_chip),
    )?;

    if let Some(size) = &args.flash_size {
        flasher.set_option(flasher::FLASH_SIZE_OPTION, OptionValue::Str(size.clone()))?;
    }
    if let Some(params) = &args.flash_params {
        flasher.set_option(
            flasher::FLASH_PARAMS_OPTION,
            OptionValue::Str(params.clone()),
        )?;
    }
    if let Some(port) = &args.flashing_data_port {
        flasher.set_option(
            flasher::FLASHING_DATA_PORT_OPTION,
            OptionValue::Str(port.clone()),
        )?;
    }
    if let Some(path) = &args.dump_fs {
        flasher.set_option(
            flasher::DUMP_FS_OPTION,
            OptionValue::Str(path.display().to_string()),
        )?;
    }

    flasher.set_option(
        flasher::FLASH_BAUD_RATE_OPTION,
        OptionValue::Int(args.flash_baud_rate as i64),
    )?;
    let spiffs_offset = parse_u32(&args.spiffs_offset)?;
    flasher.set_option(
        flasher::SPIFFS_OFFSET_OPTION,
        OptionValue::Int(spiffs_offset as i64),
    )?;
    flasher.set_option(
        flasher::SPIFFS_SIZE_OPTION,
        OptionValue::Int(args.spiffs_size as i64),
    )?;

    Ok(())
}

fn bundle_from_specs(specs: &[String]) -> Result<FirmwareBundle> {
    let mut bundle = FirmwareBundle::new("command line");
    for spec in specs {
        let (addr, rest) = spec
            .split_once('=')
            .ok_or_else(|| miette!("Part spec '{}' must look like ADDR=PATH", spec))?;

        let (path, part_type) = match rest.rsplit_once(':') {
            Some((path, "sys_params")) => (path, Some("sys_params")),
            _ => (rest, None),
        };

        let data = fs::read(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read part {}", path))?;

        let mut part = FirmwarePart::new(path, data).with_attr("addr", addr);
        if let Some(part_type) = part_type {
            part = part.with_attr("type", part_type);
        }
        bundle.push(part);
    }
    Ok(bundle)
}

fn render_events(events: Receiver<Event>, total_bytes: usize) -> Result<()> {
    let progress = ProgressBar::new(total_bytes as u64).with_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} {msg}")
            .unwrap()
            .progress_chars("=> "),
    );

    let mut outcome = None;
    for event in events {
        match event {
            Event::Progress(bytes) => progress.set_position(bytes as u64),
            Event::Status { text, important } => {
                if important {
                    progress.println(text);
                } else {
                    progress.set_message(text);
                }
            }
            Event::Done { text, ok } => {
                outcome = Some((text, ok));
                break;
            }
        }
    }
    progress.finish_and_clear();

    match outcome {
        Some((text, true)) => {
            info!("{}", text);
            Ok(())
        }
        Some((text, false)) => bail!("{}", text),
        None => bail!("Flashing worker exited without reporting a result"),
    }
}
