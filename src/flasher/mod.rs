//! The flashing orchestrator
//!
//! [Flasher] owns one flashing run end to end: it loads the firmware
//! bundle into an ordered image map, synchronizes with the boot ROM,
//! launches the flasher stub, plans the writes (sys-params relocation,
//! layout validation, flash-params patching, optional filesystem merge
//! and write deduplication), writes and verifies every image and finally
//! reboots the device into its new firmware.
//!
//! A run executes on whatever thread calls [Flasher::run], typically a
//! dedicated worker. The internal mutex is held for the whole run, so
//! attempts to reconfigure a running flasher block. All feedback flows
//! through the notification channel and the prompter port.

use std::{
    fs,
    sync::{Mutex, PoisonError},
};

use log::{debug, info, warn};

use crate::{
    bundle::FirmwareBundle,
    connection::Connection,
    error::{ConnectionError, Error},
    flash_params::{flash_params_from_str, flash_size_from_params},
    image::{parse_u32, Image, ImageMap},
    interface::{Interface, ROM_BAUD_RATE},
    progress::{Notifier, ProgressCallbacks},
    prompter::Prompter,
    spiffs::merge_filesystems,
    stub::{StubClient, FLASH_BLOCK_SIZE, FLASH_SECTOR_SIZE},
};

// Option names. These are the wire contract for configuration
// passthrough and must not be renamed.
pub const FLASH_SIZE_OPTION: &str = "esp8266-flash-size";
pub const FLASH_PARAMS_OPTION: &str = "esp8266-flash-params";
pub const FLASHING_DATA_PORT_OPTION: &str = "esp8266-flashing-data-port";
pub const SPIFFS_OFFSET_OPTION: &str = "esp8266-spiffs-offset";
pub const SPIFFS_SIZE_OPTION: &str = "esp8266-spiffs-size";
pub const NO_MINIMIZE_WRITES_OPTION: &str = "esp8266-no-minimize-writes";
pub const FLASH_ERASE_CHIP_OPTION: &str = "esp8266-flash-erase-chip";
pub const MERGE_FS_OPTION: &str = "merge-flash-filesystem";
pub const DUMP_FS_OPTION: &str = "dump-fs";
pub const FLASH_BAUD_RATE_OPTION: &str = "flash-baud-rate";

pub const DEFAULT_SPIFFS_OFFSET: u32 = 0xec000;
pub const DEFAULT_SPIFFS_SIZE: u32 = 65536;
pub const DEFAULT_FLASH_BAUD_RATE: u32 = 230_400;

/// The last 16K of flash are reserved for system params.
const SYSTEM_PARAMS_AREA_SIZE: u32 = 16 * 1024;
const SYSTEM_PARAMS_PART_TYPE: &str = "sys_params";

/// Safe default when flash size detection fails.
const FALLBACK_FLASH_SIZE: u32 = 512 * 1024;
/// There are no params constants for flash chips beyond 4 MiB.
const MAX_PARAMS_FLASH_SIZE: u32 = 4 * 1024 * 1024;

/// A dynamically typed option value, as handed through from the
/// configuration layer.
#[derive(Debug, Clone)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Str(v)
    }
}

/// Parse a size with the vendor suffix convention: a trailing lowercase
/// `k`/`m` counts kilo-/megabits, uppercase `K`/`M` kilo-/megabytes.
/// `1M` = `1024K` = `8m` = `8192k` = 1048576 bytes.
pub fn parse_size(s: &str) -> Result<u32, Error> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1024 / 8),
        Some('m') => (&s[..s.len() - 1], 1048576 / 8),
        Some('K') => (&s[..s.len() - 1], 1024),
        Some('M') => (&s[..s.len() - 1], 1048576),
        _ => (s, 1),
    };
    parse_u32(digits.trim())?
        .checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidNumber(s.to_string()))
}

/// Drives a complete flashing run against one device.
pub struct Flasher {
    state: Mutex<FlasherState>,
}

struct FlasherState {
    port_name: String,
    prompter: Box<dyn Prompter>,
    notifier: Notifier,

    images: ImageMap,
    progress: usize,

    flash_size: u32,
    erase_chip: bool,
    override_flash_params: Option<u16>,
    merge_flash_filesystem: bool,
    flashing_port_name: Option<String>,
    flashing_speed: u32,
    minimize_writes: bool,
    spiffs_offset: u32,
    spiffs_size: u32,
    fs_dump_filename: Option<String>,
}

impl Flasher {
    /// Create a flasher for the device on `port_name`. The port itself is
    /// opened when the run starts and closed when it returns.
    pub fn new(
        port_name: impl Into<String>,
        prompter: Box<dyn Prompter>,
        notifier: Notifier,
    ) -> Self {
        Flasher {
            state: Mutex::new(FlasherState {
                port_name: port_name.into(),
                prompter,
                notifier,
                images: ImageMap::new(),
                progress: 0,
                flash_size: 0,
                erase_chip: false,
                override_flash_params: None,
                merge_flash_filesystem: false,
                flashing_port_name: None,
                flashing_speed: DEFAULT_FLASH_BAUD_RATE,
                minimize_writes: true,
                spiffs_offset: DEFAULT_SPIFFS_OFFSET,
                spiffs_size: DEFAULT_SPIFFS_SIZE,
                fs_dump_filename: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FlasherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set a configuration option by its wire name.
    pub fn set_option(&self, name: &str, value: OptionValue) -> Result<(), Error> {
        self.lock().set_option(name, value)
    }

    /// Load the parts of a firmware bundle into the image map.
    ///
    /// Every part must carry an `addr` attribute holding a decimal or hex
    /// `u32`.
    pub fn set_firmware(&self, bundle: &FirmwareBundle) -> Result<(), Error> {
        let mut state = self.lock();
        for part in &bundle.parts {
            let addr_attr = part
                .attrs
                .get("addr")
                .ok_or_else(|| Error::PartWithoutAddress(part.name.clone()))?;
            let addr = parse_u32(addr_attr).map_err(|_| Error::InvalidPartAddress {
                part: part.name.clone(),
                value: addr_attr.clone(),
            })?;
            info!("{}: {} @ {:#x}", part.name, part.data.len(), addr);
            state.images.insert(
                addr,
                Image {
                    addr,
                    data: part.data.clone(),
                    attrs: part.attrs.clone(),
                },
            );
        }
        Ok(())
    }

    /// Total number of bytes a run will account for in progress events.
    pub fn total_bytes(&self) -> usize {
        let state = self.lock();
        let mut total: usize = state.images.values().map(|i| i.data.len()).sum();
        // The filesystem is read back once before being merged.
        if state.merge_flash_filesystem {
            if let Some(fs_image) = state.images.get(&state.spiffs_offset) {
                total += fs_image.data.len();
            }
        }
        total
    }

    /// Execute the flashing run. Always finishes with a `Done` event.
    pub fn run(&self) {
        let mut state = self.lock();
        let notifier = state.notifier.clone();
        match state.run_locked() {
            Ok(()) => notifier.done("All done!", true),
            Err(e) => notifier.done(error_chain(&e), false),
        }
    }
}

impl FlasherState {
    fn set_option(&mut self, name: &str, value: OptionValue) -> Result<(), Error> {
        match name {
            FLASH_SIZE_OPTION => {
                self.flash_size = match value {
                    OptionValue::Str(s) => parse_size(&s)?,
                    OptionValue::Int(i) if i > 0 => i as u32,
                    _ => return invalid_option(name, "value must be a size string"),
                };
                Ok(())
            }
            FLASH_ERASE_CHIP_OPTION => {
                self.erase_chip = expect_bool(name, value)?;
                Ok(())
            }
            MERGE_FS_OPTION => {
                self.merge_flash_filesystem = expect_bool(name, value)?;
                Ok(())
            }
            FLASH_PARAMS_OPTION => {
                self.override_flash_params = Some(match value {
                    OptionValue::Str(s) => flash_params_from_str(&s)?,
                    OptionValue::Int(i) => (i & 0xffff) as u16,
                    _ => return invalid_option(name, "value must be a number or a string"),
                });
                Ok(())
            }
            FLASHING_DATA_PORT_OPTION => {
                let OptionValue::Str(s) = value else {
                    return invalid_option(name, "value must be a string");
                };
                self.flashing_port_name = if s.is_empty() { None } else { Some(s) };
                Ok(())
            }
            FLASH_BAUD_RATE_OPTION => {
                let OptionValue::Int(i) = value else {
                    return invalid_option(name, "value must be a positive integer");
                };
                self.flashing_speed = if i > 0 {
                    i as u32
                } else {
                    DEFAULT_FLASH_BAUD_RATE
                };
                Ok(())
            }
            DUMP_FS_OPTION => {
                let OptionValue::Str(s) = value else {
                    return invalid_option(name, "value must be a string");
                };
                self.fs_dump_filename = if s.is_empty() { None } else { Some(s) };
                Ok(())
            }
            SPIFFS_OFFSET_OPTION => {
                self.spiffs_offset = expect_positive_int(name, value)?;
                Ok(())
            }
            SPIFFS_SIZE_OPTION => {
                self.spiffs_size = expect_positive_int(name, value)?;
                Ok(())
            }
            NO_MINIMIZE_WRITES_OPTION => {
                self.minimize_writes = !expect_bool(name, value)?;
                Ok(())
            }
            _ => Err(Error::UnknownOption(name.to_string())),
        }
    }

    fn run_locked(&mut self) -> Result<(), Error> {
        if self.images.is_empty() {
            return Err(Error::NoFirmware);
        }
        let notifier = self.notifier.clone();
        self.progress = 0;
        notifier.progress(0);

        let control = Interface::open(&self.port_name, ROM_BAUD_RATE)?;
        let data = self.open_flashing_data_port()?;
        let mut rom = Connection::new(control, data);

        notifier.status("Connecting to ROM...", true);
        loop {
            match rom.connect() {
                Ok(()) => break,
                Err(e) => {
                    log::error!("{}", error_chain(&e));
                    let msg = format!(
                        "Failed to talk to bootloader. Check the wiring, or put the \
                         device into flashing mode (GPIO0 = 0, reset) manually and \
                         retry now.\n\nError: {}",
                        error_chain(&e)
                    );
                    if self.prompter.prompt(&msg, &["Retry", "Cancel"]) == 1 {
                        return Err(Error::Connection(ConnectionError::ConnectionFailed));
                    }
                }
            }
        }

        notifier.status(format!("Running flasher @ {}...", self.flashing_speed), true);
        let mut stub = StubClient::connect(&mut rom, self.flashing_speed)?;

        let flash_size = self.resolve_flash_size(&mut stub)?;
        info!("Flash size: {}", flash_size);

        // Based on our knowledge of flash size, move the sys-params image
        // to its final home.
        if let Some((from, to)) = adjust_sys_params_location(&mut self.images, flash_size) {
            notifier.status(
                format!("Sys params image moved from {:#x} to {:#x}", from, to),
                true,
            );
        }

        sanity_check_images(&self.images, flash_size, FLASH_SECTOR_SIZE)?;

        if self.images.get(&0).map_or(false, |i| i.data.len() >= 4) {
            let params = match self.override_flash_params {
                Some(params) => params,
                None => {
                    // Detected size + DIO @ 40MHz is a safe default.
                    // Advanced users wishing to use other modes and
                    // frequencies can override.
                    let clamped = flash_size.min(MAX_PARAMS_FLASH_SIZE);
                    flash_params_from_str(&format!("dio,{}m,40m", clamped * 8 / 1048576))?
                }
            };
            patch_flash_params(&mut self.images, params);
            notifier.status(format!("Setting flash params to {:#06x}", params), true);
        }

        info!("SPIFFS params: {} @ {:#x}", self.spiffs_size, self.spiffs_offset);
        if self.merge_flash_filesystem && self.images.contains_key(&self.spiffs_offset) {
            let merged = self.merge_flash(&mut stub)?;
            if merged.is_empty() {
                // Keep the filesystem already on the device.
                self.images.remove(&self.spiffs_offset);
            } else if let Some(image) = self.images.get_mut(&self.spiffs_offset) {
                image.data = merged;
            }
            notifier.status("Merged flash content", true);
        } else if self.merge_flash_filesystem {
            info!("No SPIFFS image in new firmware");
        }

        let flash_images = if self.erase_chip {
            notifier.status("Erasing chip...", true);
            stub.erase_chip()?;
            self.images.clone()
        } else if self.minimize_writes {
            self.dedup_images(&mut stub)
        } else {
            self.images.clone()
        };

        notifier.status("Writing...", true);
        for (addr, image) in &flash_images {
            notifier.progress(self.progress);
            let orig_len = image.data.len();

            let mut data = image.data.clone();
            let sector = FLASH_SECTOR_SIZE as usize;
            if data.len() % sector != 0 {
                data.resize(data.len() + sector - data.len() % sector, 0x00);
            }

            notifier.status(format!("  {} @ {:#x}...", data.len(), addr), true);
            let mut relay = RelayProgress {
                notifier: &notifier,
                base: self.progress,
                cap: orig_len,
            };
            stub.write(*addr, &data, true, Some(&mut relay))
                .map_err(|e| Error::FlashWrite {
                    addr: *addr,
                    source: Box::new(e),
                })?;
            self.progress += orig_len;
        }

        notifier.status("Verifying...", true);
        for (addr, image) in &self.images {
            let digests = stub.digest(*addr, image.data.len() as u32, 0)?;
            debug!(
                "{:#x} {} host {:02x?} device {:02x?}",
                addr,
                image.data.len(),
                md5::compute(&image.data).0,
                digests.digest
            );
            verify_image_digest(image, &digests.digest)?;
            notifier.status(format!("  {} @ {:#x} ok", image.data.len(), addr), true);
        }

        notifier.status("Flashing successful, booting firmware...", true);

        // Rebooting the ESP8266 "properly" from software is not possible
        // at this point: GPIO0 is still strapped low, so every software
        // reset lands back in the boot loader. The stub instead jumps
        // straight to the flash loader routine, which works even without
        // RTS and DTR connected, at the price of the firmware not being
        // able to reboot itself cleanly later. Pulsing RTS gives boards
        // with wired-up control lines a real hardware reset. Doing both
        // makes both kinds of setups work.
        let booted = stub.boot_firmware();
        stub.disconnect()?;
        rom.reboot_into_firmware()?;
        booted
    }

    fn resolve_flash_size(&mut self, stub: &mut StubClient) -> Result<u32, Error> {
        if let Some(params) = self.override_flash_params {
            return flash_size_from_params(params);
        }
        if self.flash_size != 0 {
            return Ok(self.flash_size);
        }

        info!("Detecting flash size...");
        let mut flash_size = 0u32;
        match stub.get_flash_chip_id() {
            Ok(chip_id) => {
                let mfg = (chip_id >> 16) & 0xff;
                let device_type = (chip_id >> 8) & 0xff;
                let capacity = chip_id & 0xff;
                info!(
                    "Flash chip ID: {:#x} {:#x} {:#x}",
                    mfg, device_type, capacity
                );
                if mfg != 0 && (0x13..0x20).contains(&capacity) {
                    // Capacity is the power of two.
                    flash_size = 1 << capacity;
                }
            }
            Err(e) => {
                debug!("getFlashChipID: {}", error_chain(&e));
            }
        }

        if flash_size == 0 {
            warn!(
                "Failed to detect flash size, defaulting to 512K. You may want \
                 to specify the size explicitly using the flash-size option."
            );
            flash_size = FALLBACK_FLASH_SIZE;
        } else {
            self.notifier
                .status(format!("Detected flash size: {}", flash_size), true);
        }
        Ok(flash_size)
    }

    fn open_flashing_data_port(&self) -> Result<Option<Interface>, Error> {
        let Some(name) = &self.flashing_port_name else {
            return Ok(None);
        };

        let ports = serialport::available_ports().map_err(Error::from)?;
        if !ports.iter().any(|p| &p.port_name == name) {
            return Err(Error::SerialNotFound(name.clone()));
        }

        Interface::open(name, ROM_BAUD_RATE).map(Some)
    }

    /// Read the filesystem from the device and merge the update into it.
    ///
    /// Returns the bytes to flash, or an empty vector when the device
    /// filesystem should be kept untouched.
    fn merge_flash(&mut self, stub: &mut StubClient) -> Result<Vec<u8>, Error> {
        let notifier = self.notifier.clone();
        notifier.status(
            format!(
                "Reading file system image ({} @ {:#x})...",
                self.spiffs_size, self.spiffs_offset
            ),
            true,
        );

        let mut relay = RelayProgress {
            notifier: &notifier,
            base: self.progress,
            cap: self.spiffs_size as usize,
        };
        let device_fs = stub.read(self.spiffs_offset, self.spiffs_size, Some(&mut relay))?;
        self.progress += self.spiffs_size as usize;

        if let Some(path) = &self.fs_dump_filename {
            if let Err(e) = fs::write(path, &device_fs) {
                log::error!("Failed to write {}: {}", path, e);
            }
        }

        let update = match self.images.get(&self.spiffs_offset) {
            Some(image) => &image.data,
            None => return Err(Error::InternalError),
        };

        match merge_filesystems(&device_fs, update) {
            Ok(merged) => Ok(merged),
            Err(e) => {
                let msg = format!(
                    "Failed to merge file system: {}\nWhat should we do?",
                    e
                );
                log::error!("{}", msg);
                match self
                    .prompter
                    .prompt(&msg, &["Cancel", "Write new", "Keep old"])
                {
                    1 => Ok(update.clone()),
                    2 => Ok(Vec::new()),
                    _ => Err(Error::Spiffs(e)),
                }
            }
        }
    }

    /// Skip sectors whose contents already match the device.
    ///
    /// Asks the stub for per-sector digests of each image's range and
    /// fragments the image into the runs of sectors that actually differ.
    /// Falls back to writing everything when digests cannot be obtained.
    fn dedup_images(&mut self, stub: &mut StubClient) -> ImageMap {
        let notifier = self.notifier.clone();
        notifier.status("Deduping...", true);

        let mut result = ImageMap::new();
        let mut skipped_total = 0usize;
        for (addr, image) in &self.images {
            info!("Checksumming {} @ {:#x}...", image.data.len(), addr);
            let digests = match stub.digest(*addr, image.data.len() as u32, FLASH_SECTOR_SIZE) {
                Ok(digests) => digests,
                Err(e) => {
                    warn!("Error computing digest: {}", error_chain(&e));
                    return self.images.clone();
                }
            };

            let plan = plan_dedup(image, &digests.block_digests);
            info!(
                "{:#x} was {} now {} diff {}",
                addr,
                image.data.len(),
                image.data.len() - plan.skipped,
                plan.skipped
            );

            // There's a price for fragmenting a large image: erasing many
            // individual sectors is slower than erasing a whole block. So
            // unless the difference is substantial, don't bother.
            if plan.skipped >= FLASH_BLOCK_SIZE as usize {
                notifier.status(
                    format!(
                        "  {} @ {:#x} reduced to {}",
                        image.data.len(),
                        addr,
                        image.data.len() - plan.skipped
                    ),
                    true,
                );
                for fragment in plan.fragments {
                    result.insert(fragment.addr, fragment);
                }
                skipped_total += plan.skipped;
            } else {
                result.insert(*addr, image.clone());
            }
        }

        self.progress += skipped_total;
        self.notifier.progress(self.progress);
        debug!("After deduping: {} images", result.len());
        result
    }
}

/// Move the image tagged `type=sys_params` to the end of flash.
///
/// Returns the old and new address when a move happened. There can only
/// be one sys-params image.
pub(crate) fn adjust_sys_params_location(
    images: &mut ImageMap,
    flash_size: u32,
) -> Option<(u32, u32)> {
    let sys_params_begin = flash_size - SYSTEM_PARAMS_AREA_SIZE;
    let from = images
        .iter()
        .find(|(_, image)| {
            image.attrs.get("type").map(String::as_str) == Some(SYSTEM_PARAMS_PART_TYPE)
                && image.addr != sys_params_begin
        })
        .map(|(addr, _)| *addr)?;

    let mut image = images.remove(&from)?;
    image.addr = sys_params_begin;
    images.insert(sys_params_begin, image);
    Some((from, sys_params_begin))
}

/// Enforce the layout invariants on the image set.
///
/// Iteration is in ascending address order, so overlap detection only
/// needs to compare adjacent pairs.
pub(crate) fn sanity_check_images(
    images: &ImageMap,
    flash_size: u32,
    flash_sector_size: u32,
) -> Result<(), Error> {
    let sys_params_begin = flash_size - SYSTEM_PARAMS_AREA_SIZE;
    let mut prev: Option<(u32, u64)> = None;

    for (addr, image) in images {
        let image_begin = *addr;
        let image_end = image_begin as u64 + image.data.len() as u64;

        if image_begin >= flash_size || image_end > flash_size as u64 {
            return Err(Error::ImageTooBig {
                addr: image_begin,
                len: image.data.len(),
                flash_size,
            });
        }
        if image_begin % flash_sector_size != 0 {
            return Err(Error::UnalignedImage {
                addr: image_begin,
                sector_size: flash_sector_size,
            });
        }
        if image_begin == 0 && !image.data.is_empty() && image.data[0] != 0xE9 {
            return Err(Error::InvalidImageMagic);
        }

        let is_sys_params = image_begin == sys_params_begin
            && image.attrs.get("type").map(String::as_str) == Some(SYSTEM_PARAMS_PART_TYPE);
        if !is_sys_params && image_end > sys_params_begin as u64 {
            return Err(Error::SysParamsOverlap {
                addr: image_begin,
                region_size: SYSTEM_PARAMS_AREA_SIZE,
                region_start: sys_params_begin,
            });
        }

        if let Some((prev_begin, prev_end)) = prev {
            if prev_end > image_begin as u64 {
                return Err(Error::ImagesOverlap {
                    first: prev_begin,
                    second: image_begin,
                });
            }
        }
        prev = Some((image_begin, image_end));
    }
    Ok(())
}

/// Write the flash-params word into bytes 2 and 3 of the image at offset
/// 0, high byte first.
pub(crate) fn patch_flash_params(images: &mut ImageMap, params: u16) {
    if let Some(image) = images.get_mut(&0) {
        if image.data.len() >= 4 {
            image.data[2] = (params >> 8) as u8;
            image.data[3] = (params & 0xff) as u8;
        }
    }
}

pub(crate) struct DedupPlan {
    /// Sub-images covering the runs of sectors that differ, ascending.
    pub fragments: Vec<Image>,
    /// Bytes whose sectors already match the device.
    pub skipped: usize,
}

/// Compare an image against the device's per-sector digests and plan the
/// minimal set of writes.
pub(crate) fn plan_dedup(image: &Image, device_digests: &[[u8; 16]]) -> DedupPlan {
    let sector = FLASH_SECTOR_SIZE as usize;
    let num_sectors = (image.data.len() + sector - 1) / sector;

    let mut fragments = Vec::new();
    let mut skipped = 0usize;
    let mut run_start: Option<usize> = None;

    for i in 0..num_sectors {
        let offset = i * sector;
        let len = sector.min(image.data.len() - offset);
        let digest = md5::compute(&image.data[offset..offset + len]).0;

        if device_digests.get(i) == Some(&digest) {
            // Sector is already on the device; flush the pending run.
            if let Some(start) = run_start.take() {
                fragments.push(sub_image(image, start, offset));
            }
            skipped += len;
        } else if run_start.is_none() {
            run_start = Some(offset);
        }
    }
    if let Some(start) = run_start {
        fragments.push(sub_image(image, start, image.data.len()));
    }

    DedupPlan { fragments, skipped }
}

fn sub_image(image: &Image, start: usize, end: usize) -> Image {
    Image {
        addr: image.addr + start as u32,
        data: image.data[start..end].to_vec(),
        attrs: image.attrs.clone(),
    }
}

fn verify_image_digest(image: &Image, device_digest: &[u8; 16]) -> Result<(), Error> {
    if *device_digest == md5::compute(&image.data).0 {
        Ok(())
    } else {
        Err(Error::DigestMismatch(image.addr))
    }
}

fn invalid_option(name: &str, reason: &str) -> Result<(), Error> {
    Err(Error::InvalidOption {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

fn expect_bool(name: &str, value: OptionValue) -> Result<bool, Error> {
    match value {
        OptionValue::Bool(b) => Ok(b),
        _ => Err(Error::InvalidOption {
            name: name.to_string(),
            reason: "value must be boolean".to_string(),
        }),
    }
}

fn expect_positive_int(name: &str, value: OptionValue) -> Result<u32, Error> {
    match value {
        OptionValue::Int(i) if i > 0 && i <= u32::MAX as i64 => Ok(i as u32),
        _ => Err(Error::InvalidOption {
            name: name.to_string(),
            reason: "value must be a positive integer".to_string(),
        }),
    }
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}

struct RelayProgress<'a> {
    notifier: &'a Notifier,
    base: usize,
    cap: usize,
}

impl ProgressCallbacks for RelayProgress<'_> {
    fn init(&mut self, _addr: u32, _total: usize) {}

    fn update(&mut self, current: usize) {
        self.notifier.progress(self.base + current.min(self.cap));
    }

    fn finish(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::FirmwarePart;
    use crate::prompter::HeadlessPrompter;

    const SECTOR: usize = FLASH_SECTOR_SIZE as usize;

    fn image(addr: u32, len: usize) -> Image {
        let mut data = vec![0u8; len];
        if addr == 0 && len > 0 {
            data[0] = 0xE9;
        }
        Image::new(addr, data)
    }

    fn map(images: Vec<Image>) -> ImageMap {
        images.into_iter().map(|i| (i.addr, i)).collect()
    }

    fn sys_params_image(addr: u32) -> Image {
        let mut image = image(addr, 16 * 1024);
        image
            .attrs
            .insert("type".to_string(), "sys_params".to_string());
        image
    }

    fn test_flasher() -> Flasher {
        Flasher::new(
            "/dev/null",
            Box::new(HeadlessPrompter),
            Notifier::disabled(),
        )
    }

    #[test]
    fn parse_size_suffixes() {
        for s in ["1M", "1024K", "8m", "8192k", "1048576"] {
            assert_eq!(parse_size(s).unwrap(), 1048576, "{}", s);
        }
        assert_eq!(parse_size("512K").unwrap(), 524288);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("4096M").is_err());
    }

    #[test]
    fn sanity_accepts_good_layout() {
        let images = map(vec![
            image(0x0, 2 * SECTOR),
            image(0x10000, SECTOR),
            sys_params_image(0x7c000),
        ]);
        sanity_check_images(&images, 512 * 1024, FLASH_SECTOR_SIZE).unwrap();
    }

    #[test]
    fn sanity_rejects_overlap_and_names_addresses() {
        let images = map(vec![image(0x0, 8192), image(0x1000, 4096)]);
        let err = sanity_check_images(&images, 512 * 1024, FLASH_SECTOR_SIZE).unwrap_err();
        assert!(matches!(
            err,
            Error::ImagesOverlap {
                first: 0x0,
                second: 0x1000
            }
        ));
        let msg = err.to_string();
        assert!(msg.contains("0x0") && msg.contains("0x1000"), "{}", msg);
    }

    #[test]
    fn sanity_rejects_unaligned_image() {
        let images = map(vec![image(0x1100, 512)]);
        assert!(matches!(
            sanity_check_images(&images, 512 * 1024, FLASH_SECTOR_SIZE),
            Err(Error::UnalignedImage { addr: 0x1100, .. })
        ));
    }

    #[test]
    fn sanity_rejects_image_beyond_flash_end() {
        let images = map(vec![image(0x7f000, 2 * SECTOR)]);
        assert!(matches!(
            sanity_check_images(&images, 512 * 1024, FLASH_SECTOR_SIZE),
            Err(Error::ImageTooBig { addr: 0x7f000, .. })
        ));
    }

    #[test]
    fn sanity_rejects_bad_magic() {
        let mut first = image(0x0, SECTOR);
        first.data[0] = 0xAA;
        let images = map(vec![first]);
        assert!(matches!(
            sanity_check_images(&images, 512 * 1024, FLASH_SECTOR_SIZE),
            Err(Error::InvalidImageMagic)
        ));
    }

    #[test]
    fn sanity_rejects_sys_params_collision() {
        // An untyped image reaching into the reserved area is rejected...
        let images = map(vec![image(0x7c000, SECTOR)]);
        assert!(matches!(
            sanity_check_images(&images, 512 * 1024, FLASH_SECTOR_SIZE),
            Err(Error::SysParamsOverlap { addr: 0x7c000, .. })
        ));

        // ...while the properly tagged one at the right address is fine.
        let images = map(vec![sys_params_image(0x7c000)]);
        sanity_check_images(&images, 512 * 1024, FLASH_SECTOR_SIZE).unwrap();
    }

    #[test]
    fn sys_params_image_is_relocated() {
        let mut images = map(vec![sys_params_image(0x3c000)]);
        let moved = adjust_sys_params_location(&mut images, 512 * 1024);

        assert_eq!(moved, Some((0x3c000, 0x7c000)));
        assert_eq!(images.len(), 1);
        let relocated = &images[&0x7c000];
        assert_eq!(relocated.addr, 0x7c000);
        sanity_check_images(&images, 512 * 1024, FLASH_SECTOR_SIZE).unwrap();
    }

    #[test]
    fn sys_params_image_already_in_place_is_left_alone() {
        let mut images = map(vec![sys_params_image(0x7c000)]);
        assert_eq!(adjust_sys_params_location(&mut images, 512 * 1024), None);
        assert_eq!(images.len(), 1);
    }

    #[test]
    fn flash_params_patched_big_endian_at_offset_2() {
        // 1 MiB detected: dio,8m,40m = 0x0220
        let params = flash_params_from_str("dio,8m,40m").unwrap();
        assert_eq!(params, 0x0220);

        let mut images = map(vec![image(0x0, SECTOR)]);
        patch_flash_params(&mut images, params);
        let data = &images[&0].data;
        assert_eq!(data[2], 0x02);
        assert_eq!(data[3], 0x20);
    }

    fn sector_digests(image: &Image, matching: &[usize]) -> Vec<[u8; 16]> {
        // Device digests equal to the image's own for `matching` sectors,
        // flipped for the rest.
        let n = (image.data.len() + SECTOR - 1) / SECTOR;
        (0..n)
            .map(|i| {
                let offset = i * SECTOR;
                let len = SECTOR.min(image.data.len() - offset);
                let mut digest = md5::compute(&image.data[offset..offset + len]).0;
                if !matching.contains(&i) {
                    digest[0] ^= 0xff;
                }
                digest
            })
            .collect()
    }

    #[test]
    fn dedup_below_threshold_keeps_whole_image() {
        // 32 KiB image with 4 matching sectors: 16384 < 65536.
        let img = image(0x10000, 32 * 1024);
        let digests = sector_digests(&img, &[0, 1, 2, 3]);

        let plan = plan_dedup(&img, &digests);
        assert_eq!(plan.skipped, 16384);
        assert!((plan.skipped as u32) < FLASH_BLOCK_SIZE);
    }

    #[test]
    fn dedup_above_threshold_writes_only_the_tail() {
        // 128 KiB image whose first 64 KiB match the device.
        let mut img = image(0x10000, 128 * 1024);
        for (i, b) in img.data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let digests = sector_digests(&img, &(0..16).collect::<Vec<_>>());

        let plan = plan_dedup(&img, &digests);
        assert_eq!(plan.skipped, 65536);
        assert!(plan.skipped as u32 >= FLASH_BLOCK_SIZE);
        assert_eq!(plan.fragments.len(), 1);
        let fragment = &plan.fragments[0];
        assert_eq!(fragment.addr, 0x10000 + 65536);
        assert_eq!(fragment.data.len(), 65536);
        assert_eq!(fragment.data, img.data[65536..]);
    }

    #[test]
    fn dedup_fragments_are_ascending_runs() {
        // Sectors 0,1 match, 2 differs, 3 matches, 4..7 differ.
        let img = image(0x0, 8 * SECTOR);
        let digests = sector_digests(&img, &[0, 1, 3]);

        let plan = plan_dedup(&img, &digests);
        let spans: Vec<(u32, usize)> = plan
            .fragments
            .iter()
            .map(|f| (f.addr, f.data.len()))
            .collect();
        assert_eq!(
            spans,
            vec![(2 * SECTOR as u32, SECTOR), (4 * SECTOR as u32, 4 * SECTOR)]
        );
        assert_eq!(plan.skipped, 3 * SECTOR);
    }

    #[test]
    fn dedup_identical_image_skips_everything() {
        let img = image(0x0, 4 * SECTOR);
        let digests = sector_digests(&img, &[0, 1, 2, 3]);

        let plan = plan_dedup(&img, &digests);
        assert!(plan.fragments.is_empty());
        assert_eq!(plan.skipped, 4 * SECTOR);
    }

    #[test]
    fn dedup_handles_partial_tail_sector() {
        let img = image(0x0, SECTOR + 100);
        let digests = sector_digests(&img, &[0]);

        let plan = plan_dedup(&img, &digests);
        assert_eq!(plan.skipped, SECTOR);
        assert_eq!(plan.fragments.len(), 1);
        assert_eq!(plan.fragments[0].addr, SECTOR as u32);
        assert_eq!(plan.fragments[0].data.len(), 100);
    }

    #[test]
    fn digest_verification_law() {
        let img = image(0x10000, 1000);
        let good = md5::compute(&img.data).0;
        verify_image_digest(&img, &good).unwrap();

        let mut bad = good;
        bad[5] ^= 1;
        assert!(matches!(
            verify_image_digest(&img, &bad),
            Err(Error::DigestMismatch(0x10000))
        ));
    }

    #[test]
    fn firmware_parts_need_a_valid_address() {
        let flasher = test_flasher();

        let mut bundle = FirmwareBundle::new("fw");
        bundle.push(FirmwarePart::new("boot", vec![0xE9, 0, 0, 0]));
        assert!(matches!(
            flasher.set_firmware(&bundle),
            Err(Error::PartWithoutAddress(_))
        ));

        let mut bundle = FirmwareBundle::new("fw");
        bundle.push(FirmwarePart::new("boot", vec![0xE9]).with_attr("addr", "nope"));
        assert!(matches!(
            flasher.set_firmware(&bundle),
            Err(Error::InvalidPartAddress { .. })
        ));

        let mut bundle = FirmwareBundle::new("fw");
        bundle.push(FirmwarePart::new("boot", vec![0xE9]).with_attr("addr", "0x0"));
        bundle.push(FirmwarePart::new("fs", vec![0xff; 16]).with_attr("addr", "0xec000"));
        flasher.set_firmware(&bundle).unwrap();
        assert_eq!(flasher.total_bytes(), 17);
    }

    #[test]
    fn total_bytes_counts_filesystem_twice_when_merging() {
        let flasher = test_flasher();

        let mut bundle = FirmwareBundle::new("fw");
        bundle.push(FirmwarePart::new("boot", vec![0xE9; 100]).with_attr("addr", "0"));
        bundle.push(FirmwarePart::new("fs", vec![0xff; 4096]).with_attr("addr", "0xec000"));
        flasher.set_firmware(&bundle).unwrap();
        assert_eq!(flasher.total_bytes(), 4196);

        flasher
            .set_option(MERGE_FS_OPTION, OptionValue::Bool(true))
            .unwrap();
        assert_eq!(flasher.total_bytes(), 8292);

        // An explicit false is respected.
        flasher
            .set_option(MERGE_FS_OPTION, OptionValue::Bool(false))
            .unwrap();
        assert_eq!(flasher.total_bytes(), 4196);
    }

    #[test]
    fn options_are_type_checked() {
        let flasher = test_flasher();

        flasher
            .set_option(FLASH_SIZE_OPTION, OptionValue::Str("1M".into()))
            .unwrap();
        flasher
            .set_option(FLASH_PARAMS_OPTION, OptionValue::Str("dio,4m,40m".into()))
            .unwrap();
        flasher
            .set_option(SPIFFS_OFFSET_OPTION, OptionValue::Int(0xec000))
            .unwrap();

        assert!(matches!(
            flasher.set_option(FLASH_ERASE_CHIP_OPTION, OptionValue::Int(1)),
            Err(Error::InvalidOption { .. })
        ));
        assert!(matches!(
            flasher.set_option(SPIFFS_SIZE_OPTION, OptionValue::Int(0)),
            Err(Error::InvalidOption { .. })
        ));
        assert!(matches!(
            flasher.set_option("not-an-option", OptionValue::Bool(true)),
            Err(Error::UnknownOption(_))
        ));
        assert!(matches!(
            flasher.set_option(FLASH_PARAMS_OPTION, OptionValue::Str("qio,bad,40m".into())),
            Err(Error::InvalidFlashSize(_))
        ));
    }

    #[test]
    fn running_without_firmware_fails_fast() {
        let (notifier, rx) = Notifier::channel(8);
        let flasher = Flasher::new("/dev/null", Box::new(HeadlessPrompter), notifier);
        flasher.run();

        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            crate::progress::Event::Done { ok: false, text } if text.contains("No firmware")
        )));
    }
}
