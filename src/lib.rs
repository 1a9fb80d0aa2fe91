//! A library and application for flashing firmware bundles to ESP8266
//! devices over Serial
//!
//! ## As an application
//!
//! [espflasher] can be installed using `cargo install`:
//!
//! ```bash
//! $ cargo install espflasher
//! ```
//!
//! ## As a library
//!
//! [espflasher] can also be used as a library:
//!
//! ```toml
//! espflasher = { version = "0.2", default-features = false }
//! ```
//!
//! We add `default-features` here to disable the `cli` feature, which is
//! enabled by default. The cli module does not provide SemVer guarantees;
//! you likely will not need any of its types or functions in your
//! application so there's no use pulling in the extra dependencies.
//!
//! The core entry point is [flasher::Flasher], which owns a flashing run:
//! it talks to the ESP8266 boot ROM through [connection::Connection],
//! uploads the RAM flasher stub and drives it through [stub::StubClient],
//! and reports progress through a bounded [progress] channel.
//!
//! [espflasher]: https://crates.io/crates/espflasher

pub mod backend;
pub mod bundle;
#[cfg(feature = "cli")]
pub mod cli;
pub mod command;
pub mod connection;
pub mod error;
pub mod flash_params;
pub mod flasher;
pub mod idblock;
pub mod image;
pub mod progress;
pub mod prompter;
pub mod slip;
pub mod spiffs;
pub mod stub;

mod interface;

pub use interface::Interface;

/// Logging utilities
#[cfg(feature = "cli")]
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
