use clap::{Parser, Subcommand};
use espflasher::{
    cli::{self, ConnectArgs, EraseFlashArgs, FlashArgs, GenIdArgs},
    logging::initialize_logger,
};
use log::LevelFilter;
use miette::Result;

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,

    /// Increase log verbosity (-v, -vv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a firmware bundle to a connected device
    Flash {
        #[command(flatten)]
        connect: ConnectArgs,
        #[command(flatten)]
        args: FlashArgs,
    },
    /// Detect a connected device and print its MAC address
    Probe(ConnectArgs),
    /// Erase the flash chip entirely
    EraseFlash(EraseFlashArgs),
    /// Reboot the device into its firmware
    Reboot(ConnectArgs),
    /// Generate a device ID block and write it to a file
    GenId(GenIdArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_logger(match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });

    match &cli.subcommand {
        Commands::Flash { connect, args } => cli::flash(connect, args),
        Commands::Probe(connect) => cli::probe(connect),
        Commands::EraseFlash(args) => cli::erase_flash(args),
        Commands::Reboot(connect) => cli::reboot(connect),
        Commands::GenId(args) => cli::generate_id(args),
    }
}
