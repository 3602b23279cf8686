//! sindri - a multi-device Odin-mode firmware flasher
//!
//! This is the main entry point for the CLI application.

use clap::Parser;
use log::info;

use sindri::presentation::cli::{self, args::Args};

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line arguments
    let args = Args::parse();

    info!("sindri v{}", env!("CARGO_PKG_VERSION"));

    // Execute the command; exit codes are typed per error kind
    std::process::exit(cli::execute(args));
}
