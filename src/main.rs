//! irwatch - live compiler output viewer.
//!
//! Watches source files and pushes fresh LLVM IR, assembly, or bytecode
//! listings to every connected viewer over websockets.

mod cli;
mod compile;
mod config;
mod dispatch;
mod exec;
mod logger;
mod protocol;
mod registry;
mod serve;
mod session;
mod watch;

use anyhow::Result;
use clap::{ColorChoice, Parser};
use cli::{Cli, Commands};
use config::Config;

fn main() -> Result<()> {
    // Setup global Ctrl+C handler (before any blocking operations)
    serve::setup_shutdown_handler()?;

    let cli = Cli::parse();

    // Set global color override based on CLI option
    match cli.color {
        ColorChoice::Always => owo_colors::set_override(true),
        ColorChoice::Never => owo_colors::set_override(false),
        ColorChoice::Auto => {} // owo-colors auto-detects TTY
    }
    logger::set_verbose(cli.verbose);

    let config = Config::load(&cli)?;

    match &cli.command {
        Commands::Serve { .. } => serve::run(&config),
    }
}
