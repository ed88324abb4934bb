//! CLI definitions for netcapd.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "netcapd",
    version,
    about = "Programmable on-host packet-capture service\n\nCaptures by interface, process, pid or container, filters packets with compiled PDEF protocol rules, and exposes an HTTP control plane for start/stop/status.",
    long_about = None
)]
pub struct Cli {
    /// Path to the server config file
    #[clap(long, short, default_value = "config/netcapd.json")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the capture service (HTTP control plane + capture workers)
    Run,

    /// Print an example server config to stdout
    Init,

    /// PDEF tooling
    Pdef {
        #[clap(subcommand)]
        command: PdefCommands,
    },
}

#[derive(Subcommand)]
pub enum PdefCommands {
    /// Parse and validate a PDEF file, printing the compiled protocol
    Parse {
        /// PDEF file to parse
        file: PathBuf,

        /// Also disassemble the compiled filter bytecode
        #[clap(long)]
        disasm: bool,
    },
}
