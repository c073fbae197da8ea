use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a single message.
    Send(SendArgs),
    /// Listen and print received messages.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

impl Command {
    /// Run the subcommand and produce the process exit code.
    pub fn dispatch(self, format: OutputFormat) -> CliResult<i32> {
        match self {
            Command::Send(args) => send::run(args, format),
            Command::Listen(args) => listen::run(args, format),
            Command::Version(args) => version::run(args),
        }
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Message type byte.
    #[arg(long, short = 'k', default_value = "0")]
    pub kind: u8,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Frame buffer size in bytes.
    #[arg(long, default_value = "65536")]
    pub buffer_size: usize,
    /// Always send chunked frames, even when one frame would do.
    #[arg(long)]
    pub always_chunked: bool,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Frame buffer size in bytes.
    #[arg(long, default_value = "65536")]
    pub buffer_size: usize,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
