mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::LoggingArgs;
use crate::output::OutputFormat;

/// Framed IPC message bus CLI.
#[derive(Parser, Debug)]
#[command(name = "pipebus", version)]
struct Cli {
    /// Output format (defaults to table on a terminal, json otherwise).
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn output_format(&self) -> OutputFormat {
        self.format.unwrap_or_else(OutputFormat::default_for_stdout)
    }
}

fn main() {
    let cli = Cli::parse();
    cli.logging.init();

    let format = cli.output_format();
    let code = cli.command.dispatch(format).unwrap_or_else(|err| {
        eprintln!("error: {err}");
        err.code
    });
    std::process::exit(code);
}
