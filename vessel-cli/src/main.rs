//! CLI for the vessel application sandbox.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod run;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vessel", version, about = "Unprivileged application sandbox")]
struct Cli {
    /// Enable debug output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a program inside a new container.
    Run(Box<run::RunArgs>),
}

fn main() {
    // the container parent re-executes this binary as the init
    vessel::try_argv0();

    let cli = Cli::parse();
    vessel::output::init_logging(cli.verbose);

    let code = match cli.dispatch() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("vessel: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

impl Cli {
    fn dispatch(self) -> Result<i32> {
        match self.command {
            Command::Run(args) => args.run(self.verbose),
        }
    }
}
