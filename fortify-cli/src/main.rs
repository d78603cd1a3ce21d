//! Command-line launcher for fortify application sandboxes.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod launch;
mod ps;

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "fortify", version, about = "Launch desktop applications in per-application sandboxes")]
struct Cli {
    /// Print debug messages, here and inside the sandbox.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Serialize output as JSON when applicable.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch the app defined by a configuration file.
    App {
        /// Path to the JSON configuration.
        config: PathBuf,
        /// Arguments appended to the configured command.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Configure and start a sandbox mirroring most of the host.
    Run(Box<launch::RunArgs>),

    /// List active launchers, including ones left behind by a crash.
    #[command(visible_alias = "ls")]
    Ps {
        /// Print launcher ids only.
        #[arg(long)]
        short: bool,
    },

    /// Show a launcher or configuration file, or the host paths when no
    /// target is given.
    Show {
        /// Launcher id prefix or configuration file path.
        target: Option<String>,
        /// Omit filesystem information.
        #[arg(long)]
        short: bool,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let _span = fortify_sandbox::logging::install("fortify", cli.verbose);
    match cli.dispatch().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("fortify: {e:#}");
            std::process::exit(1);
        }
    }
}

impl Cli {
    async fn dispatch(self) -> Result<i32> {
        match self.command {
            Command::App { config, args } => launch::app(&config, args, self.verbose).await,
            Command::Run(args) => args.run(self.verbose).await,
            Command::Ps { short } => ps::ps(short, self.json).map(|()| 0),
            Command::Show { target, short } => ps::show(target.as_deref(), short, self.json).map(|()| 0),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "fortify", &mut std::io::stdout());
                Ok(0)
            }
        }
    }
}
