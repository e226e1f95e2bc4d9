#![allow(dead_code)]

use crate::cli::SubCommand;
use crate::daemon::App;
use clap::Parser;
use is_root::is_root;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

mod cli;
mod client;
mod config;
mod daemon;
mod dns;
mod error;
mod profile;
mod proxy;
mod system;

#[derive(Debug, Parser)]
#[command(name = "dnsctl", about = "System DNS configuration engine")]
struct ProgramArgs {
    /// Unix domain socket of the privileged engine; overrides the
    /// configuration file.
    #[arg(short, long)]
    pub socket: Option<PathBuf>,
    #[command(subcommand)]
    pub cmd: SubCommand,
}

fn main() -> ExitCode {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
    let _guard = rt.enter();
    let args: ProgramArgs = ProgramArgs::parse();
    let daemon_opts = match args.cmd {
        SubCommand::Daemon(opts) => opts,
        _ => rt.block_on(cli::controller_main(args)),
    };
    if !is_root() {
        eprintln!("The dnsctl daemon must be run with root privilege");
        return ExitCode::FAILURE;
    }
    let app = match App::create(daemon_opts.config, args.socket) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    rt.block_on(app.serve());
    tracing::info!("Exiting...");
    rt.shutdown_timeout(Duration::from_millis(300));
    ExitCode::SUCCESS
}
