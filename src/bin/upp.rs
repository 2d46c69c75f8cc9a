use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use upp::{run_cli, Args, ExitStatus};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    process::exit(match run_cli(args) {
        ExitStatus::Ok => 0,
        ExitStatus::FoundErrors => 1,
    });
}
