pub mod utils;

pub mod app;
pub mod cli;
mod commands;
pub mod display;
pub mod error;
pub mod integration;
pub mod metrics;
pub mod processing;
pub mod render;
pub mod scheduler;
pub mod settings;

use std::process::ExitCode;

use clap::Parser;

use cli::Cli;

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(commands::dispatch(cli)) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
