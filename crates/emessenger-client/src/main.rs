//! emessenger CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::Level;

use emessenger_client::cli::{Cli, Command, ConfigAction};
use emessenger_client::commands;
use emessenger_client::config::ClientConfig;
use emessenger_client::error::ClientResult;
use emessenger_core::{TracingConfig, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing = match cli.command {
        Command::Server {
            json_logs: true, ..
        } => TracingConfig::relay(),
        Command::Server { .. } => TracingConfig::cli(cli.debug).with_level(if cli.debug {
            Level::DEBUG
        } else {
            Level::INFO
        }),
        _ => TracingConfig::cli(cli.debug),
    };
    if let Err(e) = init_tracing(tracing) {
        eprintln!("warning: logging disabled: {}", e);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ClientResult<()> {
    let mut config = match cli.config {
        Some(ref path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };
    cli.apply_overrides(&mut config);

    match cli.command {
        Command::Send { to, ref text } => commands::send::run(&config, to, text).await,
        Command::Listen { json } => commands::listen::run(&config, json).await,
        Command::Chat { to } => commands::chat::run(&config, to).await,
        Command::Decode { ref hex } => commands::decode::run(hex),
        Command::Server { .. } => commands::server::run(&config).await,
        Command::Config { ref action } => match action {
            ConfigAction::Dump => commands::config::dump(&config, cli.config.as_deref()),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(cli.config.as_deref()),
        },
    }
}
