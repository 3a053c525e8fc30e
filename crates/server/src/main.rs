use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use conduit_server::config::ServerConfig;
use conduit_server::{Server, logging};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "conduit", version, about = "HTTP/1.1 server on top of the conduit protocol core")]
struct Cli {
    /// TOML configuration file; defaults apply without one
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.config.as_deref().map(ServerConfig::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.log);
    info!(bind_address = %config.bind_address, max_keep_alive = config.http.max_keep_alive, "configuration loaded");

    let result = match Server::builder().config(config).build() {
        Ok(server) => server.start().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(cause = %e, "server stopped");
            ExitCode::FAILURE
        }
    }
}
