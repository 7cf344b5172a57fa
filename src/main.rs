//! tcp-echo: a minimal TCP echo service
//!
//! - `tcp-echo serve`: bind a port, accept connections and echo every read
//!   back to its sender, one thread per connection, closing idle
//!   connections after a timeout
//! - `tcp-echo send [MESSAGE]`: send one message and print the reply
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod config;
mod connection;
mod server;
mod shutdown;

use config::{Config, Mode};
use server::Listener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.mode {
        Mode::Serve => run_server(&config),
        Mode::Send { ref message } => run_client(&config, message.clone()),
    }
}

/// Run the echo server until interrupted
fn run_server(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.server.host,
        port = config.server.port,
        backlog = config.server.backlog,
        idle_timeout = config.server.idle_timeout,
        "Starting tcp-echo server"
    );

    let mut listener = match Listener::open(&config.server) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "Failed to start server");
            return Err(e.into());
        }
    };

    shutdown::watch_interrupt(listener.shutdown_handle())?;

    let result = listener.serve();
    listener.close();
    result?;
    Ok(())
}

/// Send a single message and print the echoed reply
fn run_client(config: &Config, message: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    client::run(&config.client, message)?;
    Ok(())
}
