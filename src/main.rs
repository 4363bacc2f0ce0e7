//! graceful-drain: graceful termination test endpoints
//!
//! Two roles in one binary:
//! - `server`: echo server that drains its connections on SIGTERM,
//!   notifying each client in-band before closing
//! - `client`: holds one connection open, exchanging a fixed payload and
//!   verifying every echo until the server shuts it down
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod config;
mod net;
mod protocol;
mod server;
mod shutdown;

use config::{Config, Role, ServerConfig};
use server::{Server, ServerError, ServerHandle};
use tracing::{debug, error, info};
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

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match config.role {
        Role::Server(server_config) => {
            info!(
                port = server_config.port,
                workers = server_config.workers,
                msg_size = server_config.msg_size,
                io_timeout_ms = server_config.io_timeout.as_millis() as u64,
                grace_period_ms = server_config.grace_period.as_millis() as u64,
                "Starting graceful-drain server"
            );
            runtime.block_on(run_server(server_config)).inspect_err(|e| {
                error!(error = %e, "Server failed");
            })?;
        }
        Role::Client(client_config) => {
            info!(
                remote = %client_config.remote,
                msg_size = client_config.msg_size,
                on_shutdown = ?client_config.on_shutdown,
                "Starting graceful-drain client"
            );
            runtime.block_on(client::run_client(client_config)).inspect_err(|e| {
                error!(error = %e, "Client failed");
            })?;
        }
    }

    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    let signals = TerminationSignals::install().map_err(ServerError::Signal)?;
    let server = Server::bind(config).await?;

    tokio::spawn(signals.forward(server.handle()));
    server.run().await
}

/// Process termination signals, registered before the server starts
/// accepting so a signal can never arrive unobserved.
#[cfg(unix)]
struct TerminationSignals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Turn each received signal into a drain request. Repeated signals
    /// are no-ops.
    async fn forward(mut self, handle: ServerHandle) {
        loop {
            tokio::select! {
                Some(()) = self.sigterm.recv() => {}
                Some(()) = self.sigint.recv() => {}
                else => break,
            }
            request_termination(&handle);
        }
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn forward(self, handle: ServerHandle) {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl-c");
                break;
            }
            request_termination(&handle);
        }
    }
}

fn request_termination(handle: &ServerHandle) {
    if handle.terminate() {
        info!(active = handle.active_connections(), "{}", protocol::TERMINATION_MSG);
    } else {
        debug!(state = ?handle.state(), "Ignoring repeated termination signal");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use server::CoordinatorState;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_drains_server() {
        let signals = TerminationSignals::install().unwrap();
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            workers: 2,
            msg_size: 256,
            io_timeout: Duration::from_secs(1),
            grace_period: Duration::from_millis(50),
            backlog: 16,
            resolve_attempts: 1,
            resolve_retry_delay: Duration::from_millis(10),
        };
        let server = Server::bind(config).await.unwrap();
        let handle = server.handle();

        tokio::spawn(signals.forward(handle.clone()));
        let running = tokio::spawn(server.run());

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("server did not drain")
            .unwrap()
            .unwrap();
        assert_eq!(handle.state(), CoordinatorState::Drained);
    }
}
