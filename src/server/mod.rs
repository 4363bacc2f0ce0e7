//! Echo server with graceful draining.
//!
//! `Server::run` accepts on one listener, serves up to `workers`
//! connections at once, and coordinates shutdown:
//!
//! 1. `Running`: connections are accepted and echoed.
//! 2. `Draining`: the signal has fired and the listener is closed, so new
//!    dials are refused. Busy connections run the shutdown handshake on
//!    their next loop iteration.
//! 3. `Drained`: every connection task has finished.

pub mod worker;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::net;
use crate::shutdown::ShutdownSignal;
use worker::{accept_loop, Accept, WorkerContext};

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    Draining,
    Drained,
}

impl CoordinatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CoordinatorState::Running,
            1 => CoordinatorState::Draining,
            _ => CoordinatorState::Drained,
        }
    }
}

/// Cloneable control surface for a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown: ShutdownSignal,
    connections: TaskTracker,
    state: Arc<AtomicU8>,
}

impl ServerHandle {
    fn new() -> Self {
        ServerHandle {
            shutdown: ShutdownSignal::new(),
            connections: TaskTracker::new(),
            state: Arc::new(AtomicU8::new(CoordinatorState::Running as u8)),
        }
    }

    /// Request a graceful stop. Returns `true` only for the first request;
    /// later requests have no further effect.
    pub fn terminate(&self) -> bool {
        let first = self.shutdown.fire();
        if !first {
            debug!("Termination already in progress");
        }
        first
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    fn set_state(&self, state: CoordinatorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Server instance
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    handle: ServerHandle,
}

impl Server {
    /// Resolve the listen address and bind. Any failure here is fatal.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listen = config.listen_addr();
        let addr = net::resolve(&listen, config.resolve_attempts, config.resolve_retry_delay)
            .await
            .map_err(|e| ServerError::Resolve(listen.clone(), e))?;

        let listener =
            net::bind_listener(addr, config.backlog).map_err(|e| ServerError::Bind(addr, e))?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind(addr, e))?;
        info!(address = %local_addr, workers = config.workers, "Server listening");

        Ok(Server {
            config,
            listener,
            local_addr,
            handle: ServerHandle::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Serve until terminated, then drain.
    ///
    /// Returns once the listener is closed and every connection task has
    /// finished. A fatal accept error starts the drain as well and is
    /// returned after the remaining connections finish.
    pub async fn run(self) -> Result<(), ServerError> {
        coordinate(self.listener, &self.config, &self.handle).await
    }
}

async fn coordinate<L: Accept>(
    listener: L,
    config: &ServerConfig,
    handle: &ServerHandle,
) -> Result<(), ServerError> {
    let ctx = WorkerContext {
        shutdown: handle.shutdown.clone(),
        msg_size: config.msg_size,
        io_timeout: config.io_timeout,
        grace_period: config.grace_period,
    };

    // The listener is consumed here and closed when this returns.
    let accepted = accept_loop(listener, ctx, config.workers, &handle.connections).await;
    if let Err(e) = &accepted {
        error!(error = %e, "Accept failed, shutting down");
    }

    handle.shutdown.fire();
    handle.set_state(CoordinatorState::Draining);
    info!(active = handle.connections.len(), "Draining connections");

    handle.connections.close();
    handle.connections.wait().await;

    handle.set_state(CoordinatorState::Drained);
    info!("exiting");

    accepted
}

/// Server errors. All of these are fatal to the process.
#[derive(Debug)]
pub enum ServerError {
    Resolve(String, std::io::Error),
    Bind(SocketAddr, std::io::Error),
    Signal(std::io::Error),
    Accept(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Resolve(addr, e) => write!(f, "resolve tcp address {addr} failed: {e}"),
            ServerError::Bind(addr, e) => write!(f, "listen on {addr} failed: {e}"),
            ServerError::Signal(e) => write!(f, "installing signal handlers failed: {e}"),
            ServerError::Accept(e) => write!(f, "accept failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}
