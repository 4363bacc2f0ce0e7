//! Echo client.
//!
//! A session owns one connection and one random payload. It writes the
//! payload, reads back as many bytes as the reply can legitimately take,
//! and checks what came back:
//!
//! - the payload itself: next round
//! - a shutdown notice: wait for the final message or EOF, session over
//! - EOF: the server closed without a handshake, session over
//! - anything else: protocol violation, fatal
//!
//! `run_client` supervises sessions and either exits after the first one
//! ends or reconnects, depending on `OnShutdown`.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, OnShutdown};
use crate::net::{self, with_deadline, StreamError};
use crate::protocol::{
    classify, is_clean_close, Payload, Reply, FINAL_SHUTDOWN, RECEIVED_SERVER_MSG, SHUTDOWN_NOTICE,
};

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server ran the shutdown handshake.
    ShutdownObserved,
    /// The server closed the connection without a handshake.
    ServerClosed,
}

/// Resolve the server, then run sessions until the configured policy says
/// to stop.
pub async fn run_client(config: ClientConfig) -> Result<(), ClientError> {
    let addr = net::resolve(&config.remote, config.resolve_attempts, config.resolve_retry_delay)
        .await
        .map_err(|source| ClientError::Resolve {
            addr: config.remote.clone(),
            source,
        })?;

    let mut sessions = 0usize;
    loop {
        let stream = dial(addr, config.dial_attempts, config.dial_retry_delay).await?;
        info!("connected to {}", addr);

        let payload = Payload::random(config.msg_size);
        let end = run_session(stream, &payload, &config).await?;
        sessions += 1;

        match config.on_shutdown {
            OnShutdown::Exit => {
                info!(?end, "Session ended, exiting");
                return Ok(());
            }
            OnShutdown::Reconnect => {
                if config.max_sessions.is_some_and(|max| sessions >= max) {
                    info!(sessions, "Session limit reached, exiting");
                    return Ok(());
                }
                info!(?end, "Session ended, reconnecting");
            }
        }
    }
}

/// Connect with a fixed number of attempts and a fixed delay between them.
pub async fn dial(
    addr: SocketAddr,
    attempts: usize,
    delay: Duration,
) -> Result<TcpStream, ClientError> {
    let mut last_err = io::Error::new(io::ErrorKind::InvalidInput, "no connect attempts made");

    for attempt in 1..=attempts {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                return Ok(stream);
            }
            Err(e) => {
                warn!(attempt, "connect to {} failed : {}. Re-connecting", addr, e);
                last_err = e;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }

    Err(ClientError::Dial {
        addr,
        attempts,
        source: last_err,
    })
}

/// Run one session on an established connection. The connection is closed
/// when this returns.
pub async fn run_session<S>(
    mut stream: S,
    payload: &Payload,
    config: &ClientConfig,
) -> Result<SessionEnd, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let end = exchange(&mut stream, payload, config).await;
    drop(stream);
    end
}

async fn exchange<S>(
    stream: &mut S,
    payload: &Payload,
    config: &ClientConfig,
) -> Result<SessionEnd, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; payload.len().max(SHUTDOWN_NOTICE.len())];

    loop {
        let write = stream.write_all(payload.as_bytes());
        match with_deadline("write", config.io_timeout, write).await {
            Ok(()) => {}
            Err(e) if e.is_peer_gone() => {
                info!("server closed the connection: {}", e);
                return Ok(SessionEnd::ServerClosed);
            }
            Err(e) => return Err(e.into()),
        }

        let mut received = Vec::with_capacity(payload.len());
        let reply = loop {
            let remaining = match classify(payload.as_bytes(), &received) {
                Reply::Partial { remaining } => remaining,
                reply => break reply,
            };

            let limit = remaining.min(buffer.len());
            let read = stream.read(&mut buffer[..limit]);
            let n = match with_deadline("read", config.io_timeout, read).await {
                Ok(n) => n,
                Err(e) if e.is_peer_gone() => 0,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                info!("server closed the connection");
                return Ok(SessionEnd::ServerClosed);
            }
            received.extend_from_slice(&buffer[..n]);
        };

        info!("{}", RECEIVED_SERVER_MSG);

        match reply {
            Reply::Echo => {}
            Reply::ShutdownNotice => {
                info!("server is shutting down the connection");
                finish_handshake(stream, Vec::new(), config.shutdown_timeout).await?;
                return Ok(SessionEnd::ShutdownObserved);
            }
            Reply::FinalShutdown => {
                warn!("final shutdown message received without notice");
                finish_handshake(stream, received, config.shutdown_timeout).await?;
                return Ok(SessionEnd::ShutdownObserved);
            }
            Reply::Mismatch => {
                return Err(ClientError::Protocol {
                    context: "invalid server reply",
                    received,
                });
            }
            Reply::Partial { .. } => unreachable!("partial replies are read to completion"),
        }

        tokio::time::sleep(config.round_interval).await;
    }
}

/// Read whatever follows a shutdown notice until the server closes, and
/// check it is the final message or nothing.
async fn finish_handshake<S>(
    stream: &mut S,
    mut received: Vec<u8>,
    limit: Duration,
) -> Result<(), ClientError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 64];
    let read_to_close = async {
        while received.len() <= FINAL_SHUTDOWN.len() {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    debug!("connection reset after shutdown notice");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    };

    match tokio::time::timeout(limit, read_to_close).await {
        Ok(Ok(())) => {}
        Ok(Err(source)) => {
            return Err(StreamError::Io {
                op: "read final shutdown",
                source,
            }
            .into())
        }
        Err(_) => {
            return Err(StreamError::TimedOut {
                op: "read final shutdown",
                after: limit,
            }
            .into())
        }
    }

    if !is_clean_close(&received) {
        return Err(ClientError::Protocol {
            context: "unexpected data after shutdown notice",
            received,
        });
    }

    info!("server closed the connection");
    Ok(())
}

/// Client errors. All of these are fatal to the process.
#[derive(Debug)]
pub enum ClientError {
    Resolve { addr: String, source: io::Error },
    Dial { addr: SocketAddr, attempts: usize, source: io::Error },
    Stream(StreamError),
    Protocol { context: &'static str, received: Vec<u8> },
}

impl From<StreamError> for ClientError {
    fn from(e: StreamError) -> Self {
        ClientError::Stream(e)
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Resolve { addr, source } => {
                write!(f, "resolve tcp address failed [{addr}]: {source}")
            }
            ClientError::Dial { addr, attempts, source } => {
                write!(f, "dial tcp {addr} failed after {attempts} attempts: {source}")
            }
            ClientError::Stream(e) => write!(f, "{e}"),
            ClientError::Protocol { context, received } => write!(
                f,
                "{context}: {} bytes {:?}",
                received.len(),
                String::from_utf8_lossy(received)
            ),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Resolve { source, .. } | ClientError::Dial { source, .. } => Some(source),
            ClientError::Stream(e) => Some(e),
            ClientError::Protocol { .. } => None,
        }
    }
}
