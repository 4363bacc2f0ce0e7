//! Socket helpers shared by both roles: address resolution with bounded
//! retry, listener setup, and deadline-bounded stream I/O.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Resolve `addr`, retrying up to `attempts` times with a fixed delay.
///
/// Returns the first resolved address, or the last error once the
/// attempts are exhausted.
pub async fn resolve(addr: &str, attempts: usize, delay: Duration) -> io::Result<SocketAddr> {
    let mut last_err = io::Error::new(io::ErrorKind::InvalidInput, "no resolve attempts made");

    for attempt in 1..=attempts {
        match tokio::net::lookup_host(addr).await {
            Ok(mut addrs) => match addrs.next() {
                Some(resolved) => {
                    debug!(addr, %resolved, attempt, "Resolved address");
                    return Ok(resolved);
                }
                None => {
                    last_err = io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no addresses found for {addr}"),
                    );
                }
            },
            Err(e) => last_err = e,
        }

        warn!(addr, attempt, error = %last_err, "Address resolution failed");
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }

    Err(last_err)
}

/// Create a listening socket with `SO_REUSEADDR` and the given backlog.
///
/// Must be called from within a Tokio runtime.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

/// Failure of a single deadline-bounded read or write.
#[derive(Debug)]
pub enum StreamError {
    TimedOut { op: &'static str, after: Duration },
    Io { op: &'static str, source: io::Error },
}

impl StreamError {
    /// Whether the peer went away (reset or broken pipe) rather than the
    /// operation failing for some other reason.
    pub fn is_peer_gone(&self) -> bool {
        match self {
            StreamError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            StreamError::TimedOut { .. } => false,
        }
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::TimedOut { op, after } => {
                write!(f, "{op} timed out after {}ms", after.as_millis())
            }
            StreamError::Io { op, source } => write!(f, "{op} failed: {source}"),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::Io { source, .. } => Some(source),
            StreamError::TimedOut { .. } => None,
        }
    }
}

/// Run one I/O operation under a deadline. Timeouts are not retried.
pub async fn with_deadline<T, F>(
    op: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, StreamError>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(StreamError::Io { op, source }),
        Err(_) => Err(StreamError::TimedOut { op, after: limit }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal() {
        let addr = resolve("127.0.0.1:8080", 1, Duration::ZERO).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_gives_up() {
        // Missing port is rejected without touching DNS.
        let result = resolve("not-an-address", 2, Duration::from_millis(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bind_listener() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let (client, accepted) =
            tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());
        assert!(client.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_elapses() {
        let result = with_deadline(
            "read",
            Duration::from_secs(1),
            std::future::pending::<io::Result<()>>(),
        )
        .await;

        match result {
            Err(StreamError::TimedOut { op, after }) => {
                assert_eq!(op, "read");
                assert_eq!(after, Duration::from_secs(1));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deadline_passes_io_error() {
        let result = with_deadline("write", Duration::from_secs(1), async {
            Err::<(), _>(io::Error::from(io::ErrorKind::BrokenPipe))
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_peer_gone());
        assert_eq!(err.to_string(), "write failed: broken pipe");
    }
}
