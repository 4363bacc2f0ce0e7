//! Connection acceptance and serving.
//!
//! One acceptor owns the listener. It takes a worker slot before each
//! accept, so the slot count bounds the number of connections served at
//! once; further connections wait in the kernel backlog. When the shutdown
//! signal fires the acceptor returns and the listener is dropped with it.
//!
//! The serve loop observes the shutdown signal only at the top of each
//! iteration. A read or write already in progress is allowed to finish (or
//! time out) first, which bounds drain latency by one I/O timeout plus the
//! grace period.

use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::net::{with_deadline, StreamError};
use crate::protocol::{FINAL_SHUTDOWN, RECEIVED_CLIENT_CONN, SHUTDOWN_NOTICE};
use crate::server::ServerError;
use crate::shutdown::ShutdownSignal;

/// Source of incoming connections.
pub trait Accept {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    type Stream = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        async move {
            let (stream, peer) = TcpListener::accept(self).await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }
            Ok((stream, peer))
        }
    }
}

/// Everything a connection task needs, cloned once per connection.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub shutdown: ShutdownSignal,
    pub msg_size: usize,
    pub io_timeout: Duration,
    pub grace_period: Duration,
}

/// How a served connection ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// The client closed the connection.
    PeerClosed,
    /// The shutdown handshake ran to completion.
    Drained,
}

/// Accept connections until the shutdown signal fires, serving at most
/// `workers` of them at a time on tasks registered with `tracker`.
///
/// Consumes the listener, so it is closed as soon as this returns. Only a
/// non-shutdown accept failure is returned as an error; failures of an
/// individual connection are logged.
pub async fn accept_loop<L: Accept>(
    listener: L,
    ctx: WorkerContext,
    workers: usize,
    tracker: &TaskTracker,
) -> Result<(), ServerError> {
    let slots = Arc::new(Semaphore::new(workers));

    loop {
        let permit = tokio::select! {
            biased;

            _ = ctx.shutdown.fired() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            biased;

            _ = ctx.shutdown.fired() => break,
            accepted = listener.accept() => accepted.map_err(ServerError::Accept)?,
        };
        info!(active = tracker.len(), "{} {}", RECEIVED_CLIENT_CONN, peer);

        let ctx = ctx.clone();
        tracker.spawn(async move {
            match serve_connection(stream, peer, &ctx).await {
                Ok(outcome) => debug!(peer = %peer, ?outcome, "Connection finished"),
                Err(e) => warn!(peer = %peer, error = %e, "Connection closed on error"),
            }
            drop(permit);
        });
    }

    debug!("Listener closed");
    Ok(())
}

/// Serve one connection: echo until the peer leaves, an operation fails,
/// or the shutdown signal is observed.
///
/// The connection is closed on every return path by dropping `stream`.
pub async fn serve_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    ctx: &WorkerContext,
) -> Result<ConnectionOutcome, StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::zeroed(ctx.msg_size);

    loop {
        if ctx.shutdown.is_fired() {
            run_handshake(&mut stream, peer, ctx).await?;
            return Ok(ConnectionOutcome::Drained);
        }

        let n = with_deadline("read", ctx.io_timeout, stream.read(&mut buffer[..])).await?;
        if n == 0 {
            trace!(peer = %peer, "Connection closed by client");
            return Ok(ConnectionOutcome::PeerClosed);
        }

        with_deadline("write", ctx.io_timeout, stream.write_all(&buffer[..n])).await?;
        trace!(peer = %peer, bytes = n, "Echoed");
    }
}

/// Notify, wait out the grace period, send the final message and close.
async fn run_handshake<S>(
    stream: &mut S,
    peer: SocketAddr,
    ctx: &WorkerContext,
) -> Result<(), StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let notice = stream.write_all(SHUTDOWN_NOTICE);
    with_deadline("write shutdown notice", ctx.io_timeout, notice).await?;
    debug!(
        peer = %peer,
        grace_ms = ctx.grace_period.as_millis() as u64,
        "Shutdown notice sent"
    );

    tokio::time::sleep(ctx.grace_period).await;

    let last = stream.write_all(FINAL_SHUTDOWN);
    with_deadline("write final shutdown", ctx.io_timeout, last).await?;
    with_deadline("shutdown", ctx.io_timeout, stream.shutdown()).await?;

    // Closing with unread input pending makes the kernel send a reset,
    // which can discard the final message before the client reads it.
    let mut sink = [0u8; 1024];
    let lingered = tokio::time::timeout(ctx.io_timeout, async {
        loop {
            match stream.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(n) => trace!(peer = %peer, bytes = n, "Discarded input while closing"),
            }
        }
    })
    .await;
    if lingered.is_err() {
        debug!(peer = %peer, "Client did not close within timeout");
    }

    debug!(peer = %peer, "Shutdown handshake complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;
    use tokio_test::io::Builder;

    fn context(grace_period: Duration) -> WorkerContext {
        WorkerContext {
            shutdown: ShutdownSignal::new(),
            msg_size: 256,
            io_timeout: Duration::from_secs(1),
            grace_period,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn payload() -> Vec<u8> {
        (0..256).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_echo_until_peer_closes() {
        let ctx = context(Duration::from_millis(10));
        let p = payload();
        let stream = Builder::new()
            .read(&p)
            .write(&p)
            .read(&p)
            .write(&p)
            .build();

        let outcome = serve_connection(stream, peer(), &ctx).await.unwrap();
        assert_eq!(outcome, ConnectionOutcome::PeerClosed);
    }

    #[tokio::test]
    async fn test_partial_reads_are_echoed_as_received() {
        let ctx = context(Duration::from_millis(10));
        let p = payload();
        let stream = Builder::new()
            .read(&p[..100])
            .write(&p[..100])
            .read(&p[100..])
            .write(&p[100..])
            .build();

        let outcome = serve_connection(stream, peer(), &ctx).await.unwrap();
        assert_eq!(outcome, ConnectionOutcome::PeerClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_when_already_fired() {
        let ctx = context(Duration::from_secs(15));
        ctx.shutdown.fire();
        let stream = Builder::new()
            .write(SHUTDOWN_NOTICE)
            .write(FINAL_SHUTDOWN)
            .build();

        let start = Instant::now();
        let outcome = serve_connection(stream, peer(), &ctx).await.unwrap();
        assert_eq!(outcome, ConnectionOutcome::Drained);
        assert!(start.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_echo_completes_before_handshake() {
        let ctx = context(Duration::from_secs(2));
        let tracker = TaskTracker::new();
        let p = payload();
        // The request arrives after the signal fired but while the worker
        // was already blocked in read.
        let stream = Builder::new()
            .wait(Duration::from_millis(500))
            .read(&p)
            .write(&p)
            .write(SHUTDOWN_NOTICE)
            .write(FINAL_SHUTDOWN)
            .build();

        let start = Instant::now();
        let worker = {
            let ctx = ctx.clone();
            tracker.spawn(async move { serve_connection(stream, peer(), &ctx).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tracker.len(), 1);
        assert!(ctx.shutdown.fire());

        let outcome = worker.await.unwrap().unwrap();
        assert_eq!(outcome, ConnectionOutcome::Drained);

        // One pending I/O (bounded by the timeout) plus the grace period.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed <= ctx.io_timeout + ctx.grace_period + Duration::from_millis(100));
        assert_eq!(tracker.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_read_times_out() {
        let ctx = context(Duration::from_millis(10));
        let stream = Builder::new().wait(Duration::from_secs(10)).build();

        let err = serve_connection(stream, peer(), &ctx).await.unwrap_err();
        assert!(matches!(err, StreamError::TimedOut { op: "read", .. }));
    }

    #[tokio::test]
    async fn test_read_error_ends_connection() {
        let ctx = context(Duration::from_millis(10));
        let stream = Builder::new()
            .read_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .build();

        let err = serve_connection(stream, peer(), &ctx).await.unwrap_err();
        assert!(err.is_peer_gone());
    }

    #[tokio::test]
    async fn test_acceptor_returns_once_fired() {
        let ctx = context(Duration::from_millis(10));
        let tracker = TaskTracker::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        ctx.shutdown.fire();
        accept_loop(listener, ctx, 2, &tracker).await.unwrap();
        assert!(tracker.is_empty());
    }
}
