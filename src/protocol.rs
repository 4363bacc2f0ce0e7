//! Wire protocol shared by the server and client.
//!
//! There is no framing: the client sends `msg_size` raw bytes per round and
//! the server echoes them unchanged. Shutdown notifications travel on the
//! same byte stream as fixed ASCII strings and are told apart from an echo
//! purely by comparing content against the payload that was just sent.
//!
//! ```text
//! client -> server: <msg_size random bytes>
//! server -> client: <the same bytes>                        (normal)
//! server -> client: connection will be closed shortly       (notice)
//!                   ... grace period ...
//! server -> client: connection is now closing, then EOF     (final)
//! ```
//!
//! A payload that happens to equal or start with a control string is
//! indistinguishable from it. That collision risk is part of the protocol.

use rand::Rng;

/// Default payload size in bytes. Must match on both ends.
pub const DEFAULT_MSG_SIZE: usize = 256;

/// Sent by a draining server in place of the next echo.
pub const SHUTDOWN_NOTICE: &[u8] = b"connection will be closed shortly";

/// Sent after the grace period, immediately before the server closes.
pub const FINAL_SHUTDOWN: &[u8] = b"connection is now closing";

/// Log line emitted for each accepted connection.
pub const RECEIVED_CLIENT_CONN: &str = "received connection from";

/// Log line emitted when the server starts draining.
pub const TERMINATION_MSG: &str = "terminating on SIGTERM";

/// Log line emitted by the client for every complete reply.
pub const RECEIVED_SERVER_MSG: &str = "client received reply";

/// Fixed-size request content, generated once per client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Fill a new payload of `size` bytes from the thread-local RNG.
    pub fn random(size: usize) -> Self {
        let mut bytes = vec![0u8; size];
        rand::thread_rng().fill(&mut bytes[..]);
        Payload(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload(bytes)
    }
}

/// What a run of bytes read back from the server amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Still a strict prefix of something valid. Read at most `remaining`
    /// more bytes so a following message is never consumed early.
    Partial { remaining: usize },
    /// Exact echo of the payload.
    Echo,
    /// The server is draining this connection.
    ShutdownNotice,
    /// The server is closing this connection now.
    FinalShutdown,
    /// Matches neither the payload nor a control message.
    Mismatch,
}

/// Classify bytes received so far in the current round.
///
/// Exact matches are checked payload first, so a payload colliding with a
/// control string is still taken as an echo.
pub fn classify(payload: &[u8], received: &[u8]) -> Reply {
    if received == payload {
        return Reply::Echo;
    }
    if received == SHUTDOWN_NOTICE {
        return Reply::ShutdownNotice;
    }
    if received == FINAL_SHUTDOWN {
        return Reply::FinalShutdown;
    }

    [payload, SHUTDOWN_NOTICE, FINAL_SHUTDOWN]
        .iter()
        .filter(|candidate| candidate.len() > received.len() && candidate.starts_with(received))
        .map(|candidate| candidate.len() - received.len())
        .min()
        .map_or(Reply::Mismatch, |remaining| Reply::Partial { remaining })
}

/// Check the tail of a connection after a shutdown notice: either nothing
/// more arrived before EOF or exactly the final message did.
pub fn is_clean_close(trailing: &[u8]) -> bool {
    trailing.is_empty() || trailing == FINAL_SHUTDOWN
}
