pub mod error;
pub mod set;
mod tcp;

cfg_if! {
    if #[cfg(unix)] {
        mod pipe;
        pub use pipe::{PipeConnection, PipeConnectionListener};

        /// Wait up to `interval` for `fd` to become readable, without
        /// consuming data and without touching socket options that a dup'd
        /// descriptor shares with the connection's own reads.
        ///
        /// `POLLIN` fires for buffered data and for end-of-stream alike; a
        /// non-consuming `MSG_PEEK` recv tells the two apart.
        pub(crate) fn wait_fd_readable(
            fd: std::os::unix::io::RawFd,
            interval: Duration,
        ) -> ProbeResult {
            let timeout = interval.as_millis().min(i32::MAX as u128) as i32;
            let mut poll_fd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            // Safety: the pointer refers to exactly one valid pollfd entry.
            let ready = unsafe { libc::poll(&mut poll_fd, 1, timeout) };
            if ready < 0 {
                return match std::io::Error::last_os_error().raw_os_error() {
                    Some(libc::EINTR) => ProbeResult::Idle,
                    _ => ProbeResult::Error,
                };
            }
            if ready == 0 {
                return ProbeResult::Idle;
            }
            if poll_fd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                return ProbeResult::Error;
            }

            let mut byte = 0u8;
            // Safety: recv writes at most one byte into a valid buffer.
            let peeked = unsafe {
                libc::recv(
                    fd,
                    &mut byte as *mut u8 as *mut libc::c_void,
                    1,
                    libc::MSG_PEEK | libc::MSG_DONTWAIT,
                )
            };
            if peeked > 0 {
                ProbeResult::Data
            } else if peeked == 0 {
                ProbeResult::Closed
            } else {
                let errno = std::io::Error::last_os_error().raw_os_error();
                if errno == Some(libc::EAGAIN)
                    || errno == Some(libc::EWOULDBLOCK)
                    || errno == Some(libc::EINTR)
                {
                    ProbeResult::Idle
                } else {
                    ProbeResult::Error
                }
            }
        }
    }
}

use std::{sync::Arc, time::Duration};

pub use error::ConnectionError;
pub use set::{ConnectionSet, Readiness, SelectResult};
pub use tcp::{TcpConnection, TcpConnectionListener};

/// The kind of transport a connection runs on.
///
/// Fabric links (MPI-like interconnects) are external collaborators: they
/// implement [`Connection`] outside this crate and identify as `FabricLink`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    StreamSocket,
    LocalPipe,
    FabricLink,
}

/// One live bidirectional byte stream to a peer.
///
/// A connection is exclusively owned by its node; reader threads and senders
/// share it behind an [`Arc`]. Once closed a connection is never reused.
pub trait Connection: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Human-readable peer description (host:port or equivalent).
    fn peer(&self) -> String;

    /// Blocking read. Returns the number of bytes read (at least 1), or
    /// [`ConnectionError::ClosedByPeer`] once the peer closes or `close` is
    /// called from another thread.
    fn read(&self, buffer: &mut [u8]) -> Result<usize, ConnectionError>;

    /// Blocking, fully-buffered send. Does not return until every byte is
    /// queued to the transport; partial writes are retried internally.
    /// Concurrent writers are serialized so packet bytes never interleave.
    fn write(&self, bytes: &[u8]) -> Result<(), ConnectionError>;

    /// Idempotent close, safe to call from any thread. Unblocks in-progress
    /// reads with [`ConnectionError::ClosedByPeer`].
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// An independently-readable probe for readiness watching. The probe
    /// shares the transport but never consumes data from it.
    fn probe(&self) -> Result<Box<dyn ReadProbe>, ConnectionError>;
}

/// Shared handle to a connection.
pub type ConnectionRef = Arc<dyn Connection>;

/// Outcome of one readiness probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    /// Data is available to read.
    Data,
    /// The peer closed the connection.
    Closed,
    /// The transport reported an error.
    Error,
    /// Nothing happened within the probe interval.
    Idle,
}

/// Non-consuming readiness watcher over one connection, used by
/// [`ConnectionSet`] watcher threads.
pub trait ReadProbe: Send {
    /// Wait up to `interval` for the connection to become readable.
    fn wait_readable(&self, interval: Duration) -> ProbeResult;
}

/// Helper used by both stream transports: reads exactly `buffer.len()` bytes.
pub(crate) fn read_exact_from(
    connection: &dyn Connection,
    buffer: &mut [u8],
) -> Result<(), ConnectionError> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = connection.read(&mut buffer[filled..])?;
        filled += read;
    }
    Ok(())
}
