use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use super::{Connection, ConnectionError, ReadProbe, TransportKind};

#[cfg(unix)]
use std::{os::unix::io::AsRawFd, time::Duration};

#[cfg(unix)]
use super::ProbeResult;

/// A connection over a TCP/IP stream socket.
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl TcpConnection {
    /// Establish an outbound connection to `address`.
    pub fn connect<A: ToSocketAddrs>(address: A) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect(address).map_err(ConnectionError::from_io)?;
        Self::from_stream(stream)
    }

    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self, ConnectionError> {
        stream.set_nodelay(true).map_err(ConnectionError::from_io)?;
        let peer = stream.peer_addr().map_err(ConnectionError::from_io)?;
        Ok(Self {
            stream,
            peer,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }
}

impl Connection for TcpConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamSocket
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn read(&self, buffer: &mut [u8]) -> Result<usize, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::ClosedByPeer);
        }
        match (&self.stream).read(buffer) {
            Ok(0) => Err(ConnectionError::ClosedByPeer),
            Ok(read) => Ok(read),
            Err(error) => {
                if self.is_closed() {
                    // close() shut the socket down under us
                    return Err(ConnectionError::ClosedByPeer);
                }
                Err(ConnectionError::from_io(error))
            }
        }
    }

    fn write(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::ClosedByPeer);
        }
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (&self.stream)
            .write_all(bytes)
            .map_err(ConnectionError::from_io)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn probe(&self) -> Result<Box<dyn ReadProbe>, ConnectionError> {
        #[cfg(unix)]
        {
            let stream = self.stream.try_clone().map_err(ConnectionError::from_io)?;
            Ok(Box::new(TcpProbe { stream }))
        }
        #[cfg(not(unix))]
        {
            Err(ConnectionError::Transport {
                detail: "readiness probing requires a poll-capable platform".to_string(),
            })
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(unix)]
struct TcpProbe {
    // dup'd descriptor: independent of the connection's reads, and its
    // socket options are never touched
    stream: TcpStream,
}

#[cfg(unix)]
impl ReadProbe for TcpProbe {
    fn wait_readable(&self, interval: Duration) -> ProbeResult {
        super::wait_fd_readable(self.stream.as_raw_fd(), interval)
    }
}

/// Accepts inbound TCP connections for server-side nodes.
pub struct TcpConnectionListener {
    listener: TcpListener,
}

impl TcpConnectionListener {
    pub fn bind<A: ToSocketAddrs>(address: A) -> Result<Self, ConnectionError> {
        let listener = TcpListener::bind(address).map_err(ConnectionError::from_io)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ConnectionError> {
        self.listener.local_addr().map_err(ConnectionError::from_io)
    }

    /// Block until an inbound connection arrives.
    pub fn accept(&self) -> Result<TcpConnection, ConnectionError> {
        let (stream, _addr) = self.listener.accept().map_err(ConnectionError::from_io)?;
        TcpConnection::from_stream(stream)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;
    use crate::connection::read_exact_from;

    fn loopback_pair() -> (TcpConnection, TcpConnection) {
        let listener = TcpConnectionListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpConnection::connect(address).unwrap());
        let server = listener.accept().unwrap();
        (server, client.join().unwrap())
    }

    #[test]
    fn write_then_read_round_trip() {
        let (server, client) = loopback_pair();

        client.write(b"frustum").unwrap();
        let mut buffer = [0u8; 7];
        read_exact_from(&server, &mut buffer).unwrap();
        assert_eq!(&buffer, b"frustum");
    }

    #[test]
    fn read_reports_peer_close() {
        let (server, client) = loopback_pair();
        client.close();

        let mut buffer = [0u8; 4];
        assert_eq!(server.read(&mut buffer), Err(ConnectionError::ClosedByPeer));
    }

    #[test]
    fn close_unblocks_reader_on_other_thread() {
        let (server, _client) = loopback_pair();
        let server = Arc::new(server);

        let reader = {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                let mut buffer = [0u8; 4];
                server.read(&mut buffer)
            })
        };

        thread::sleep(Duration::from_millis(50));
        server.close();
        assert_eq!(reader.join().unwrap(), Err(ConnectionError::ClosedByPeer));
    }

    #[test]
    fn close_is_idempotent() {
        let (server, _client) = loopback_pair();
        server.close();
        server.close();
        assert!(server.is_closed());
    }

    #[cfg(unix)]
    #[test]
    fn probe_sees_data_and_close() {
        let (server, client) = loopback_pair();
        let probe = server.probe().unwrap();

        assert_eq!(
            probe.wait_readable(Duration::from_millis(20)),
            ProbeResult::Idle
        );

        client.write(b"x").unwrap();
        assert_eq!(
            probe.wait_readable(Duration::from_secs(1)),
            ProbeResult::Data
        );

        // Peek does not consume: the data is still readable.
        let mut buffer = [0u8; 1];
        assert_eq!(server.read(&mut buffer).unwrap(), 1);

        client.close();
        assert_eq!(
            probe.wait_readable(Duration::from_secs(1)),
            ProbeResult::Closed
        );
    }

    #[cfg(unix)]
    #[test]
    fn probing_leaves_blocking_reads_blocking() {
        let (server, client) = loopback_pair();
        let probe = server.probe().unwrap();
        assert_eq!(
            probe.wait_readable(Duration::from_millis(20)),
            ProbeResult::Idle
        );

        let server = Arc::new(server);
        let reader = {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                let mut buffer = [0u8; 1];
                server.read(&mut buffer)
            })
        };

        // Well past the probe interval the read must still be blocked, not
        // failed with a timeout inherited from the watcher.
        thread::sleep(Duration::from_millis(150));
        assert!(!reader.is_finished());

        client.write(b"k").unwrap();
        assert_eq!(reader.join().unwrap(), Ok(1));
    }
}
