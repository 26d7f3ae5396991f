use std::{
    io::{Read, Write},
    net::Shutdown,
    os::unix::{
        io::AsRawFd,
        net::{UnixListener, UnixStream},
    },
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

use super::{Connection, ConnectionError, ProbeResult, ReadProbe, TransportKind};

/// A connection over a local (same-host) pipe, backed by a unix domain
/// socket. Used between co-located processes and as the loopback transport in
/// tests.
pub struct PipeConnection {
    stream: UnixStream,
    peer: String,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl PipeConnection {
    /// Connect to a listening pipe at `path`.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self, ConnectionError> {
        let peer = path.as_ref().display().to_string();
        let stream = UnixStream::connect(path).map_err(ConnectionError::from_io)?;
        Ok(Self::from_stream(stream, peer))
    }

    /// An anonymous, already-connected pair of pipe endpoints.
    pub fn pair() -> Result<(Self, Self), ConnectionError> {
        let (a, b) = UnixStream::pair().map_err(ConnectionError::from_io)?;
        Ok((
            Self::from_stream(a, "pipe:a".to_string()),
            Self::from_stream(b, "pipe:b".to_string()),
        ))
    }

    fn from_stream(stream: UnixStream, peer: String) -> Self {
        Self {
            stream,
            peer,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }
}

impl Connection for PipeConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalPipe
    }

    fn peer(&self) -> String {
        self.peer.clone()
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
        let stream = self.stream.try_clone().map_err(ConnectionError::from_io)?;
        Ok(Box::new(PipeProbe { stream }))
    }
}

impl Drop for PipeConnection {
    fn drop(&mut self) {
        self.close();
    }
}

struct PipeProbe {
    // dup'd descriptor: independent of the connection's reads, and its
    // socket options are never touched
    stream: UnixStream,
}

impl ReadProbe for PipeProbe {
    fn wait_readable(&self, interval: Duration) -> ProbeResult {
        super::wait_fd_readable(self.stream.as_raw_fd(), interval)
    }
}

/// Accepts inbound pipe connections at a filesystem path.
pub struct PipeConnectionListener {
    listener: UnixListener,
    path: String,
}

impl PipeConnectionListener {
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Self, ConnectionError> {
        let display = path.as_ref().display().to_string();
        let listener = UnixListener::bind(path).map_err(ConnectionError::from_io)?;
        Ok(Self {
            listener,
            path: display,
        })
    }

    pub fn accept(&self) -> Result<PipeConnection, ConnectionError> {
        let (stream, _addr) = self.listener.accept().map_err(ConnectionError::from_io)?;
        Ok(PipeConnection::from_stream(stream, self.path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::read_exact_from;

    #[test]
    fn pair_round_trip() {
        let (a, b) = PipeConnection::pair().unwrap();
        a.write(b"viewport").unwrap();

        let mut buffer = [0u8; 8];
        read_exact_from(&b, &mut buffer).unwrap();
        assert_eq!(&buffer, b"viewport");
        assert_eq!(a.kind(), TransportKind::LocalPipe);
    }

    #[test]
    fn closed_pair_reports_closed_by_peer() {
        let (a, b) = PipeConnection::pair().unwrap();
        drop(a);

        let mut buffer = [0u8; 1];
        assert_eq!(b.read(&mut buffer), Err(ConnectionError::ClosedByPeer));
        assert_eq!(b.write(b"x"), Err(ConnectionError::ClosedByPeer));
    }

    #[test]
    fn probing_leaves_blocking_reads_blocking() {
        use std::{sync::Arc, thread};

        let (a, b) = PipeConnection::pair().unwrap();
        let probe = a.probe().unwrap();
        assert_eq!(
            probe.wait_readable(Duration::from_millis(20)),
            ProbeResult::Idle
        );

        let a = Arc::new(a);
        let reader = {
            let a = Arc::clone(&a);
            thread::spawn(move || {
                let mut buffer = [0u8; 1];
                a.read(&mut buffer)
            })
        };

        thread::sleep(Duration::from_millis(150));
        assert!(!reader.is_finished());

        b.write(b"k").unwrap();
        assert_eq!(reader.join().unwrap(), Ok(1));
    }
}
