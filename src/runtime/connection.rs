//! Client connections and the registry that owns them.
//!
//! The multiplexer owns the registry and is the only thread that registers,
//! reads from, or removes connections. Work items carry an `Arc` to their
//! connection so a worker can write the response; the socket is closed once
//! the registry and every in-flight work item have let go of it. A worker
//! whose response write fails shuts the socket down early with
//! [`Connection::close`].

use mio::net::TcpStream;
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Pause between attempts when the socket send buffer is full.
const WRITE_RETRY_PAUSE: Duration = Duration::from_micros(50);

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    id: usize,
    stream: TcpStream,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl Connection {
    /// Registry key, also used as the poll token and for worker affinity.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Whether a worker has given up on this connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shut the socket down in both directions and mark it closed.
    ///
    /// Responses still queued for it are skipped; the multiplexer sees EOF
    /// on its next read and deregisters the connection.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // NotConnected if the peer already went away
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    /// One non-blocking read.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    /// Write a complete response, retrying while the socket would block.
    ///
    /// Gives up with `TimedOut` once `timeout` has elapsed. Fails with
    /// `NotConnected` without writing if the connection is closed.
    pub fn write_response(&self, data: &[u8], timeout: Duration) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let deadline = Instant::now() + timeout;
        let mut written = 0;

        while written < data.len() {
            match (&self.stream).write(&data[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "response write timed out",
                        ));
                    }
                    thread::sleep(WRITE_RETRY_PAUSE);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Registry of live connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Arc<Connection>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Take ownership of an accepted stream.
    ///
    /// Returns `None` (dropping, and so closing, the stream) if the registry
    /// is at capacity.
    pub fn insert(&mut self, stream: TcpStream, peer: SocketAddr) -> Option<Arc<Connection>> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let entry = self.connections.vacant_entry();
        let conn = Arc::new(Connection {
            id: entry.key(),
            stream,
            peer,
            closed: AtomicBool::new(false),
        });
        entry.insert(Arc::clone(&conn));
        Some(conn)
    }

    /// Get a connection by id.
    pub fn get(&self, id: usize) -> Option<&Arc<Connection>> {
        self.connections.get(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Arc<Connection>> {
        self.connections.try_remove(id)
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Arc<Connection>> + '_ {
        self.connections.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdListener;

    /// A connected (client, server-side mio stream) pair over loopback.
    fn socket_pair() -> (std::net::TcpStream, TcpStream, SocketAddr) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, TcpStream::from_std(server), peer)
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let (_c1, s1, p1) = socket_pair();
        let (_c2, s2, p2) = socket_pair();
        let (_c3, s3, p3) = socket_pair();

        let id1 = registry.insert(s1, p1).unwrap().id();
        let id2 = registry.insert(s2, p2).unwrap().id();
        assert_ne!(id1, id2);

        // At capacity
        assert!(registry.insert(s3, p3).is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(id2).unwrap().peer(), p2);

        registry.remove(id1);
        assert!(!registry.contains(id1));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(id1).is_none());
    }

    #[test]
    fn test_read_and_write() {
        use std::io::{Read as _, Write as _};

        let mut registry = ConnectionRegistry::new(4);
        let (mut client, server, peer) = socket_pair();
        let conn = registry.insert(server, peer).unwrap();

        let mut buf = [0u8; 64];
        let err = conn.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        client.write_all(b"ping").unwrap();
        client.flush().unwrap();
        let mut n = 0;
        for _ in 0..100 {
            match conn.read(&mut buf) {
                Ok(read) => {
                    n = read;
                    break;
                }
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        }
        assert_eq!(&buf[..n], b"ping");

        conn.write_response(b"pong\r\n", Duration::from_secs(1)).unwrap();
        let mut reply = [0u8; 6];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong\r\n");
    }

    #[test]
    fn test_close_sends_eof_and_refuses_writes() {
        use std::io::Read as _;

        let mut registry = ConnectionRegistry::new(4);
        let (mut client, server, peer) = socket_pair();
        let conn = registry.insert(server, peer).unwrap();

        assert!(!conn.is_closed());
        conn.close();
        conn.close();
        assert!(conn.is_closed());

        let started = Instant::now();
        let err = conn
            .write_response(b"late\r\n", Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(started.elapsed() < Duration::from_secs(1));

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_connection_outlives_registry_entry() {
        let mut registry = ConnectionRegistry::new(4);
        let (_client, server, peer) = socket_pair();
        let conn = registry.insert(server, peer).unwrap();
        let id = conn.id();

        let removed = registry.remove(id).unwrap();
        drop(removed);
        assert!(registry.is_empty());
        // the work-item side still holds a live socket
        assert!(conn.fd() >= 0);
    }
}
