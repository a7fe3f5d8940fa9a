//! Connection multiplexer.
//!
//! Readiness-based model: poll tells us when the listener or a connection is
//! ready, then we perform non-blocking accept/read syscalls. mio registers
//! sockets edge-triggered (epoll `EPOLLET`, kqueue `EV_CLEAR`), so every
//! readiness event is drained until the call would block.
//!
//! This thread never writes to sockets and never waits on queue capacity:
//! reads become work items, and a full shard drops the item.

use crate::config::ServerConfig;
use bytes::Bytes;
use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::connection::ConnectionRegistry;
use super::queue::{HandoffQueue, WorkItem};
use super::stats::ServerStats;

pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

pub(crate) struct EventLoop<'a> {
    poll: Poll,
    listener: TcpListener,
    connections: ConnectionRegistry,
    queue: &'a HandoffQueue<WorkItem>,
    stats: &'a ServerStats,
    running: &'a AtomicBool,
    config: &'a ServerConfig,
    read_buf: Vec<u8>,
}

impl<'a> EventLoop<'a> {
    /// Register the listener and prepare the loop. The poll instance must
    /// already carry the shutdown waker under [`WAKER_TOKEN`].
    pub(crate) fn new(
        poll: Poll,
        mut listener: TcpListener,
        queue: &'a HandoffQueue<WorkItem>,
        stats: &'a ServerStats,
        running: &'a AtomicBool,
        config: &'a ServerConfig,
    ) -> io::Result<Self> {
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            connections: ConnectionRegistry::new(config.max_connections),
            queue,
            stats,
            running,
            config,
            read_buf: vec![0u8; config.read_buffer_size.max(1)],
        })
    }

    /// Run until the running flag is cleared.
    pub(crate) fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.config.max_events.max(1));
        let timeout = Some(self.config.poll_timeout());

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => trace!("Event loop woken"),
                    Token(conn_id) => self.handle_readable(conn_id),
                }
            }
        }

        self.close_all();
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if !self.running.load(Ordering::Acquire) {
                        return;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let conn = match self.connections.insert(stream, peer) {
                        Some(conn) => conn,
                        None => {
                            warn!(peer = %peer, "Connection limit reached");
                            continue;
                        }
                    };

                    let conn_id = conn.id();
                    let fd = conn.fd();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut SourceFd(&fd), Token(conn_id), Interest::READABLE)
                    {
                        debug!(conn_id, peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    self.stats.record_accept();
                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, conn_id: usize) {
        let conn = match self.connections.get(conn_id) {
            Some(conn) => Arc::clone(conn),
            None => return,
        };

        loop {
            match conn.read(&mut self.read_buf) {
                Ok(0) => {
                    self.close_connection(conn_id);
                    return;
                }
                Ok(n) => {
                    let item = WorkItem {
                        conn: Arc::clone(&conn),
                        payload: Bytes::copy_from_slice(&self.read_buf[..n]),
                        received_at: Instant::now(),
                    };
                    if self.queue.enqueue(conn_id, item) {
                        self.stats.record_enqueued();
                    } else {
                        self.stats.record_dropped();
                        debug!(conn_id, bytes = n, "Hand-off queue full, request dropped");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id, error = %e, "Read error");
                    self.close_connection(conn_id);
                    return;
                }
            }
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(conn) = self.connections.remove(conn_id) {
            let fd = conn.fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            self.stats.record_close();
            debug!(conn_id, peer = %conn.peer(), "Connection closed");
        }
    }

    fn close_all(&mut self) {
        let remaining: Vec<_> = self.connections.drain().collect();
        for conn in &remaining {
            let fd = conn.fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            self.stats.record_close();
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
        info!(connections = remaining.len(), "Event loop stopped");
    }
}
