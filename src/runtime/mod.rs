//! Request-processing runtime.
//!
//! - `event_loop`: single multiplexer thread (mio: epoll on Linux, kqueue on
//!   macOS) accepting connections and reading requests
//! - `queue`: bounded hand-off from the multiplexer to the workers, sharded
//!   by connection for per-connection ordering
//! - `worker`: fixed pool running the middleware/handler pipeline
//! - `connection`: connection registry owned by the multiplexer
//! - `stats`: shared counters
//!
//! [`Server`] ties them together. It is an ordinary value owned by its
//! caller; several can run in one process.

mod connection;
mod event_loop;
mod queue;
mod stats;
mod worker;

pub use connection::{Connection, ConnectionRegistry};
pub use queue::{HandoffQueue, WorkItem};
pub use stats::{ServerStats, StatsSnapshot};
pub use worker::RESPONSE_TERMINATOR;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::pipeline::{Handler, Middleware, Pipeline};
use event_loop::{EventLoop, WAKER_TOKEN};
use mio::{Poll, Waker};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};
use worker::Worker;

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: i32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// State shared between a server and its shutdown handles.
struct Shared {
    running: AtomicBool,
    phase: Mutex<Phase>,
    phase_changed: Condvar,
    waker: Mutex<Option<Arc<Waker>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Shared {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase() = phase;
        self.phase_changed.notify_all();
    }

    fn stop(&self) {
        {
            let mut phase = self.phase();
            match *phase {
                Phase::Idle => return,
                Phase::Starting | Phase::Running => *phase = Phase::Stopping,
                Phase::Stopping => {}
            }
            self.running.store(false, Ordering::Release);
        }
        self.phase_changed.notify_all();

        if let Some(waker) = self.waker.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            if let Err(e) = waker.wake() {
                error!(error = %e, "Failed to wake event loop");
            }
        }

        // workers are joined by the thread running start; waiting here from a
        // worker would never finish
        if worker::on_worker_thread() {
            return;
        }

        let mut phase = self.phase();
        while *phase != Phase::Idle {
            phase = self
                .phase_changed
                .wait(phase)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn wait_running(&self, timeout: Duration) -> Option<SocketAddr> {
        let deadline = Instant::now() + timeout;
        let mut phase = self.phase();
        while *phase != Phase::Running {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            phase = self
                .phase_changed
                .wait_timeout(phase, remaining)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        drop(phase);
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable handle for stopping a server from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    /// Stop the server and wait until its workers have been joined.
    ///
    /// Idempotent; a no-op if the server is not running.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Block until the server is accepting connections, returning the bound
    /// address, or `None` on timeout.
    pub fn wait_ready(&self, timeout: Duration) -> Option<SocketAddr> {
        self.shared.wait_running(timeout)
    }

    pub fn is_running(&self) -> bool {
        *self.shared.phase() == Phase::Running
    }
}

/// The request server.
///
/// Register handlers and middleware, then call [`Server::start`], which
/// blocks until [`Server::stop`] (or a [`ShutdownHandle`]) stops it.
pub struct Server {
    config: ServerConfig,
    pipeline: Pipeline,
    stats: Arc<ServerStats>,
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            pipeline: Pipeline::new(),
            stats: Arc::new(ServerStats::new()),
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                phase: Mutex::new(Phase::Idle),
                phase_changed: Condvar::new(),
                waker: Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Initialize the handler and append it to the dispatch order.
    pub fn register_handler(&mut self, handler: Box<dyn Handler>) -> Result<(), ServerError> {
        self.pipeline.add_handler(handler)
    }

    /// Append the middleware and re-sort by priority.
    pub fn register_middleware(&mut self, middleware: Box<dyn Middleware>) {
        self.pipeline.add_middleware(middleware);
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Address bound by the current or most recent run.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop the server. See [`ShutdownHandle::stop`].
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Bind the configured address and serve until stopped.
    pub fn start(&self) -> Result<(), ServerError> {
        self.start_on(self.config.port)
    }

    /// Bind `host:port` and serve until stopped.
    pub fn start_on(&self, port: u16) -> Result<(), ServerError> {
        {
            let mut phase = self.shared.phase();
            if *phase != Phase::Idle {
                return Err(ServerError::AlreadyRunning);
            }
            *phase = Phase::Starting;
            self.shared.running.store(true, Ordering::Release);
        }

        let result = self.serve(port);

        self.shared.running.store(false, Ordering::Release);
        *self.shared.waker.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.shared.set_phase(Phase::Idle);

        match &result {
            Ok(()) => info!("Server stopped"),
            Err(e) => error!(error = %e, "Server failed"),
        }
        result
    }

    fn serve(&self, port: u16) -> Result<(), ServerError> {
        let addr = resolve_addr(&self.config.host, port)?;
        let listener = create_listener(addr)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new().map_err(ServerError::Poll)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(ServerError::Poll)?);

        let workers = self.config.worker_count();
        let queue = HandoffQueue::new(workers, self.config.queue_capacity);
        let mut event_loop = EventLoop::new(
            poll,
            listener,
            &queue,
            &self.stats,
            &self.shared.running,
            &self.config,
        )?;

        *self.shared.waker.lock().unwrap_or_else(|e| e.into_inner()) = Some(waker);
        *self.shared.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local_addr);
        {
            let mut phase = self.shared.phase();
            if *phase == Phase::Stopping {
                return Ok(());
            }
            *phase = Phase::Running;
        }
        self.shared.phase_changed.notify_all();

        info!(
            addr = %local_addr,
            workers,
            queue_shard_capacity = queue.shard_capacity(),
            handlers = self.pipeline.handler_count(),
            middleware = ?self.pipeline.middleware_order(),
            "Server listening"
        );

        thread::scope(|scope| {
            for id in 0..workers {
                let worker = Worker {
                    id,
                    queue: &queue,
                    pipeline: &self.pipeline,
                    stats: &self.stats,
                    running: &self.shared.running,
                    config: &self.config,
                };
                let spawned = thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn_scoped(scope, move || worker.run());
                if let Err(e) = spawned {
                    // already-spawned workers must observe shutdown before
                    // the scope joins them
                    self.shared.running.store(false, Ordering::Release);
                    return Err(ServerError::Spawn(e));
                }
            }

            let result = event_loop.run();
            self.shared.running.store(false, Ordering::Release);
            result.map_err(ServerError::from)
        })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ServerError::InvalidAddress(format!("{host}:{port}")))
}

/// Create a non-blocking TCP listener with `SO_REUSEADDR`.
fn create_listener(addr: SocketAddr) -> Result<mio::net::TcpListener, ServerError> {
    let bind = |source: std::io::Error| ServerError::Bind { addr, source };

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(bind)?;

    socket.set_reuse_address(true).map_err(bind)?;
    socket.set_nonblocking(true).map_err(bind)?;
    socket.bind(&addr.into()).map_err(bind)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(mio::net::TcpListener::from_std(listener))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_without_start_is_noop() {
        let server = Server::new(ServerConfig::default());
        server.stop();
        server.stop();
        assert!(!server.handle().is_running());
    }

    #[test]
    fn test_resolve_addr() {
        assert_eq!(
            resolve_addr("127.0.0.1", 8080).unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
        assert!(matches!(
            resolve_addr("not a host", 1),
            Err(ServerError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = Server::new(ServerConfig {
            host: "127.0.0.1".to_string(),
            workers: 1,
            ..ServerConfig::default()
        });
        assert!(matches!(
            server.start_on(port),
            Err(ServerError::Bind { .. })
        ));
        // a failed start leaves the server restartable
        assert!(!server.handle().is_running());
    }

    #[test]
    fn test_start_stop_from_another_thread() {
        let server = Server::new(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            workers: 2,
            ..ServerConfig::default()
        });
        let handle = server.handle();

        let runner = thread::spawn(move || server.start());
        let addr = handle.wait_ready(Duration::from_secs(5)).unwrap();
        assert_ne!(addr.port(), 0);
        assert!(handle.is_running());

        handle.stop();
        handle.stop();
        assert!(runner.join().unwrap().is_ok());
        assert!(!handle.is_running());
    }
}
