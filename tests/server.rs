//! End-to-end tests against a live server on an ephemeral loopback port.

use relay_core::error::HandlerError;
use relay_core::handlers::{CalculatorHandler, EchoHandler, FileHandler};
use relay_core::middleware::{
    AuthMiddleware, LoggingMiddleware, RateLimitMiddleware, ValidationMiddleware,
};
use relay_core::{Handler, Request, Server, ServerConfig, ServerError, ServerStats, ShutdownHandle};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const TOKEN: &str = "secret123";

struct Running {
    handle: ShutdownHandle,
    addr: SocketAddr,
    stats: Arc<ServerStats>,
    runner: JoinHandle<Result<(), ServerError>>,
}

impl Running {
    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn shutdown(self) {
        self.handle.stop();
        assert!(self.runner.join().unwrap().is_ok());
    }
}

fn test_config(workers: usize) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        workers,
        stats_interval_secs: 0,
        ..ServerConfig::default()
    }
}

fn spawn(server: Server) -> Running {
    let handle = server.handle();
    let stats = server.stats();
    let runner = thread::spawn(move || server.start());
    let addr = handle
        .wait_ready(Duration::from_secs(5))
        .expect("server did not start");
    Running {
        handle,
        addr,
        stats,
        runner,
    }
}

/// The full built-in handler and middleware stack.
fn standard_server(file_root: &Path, rate_limit: u64) -> Running {
    let mut server = Server::new(test_config(2));
    server.register_handler(Box::new(EchoHandler)).unwrap();
    server.register_handler(Box::new(CalculatorHandler)).unwrap();
    server
        .register_handler(Box::new(FileHandler::new(file_root)))
        .unwrap();
    server.register_middleware(Box::new(ValidationMiddleware::default()));
    server.register_middleware(Box::new(RateLimitMiddleware::new(rate_limit)));
    server.register_middleware(Box::new(LoggingMiddleware));
    server.register_middleware(Box::new(AuthMiddleware::new(TOKEN)));
    spawn(server)
}

/// Send one request line and read one `\r\n`-terminated response.
fn roundtrip(stream: &mut TcpStream, line: &str) -> std::io::Result<String> {
    stream.write_all(format!("{line}\r\n").as_bytes())?;

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    while !response.ends_with(b"\r\n") {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(ErrorKind::UnexpectedEof.into());
        }
        response.extend_from_slice(&buf[..n]);
    }
    response.truncate(response.len() - 2);
    Ok(String::from_utf8(response).unwrap())
}

#[test]
fn echo_with_valid_token() {
    let dir = tempfile::tempdir().unwrap();
    let server = standard_server(dir.path(), 1000);
    let mut conn = server.connect();

    assert_eq!(
        roundtrip(&mut conn, "TOKEN:secret123 ECHO Hello World").unwrap(),
        "ECHO: Hello World"
    );
    // a connection serves any number of requests
    assert_eq!(
        roundtrip(&mut conn, "TOKEN:secret123 echo again").unwrap(),
        "ECHO: again"
    );

    server.shutdown();
}

#[test]
fn rejected_requests_get_an_error_line() {
    let dir = tempfile::tempdir().unwrap();
    let server = standard_server(dir.path(), 1000);
    let mut conn = server.connect();

    let bad_token = roundtrip(&mut conn, "TOKEN:wrong ECHO Hello").unwrap();
    assert_eq!(bad_token, "ERROR: Authentication failed");

    let no_token = roundtrip(&mut conn, "ECHO Hello").unwrap();
    assert_eq!(no_token, "ERROR: Authentication failed");

    let unknown = roundtrip(&mut conn, "TOKEN:secret123 UNKNOWN thing").unwrap();
    assert_eq!(unknown, "ERROR: Unknown command");

    let too_long = format!("TOKEN:secret123 ECHO {}", "x".repeat(2000));
    assert_eq!(
        roundtrip(&mut conn, &too_long).unwrap(),
        "ERROR: Request too long"
    );

    server.shutdown();
}

#[test]
fn failed_auth_has_no_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let server = standard_server(dir.path(), 1000);
    let mut conn = server.connect();

    assert_eq!(
        roundtrip(&mut conn, "TOKEN:wrong WRITE x.txt data").unwrap(),
        "ERROR: Authentication failed"
    );
    assert_eq!(
        roundtrip(&mut conn, "WRITE y.txt data").unwrap(),
        "ERROR: Authentication failed"
    );
    assert!(!dir.path().join("x.txt").exists());
    assert!(!dir.path().join("y.txt").exists());

    server.shutdown();
}

#[test]
fn calculator_requests() {
    let dir = tempfile::tempdir().unwrap();
    let server = standard_server(dir.path(), 1000);
    let mut conn = server.connect();

    assert_eq!(
        roundtrip(&mut conn, "TOKEN:secret123 CAL 2 + 3 * 4").unwrap(),
        "RESULT: 14"
    );
    assert_eq!(
        roundtrip(&mut conn, "TOKEN:secret123 CAL (1 + 2) / 4").unwrap(),
        "RESULT: 0.75"
    );
    assert_eq!(
        roundtrip(&mut conn, "TOKEN:secret123 CAL 1 / 0").unwrap(),
        "ERROR: Division by zero"
    );

    server.shutdown();
}

#[test]
fn write_then_read_file() {
    let dir = tempfile::tempdir().unwrap();
    let server = standard_server(dir.path(), 1000);
    let mut conn = server.connect();

    assert_eq!(
        roundtrip(&mut conn, "TOKEN:secret123 WRITE notes.txt hello there").unwrap(),
        "SUCCESS: File written successfully"
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
        "hello there"
    );
    assert_eq!(
        roundtrip(&mut conn, "TOKEN:secret123 READ notes.txt").unwrap(),
        "FILE_CONTENT: hello there"
    );

    let missing = roundtrip(&mut conn, "TOKEN:secret123 READ absent.txt").unwrap();
    assert!(missing.starts_with("ERROR:"), "{missing}");

    let escape = roundtrip(&mut conn, "TOKEN:secret123 READ ../etc/passwd").unwrap();
    assert!(escape.starts_with("ERROR:"), "{escape}");

    server.shutdown();
}

#[test]
fn rate_limit_rejects_excess_requests() {
    let dir = tempfile::tempdir().unwrap();
    let server = standard_server(dir.path(), 3);
    let mut conn = server.connect();

    for i in 0..3 {
        assert_eq!(
            roundtrip(&mut conn, &format!("TOKEN:secret123 ECHO {i}")).unwrap(),
            format!("ECHO: {i}")
        );
    }
    assert_eq!(
        roundtrip(&mut conn, "TOKEN:secret123 ECHO 3").unwrap(),
        "ERROR: Rate limit exceeded"
    );

    server.shutdown();
}

#[test]
fn concurrent_connections_keep_their_own_responses() {
    const CLIENTS: usize = 8;
    const REQUESTS: usize = 20;

    let dir = tempfile::tempdir().unwrap();
    let server = standard_server(dir.path(), 100_000);

    let clients: Vec<_> = (0..CLIENTS)
        .map(|client| {
            let mut conn = server.connect();
            thread::spawn(move || {
                for i in 0..REQUESTS {
                    let payload = format!("client-{client}-request-{i}");
                    let response =
                        roundtrip(&mut conn, &format!("TOKEN:secret123 ECHO {payload}")).unwrap();
                    assert_eq!(response, format!("ECHO: {payload}"));
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    let stats = server.stats.snapshot();
    assert_eq!(stats.requests_completed, (CLIENTS * REQUESTS) as u64);
    assert_eq!(stats.requests_dropped, 0);
    assert_eq!(stats.connections_accepted, CLIENTS as u64);

    server.shutdown();
}

struct SlowHandler(Duration);

impl Handler for SlowHandler {
    fn name(&self) -> &str {
        "slow"
    }

    fn handle(&self, request: &Request) -> Option<Result<String, HandlerError>> {
        if !request.is_command("SLOW") {
            return None;
        }
        thread::sleep(self.0);
        Some(Ok("DONE".to_string()))
    }
}

#[test]
fn saturated_queue_drops_and_recovers() {
    let mut server = Server::new(ServerConfig {
        queue_capacity: 2,
        ..test_config(1)
    });
    server
        .register_handler(Box::new(SlowHandler(Duration::from_millis(50))))
        .unwrap();
    server.register_handler(Box::new(EchoHandler)).unwrap();
    let server = spawn(server);

    let mut conns: Vec<TcpStream> = (0..20).map(|_| server.connect()).collect();
    for conn in &mut conns {
        conn.set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        conn.write_all(b"SLOW\r\n").unwrap();
    }

    let mut answered = 0;
    let mut timed_out = 0;
    for conn in &mut conns {
        let mut buf = [0u8; 64];
        match conn.read(&mut buf) {
            Ok(n) if n > 0 => {
                assert_eq!(&buf[..n], b"DONE\r\n");
                answered += 1;
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                timed_out += 1
            }
            other => panic!("unexpected read result: {other:?}"),
        }
    }

    assert!(answered >= 1);
    assert!(timed_out >= 1);
    let stats = server.stats.snapshot();
    assert!(stats.requests_dropped >= 1);
    assert_eq!(stats.requests_dropped + stats.requests_enqueued, 20);

    // once drained, the server keeps serving
    let mut fresh = server.connect();
    assert_eq!(roundtrip(&mut fresh, "ECHO still alive").unwrap(), "ECHO: still alive");

    server.shutdown();
}

#[test]
fn unclaimed_request_gets_no_handler_error() {
    let mut server = Server::new(test_config(1));
    server.register_handler(Box::new(EchoHandler)).unwrap();
    let server = spawn(server);
    let mut conn = server.connect();

    assert_eq!(
        roundtrip(&mut conn, "PING").unwrap(),
        "ERROR: No service available to handle request"
    );

    server.shutdown();
}

#[test]
fn stop_is_idempotent_and_server_restarts() {
    let server = Server::new(test_config(1));
    let handle = server.handle();
    let server = Arc::new(server);

    let first = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.start())
    };
    assert!(handle.wait_ready(Duration::from_secs(5)).is_some());
    assert!(matches!(server.start(), Err(ServerError::AlreadyRunning)));

    handle.stop();
    handle.stop();
    assert!(first.join().unwrap().is_ok());
    assert!(!handle.is_running());

    let second = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.start())
    };
    assert!(handle.wait_ready(Duration::from_secs(5)).is_some());
    server.stop();
    assert!(second.join().unwrap().is_ok());
}
