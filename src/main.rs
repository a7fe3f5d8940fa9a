//! relay-server: the reference server binary.
//!
//! Registers the built-in handlers (echo, calculator, file) and middleware
//! (logging, authentication, rate limiting, validation), then serves until
//! SIGINT or SIGTERM.

use relay_core::config::Config;
use relay_core::handlers::{CalculatorHandler, EchoHandler, FileHandler};
use relay_core::middleware::{
    AuthMiddleware, LoggingMiddleware, RateLimitMiddleware, ValidationMiddleware,
};
use relay_core::{Server, ServerStats, ShutdownHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    info!(
        host = %config.server.host,
        port = config.server.port,
        workers = config.server.worker_count(),
        queue_capacity = config.server.queue_capacity,
        rate_limit = config.rate_limit,
        file_root = %config.file_root.display(),
        "Starting relay server"
    );

    let mut server = Server::new(config.server.clone());

    server.register_handler(Box::new(EchoHandler))?;
    server.register_handler(Box::new(CalculatorHandler))?;
    server.register_handler(Box::new(FileHandler::new(config.file_root.clone())))?;

    server.register_middleware(Box::new(LoggingMiddleware));
    server.register_middleware(Box::new(AuthMiddleware::new(config.token.clone())));
    server.register_middleware(Box::new(RateLimitMiddleware::with_window(
        config.rate_limit,
        config.rate_window,
    )));
    server.register_middleware(Box::new(ValidationMiddleware::new(
        config.max_request_length,
        config.commands.clone(),
    )));

    install_signal_handlers();
    spawn_signal_watcher(server.handle())?;
    if config.server.stats_interval_secs > 0 {
        spawn_stats_reporter(
            server.stats(),
            Duration::from_secs(config.server.stats_interval_secs),
        )?;
    }

    server.start()?;

    let stats = server.stats().snapshot();
    info!(
        requests = stats.requests_completed,
        dropped = stats.requests_dropped,
        avg_latency_us = stats.average_latency_us,
        "Shutdown complete"
    );
    Ok(())
}

fn install_signal_handlers() {
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Turn a delivered signal into a graceful stop.
fn spawn_signal_watcher(handle: ShutdownHandle) -> std::io::Result<()> {
    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || loop {
            if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
                warn!("Shutdown signal received");
                handle.stop();
                return;
            }
            thread::sleep(Duration::from_millis(100));
        })?;
    Ok(())
}

/// Periodically log a stats snapshot.
fn spawn_stats_reporter(stats: Arc<ServerStats>, interval: Duration) -> std::io::Result<()> {
    thread::Builder::new()
        .name("stats".to_string())
        .spawn(move || loop {
            thread::sleep(interval);
            let snap = stats.snapshot();
            info!(
                connections = snap.connections_active,
                accepted = snap.connections_accepted,
                requests = snap.requests_completed,
                dropped = snap.requests_dropped,
                write_failures = snap.write_failures,
                avg_latency_us = snap.average_latency_us,
                uptime_secs = snap.uptime_seconds,
                "Server stats"
            );
        })?;
    Ok(())
}
