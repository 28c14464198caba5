//! iobench: a client/server I/O micro-benchmark
//!
//! Started without server addresses the process is a server; otherwise it is
//! a client driving the listed servers with read and write operations.
//!
//! Features:
//! - Global and per-connection concurrency windows
//! - Chunked transfers over pooled buffers
//! - Deterministic payload content with optional validation
//! - Connect retries and reply timeouts
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod protocol;
mod random;
mod runtime;
mod server;
mod status;

use std::net::SocketAddr;

use config::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use client::Client;
use runtime::TcpTransport;
use server::Server;
use status::{RunStatus, TerminateFlag};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        pid = std::process::id(),
        host = %hostname(),
        time = %chrono::Local::now().to_rfc3339(),
        seed = config.seed,
        "Starting iobench {}",
        if config.is_client() { "client" } else { "server" }
    );

    status::install_signal_handler()?;
    let terminate = TerminateFlag::new();

    let status = if config.is_client() {
        run_client(config, terminate)?
    } else {
        run_server(config, terminate)?
    };

    info!("Exit status: {}", status);
    if !status.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_server(
    config: Config,
    terminate: TerminateFlag,
) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let transport = TcpTransport::new(config.connect_timeout, config.max_frame_len())?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let mut server = Server::new(config, transport, terminate)?;

    if let Err(e) = server.listen(addr) {
        error!(addr = %addr, error = %e, "failed to listen");
        return Err(e.into());
    }
    Ok(server.run())
}

fn run_client(
    config: Config,
    terminate: TerminateFlag,
) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let transport = TcpTransport::new(config.connect_timeout, config.max_frame_len())?;
    let mut client = Client::new(config, transport, terminate)?;
    Ok(client.run())
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer outlives the call and its length is passed along.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if ret != 0 {
        return "<unknown>".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}
