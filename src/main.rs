#![warn(clippy::all)]

mod error;
mod filter;
mod relay;
mod request;
mod response;
mod target;

use crate::filter::FilterSet;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info};

// ============================================================================
// CONSTANTS
// ============================================================================

const DEFAULT_PORT: u16 = 49999;
const LISTEN_BACKLOG: i32 = 1024;

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Filter list, one substring per line. Requests whose target contains
    /// any of them are answered with 403.
    #[arg(long)]
    filter: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    timeout_connect: u64,

    /// Answer non-GET requests with 405 instead of closing silently.
    #[arg(long)]
    reject_non_get: bool,

    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

// ============================================================================
// STATISTICS
// ============================================================================

struct Stats {
    total: AtomicU64,
    active: AtomicU64,
    blocked: AtomicU64,
    not_found: AtomicU64,
    refused: AtomicU64,
    failed: AtomicU64,
    bytes_relayed: AtomicU64,
}

impl Stats {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            active: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
        }
    }

    fn print(&self) {
        info!(
            "📊 total={} active={} blocked={} not_found={} refused={} failed={} relayed={}MB",
            self.total.load(Ordering::Relaxed),
            self.active.load(Ordering::Relaxed),
            self.blocked.load(Ordering::Relaxed),
            self.not_found.load(Ordering::Relaxed),
            self.refused.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.bytes_relayed.load(Ordering::Relaxed) / 1_000_000,
        );
    }
}

// ============================================================================
// PROXY CONFIGURATION
// ============================================================================

#[derive(Clone)]
struct ProxyConfig {
    filter: Arc<FilterSet>,
    stats: Arc<Stats>,
    connect_timeout: Option<Duration>,
    reject_non_get: bool,
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let filter = match args.filter {
        Some(ref path) => FilterSet::load_or_empty(path),
        None => FilterSet::empty(),
    };

    if filter.is_empty() {
        info!("Filtering disabled");
    }

    let stats = Arc::new(Stats::new());

    if args.stats_interval > 0 {
        let stats_clone = stats.clone();
        let interval = args.stats_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(interval));
            loop {
                timer.tick().await;
                stats_clone.print();
            }
        });
    }

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", args.host, args.port))?;

    let listener = bind(addr)?;

    info!("🚀 Proxy listening on http://{}", addr);

    let config = ProxyConfig {
        filter: Arc::new(filter),
        stats,
        connect_timeout: (args.timeout_connect > 0)
            .then(|| Duration::from_secs(args.timeout_connect)),
        reject_non_get: args.reject_non_get,
    };

    dispatch(listener, config).await
}

fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    match socket.bind(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            eprintln!("\n❌ PORT {} ALREADY IN USE\n", addr.port());
            eprintln!("   Run with a different port: --port {}\n", addr.port().wrapping_add(1));
            std::process::exit(1);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Bind failed on {}", addr));
        }
    }

    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Accepts connections forever, one task per connection. Only an accept error
/// on the listening socket ends the loop.
async fn dispatch(listener: TcpListener, config: ProxyConfig) -> anyhow::Result<()> {
    loop {
        let (client_stream, client_addr) = listener.accept().await?;
        let _ = client_stream.set_nodelay(true);

        let id = config.stats.total.fetch_add(1, Ordering::Relaxed) + 1;
        config.stats.active.fetch_add(1, Ordering::Relaxed);
        debug!("Spawning {} for {}", id, client_addr);

        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = relay::handle_connection(client_stream, id, &config).await {
                debug!("Connection error from {}: {}", client_addr, e);
                config.stats.failed.fetch_add(1, Ordering::Relaxed);
            }

            config.stats.active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config(tokens: &[&str]) -> ProxyConfig {
        ProxyConfig {
            filter: Arc::new(FilterSet::from_tokens(tokens.iter().copied())),
            stats: Arc::new(Stats::new()),
            connect_timeout: Some(Duration::from_secs(5)),
            reject_non_get: false,
        }
    }

    #[test]
    fn test_stats_initialization() {
        let stats = Stats::new();
        assert_eq!(stats.total.load(Ordering::Relaxed), 0);
        assert_eq!(stats.active.load(Ordering::Relaxed), 0);
        assert_eq!(stats.bytes_relayed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["filter-proxy"]);
        assert_eq!(args.port, DEFAULT_PORT);
        assert!(args.filter.is_none());
        assert!(!args.reject_non_get);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_dispatcher_serves_concurrent_clients() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = test_config(&["blocked"]);
        let stats = config.stats.clone();

        tokio::spawn(dispatch(listener, config));

        let mut clients = Vec::new();
        for i in 0..8 {
            clients.push(tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                let request = format!("GET http://blocked.example/{} HTTP/1.0\r\n\r\n", i);
                stream.write_all(request.as_bytes()).await.unwrap();

                let mut response = Vec::new();
                stream.read_to_end(&mut response).await.unwrap();
                response
            }));
        }

        for client in clients {
            let response = client.await.unwrap();
            assert!(response.starts_with(b"HTTP/1.0 403 Forbidden\r\n\r\n"));
        }

        assert_eq!(stats.total.load(Ordering::Relaxed), 8);
        assert_eq!(stats.blocked.load(Ordering::Relaxed), 8);
    }
}
