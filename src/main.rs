#![warn(clippy::all)]

mod block_page;
mod blocklist;
mod classify;
mod connection;
mod dial;
mod error;
mod relay;

use crate::block_page::BlockPage;
use crate::blocklist::Blocklist;
use crate::connection::{Connection, ProxyContext};
use crate::dial::TcpDialer;
use crate::error::ProxyError;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Newline-delimited hostnames to refuse. A missing file blocks nothing.
    #[arg(long, default_value = "blocked.txt")]
    blocklist: PathBuf,

    /// HTML body of the 403 response sent for blocked hosts.
    #[arg(long, default_value = "403message.html")]
    block_page: PathBuf,

    #[arg(long, default_value_t = 1024)]
    backlog: i32,

    /// Runtime worker threads, 0 for twice the CPU count.
    #[arg(long, default_value_t = 0)]
    workers: usize,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    nodelay: bool,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn log_level(&self) -> &str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }

    fn worker_threads(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            num_cpus::get() * 2
        }
    }
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level())),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.worker_threads())
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    // Loaded once, before any connection exists; read-only from here on.
    let ctx = ProxyContext::new(
        Blocklist::load_or_empty(&args.blocklist),
        BlockPage::new(&args.block_page),
    );

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", args.host, args.port))?;
    let listener = bind(addr, args.backlog)?;

    info!("🚀 Proxy listening on http://{}", listener.local_addr()?);
    info!(
        "Blocking {} hosts, block page {:?}",
        ctx.blocklist.len(),
        ctx.block_page.path()
    );

    serve(listener, ctx, TcpDialer::new(args.nodelay), args.nodelay).await
}

fn bind(addr: SocketAddr, backlog: i32) -> anyhow::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Bind to {} failed", addr))?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into())?)
}

// ============================================================================
// ACCEPT LOOP
// ============================================================================

/// Accepts until Ctrl-C, one task per client. Tasks share nothing but the
/// read-only context and the dialer.
async fn serve(
    listener: TcpListener,
    ctx: ProxyContext,
    dialer: TcpDialer,
    nodelay: bool,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut client, client_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                };

                if nodelay {
                    let _ = client.set_nodelay(true);
                }

                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let result = Connection::new(&mut client, &dialer, &ctx).run().await;
                    log_result(client_addr, result);
                    // `client` is dropped (closed) here, after the state machine.
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                return Ok(());
            }
        }
    }
}

fn log_result(client_addr: SocketAddr, result: Result<connection::Outcome, ProxyError>) {
    match result {
        Ok(outcome) => debug!("{}: {}", client_addr, outcome),
        Err(e) if !e.is_failure() => debug!("{}: {}", client_addr, e),
        Err(e) => debug!("Connection error from {}: {}", client_addr, e),
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

    async fn start_proxy(name: &str, blocked: &[&str]) -> SocketAddr {
        let listener = bind("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let addr = listener.local_addr().unwrap();
        let page = std::env::temp_dir().join(format!(
            "main-block-{}-{}.html",
            std::process::id(),
            name
        ));
        std::fs::write(&page, "nope").unwrap();

        let ctx = ProxyContext::new(Blocklist::from_entries(blocked), BlockPage::new(page));
        tokio::spawn(serve(listener, ctx, TcpDialer::new(true), true));
        addr
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["proxy"]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.blocklist, PathBuf::from("blocked.txt"));
        assert_eq!(args.block_page, PathBuf::from("403message.html"));
        assert!(args.nodelay);
        assert_eq!(args.log_level(), "info");
    }

    #[test]
    fn test_args_log_level_overrides() {
        assert_eq!(Args::parse_from(["proxy", "-q"]).log_level(), "error");
        assert_eq!(Args::parse_from(["proxy", "-v"]).log_level(), "debug");
        assert_eq!(Args::parse_from(["proxy", "--workers", "3"]).worker_threads(), 3);
        assert!(!Args::parse_from(["proxy", "--nodelay", "false"]).nodelay);
    }

    #[tokio::test]
    async fn test_tunnel_end_to_end() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = origin.local_addr().unwrap().port();
        let proxy = start_proxy("tunnel", &[]).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", origin_port).as_bytes())
            .await
            .unwrap();

        let (mut upstream, _) = origin.accept().await.unwrap();

        let mut ack = [0u8; 39];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, b"HTTP/1.1 200 Connection Established\r\n\r\n");

        client.write_all(b"opaque bytes").await.unwrap();
        let mut got = [0u8; 12];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"opaque bytes");

        upstream.write_all(b"back").await.unwrap();
        drop(upstream);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"back");
    }

    #[tokio::test]
    async fn test_blocked_end_to_end() {
        let proxy = start_proxy("blocked", &["blocked.example"]).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(b"CONNECT Blocked.Example:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(
            response,
            b"HTTP/1.1 403 Forbidden\r\nContent-Type: text/html\r\nContent-Length: 4\r\n\r\nnope"
        );
    }
}
