//! Per-connection state machine.
//!
//! ```text
//! Init -> Process -> Tunnel -> Relay -> Closing
//!                 \----------/
//! ```
//!
//! Every failure jumps straight to `Closing`; no state is entered twice.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::block_page::BlockPage;
use crate::blocklist::Blocklist;
use crate::classify::{classify, Request, Target};
use crate::dial::Dialer;
use crate::error::{Peer, ProxyError};
use crate::relay::{self, Pump, RelayTotals};

/// Size of a single read, for the first request chunk and for each relay
/// direction.
pub const BUFFER_SIZE: usize = 8192;

const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Process-wide, read-only state shared by every connection.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub blocklist: Arc<Blocklist>,
    pub block_page: Arc<BlockPage>,
}

impl ProxyContext {
    pub fn new(blocklist: Blocklist, block_page: BlockPage) -> Self {
        Self {
            blocklist: Arc::new(blocklist),
            block_page: Arc::new(block_page),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    /// Holds the length of the first chunk.
    Process(usize),
    Tunnel,
    Relay,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The client went away before sending anything.
    ClientClosed,
    Relayed {
        target: Target,
        tunnel: bool,
        closed_by: Peer,
        totals: RelayTotals,
    },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::ClientClosed => f.write_str("client closed before sending a request"),
            Outcome::Relayed {
                target,
                tunnel,
                closed_by,
                totals,
            } => write!(
                f,
                "{} {} closed by {} (up={} down={})",
                if *tunnel { "tunnel" } else { "http" },
                target,
                closed_by,
                totals.client_to_origin,
                totals.origin_to_client
            ),
        }
    }
}

/// Drives one accepted client from its first read to teardown.
///
/// The client stream is only borrowed: whoever accepted it closes it once
/// `run` returns. The origin stream is owned and closed here.
pub struct Connection<'a, C, D: Dialer> {
    client: &'a mut C,
    dialer: &'a D,
    ctx: &'a ProxyContext,
    origin: Option<D::Stream>,
    buf: Vec<u8>,
    target: Option<Target>,
    tunnel: bool,
    /// Plain HTTP only: the first chunk has reached the origin.
    request_forwarded: bool,
    closed_by: Option<Peer>,
    totals: RelayTotals,
}

impl<'a, C, D> Connection<'a, C, D>
where
    C: AsyncRead + AsyncWrite + Unpin,
    D: Dialer,
{
    pub fn new(client: &'a mut C, dialer: &'a D, ctx: &'a ProxyContext) -> Self {
        Self {
            client,
            dialer,
            ctx,
            origin: None,
            buf: vec![0u8; 2 * BUFFER_SIZE],
            target: None,
            tunnel: false,
            request_forwarded: false,
            closed_by: None,
            totals: RelayTotals::default(),
        }
    }

    pub async fn run(mut self) -> Result<Outcome, ProxyError> {
        let mut state = State::Init;
        let mut failure = None;

        loop {
            let next = match state {
                State::Init => self.read_request().await,
                State::Process(n) => self.process(n).await,
                State::Tunnel => Ok(State::Relay),
                State::Relay => self.relay().await,
                State::Closing => {
                    self.close().await;
                    break;
                }
            };
            state = next.unwrap_or_else(|e| {
                failure = Some(e);
                State::Closing
            });
        }

        if let Some(e) = failure {
            return Err(e);
        }

        Ok(match (self.target, self.closed_by) {
            (Some(target), Some(closed_by)) => Outcome::Relayed {
                target,
                tunnel: self.tunnel,
                closed_by,
                totals: self.totals,
            },
            _ => Outcome::ClientClosed,
        })
    }

    async fn read_request(&mut self) -> Result<State, ProxyError> {
        match self.client.read(&mut self.buf[..BUFFER_SIZE]).await {
            Ok(0) => Ok(State::Closing),
            Ok(n) => Ok(State::Process(n)),
            Err(source) => Err(ProxyError::ReadFailed {
                peer: Peer::Client,
                source,
            }),
        }
    }

    async fn process(&mut self, n: usize) -> Result<State, ProxyError> {
        let request = classify(&self.buf[..n])?;
        let target = request.target().clone();

        match &request {
            Request::Tunnel(_) => info!("CONNECT {}", target),
            Request::Forward { .. } => info!("HTTP {}", target.host),
        }

        if self.ctx.blocklist.is_blocked(&target.host) {
            warn!("🚫 Blocked: {}", target.host);
            self.ctx.block_page.respond(&mut *self.client).await;
            return Err(ProxyError::BlockedDomain(target.host));
        }

        let origin = self.dialer.dial(&target.host, target.port).await?;
        let origin = self.origin.insert(origin);

        let next = match request {
            Request::Tunnel(_) => {
                self.client
                    .write_all(RESPONSE_200_CONNECT)
                    .await
                    .map_err(|source| ProxyError::WriteFailed {
                        peer: Peer::Client,
                        source,
                    })?;
                self.tunnel = true;
                State::Tunnel
            }
            Request::Forward { raw, .. } => {
                origin
                    .write_all(raw)
                    .await
                    .map_err(|source| ProxyError::WriteFailed {
                        peer: Peer::Origin,
                        source,
                    })?;
                self.request_forwarded = true;
                State::Relay
            }
        };

        self.target = Some(target);
        Ok(next)
    }

    async fn relay(&mut self) -> Result<State, ProxyError> {
        // Unreachable: `process` stores the origin before any path to `Relay`.
        let Some(origin) = self.origin.as_mut() else {
            return Ok(State::Closing);
        };

        match relay::pump(&mut *self.client, origin, &mut self.buf, &mut self.totals).await? {
            Pump::Continue => Ok(State::Relay),
            Pump::Closed(peer) => {
                self.closed_by = Some(peer);
                Ok(State::Closing)
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut origin) = self.origin.take() {
            let _ = origin.shutdown().await;
            debug!(
                "Closed origin (forwarded={} up={} down={})",
                self.request_forwarded, self.totals.client_to_origin, self.totals.origin_to_client
            );
        }
    }
}
