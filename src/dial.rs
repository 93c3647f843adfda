use std::future::Future;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};

#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to resolve {host}: {source}")]
    ResolutionFailed {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Opens the connection to the origin server.
pub trait Dialer: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    fn dial(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<Self::Stream, DialError>> + Send;
}

/// Resolves through the system resolver and connects to the first address
/// only. Nothing is retried.
#[derive(Debug, Clone, Copy)]
pub struct TcpDialer {
    nodelay: bool,
}

impl TcpDialer {
    pub fn new(nodelay: bool) -> Self {
        Self { nodelay }
    }
}

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let resolution_failed = |source| DialError::ResolutionFailed {
            host: host.to_string(),
            source,
        };

        let addr = lookup_host((host, port))
            .await
            .map_err(resolution_failed)?
            .next()
            .ok_or_else(|| {
                resolution_failed(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no addresses returned",
                ))
            })?;

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| DialError::ConnectFailed { addr, source })?;

        if self.nodelay {
            let _ = stream.set_nodelay(true);
        }

        Ok(stream)
    }
}
