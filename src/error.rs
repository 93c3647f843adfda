use std::fmt;
use std::io;

use thiserror::Error;

use crate::classify::ParseError;
use crate::dial::DialError;

/// Which side of a proxied connection an I/O operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Client,
    Origin,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Client => f.write_str("client"),
            Peer::Origin => f.write_str("origin"),
        }
    }
}

/// Everything that can end a single proxied connection early.
///
/// None of these are retried and none escape the task that owns the
/// connection.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("read from {peer} failed: {source}")]
    ReadFailed {
        peer: Peer,
        #[source]
        source: io::Error,
    },

    #[error("malformed request: {0}")]
    ParseFailed(#[from] ParseError),

    #[error("blocked domain: {0}")]
    BlockedDomain(String),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("write to {peer} failed: {source}")]
    WriteFailed {
        peer: Peer,
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    /// A blocked domain is a policy decision, everything else is a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, ProxyError::BlockedDomain(_))
    }
}
