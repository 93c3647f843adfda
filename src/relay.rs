//! One wait-and-drain cycle of the client/origin byte relay.
//!
//! Both sockets are polled in the same wake-up and every side that has data
//! (or has closed) is handled before returning, so a busy direction cannot
//! starve the other. Looping is left to the caller.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{Peer, ProxyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    Continue,
    /// The given side read end-of-stream.
    Closed(Peer),
}

/// Bytes moved in each direction over the life of a connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayTotals {
    pub client_to_origin: u64,
    pub origin_to_client: u64,
}

/// Waits until either side is readable, then forwards whatever was read.
///
/// `scratch` is split in half, one half per direction. There is no timeout:
/// a silent pair of peers parks the caller indefinitely.
pub async fn pump<C, O>(
    client: &mut C,
    origin: &mut O,
    scratch: &mut [u8],
    totals: &mut RelayTotals,
) -> Result<Pump, ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    O: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let half = scratch.len() / 2;
    let (client_buf, origin_buf) = scratch.split_at_mut(half);

    let (from_client, from_origin) = poll_fn(|cx| {
        let from_client = poll_side(Pin::new(&mut *client), cx, &mut *client_buf);
        let from_origin = poll_side(Pin::new(&mut *origin), cx, &mut *origin_buf);
        if from_client.is_none() && from_origin.is_none() {
            Poll::Pending
        } else {
            Poll::Ready((from_client, from_origin))
        }
    })
    .await;

    if let Some(read) = from_client {
        let n = read.map_err(|source| ProxyError::ReadFailed {
            peer: Peer::Client,
            source,
        })?;
        if n == 0 {
            return Ok(Pump::Closed(Peer::Client));
        }
        origin
            .write_all(&client_buf[..n])
            .await
            .map_err(|source| ProxyError::WriteFailed {
                peer: Peer::Origin,
                source,
            })?;
        totals.client_to_origin += n as u64;
    }

    if let Some(read) = from_origin {
        let n = read.map_err(|source| ProxyError::ReadFailed {
            peer: Peer::Origin,
            source,
        })?;
        if n == 0 {
            return Ok(Pump::Closed(Peer::Origin));
        }
        client
            .write_all(&origin_buf[..n])
            .await
            .map_err(|source| ProxyError::WriteFailed {
                peer: Peer::Client,
                source,
            })?;
        totals.origin_to_client += n as u64;
    }

    Ok(Pump::Continue)
}

fn poll_side<R>(reader: Pin<&mut R>, cx: &mut Context<'_>, buf: &mut [u8]) -> Option<io::Result<usize>>
where
    R: AsyncRead + ?Sized,
{
    let mut read_buf = ReadBuf::new(buf);
    match reader.poll_read(cx, &mut read_buf) {
        Poll::Ready(Ok(())) => Some(Ok(read_buf.filled().len())),
        Poll::Ready(Err(e)) => Some(Err(e)),
        Poll::Pending => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    const SCRATCH: usize = 2 * 1024;

    #[tokio::test]
    async fn test_forwards_client_bytes_to_origin() {
        let (mut client, mut client_peer) = duplex(4096);
        let (mut origin, mut origin_peer) = duplex(4096);
        let mut scratch = vec![0u8; SCRATCH];
        let mut totals = RelayTotals::default();

        client_peer.write_all(b"ping").await.unwrap();
        let step = pump(&mut client, &mut origin, &mut scratch, &mut totals)
            .await
            .unwrap();
        assert_eq!(step, Pump::Continue);

        let mut got = [0u8; 4];
        origin_peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");
        assert_eq!(totals.client_to_origin, 4);
        assert_eq!(totals.origin_to_client, 0);
    }

    #[tokio::test]
    async fn test_handles_both_directions_in_one_wakeup() {
        let (mut client, mut client_peer) = duplex(4096);
        let (mut origin, mut origin_peer) = duplex(4096);
        let mut scratch = vec![0u8; SCRATCH];
        let mut totals = RelayTotals::default();

        client_peer.write_all(b"request").await.unwrap();
        origin_peer.write_all(b"response").await.unwrap();

        let step = pump(&mut client, &mut origin, &mut scratch, &mut totals)
            .await
            .unwrap();
        assert_eq!(step, Pump::Continue);
        assert_eq!(totals.client_to_origin, 7);
        assert_eq!(totals.origin_to_client, 8);

        let mut got = [0u8; 8];
        client_peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"response");
    }

    #[tokio::test]
    async fn test_reads_are_bounded_by_half_the_scratch() {
        let (mut client, mut client_peer) = duplex(8192);
        let (mut origin, _origin_peer) = duplex(8192);
        let mut scratch = vec![0u8; 16];
        let mut totals = RelayTotals::default();

        client_peer.write_all(&[7u8; 20]).await.unwrap();
        pump(&mut client, &mut origin, &mut scratch, &mut totals)
            .await
            .unwrap();
        assert_eq!(totals.client_to_origin, 8);
    }

    #[tokio::test]
    async fn test_client_close_ends_relay() {
        let (mut client, client_peer) = duplex(4096);
        let (mut origin, _origin_peer) = duplex(4096);
        let mut scratch = vec![0u8; SCRATCH];
        let mut totals = RelayTotals::default();

        drop(client_peer);
        let step = pump(&mut client, &mut origin, &mut scratch, &mut totals)
            .await
            .unwrap();
        assert_eq!(step, Pump::Closed(Peer::Client));
    }

    #[tokio::test]
    async fn test_origin_close_ends_relay() {
        let (mut client, _client_peer) = duplex(4096);
        let (mut origin, origin_peer) = duplex(4096);
        let mut scratch = vec![0u8; SCRATCH];
        let mut totals = RelayTotals::default();

        drop(origin_peer);
        let step = pump(&mut client, &mut origin, &mut scratch, &mut totals)
            .await
            .unwrap();
        assert_eq!(step, Pump::Closed(Peer::Origin));
    }

    #[tokio::test]
    async fn test_write_to_closed_origin_fails() {
        let (mut client, mut client_peer) = duplex(4096);
        let (mut origin, origin_peer) = duplex(4096);
        let mut scratch = vec![0u8; SCRATCH];
        let mut totals = RelayTotals::default();

        client_peer.write_all(b"late").await.unwrap();
        drop(origin_peer);

        let step = pump(&mut client, &mut origin, &mut scratch, &mut totals).await;
        match step {
            Err(ProxyError::WriteFailed {
                peer: Peer::Origin, ..
            }) => {}
            other => panic!("unexpected relay step: {:?}", other),
        }
    }
}
