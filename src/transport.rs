//! Datagram transport with timeout-bounded send/receive and ACK/NAK reply
//! discipline, grounded on `mop_msg.c`'s `msg_init`/`msg_send`/`msg_recv`.
//!
//! The five-argument `msg_send`/`msg_recv` form (timeout, payload,
//! destination, expected reply, expected reply length) is the one carried
//! forward here; the source also contains an incompatible three-argument
//! variant that was never wired into `mopnet.c`'s actual call sites, so it
//! is not modeled.

use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{AppResult, MoptopError};
use crate::protocol::Tag;

const MAX_DATAGRAM: usize = 1024;

/// A single bound UDP socket, one per process, matching `msg_init`'s
/// `SO_REUSEADDR`-bind-on-all-interfaces behaviour.
pub struct Transport {
    socket: UdpSocket,
}

impl Transport {
    /// Binds a UDP socket to `bind_address` ("ip:port"). `SO_REUSEADDR` is
    /// the default on most platforms for `tokio::net::UdpSocket::bind`
    /// already; the explicit option in the source is for re-binding quickly
    /// after a crash, which the OS default covers here too.
    pub async fn bind(bind_address: &str) -> AppResult<Self> {
        let socket = UdpSocket::bind(bind_address)
            .await
            .map_err(|e| MoptopError::Socket(e.to_string()))?;
        Ok(Self { socket })
    }

    /// Sends `payload` to `destination`; if `expected` is `Some`, blocks up
    /// to `timeout_secs` for a reply and checks its prefix matches.
    /// `timeout_secs == 0` means block forever, matching the source's
    /// `SO_RCVTIMEO` convention of a zero timeval.
    pub async fn send(
        &self,
        timeout_secs: u64,
        payload: &str,
        destination: &str,
        expected: Option<Tag>,
    ) -> AppResult<()> {
        self.socket
            .send_to(payload.as_bytes(), destination)
            .await
            .map_err(|e| MoptopError::Socket(e.to_string()))?;

        let Some(expected) = expected else {
            return Ok(());
        };

        let mut buf = [0u8; MAX_DATAGRAM];
        let recv = async {
            let (n, _) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| MoptopError::Socket(e.to_string()))?;
            Ok::<_, MoptopError>(n)
        };

        let n = if timeout_secs == 0 {
            recv.await?
        } else {
            timeout(Duration::from_secs(timeout_secs), recv)
                .await
                .map_err(|_| MoptopError::TransportTimeout(payload.to_string()))??
        };

        let reply = std::str::from_utf8(&buf[..n]).unwrap_or("");
        if reply.starts_with(expected.as_str()) {
            Ok(())
        } else {
            Err(MoptopError::UnexpectedReply {
                expected: expected.as_str().to_string(),
                got: reply.to_string(),
            })
        }
    }

    /// Receives a datagram, returning its payload and sender address. If
    /// `expected_prefix` is given, the payload must start with it or the
    /// receive is reported as a mismatch (after still sending NAK back to
    /// the sender, matching `msg_recv`'s always-acknowledge behaviour).
    pub async fn recv(
        &self,
        timeout_secs: u64,
        expected_prefix: Option<Tag>,
    ) -> AppResult<(String, std::net::SocketAddr)> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let recv = async {
            self.socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| MoptopError::Socket(e.to_string()))
        };

        let (n, sender) = if timeout_secs == 0 {
            recv.await?
        } else {
            timeout(Duration::from_secs(timeout_secs), recv)
                .await
                .map_err(|_| MoptopError::TransportTimeout("recv".to_string()))??
        };

        let payload = std::str::from_utf8(&buf[..n]).unwrap_or("").to_string();

        if let Some(expected) = expected_prefix {
            let matched = payload.starts_with(expected.as_str());
            let ack = if matched { Tag::Ack } else { Tag::Nak };
            self.socket
                .send_to(ack.as_str().as_bytes(), sender)
                .await
                .map_err(|e| MoptopError::Socket(e.to_string()))?;
            if !matched {
                return Err(MoptopError::UnexpectedReply {
                    expected: expected.as_str().to_string(),
                    got: payload,
                });
            }
        }

        Ok((payload, sender))
    }

    /// Blocks forever (`timeout_secs = 0`) until a datagram matching `tag`
    /// arrives, retrying on mismatched/timed-out receives — the pattern
    /// `mopnet.c`'s main loops use to wait for the next `RUN` message.
    pub async fn recv_forever(&self, tag: Tag) -> AppResult<String> {
        loop {
            match self.recv(0, Some(tag)).await {
                Ok((payload, _)) => return Ok(payload),
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let server = Transport::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.socket.local_addr().unwrap();
        let client = Transport::bind("127.0.0.1:0").await.unwrap();

        let send_fut = client.send(5, "RUN -xb", &server_addr.to_string(), Some(Tag::Ack));
        let recv_fut = server.recv(5, Some(Tag::Run));

        let (send_result, recv_result) = tokio::join!(send_fut, recv_fut);
        assert!(send_result.is_ok());
        let (payload, _) = recv_result.unwrap();
        assert_eq!(payload, "RUN -xb");
    }

    #[tokio::test]
    async fn test_recv_mismatched_prefix_sends_nak() {
        let server = Transport::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.socket.local_addr().unwrap();
        let client = Transport::bind("127.0.0.1:0").await.unwrap();

        let send_fut = client.send(5, "TOK 3", &server_addr.to_string(), None);
        let recv_fut = server.recv(5, Some(Tag::Run));
        let (_, recv_result) = tokio::join!(send_fut, recv_fut);
        assert!(recv_result.is_err());
    }
}
