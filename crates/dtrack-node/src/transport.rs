//! C5 — Message Transport.
//!
//! A thin datagram façade shared by every other component: bind a UDP
//! socket for a given role, send JSON payloads, and receive with a bounded
//! timeout so callers can check their shutdown flag promptly. The
//! transport dispatches nothing itself beyond what `serde` resolves from
//! the `type` tag — interpretation is each component's job.

use crate::error::DtrackError;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Hard cap on a single datagram, matching the wire format's bound.
pub const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

/// Receive buffer for the detection socket.
pub const DETECTION_BUF_BYTES: usize = 4096;
/// Receive buffer for the routing socket.
pub const ROUTING_BUF_BYTES: usize = 1024;

/// Bind a UDP socket for the named role. The only fatal error path in the
/// whole system: failure to bind a required socket at startup.
pub async fn bind_udp(role: &'static str, host: &str, port: u16) -> Result<UdpSocket, DtrackError> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .unwrap_or_else(|_| panic!("invalid bind address {host}:{port}"));
    UdpSocket::bind(addr)
        .await
        .map_err(|source| DtrackError::Bind { role, addr, source })
}

/// Serialize `msg` to JSON and send it to `addr`. Oversized payloads are
/// refused before hitting the socket so a bug upstream can't silently
/// truncate a datagram in flight.
pub async fn send_json<T: Serialize>(
    socket: &UdpSocket,
    addr: SocketAddr,
    msg: &T,
) -> Result<(), DtrackError> {
    let payload = serde_json::to_vec(msg).map_err(|e| DtrackError::Encode {
        addr,
        source: e,
    })?;
    if payload.len() > MAX_DATAGRAM_BYTES {
        tracing::warn!("dropping oversized payload to {addr} ({} bytes)", payload.len());
        return Ok(());
    }
    socket
        .send_to(&payload, addr)
        .await
        .map(|_| ())
        .map_err(|source| DtrackError::Send { addr, source })
}

/// Receive one datagram, bounded by `timeout`. Returns `Ok(None)` on
/// timeout (the normal "check `running` and loop again" case), `Ok(Some)`
/// with the raw bytes and sender on success, and `Err` only for socket
/// errors other than a timeout (logged and ignored by callers).
pub async fn recv_with_timeout(
    socket: &UdpSocket,
    buf: &mut [u8],
    timeout: Duration,
) -> Option<std::io::Result<(usize, SocketAddr)>> {
    match tokio::time::timeout(timeout, socket.recv_from(buf)).await {
        Ok(result) => Some(result),
        Err(_elapsed) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtrack_types::WireMessage;

    #[tokio::test]
    async fn send_and_receive_round_trip() {
        let a = bind_udp("test", "127.0.0.1", 0).await.unwrap();
        let b = bind_udp("test", "127.0.0.1", 0).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        send_json(&a, b_addr, &WireMessage::DiscoveryRequest).await.unwrap();

        let mut buf = [0u8; DETECTION_BUF_BYTES];
        let (len, _from) = recv_with_timeout(&b, &mut buf, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let msg: WireMessage = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(msg, WireMessage::DiscoveryRequest);
    }

    #[tokio::test]
    async fn recv_times_out_when_nothing_arrives() {
        let a = bind_udp("test", "127.0.0.1", 0).await.unwrap();
        let mut buf = [0u8; 64];
        let result = recv_with_timeout(&a, &mut buf, Duration::from_millis(10)).await;
        assert!(result.is_none());
    }
}
