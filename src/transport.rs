//! Control-channel transport — spec §1 ("the ICMP socket transport" is an
//! external collaborator), bound concretely here per SPEC_FULL §6.
//!
//! `ControlChannel` is the seam between the protocol core (`wire`,
//! `daemon`, `shim`) and the datapath. `RawIcmpV6Channel` binds a real
//! ICMPv6 raw socket via `socket2`; `LoopbackChannel` is an in-memory
//! channel used by the demo driver and tests, so the daemon/shim loops
//! are exercised without needing `CAP_NET_RAW`.

use std::net::Ipv6Addr;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::wire::MESSAGE_SIZE;

/// IPPROTO_ICMPV6, per RFC 8200.
const IPPROTO_ICMPV6: i32 = 58;

/// An inbound datagram on the control channel.
#[derive(Debug, Clone)]
pub struct Received {
    pub src: Ipv6Addr,
    pub bytes: Vec<u8>,
}

/// Abstraction over "send a control message to a peer" / "receive the
/// next one", so the daemon/shim loops don't depend on raw sockets
/// directly.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send_to(&self, dst: Ipv6Addr, bytes: &[u8]) -> Result<(), TransportError>;
    async fn recv(&self) -> Result<Received, TransportError>;
}

/// Real ICMPv6 raw-socket transport, bound to `local`.
pub struct RawIcmpV6Channel {
    socket: tokio::net::UdpSocket,
}

impl RawIcmpV6Channel {
    /// Bind a raw ICMPv6 socket. Requires `CAP_NET_RAW` (or root); fails
    /// with [`TransportError::InsufficientPrivileges`] otherwise.
    pub fn bind(local: Ipv6Addr) -> Result<Self, TransportError> {
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::from(IPPROTO_ICMPV6))).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                TransportError::InsufficientPrivileges
            } else {
                TransportError::BindFailed {
                    addr: local.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        socket
            .bind(&std::net::SocketAddr::new(local.into(), 0).into())
            .map_err(|e| TransportError::BindFailed {
                addr: local.to_string(),
                reason: e.to_string(),
            })?;
        socket.set_nonblocking(true).map_err(TransportError::Io)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = tokio::net::UdpSocket::from_std(std_socket).map_err(TransportError::Io)?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl ControlChannel for RawIcmpV6Channel {
    async fn send_to(&self, dst: Ipv6Addr, bytes: &[u8]) -> Result<(), TransportError> {
        self.socket
            .send_to(bytes, (dst, 0))
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed { reason: e.to_string() })
    }

    async fn recv(&self) -> Result<Received, TransportError> {
        let mut buf = vec![0u8; MESSAGE_SIZE.max(1500)];
        let (len, addr) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed { reason: e.to_string() })?;
        buf.truncate(len);
        let src = match addr.ip() {
            std::net::IpAddr::V6(v6) => v6,
            std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        };
        Ok(Received { src, bytes: buf })
    }
}

/// An in-memory loopback channel: every `send_to` is delivered to every
/// other `LoopbackChannel` sharing the same hub, tagged with the sender's
/// own address. Used by the demo binary and integration tests to drive
/// the daemon/shim loops without a real socket.
pub struct LoopbackChannel {
    self_addr: Ipv6Addr,
    hub: mpsc::UnboundedSender<(Ipv6Addr, Ipv6Addr, Vec<u8>)>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Received>>,
}

/// Shared hub wiring together a set of [`LoopbackChannel`]s.
pub struct LoopbackHub {
    tap_tx: mpsc::UnboundedSender<(Ipv6Addr, Ipv6Addr, Vec<u8>)>,
}

impl LoopbackHub {
    /// Spawn the hub's routing task and return a handle for registering
    /// channels. `addrs` lists every address the hub knows how to route
    /// to; a `send_to` for an address not in `addrs` is simply dropped.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Ipv6Addr, Ipv6Addr, Vec<u8>)>) {
        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        (Self { tap_tx }, tap_rx)
    }

    pub fn channel(&self, self_addr: Ipv6Addr) -> (LoopbackChannel, mpsc::UnboundedSender<Received>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        (
            LoopbackChannel {
                self_addr,
                hub: self.tap_tx.clone(),
                inbox: tokio::sync::Mutex::new(inbox_rx),
            },
            inbox_tx,
        )
    }
}

/// Routes queued `(dst, src, bytes)` triples from the hub's tap into the
/// matching registered channel's inbox. Call this once, driving it in a
/// background task, after registering every channel.
pub async fn route_loopback_hub(
    mut tap_rx: mpsc::UnboundedReceiver<(Ipv6Addr, Ipv6Addr, Vec<u8>)>,
    routes: Vec<(Ipv6Addr, mpsc::UnboundedSender<Received>)>,
) {
    while let Some((dst, src, bytes)) = tap_rx.recv().await {
        if let Some((_, tx)) = routes.iter().find(|(addr, _)| *addr == dst) {
            let _ = tx.send(Received { src, bytes });
        }
    }
}

#[async_trait]
impl ControlChannel for LoopbackChannel {
    async fn send_to(&self, dst: Ipv6Addr, bytes: &[u8]) -> Result<(), TransportError> {
        self.hub
            .send((dst, self.self_addr, bytes.to_vec()))
            .map_err(|_| TransportError::SendFailed {
                reason: "loopback hub closed".into(),
            })
    }

    async fn recv(&self) -> Result<Received, TransportError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError::ReceiveFailed {
                reason: "loopback channel closed".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_hub_delivers_between_two_channels() {
        let (hub, tap_rx) = LoopbackHub::new();
        let a_addr: Ipv6Addr = "2001:db8::a".parse().unwrap();
        let b_addr: Ipv6Addr = "2001:db8::b".parse().unwrap();
        let (a, a_tx) = hub.channel(a_addr);
        let (b, b_tx) = hub.channel(b_addr);

        tokio::spawn(route_loopback_hub(tap_rx, vec![(a_addr, a_tx), (b_addr, b_tx)]));

        a.send_to(b_addr, b"hello").await.unwrap();
        let received = b.recv().await.unwrap();
        assert_eq!(received.src, a_addr);
        assert_eq!(received.bytes, b"hello");
    }
}
