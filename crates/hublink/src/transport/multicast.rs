// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Multicast socket setup for the event bus.
//!
//! All events on the host share one well-known multicast group. This
//! is a same-host bus: membership is joined on the unspecified
//! interface and loopback delivery is always enabled, so co-located
//! services see each other's events without any routing setup. The
//! `HUBLINK_MULTICAST_IF` override exists for multi-homed test rigs.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{self, POLL_INTERVAL};

/// Socket for broadcasting events toward the group.
///
/// Loopback is enabled and TTL pinned to 1: events must not leave the
/// host segment.
pub fn multicast_send_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(1)?;
    if let Some(iface) = config::multicast_interface() {
        socket.set_multicast_if_v4(&iface)?;
        log::debug!("[UDP] multicast send bound to interface {}", iface);
    }
    Ok(socket.into())
}

/// Socket joined to the event group, ready for blocking receives.
///
/// The receive path uses a short read timeout so the reader thread can
/// notice its shutdown flag between datagrams.
pub fn multicast_recv_socket(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;

    let iface = config::multicast_interface().unwrap_or(Ipv4Addr::UNSPECIFIED);
    match socket.join_multicast_v4(&group, &iface) {
        Ok(()) => {
            log::debug!("[UDP] joined group {} on interface {}", group, iface);
        }
        Err(e) => {
            // Non-fatal: loopback delivery still works on hosts where
            // membership registration fails (e.g. minimal containers).
            log::warn!(
                "[UDP] join_multicast_v4({}) on {} failed (non-fatal): {}",
                group,
                iface,
                e
            );
        }
    }
    socket.set_multicast_loop_v4(true)?;
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_socket_builds() {
        let socket = multicast_send_socket().expect("send socket");
        assert!(socket.local_addr().is_ok());
    }

    #[test]
    fn test_recv_socket_builds_and_times_out() {
        let port = 20000 + fastrand::u16(..10000);
        let socket =
            multicast_recv_socket(config::DEFAULT_EVENT_GROUP, port).expect("recv socket");
        let mut buf = [0u8; 64];
        // Nothing is sent; the read must return on timeout, not hang.
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(
            err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut
        );
    }

    #[test]
    fn test_loopback_delivery() {
        let port = 30000 + fastrand::u16(..10000);
        let group = config::DEFAULT_EVENT_GROUP;
        let recv = multicast_recv_socket(group, port).expect("recv socket");
        let send = multicast_send_socket().expect("send socket");

        let dest = SocketAddrV4::new(group, port);
        let mut delivered = false;
        let mut buf = [0u8; 64];
        for _ in 0..5 {
            send.send_to(b"ping", dest).expect("send");
            match recv.recv_from(&mut buf) {
                Ok((n, _)) if &buf[..n] == b"ping" => {
                    delivered = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(delivered, "no loopback multicast delivery");
    }
}
