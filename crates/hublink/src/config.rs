// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Well-known addresses, limits, and environment overrides.
//!
//! The hub is a fixed set of co-located services, so almost everything
//! here is a build-time constant: each service owns one TCP port by
//! convention and all events share one multicast group. Environment
//! variables exist for test rigs and debugging, not for deployment.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Multicast group all events are broadcast to.
pub const DEFAULT_EVENT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 76, 67);

/// UDP port of the event multicast group.
pub const DEFAULT_EVENT_PORT: u16 = 12575;

/// Largest event datagram we will send (UDP payload ceiling over IPv4).
pub const MAX_EVENT_DATAGRAM: usize = 65507;

/// Socket-level read timeout used by blocking receive loops so that
/// shutdown flags are noticed promptly.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default read timeout for a receiver worker draining one request.
/// A client that connects and then goes silent must not pin a worker
/// forever.
pub const WORKER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared memory segment backing the host-wide event id counter.
pub const SEQUENCER_SHM_NAME: &str = "/hublink_event_seq";

/// Named semaphore guarding the event id counter.
pub const SEQUENCER_SEM_NAME: &str = "/hublink_event_seq_lock";

/// Multicast group for events, honoring `HUBLINK_MULTICAST_GROUP`.
pub fn event_group() -> Ipv4Addr {
    if let Ok(var) = std::env::var("HUBLINK_MULTICAST_GROUP") {
        if let Ok(addr) = var.parse::<Ipv4Addr>() {
            log::debug!("[CFG] Using HUBLINK_MULTICAST_GROUP override: {}", addr);
            return addr;
        }
        log::warn!("[CFG] Ignoring invalid HUBLINK_MULTICAST_GROUP='{}'", var);
    }
    DEFAULT_EVENT_GROUP
}

/// Event port, honoring `HUBLINK_MULTICAST_PORT`.
pub fn event_port() -> u16 {
    if let Ok(var) = std::env::var("HUBLINK_MULTICAST_PORT") {
        if let Ok(port) = var.parse::<u16>() {
            log::debug!("[CFG] Using HUBLINK_MULTICAST_PORT override: {}", port);
            return port;
        }
        log::warn!("[CFG] Ignoring invalid HUBLINK_MULTICAST_PORT='{}'", var);
    }
    DEFAULT_EVENT_PORT
}

/// Optional interface override for multicast membership and sends,
/// honoring `HUBLINK_MULTICAST_IF`. `None` means join on the
/// unspecified interface, which is correct for the same-host bus.
pub fn multicast_interface() -> Option<Ipv4Addr> {
    if let Ok(var) = std::env::var("HUBLINK_MULTICAST_IF") {
        if let Ok(addr) = var.parse::<Ipv4Addr>() {
            log::debug!("[CFG] Using HUBLINK_MULTICAST_IF override: {}", addr);
            return Some(addr);
        }
        log::warn!("[CFG] Ignoring invalid HUBLINK_MULTICAST_IF='{}'", var);
    }
    None
}
