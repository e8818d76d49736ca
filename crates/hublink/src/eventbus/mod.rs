// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Multicast publish/subscribe event bus.
//!
//! Services announce state changes by broadcasting an [`Event`] to one
//! well-known multicast group; interested services subscribe by
//! producing-service id (or [`SUBSCRIBE_ALL`]). Delivery is UDP
//! best-effort by design: events carry "latest state", not a durable
//! log, and a consumer that was not listening at broadcast time simply
//! never sees the event.
//!
//! ```text
//! +-----------+  broadcast   +--------------------+   recv    +-----------+
//! | Producer  +------------->+  multicast group   +---------->+ Consumer  |
//! | (svc 15)  |              |  239.255.76.67     |           | reader    |
//! +-----------+              +--------------------+           +-----+-----+
//!                                                                   | dispatch
//!                                                       +-----------+----------+
//!                                                       | per-service worker   |
//!                                                       | pools (handlers)     |
//!                                                       +----------------------+
//! ```
//!
//! The host-wide [`crate::sequencer`] stamps every broadcast event
//! with a unique increasing id so consumers can detect gaps or
//! reordering after the fact.

pub mod consumer;
pub mod producer;

pub use consumer::{
    collect_event_stats, directly_process_raw_event, register_service_event_pool,
    shutdown_event_listener, start_event_listener, stop_event_listener, EventHandler,
};
pub use producer::EventProducer;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::CodecError;

/// Subscription sentinel: deliver every event regardless of producing
/// service.
pub const SUBSCRIBE_ALL: i32 = 0;

/// Event bus failures.
#[derive(Debug)]
pub enum EventBusError {
    /// Event could not be serialized or parsed.
    Codec(CodecError),
    /// Socket-level failure.
    Io(io::Error),
    /// Serialized event exceeds one UDP datagram.
    OversizedEvent(usize),
    /// The producer has been shut down.
    ShutDown,
}

impl fmt::Display for EventBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "event codec failure: {e}"),
            Self::Io(e) => write!(f, "event transport failure: {e}"),
            Self::OversizedEvent(size) => {
                write!(f, "event of {size} bytes exceeds one datagram")
            }
            Self::ShutDown => write!(f, "event producer is shut down"),
        }
    }
}

impl std::error::Error for EventBusError {}

impl From<CodecError> for EventBusError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<io::Error> for EventBusError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Event counters for external polling (clear-on-read supported).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventStats {
    /// Events broadcast by this process's producers.
    pub events_sent: u64,
    /// Datagrams received and decoded by the listener.
    pub events_received: u64,
    /// Handler submissions (one event can dispatch to several
    /// subscribers).
    pub events_dispatched: u64,
    /// Events dropped because a handler pool queue was full.
    pub events_dropped: u64,
    /// Datagrams that failed to decode.
    pub decode_failures: u64,
}

/// Atomic counter block behind [`EventStats`].
#[derive(Debug, Default)]
pub(crate) struct EventStatsBlock {
    pub received: AtomicU64,
    pub dispatched: AtomicU64,
    pub dropped: AtomicU64,
    pub decode_failures: AtomicU64,
}

impl EventStatsBlock {
    pub(crate) fn read(&self, clear: bool) -> (u64, u64, u64, u64) {
        if clear {
            (
                self.received.swap(0, Ordering::Relaxed),
                self.dispatched.swap(0, Ordering::Relaxed),
                self.dropped.swap(0, Ordering::Relaxed),
                self.decode_failures.swap(0, Ordering::Relaxed),
            )
        } else {
            (
                self.received.load(Ordering::Relaxed),
                self.dispatched.load(Ordering::Relaxed),
                self.dropped.load(Ordering::Relaxed),
                self.decode_failures.load(Ordering::Relaxed),
            )
        }
    }
}
