// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Event producer: one multicast send socket per service id.
//!
//! `init` is idempotent within a process: a second `init` for the same
//! service id returns a handle to the same underlying socket. The
//! caller keeps ownership of the [`Event`] it broadcasts; the producer
//! copies what it needs during serialization.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::config::{self, MAX_EVENT_DATAGRAM};
use crate::protocol::Event;
use crate::sequencer;
use crate::transport::multicast;

use super::EventBusError;

struct ProducerInner {
    service_id: i32,
    socket: UdpSocket,
    dest: SocketAddr,
    shut: AtomicBool,
    sent: AtomicU64,
}

/// Broadcast handle scoped to one service id. Cloneable; clones share
/// the socket and counters.
#[derive(Clone)]
pub struct EventProducer {
    inner: Arc<ProducerInner>,
}

fn registry() -> &'static DashMap<i32, EventProducer> {
    static REGISTRY: OnceLock<DashMap<i32, EventProducer>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

impl EventProducer {
    /// Open (or reuse) the multicast send socket for `service_id`.
    pub fn init(service_id: i32) -> Result<Self, EventBusError> {
        if let Some(existing) = registry().get(&service_id) {
            if !existing.inner.shut.load(Ordering::SeqCst) {
                return Ok(existing.clone());
            }
        }

        let socket = multicast::multicast_send_socket()?;
        socket.set_nonblocking(true)?;
        let dest = SocketAddr::V4(SocketAddrV4::new(config::event_group(), config::event_port()));

        let producer = Self {
            inner: Arc::new(ProducerInner {
                service_id,
                socket,
                dest,
                shut: AtomicBool::new(false),
                sent: AtomicU64::new(0),
            }),
        };
        registry().insert(service_id, producer.clone());
        log::debug!(
            "[EVENT] Producer for service {} sending to {}",
            service_id,
            dest
        );
        Ok(producer)
    }

    /// Serialize and broadcast one event. Returns the event id that
    /// went on the wire (stamped from the sequencer when the caller
    /// left it 0; stays 0 if the sequencer is unavailable).
    ///
    /// One non-blocking send, no acknowledgement, no retry. A send
    /// buffer momentarily full drops the event, which is within the
    /// bus's best-effort contract.
    pub fn broadcast(&self, event: &Event) -> Result<u64, EventBusError> {
        if self.inner.shut.load(Ordering::SeqCst) {
            return Err(EventBusError::ShutDown);
        }

        let mut outgoing = event.clone();
        if outgoing.event_id == 0 {
            outgoing.event_id = sequencer::next_event_id();
        }
        if outgoing.service_id == 0 {
            outgoing.service_id = self.inner.service_id;
        }

        let json = outgoing.to_json()?;
        if json.len() > MAX_EVENT_DATAGRAM {
            return Err(EventBusError::OversizedEvent(json.len()));
        }

        match self.inner.socket.send_to(json.as_bytes(), self.inner.dest) {
            Ok(_) => {
                self.inner.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                log::debug!(
                    "[EVENT] Send buffer full, dropping event {} from service {}",
                    outgoing.event_id,
                    self.inner.service_id
                );
            }
            Err(e) => return Err(EventBusError::Io(e)),
        }

        Ok(outgoing.event_id)
    }

    /// Service id this producer is scoped to.
    pub fn service_id(&self) -> i32 {
        self.inner.service_id
    }

    /// Events successfully handed to the socket.
    pub fn events_sent(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    /// Close the producer. Safe to call more than once; later
    /// broadcasts fail with [`EventBusError::ShutDown`].
    pub fn shutdown(&self) {
        if !self.inner.shut.swap(true, Ordering::SeqCst) {
            registry().remove_if(&self.inner.service_id, |_, p| {
                Arc::ptr_eq(&p.inner, &self.inner)
            });
            log::debug!(
                "[EVENT] Producer for service {} shut down",
                self.inner.service_id
            );
        }
    }
}

/// Sum (and optionally clear) the sent counters of every live producer
/// in this process. Feeds the process-wide event statistics.
pub(crate) fn total_events_sent(clear: bool) -> u64 {
    let mut total = 0;
    for entry in registry().iter() {
        let sent = &entry.value().inner.sent;
        total += if clear {
            sent.swap(0, Ordering::Relaxed)
        } else {
            sent.load(Ordering::Relaxed)
        };
    }
    total
}
