// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! hublink: same-host IPC substrate for cooperating hub services.
//!
//! Three layers, each usable on its own:
//!
//! ```text
//! +----------------------------------------------------------------+
//! |                        hub services                            |
//! +------------------+----------------------+----------------------+
//! | rpc              | eventbus             | sequencer            |
//! | request/response | multicast pub/sub    | host-wide event ids  |
//! | over loopback TCP| (best-effort UDP)    | (shm + semaphore)    |
//! +------------------+----------------------+----------------------+
//! | protocol (frames, events)  | pool (bounded workers)            |
//! +----------------------------+-----------------------------------+
//! | transport (socket plumbing)                                    |
//! +----------------------------------------------------------------+
//! ```
//!
//! * [`rpc`] gives every service a synchronous command channel: a
//!   bounded-concurrency [`rpc::IpcReceiver`] on the service side,
//!   connect-per-call sender functions on the client side.
//! * [`eventbus`] broadcasts state-change [`protocol::Event`]s to one
//!   well-known multicast group; consumers subscribe per producing
//!   service id or to everything.
//! * [`sequencer`] hands out host-unique increasing event ids through
//!   a shared-memory counter, so events from different processes can
//!   be ordered after the fact.
//!
//! Everything is thread-based and blocking. The crate assumes a
//! trusted single-host deployment: no authentication, no encryption,
//! loopback-only RPC by default.
//!
//! ## Quick tour
//!
//! ```no_run
//! use std::sync::Arc;
//! use hublink::protocol::{Event, IpcCode, IpcMessage};
//! use hublink::rpc::{IpcReceiver, ReceiverConfig};
//!
//! // Service side: answer requests on port 15000.
//! let receiver = IpcReceiver::start(
//!     ReceiverConfig::new(15000),
//!     Arc::new(|req: &IpcMessage| {
//!         (IpcCode::Success, IpcMessage::new(req.code))
//!     }),
//!     None,
//! ).unwrap();
//!
//! // Client side: one call, one response.
//! let reply = hublink::rpc::send_service_request_timeout(
//!     15000,
//!     &IpcMessage::new(42),
//!     5,
//! ).unwrap();
//! assert_eq!(reply.code, 42);
//!
//! // Broadcast a state change.
//! let producer = hublink::eventbus::EventProducer::init(15).unwrap();
//! producer.broadcast(&Event::new(15_001, 1)).unwrap();
//!
//! receiver.shutdown();
//! ```

pub mod config;
pub mod eventbus;
pub mod pool;
pub mod protocol;
pub mod rpc;
pub mod sequencer;
pub mod transport;

/// Crate version, from the build manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use protocol::{Event, IpcCode, IpcMessage};
