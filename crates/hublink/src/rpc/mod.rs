// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Synchronous request/response RPC between hub services.
//!
//! One service owns one TCP port (a build-time constant) and services
//! it with an [`receiver::IpcReceiver`]; any other process calls it
//! through the free functions in [`sender`]. Every call is one fresh
//! connection carrying exactly one framed request and one framed
//! response. No pooling, no keep-alive: services restart independently
//! and call each other rarely, so stale-connection bugs are traded
//! away for connection-setup cost.
//!
//! ```text
//!  caller process                         service process
//!  --------------                        ------------------
//!  send_service_request(port, req)  -->  accept loop --> worker pool
//!                                              |            |
//!                                              |        handler(req)
//!  response <--------------------------------(same connection)
//! ```

pub mod receiver;
pub mod sender;

pub use receiver::{IpcReceiver, ReceiverConfig, RequestHandler};
pub use sender::{
    is_service_available, reset_sender_shutdown, send_service_request,
    send_service_request_timeout, sender_shutdown, wait_for_service_available,
};

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::{CodecError, IpcCode};

/// Which peers may reach a receiver, expressed as a bind address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceVisibility {
    /// Only callers inside this host's loopback (the normal case for
    /// hub services).
    #[default]
    LocalProcess,
    /// Any process on this host.
    LocalHost,
    /// Any host that can route to us. The hub is a closed box, so this
    /// is the same bind as `LocalHost`; the distinction is kept for
    /// wire compatibility with peers that configure it.
    AllHosts,
}

impl ServiceVisibility {
    /// Bind address implied by this visibility for the given port.
    pub fn bind_addr(self, port: u16) -> SocketAddr {
        let ip = match self {
            Self::LocalProcess => Ipv4Addr::LOCALHOST,
            Self::LocalHost | Self::AllHosts => Ipv4Addr::UNSPECIFIED,
        };
        SocketAddr::new(IpAddr::V4(ip), port)
    }
}

/// RPC failures, both sides.
#[derive(Debug)]
pub enum RpcError {
    /// The message codec rejected a frame.
    Codec(CodecError),
    /// Socket-level failure.
    Io(io::Error),
    /// No listener on the target port.
    ConnectionRefused,
    /// The bounded wait for a response elapsed.
    Timeout,
    /// The process-wide sender shutdown flag aborted the call.
    ShuttingDown,
    /// The listening socket could not be created.
    Bind(io::Error),
}

impl RpcError {
    /// Collapse into the transport status code CLI tools print.
    pub fn to_ipc_code(&self) -> IpcCode {
        match self {
            Self::Codec(_) => IpcCode::InvalidRequest,
            Self::ConnectionRefused => IpcCode::ConnectionRefused,
            Self::Timeout => IpcCode::Timeout,
            Self::ShuttingDown => IpcCode::ShutDown,
            Self::Io(_) | Self::Bind(_) => IpcCode::GeneralFailure,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "codec failure: {e}"),
            Self::Io(e) => write!(f, "transport failure: {e}"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::Timeout => write!(f, "request timed out"),
            Self::ShuttingDown => write!(f, "sender is shutting down"),
            Self::Bind(e) => write!(f, "listener bind failed: {e}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<CodecError> for RpcError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::ConnectionAborted => Self::ShuttingDown,
            _ => Self::Io(e),
        }
    }
}

/// Counters attached to a receiver for external polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RpcStats {
    /// Requests fully serviced (handler ran, response written).
    pub requests_handled: u64,
    /// Requests that failed in decode, handler, or response write.
    pub requests_failed: u64,
    /// Requests rejected because the worker queue was full.
    pub requests_rejected: u64,
    /// Tasks waiting in the worker queue at snapshot time.
    pub queue_depth: u64,
}

/// Lock-free counter block behind [`RpcStats`] snapshots.
#[derive(Debug, Default)]
pub(crate) struct StatsBlock {
    pub handled: AtomicU64,
    pub failed: AtomicU64,
    pub rejected: AtomicU64,
}

impl StatsBlock {
    pub(crate) fn snapshot(&self, queue_depth: u64, clear: bool) -> RpcStats {
        let (handled, failed, rejected) = if clear {
            (
                self.handled.swap(0, Ordering::Relaxed),
                self.failed.swap(0, Ordering::Relaxed),
                self.rejected.swap(0, Ordering::Relaxed),
            )
        } else {
            (
                self.handled.load(Ordering::Relaxed),
                self.failed.load(Ordering::Relaxed),
                self.rejected.load(Ordering::Relaxed),
            )
        };
        RpcStats {
            requests_handled: handled,
            requests_failed: failed,
            requests_rejected: rejected,
            queue_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_bind_addresses() {
        assert_eq!(
            ServiceVisibility::LocalProcess.bind_addr(15000),
            "127.0.0.1:15000".parse().unwrap()
        );
        assert_eq!(
            ServiceVisibility::LocalHost.bind_addr(15000),
            "0.0.0.0:15000".parse().unwrap()
        );
        assert_eq!(
            ServiceVisibility::AllHosts.bind_addr(1),
            "0.0.0.0:1".parse().unwrap()
        );
    }

    #[test]
    fn test_io_error_mapping() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "x");
        assert!(matches!(
            RpcError::from(refused),
            RpcError::ConnectionRefused
        ));
        let timed = io::Error::new(io::ErrorKind::TimedOut, "x");
        assert!(matches!(RpcError::from(timed), RpcError::Timeout));
    }

    #[test]
    fn test_stats_clear_on_read() {
        let block = StatsBlock::default();
        block.handled.store(5, Ordering::Relaxed);
        let snap = block.snapshot(2, true);
        assert_eq!(snap.requests_handled, 5);
        assert_eq!(snap.queue_depth, 2);
        assert_eq!(block.snapshot(0, false).requests_handled, 0);
    }
}
