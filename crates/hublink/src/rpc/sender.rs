// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Client side of the RPC substrate.
//!
//! Free functions rather than a client object: a call is a fresh
//! connection, one framed request, one framed response, close. The
//! only process-wide state is the shutdown flag, which makes calls
//! already blocked in a read abort promptly during process exit
//! instead of hanging on an unresponsive peer.
//!
//! A transport-level `Ok` says only that bytes were exchanged
//! correctly; whatever success or failure the handler encoded inside
//! the response is the caller's to interpret.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::protocol::frame::{self, IpcMessage};
use crate::transport;

use super::RpcError;

/// How long one availability probe waits for the connect.
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Initial delay between availability polls; backs off to
/// [`POLL_DELAY_MAX`].
const POLL_DELAY_START: Duration = Duration::from_millis(100);
const POLL_DELAY_MAX: Duration = Duration::from_millis(500);

/// Process-wide abort flag. Cooperative: blocked reads notice it
/// within one poll interval.
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

/// Raise the process-wide abort flag. Any sender call already blocked
/// in a read returns [`RpcError::ShuttingDown`] promptly; new calls
/// fail immediately. Used on the process-exit path.
pub fn sender_shutdown() {
    SHUTTING_DOWN.store(true, Ordering::SeqCst);
    log::info!("[RPC] Sender shutdown flag raised");
}

/// Lower the abort flag again (test rigs; a real process exits).
pub fn reset_sender_shutdown() {
    SHUTTING_DOWN.store(false, Ordering::SeqCst);
}

fn aborting() -> bool {
    SHUTTING_DOWN.load(Ordering::SeqCst)
}

fn service_addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// Probe whether something is listening on the service port. Connects
/// and immediately closes; no data is exchanged.
pub fn is_service_available(port: u16) -> bool {
    TcpStream::connect_timeout(&service_addr(port), PROBE_TIMEOUT).is_ok()
}

/// Poll [`is_service_available`] with backoff until the service is up
/// or `timeout_secs` elapse. `timeout_secs == 0` means wait forever
/// (still aborted by [`sender_shutdown`]).
pub fn wait_for_service_available(port: u16, timeout_secs: u64) -> bool {
    let deadline = if timeout_secs == 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_secs(timeout_secs))
    };
    let mut delay = POLL_DELAY_START;

    loop {
        if aborting() {
            return false;
        }
        if is_service_available(port) {
            return true;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return false;
            }
        }
        std::thread::sleep(delay);
        delay = (delay * 2).min(POLL_DELAY_MAX);
    }
}

/// Send one request and block until the response arrives (or the
/// process-wide shutdown flag aborts the wait).
pub fn send_service_request(port: u16, request: &IpcMessage) -> Result<IpcMessage, RpcError> {
    send_service_request_timeout(port, request, 0)
}

/// Send one request with a bounded response wait. `read_timeout_secs
/// == 0` blocks indefinitely.
///
/// A timeout aborts only this caller's wait: the request may still
/// complete server-side after we give up (at-most-one execution is not
/// guaranteed).
pub fn send_service_request_timeout(
    port: u16,
    request: &IpcMessage,
    read_timeout_secs: u64,
) -> Result<IpcMessage, RpcError> {
    if aborting() {
        return Err(RpcError::ShuttingDown);
    }

    // Surface codec failures before touching the network.
    let encoded = frame::encode(request)?;

    let deadline = if read_timeout_secs == 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_secs(read_timeout_secs))
    };

    let addr = service_addr(port);
    let mut stream = match deadline {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            TcpStream::connect_timeout(&addr, remaining.max(Duration::from_millis(1)))
        }
        None => TcpStream::connect(&addr),
    }
    .map_err(RpcError::from)?;

    transport::write_frame(&mut stream, &encoded, deadline)?;

    let raw = transport::read_frame(&mut stream, deadline, &aborting)?;
    let response = frame::decode(&raw)?;

    log::debug!(
        "[RPC] Call to port {} done: sent code {}, got code {} ({} payload bytes)",
        port,
        request.code,
        response.code,
        response.payload_len()
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_port_probe() {
        // Port 1 on loopback: nothing listens there in any sane rig.
        assert!(!is_service_available(1));
    }

    #[test]
    fn test_wait_for_service_times_out() {
        let start = Instant::now();
        assert!(!wait_for_service_available(1, 1));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(900));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_send_to_dead_port_fails_fast() {
        let request = IpcMessage::new(100);
        let start = Instant::now();
        let result = send_service_request_timeout(1, &request, 1);
        assert!(matches!(
            result,
            Err(RpcError::ConnectionRefused) | Err(RpcError::Timeout)
        ));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    // The process-wide shutdown flag is exercised in its own
    // integration test binary (tests/sender_shutdown.rs) so it cannot
    // race other tests sharing this process.

    #[test]
    fn test_oversized_request_rejected_before_connect() {
        use crate::protocol::frame::MAX_PAYLOAD_LEN;
        let request = IpcMessage::with_payload(1, vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            send_service_request_timeout(1, &request, 1),
            Err(RpcError::Codec(_))
        ));
    }
}
