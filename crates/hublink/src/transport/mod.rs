// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Socket plumbing shared by the RPC and event-bus layers.
//!
//! All sockets are blocking; loops that must notice a shutdown flag
//! use short socket-level timeouts ([`crate::config::POLL_INTERVAL`])
//! instead of a poll reactor. One service makes few calls, and the
//! traffic is same-host, so connection setup cost is accepted in
//! exchange for having no connection state to invalidate.

pub mod multicast;

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Instant;

use crate::config::POLL_INTERVAL;
use crate::protocol::frame::{declared_frame_size, FRAME_LEN_SIZE};

/// Create a listening TCP socket with `SO_REUSEADDR` so a restarting
/// service can rebind its well-known port without waiting out
/// TIME_WAIT.
pub fn tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

/// Read one complete frame (length prefix included) from a blocking
/// stream.
///
/// The read is chunked under a short socket timeout so `deadline` and
/// `abort` are honored promptly:
/// - past `deadline` -> `ErrorKind::TimedOut`
/// - `abort()` true -> `ErrorKind::ConnectionAborted`
/// - peer closed mid-frame -> `ErrorKind::UnexpectedEof`
pub fn read_frame(
    stream: &mut TcpStream,
    deadline: Option<Instant>,
    abort: &dyn Fn() -> bool,
) -> io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(POLL_INTERVAL))?;

    let mut buf = vec![0u8; FRAME_LEN_SIZE];
    let mut filled = 0usize;
    let mut total = None;

    loop {
        if abort() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "read aborted by shutdown",
            ));
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "frame read deadline elapsed",
                ));
            }
        }

        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    if filled == 0 {
                        "connection closed"
                    } else {
                        "connection closed mid-frame"
                    },
                ));
            }
            Ok(n) => {
                filled += n;
                if total.is_none() {
                    if let Some(frame_size) = declared_frame_size(&buf[..filled]) {
                        // Length prefix complete; grow the buffer to
                        // fit the declared frame and keep reading.
                        total = Some(frame_size);
                        buf.resize(frame_size, 0);
                    }
                }
                if let Some(frame_size) = total {
                    if filled >= frame_size {
                        return Ok(buf);
                    }
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Write a full frame, bounded by `deadline` when given.
pub fn write_frame(
    stream: &mut TcpStream,
    frame: &[u8],
    deadline: Option<Instant>,
) -> io::Result<()> {
    let timeout = deadline
        .map(|d| d.saturating_duration_since(Instant::now()))
        .filter(|t| !t.is_zero());
    if deadline.is_some() && timeout.is_none() {
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "frame write deadline elapsed",
        ));
    }
    stream.set_write_timeout(timeout)?;
    stream.write_all(frame)?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{self, IpcMessage};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    fn loopback_listener() -> TcpListener {
        tcp_listener(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
            .expect("bind loopback")
    }

    #[test]
    fn test_read_frame_roundtrip_over_tcp() {
        let listener = loopback_listener();
        let addr = listener.local_addr().unwrap();

        let writer = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let msg = IpcMessage::with_payload(77, b"{\"k\":true}".to_vec());
            let encoded = frame::encode(&msg).unwrap();
            write_frame(&mut stream, &encoded, None).unwrap();
        });

        let (mut stream, _) = listener.accept().unwrap();
        let raw = read_frame(&mut stream, None, &|| false).unwrap();
        let msg = frame::decode(&raw).unwrap();
        assert_eq!(msg.code, 77);
        assert_eq!(msg.payload_str().unwrap(), "{\"k\":true}");
        writer.join().unwrap();
    }

    #[test]
    fn test_read_frame_deadline_elapses() {
        let listener = loopback_listener();
        let addr = listener.local_addr().unwrap();

        // Connect but never send anything.
        let _idle = TcpStream::connect(addr).unwrap();
        let (mut stream, _) = listener.accept().unwrap();

        let start = Instant::now();
        let deadline = Some(start + Duration::from_millis(500));
        let err = read_frame(&mut stream, deadline, &|| false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_read_frame_abort_flag() {
        let listener = loopback_listener();
        let addr = listener.local_addr().unwrap();
        let _idle = TcpStream::connect(addr).unwrap();
        let (mut stream, _) = listener.accept().unwrap();

        let err = read_frame(&mut stream, None, &|| true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn test_read_frame_peer_close_mid_frame() {
        let listener = loopback_listener();
        let addr = listener.local_addr().unwrap();

        let writer = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            // Length prefix promising 10 bytes, then hang up.
            stream.write_all(&[0u8, 10, 1, 2]).unwrap();
        });

        let (mut stream, _) = listener.accept().unwrap();
        let err = read_frame(&mut stream, None, &|| false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        writer.join().unwrap();
    }
}
