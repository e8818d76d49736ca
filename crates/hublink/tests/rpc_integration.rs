// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! End-to-end RPC tests: real sockets, real worker pools, both sides
//! of the protocol in one process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hublink::protocol::{IpcCode, IpcMessage};
use hublink::rpc::{self, IpcReceiver, ReceiverConfig, RequestHandler};

fn test_port() -> u16 {
    40000 + fastrand::u16(..20000)
}

fn echo_handler() -> RequestHandler {
    Arc::new(|request: &IpcMessage| {
        (
            IpcCode::Success,
            IpcMessage {
                code: request.code,
                payload: request.payload.clone(),
            },
        )
    })
}

#[test]
fn test_concurrent_echo_round_trips() {
    let port = test_port();
    let receiver =
        IpcReceiver::start(ReceiverConfig::new(port), echo_handler(), None).expect("start");

    let mut callers = Vec::new();
    for i in 0..5u32 {
        callers.push(std::thread::spawn(move || {
            let body = format!("{{\"test\":\"x\",\"caller\":{i}}}");
            let request = IpcMessage::with_payload(1000 + i, body.clone().into_bytes());
            let response =
                rpc::send_service_request_timeout(port, &request, 5).expect("call succeeded");
            assert_eq!(response.code, 1000 + i);
            assert_eq!(response.payload_str().unwrap(), body);
        }));
    }
    for caller in callers {
        caller.join().expect("caller thread");
    }

    let stats = receiver.collect_stats(false);
    assert_eq!(stats.requests_handled, 5);
    assert_eq!(stats.requests_rejected, 0);
    receiver.shutdown();
}

#[test]
fn test_silent_peer_times_out() {
    // A listener that accepts but never answers: the bounded read must
    // give up close to its deadline instead of hanging.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let silent = std::thread::spawn(move || {
        let accepted = listener.accept();
        // Hold the connection open long enough for the client to time
        // out, then drop it.
        std::thread::sleep(Duration::from_secs(3));
        drop(accepted);
    });

    let start = Instant::now();
    let result = rpc::send_service_request_timeout(port, &IpcMessage::new(1), 1);
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(rpc::RpcError::Timeout)), "{result:?}");
    assert!(elapsed >= Duration::from_millis(900));
    assert!(elapsed < Duration::from_millis(2500));
    silent.join().expect("silent peer thread");
}

#[test]
fn test_pool_boundedness_rejects_excess_load() {
    let port = test_port();
    let mut config = ReceiverConfig::new(port);
    config.min_threads = 1;
    config.max_threads = 1;
    config.max_queue = 1;

    let handler: RequestHandler = Arc::new(|request: &IpcMessage| {
        std::thread::sleep(Duration::from_millis(400));
        (IpcCode::Success, IpcMessage::new(request.code))
    });
    let receiver = IpcReceiver::start(config, handler, None).expect("start");

    let successes = Arc::new(AtomicUsize::new(0));
    let rejections = Arc::new(AtomicUsize::new(0));
    let mut callers = Vec::new();
    for i in 0..6u32 {
        let successes = Arc::clone(&successes);
        let rejections = Arc::clone(&rejections);
        callers.push(std::thread::spawn(move || {
            match rpc::send_service_request_timeout(port, &IpcMessage::new(i), 5) {
                Ok(response) if response.code == i => {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
                Ok(response) => {
                    assert_eq!(
                        IpcCode::from_u32(response.code),
                        Some(IpcCode::ResourceExhausted)
                    );
                    rejections.fetch_add(1, Ordering::SeqCst);
                }
                // A racing reject can also surface as a dropped
                // connection.
                Err(_) => {
                    rejections.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }
    for caller in callers {
        caller.join().expect("caller thread");
    }

    let successes = successes.load(Ordering::SeqCst);
    let rejections = rejections.load(Ordering::SeqCst);
    assert_eq!(successes + rejections, 6);
    assert!(successes >= 1, "no request got through");
    assert!(rejections >= 1, "bounded pool never pushed back");
    receiver.shutdown();
}

#[test]
fn test_shutdown_drains_in_flight_request() {
    let port = test_port();
    let handler: RequestHandler = Arc::new(|request: &IpcMessage| {
        std::thread::sleep(Duration::from_millis(300));
        (IpcCode::Success, IpcMessage::new(request.code))
    });
    let receiver =
        IpcReceiver::start(ReceiverConfig::new(port), handler, None).expect("start");

    let caller = std::thread::spawn(move || {
        rpc::send_service_request_timeout(port, &IpcMessage::new(77), 5)
    });

    // Let the request reach the worker before tearing down.
    std::thread::sleep(Duration::from_millis(100));
    receiver.shutdown();

    let response = caller.join().expect("caller thread").expect("drained call");
    assert_eq!(response.code, 77);
    assert!(!rpc::is_service_available(port));
}

#[test]
fn test_wait_for_service_sees_late_start() {
    let port = test_port();

    let starter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        IpcReceiver::start(ReceiverConfig::new(port), echo_handler(), None).expect("start")
    });

    assert!(rpc::wait_for_service_available(port, 5));
    let receiver = starter.join().expect("starter thread");
    receiver.shutdown();
}
