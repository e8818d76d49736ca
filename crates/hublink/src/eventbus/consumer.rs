// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Event consumer: service-scoped filtering and handler dispatch.
//!
//! One process owns at most one receive socket and reader thread for
//! the event group, shared by every subscriber inside the process.
//! The reader is created lazily on the first registration and torn
//! down when the last registration is removed.
//!
//! The reader thread never runs handler code: every matching event is
//! submitted to a worker pool (the shared default pool, or a dedicated
//! pool registered for the service id), so one slow handler cannot
//! starve delivery to other subscribers. Subscribe/unsubscribe can
//! race the dispatch loop; the registration table is a concurrent map
//! for that reason.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config;
use crate::pool::WorkerPool;
use crate::protocol::Event;
use crate::transport::multicast;

use super::{producer, EventStats, EventStatsBlock, SUBSCRIBE_ALL};

/// Handler for delivered events. Runs on a worker-pool thread, never
/// on the reader thread.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle_event(&self, event: &Event) {
        self(event);
    }
}

struct ReaderHandle {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct ConsumerState {
    handlers: DashMap<i32, Arc<dyn EventHandler>>,
    pools: DashMap<i32, Arc<WorkerPool>>,
    default_pool: Mutex<Option<Arc<WorkerPool>>>,
    reader: Mutex<Option<ReaderHandle>>,
    stats: EventStatsBlock,
}

fn state() -> &'static ConsumerState {
    static STATE: OnceLock<ConsumerState> = OnceLock::new();
    STATE.get_or_init(|| ConsumerState {
        handlers: DashMap::new(),
        pools: DashMap::new(),
        default_pool: Mutex::new(None),
        reader: Mutex::new(None),
        stats: EventStatsBlock::default(),
    })
}

/// Register `handler` for events produced by `service_id`
/// ([`SUBSCRIBE_ALL`] for every event). Starts the receive socket and
/// reader thread on the first registration.
///
/// Returns `false` if the id already has a handler (stop it first) or
/// the receive socket could not be created.
pub fn start_event_listener(service_id: i32, handler: Arc<dyn EventHandler>) -> bool {
    let st = state();
    if st.handlers.contains_key(&service_id) {
        log::warn!(
            "[EVENT] Listener for service {} already registered",
            service_id
        );
        return false;
    }
    st.handlers.insert(service_id, handler);

    if !ensure_reader_running(st) {
        st.handlers.remove(&service_id);
        return false;
    }
    log::debug!("[EVENT] Listener registered for service {}", service_id);
    true
}

/// Remove the registration for `service_id`. Tears the socket and
/// reader thread down when this was the last registration.
pub fn stop_event_listener(service_id: i32) -> bool {
    let st = state();
    let removed = st.handlers.remove(&service_id).is_some();
    if removed && st.handlers.is_empty() {
        stop_reader(st);
    }
    removed
}

/// Force-close the socket and reader thread regardless of outstanding
/// registrations. Process-exit path; idempotent.
pub fn shutdown_event_listener() {
    let st = state();
    st.handlers.clear();
    stop_reader(st);
    log::info!("[EVENT] Event listener shut down");
}

/// Give `service_id` its own worker pool for handler execution.
/// Replaces (and drains) any previously registered pool for that id.
pub fn register_service_event_pool(
    service_id: i32,
    min_threads: usize,
    max_threads: usize,
    max_queue: usize,
) {
    let pool = Arc::new(WorkerPool::new(
        &format!("event-{service_id}"),
        min_threads,
        max_threads,
        max_queue,
    ));
    state().pools.insert(service_id, pool);
}

/// Feed a pre-encoded event JSON document straight into the matching
/// and dispatch path, bypassing the socket. Returns whether the
/// document decoded as an event.
///
/// This is the unit-test entry for filter/dispatch logic; it works
/// with no listener running.
pub fn directly_process_raw_event(raw: &str) -> bool {
    dispatch_raw(state(), raw)
}

/// Snapshot (and optionally clear) the process-wide event counters,
/// including events sent by this process's producers.
pub fn collect_event_stats(clear: bool) -> EventStats {
    let st = state();
    let (received, dispatched, dropped, decode_failures) = st.stats.read(clear);
    EventStats {
        events_sent: producer::total_events_sent(clear),
        events_received: received,
        events_dispatched: dispatched,
        events_dropped: dropped,
        decode_failures,
    }
}

/// Start the reader thread if it is not running. Caller has already
/// inserted its registration.
fn ensure_reader_running(st: &'static ConsumerState) -> bool {
    let mut reader = st.reader.lock();
    if reader.is_some() {
        return true;
    }

    let socket = match multicast::multicast_recv_socket(config::event_group(), config::event_port())
    {
        Ok(socket) => socket,
        Err(e) => {
            log::error!("[EVENT] Cannot open event receive socket: {}", e);
            return false;
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let thread_running = Arc::clone(&running);
    let spawned = std::thread::Builder::new()
        .name("event-reader".to_string())
        .spawn(move || reader_loop(&thread_running, &socket));

    match spawned {
        Ok(handle) => {
            *reader = Some(ReaderHandle { running, handle });
            log::debug!(
                "[EVENT] Reader listening on {}:{}",
                config::event_group(),
                config::event_port()
            );
            true
        }
        Err(e) => {
            log::error!("[EVENT] Cannot spawn event reader: {}", e);
            false
        }
    }
}

fn stop_reader(st: &ConsumerState) {
    if let Some(reader) = st.reader.lock().take() {
        reader.running.store(false, Ordering::SeqCst);
        let _ = reader.handle.join();
        log::debug!("[EVENT] Reader stopped");
    }
}

/// One blocking receive per iteration; the socket carries a short
/// read timeout so the running flag is honored between datagrams.
fn reader_loop(running: &AtomicBool, socket: &std::net::UdpSocket) {
    let st = state();
    let mut buf = vec![0u8; 65536];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, _peer)) => {
                let raw = String::from_utf8_lossy(&buf[..len]);
                dispatch_raw(st, &raw);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::warn!("[EVENT] recv failed: {}", e);
                break;
            }
        }
    }
}

/// Decode, filter, and dispatch one raw event document.
fn dispatch_raw(st: &'static ConsumerState, raw: &str) -> bool {
    let event = match Event::from_json(raw) {
        Ok(event) => event,
        Err(e) => {
            st.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
            log::debug!("[EVENT] Undecodable event dropped: {}", e);
            return false;
        }
    };
    st.stats.received.fetch_add(1, Ordering::Relaxed);

    let owner = event.owning_service_id();
    let event = Arc::new(event);

    dispatch_to(st, owner, &event);
    if owner != SUBSCRIBE_ALL {
        dispatch_to(st, SUBSCRIBE_ALL, &event);
    }
    true
}

/// Submit the event to the handler registered under `key`, if any.
fn dispatch_to(st: &'static ConsumerState, key: i32, event: &Arc<Event>) {
    let Some(entry) = st.handlers.get(&key) else {
        return;
    };
    let handler = Arc::clone(entry.value());
    drop(entry);

    let pool = pool_for(st, key);
    let event = Arc::clone(event);
    match pool.execute(move || handler.handle_event(&event)) {
        Ok(()) => {
            st.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            st.stats.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!("[EVENT] Dropped event for subscriber {}: {}", key, e);
        }
    }
}

/// Dedicated pool for the subscription when one was registered,
/// otherwise the process-wide default pool.
fn pool_for(st: &ConsumerState, key: i32) -> Arc<WorkerPool> {
    if let Some(pool) = st.pools.get(&key) {
        return Arc::clone(pool.value());
    }
    let mut default_pool = st.default_pool.lock();
    Arc::clone(default_pool.get_or_insert_with(|| {
        Arc::new(WorkerPool::new("event-default", 1, 4, 64))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_handler() -> (Arc<dyn EventHandler>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_in = Arc::clone(&count);
        let handler: Arc<dyn EventHandler> = Arc::new(move |_event: &Event| {
            count_in.fetch_add(1, Ordering::SeqCst);
        });
        (handler, count)
    }

    fn wait_for(count: &AtomicUsize, expected: usize) -> bool {
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) >= expected {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    // These tests share the process-global consumer, so each uses its
    // own service id range and unregisters when done.

    #[test]
    fn test_direct_dispatch_matches_specific_subscriber() {
        let (handler, count) = counting_handler();
        assert!(start_event_listener(701, handler));

        let raw = r#"{"eventId":1,"eventCode":701001,"eventValue":0,"eventTime":1,"serviceId":701}"#;
        assert!(directly_process_raw_event(raw));
        assert!(wait_for(&count, 1));

        // An event from a different service must not reach it.
        let other = r#"{"eventId":2,"eventCode":702001,"eventValue":0,"eventTime":1,"serviceId":702}"#;
        assert!(directly_process_raw_event(other));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(stop_event_listener(701));
    }

    #[test]
    fn test_subscribe_all_sees_everything() {
        let (handler, count) = counting_handler();
        assert!(start_event_listener(SUBSCRIBE_ALL, handler));

        for code in [711_001, 712_001, 713_001] {
            let raw = format!(r#"{{"eventId":9,"eventCode":{code},"eventValue":0,"eventTime":1}}"#);
            assert!(directly_process_raw_event(&raw));
        }
        assert!(wait_for(&count, 3));

        assert!(stop_event_listener(SUBSCRIBE_ALL));
    }

    #[test]
    fn test_double_registration_refused() {
        let (handler, _count) = counting_handler();
        assert!(start_event_listener(721, handler));
        let (handler2, _count2) = counting_handler();
        assert!(!start_event_listener(721, handler2));
        assert!(stop_event_listener(721));
        assert!(!stop_event_listener(721));
    }

    #[test]
    fn test_undecodable_event_counts_failure() {
        let before = collect_event_stats(false).decode_failures;
        assert!(!directly_process_raw_event("this is not json"));
        let after = collect_event_stats(false).decode_failures;
        assert!(after > before);
    }

    #[test]
    fn test_dedicated_pool_is_used() {
        register_service_event_pool(731, 1, 2, 8);
        let (handler, count) = counting_handler();
        assert!(start_event_listener(731, handler));

        let raw = r#"{"eventId":5,"eventCode":731001,"eventValue":2,"eventTime":1}"#;
        assert!(directly_process_raw_event(raw));
        assert!(wait_for(&count, 1));

        assert!(stop_event_listener(731));
    }
}
