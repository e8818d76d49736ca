// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Server side of the RPC substrate.
//!
//! One receiver per service: it owns the listening socket and a
//! bounded worker pool. The accept loop does nothing but accept and
//! enqueue; decoding, the handler call, and the response write all
//! happen on a pool worker so a slow handler never stalls accepting.
//!
//! State machine:
//!
//! ```text
//! Created -> Listening -> (Accepting <-> Dispatching)* -> ShuttingDown -> Stopped
//! ```
//!
//! Teardown is triggered either externally ([`IpcReceiver::shutdown`])
//! or by a handler returning [`IpcCode::ShutDown`]; both run the same
//! path: stop accepting, close the socket, drain in-flight workers,
//! fire the shutdown callback exactly once, wake
//! [`IpcReceiver::wait_for_shutdown`] parkers.

use std::net::TcpStream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::WORKER_READ_TIMEOUT;
use crate::pool::WorkerPool;
use crate::protocol::frame::{self, IpcMessage};
use crate::protocol::IpcCode;
use crate::transport;

use super::{RpcError, RpcStats, ServiceVisibility, StatsBlock};

/// Bound on writing a response back to a connected client.
const RESPONSE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-service request handler: business logic lives entirely outside
/// this crate. The returned [`IpcCode`] is the handler's local status
/// (`ShutDown` requests teardown); the returned message is what goes
/// back on the wire.
pub type RequestHandler = Arc<dyn Fn(&IpcMessage) -> (IpcCode, IpcMessage) + Send + Sync>;

/// Callback fired exactly once when teardown completes.
pub type ShutdownCallback = Box<dyn FnOnce() + Send>;

/// Receiver tuning. Defaults suit a typical hub service: rarely more
/// than a handful of concurrent callers.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverConfig {
    /// Well-known TCP port of this service.
    pub port: u16,
    /// Which peers may connect.
    pub visibility: ServiceVisibility,
    /// Workers kept alive while idle.
    pub min_threads: usize,
    /// Upper bound on workers under load.
    pub max_threads: usize,
    /// Upper bound on queued (not yet dispatched) requests.
    pub max_queue: usize,
}

impl ReceiverConfig {
    /// Defaults for `port`: loopback visibility, 1..8 workers, queue 16.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            visibility: ServiceVisibility::LocalProcess,
            min_threads: 1,
            max_threads: 8,
            max_queue: 16,
        }
    }
}

struct ReceiverInner {
    port: u16,
    handler: RequestHandler,
    pool: WorkerPool,
    stats: StatsBlock,
    shutting_down: AtomicBool,
    stopped: Mutex<bool>,
    stopped_cond: Condvar,
    on_shutdown: Mutex<Option<ShutdownCallback>>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running RPC receiver. Cloneable; all clones refer to
/// the same listener and pool.
#[derive(Clone)]
pub struct IpcReceiver {
    inner: Arc<ReceiverInner>,
}

impl IpcReceiver {
    /// Bind, listen, and start accepting.
    ///
    /// Failure to bind (port in use, permission) is fatal and returned
    /// as [`RpcError::Bind`]; everything after that is handled
    /// internally. `on_async_shutdown` fires exactly once when
    /// teardown completes, whichever side triggered it.
    pub fn start(
        config: ReceiverConfig,
        handler: RequestHandler,
        on_async_shutdown: Option<ShutdownCallback>,
    ) -> Result<Self, RpcError> {
        let bind_addr = config.visibility.bind_addr(config.port);
        let listener = transport::tcp_listener(bind_addr).map_err(RpcError::Bind)?;

        let inner = Arc::new(ReceiverInner {
            port: config.port,
            handler,
            pool: WorkerPool::new(
                &format!("rpc-{}", config.port),
                config.min_threads,
                config.max_threads,
                config.max_queue,
            ),
            stats: StatsBlock::default(),
            shutting_down: AtomicBool::new(false),
            stopped: Mutex::new(false),
            stopped_cond: Condvar::new(),
            on_shutdown: Mutex::new(on_async_shutdown),
            accept_handle: Mutex::new(None),
        });

        let accept_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("rpc-accept-{}", config.port))
            .spawn(move || accept_loop(&accept_inner, listener))
            .map_err(RpcError::Io)?;
        *inner.accept_handle.lock() = Some(handle);

        log::info!("[RPC] Receiver listening on {}", bind_addr);
        Ok(Self { inner })
    }

    /// Synchronous teardown, callable from any thread except one of
    /// this receiver's own workers. Returns once the socket is closed
    /// and all accepted requests have been serviced. Idempotent: later
    /// callers just wait for the first teardown to finish.
    pub fn shutdown(&self) {
        if self
            .inner
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            teardown(&self.inner);
        } else {
            self.wait_for_shutdown();
        }
    }

    /// Park until teardown completes. Services run this on a dedicated
    /// pump thread so the process can sit idle awaiting IPC traffic.
    pub fn wait_for_shutdown(&self) {
        let mut stopped = self.inner.stopped.lock();
        while !*stopped {
            self.inner.stopped_cond.wait(&mut stopped);
        }
    }

    /// Atomically snapshot the runtime counters, optionally zeroing
    /// them (clear-on-read).
    pub fn collect_stats(&self, clear: bool) -> RpcStats {
        self.inner
            .stats
            .snapshot(self.inner.pool.queue_depth() as u64, clear)
    }

    /// Port this receiver is serving.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Whether teardown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }
}

fn accept_loop(inner: &Arc<ReceiverInner>, listener: std::net::TcpListener) {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _peer)) => stream,
            Err(e) => {
                if inner.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("[RPC] accept failed on port {}: {}", inner.port, e);
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        };

        if inner.shutting_down.load(Ordering::SeqCst) {
            // The wake-up connection (or a late client) during
            // teardown; no new requests are admitted.
            break;
        }

        if inner.pool.is_full() {
            inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
            reject_connection(inner, stream);
            continue;
        }

        let task_inner = Arc::clone(inner);
        let submitted = inner
            .pool
            .execute(move || service_connection(&task_inner, stream));
        if submitted.is_err() {
            // Raced a concurrent fill-up; dropping the stream closes
            // the connection and the client sees a transport error.
            inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }
    log::debug!("[RPC] Accept loop on port {} exited", inner.port);
}

/// Tell the client the queue is full and hang up. Best-effort; the
/// write happens on the accept thread, so it gets a short deadline.
fn reject_connection(inner: &Arc<ReceiverInner>, mut stream: TcpStream) {
    let response = IpcMessage::new(IpcCode::ResourceExhausted.as_u32());
    if let Ok(encoded) = frame::encode(&response) {
        let deadline = Instant::now() + Duration::from_millis(500);
        let _ = transport::write_frame(&mut stream, &encoded, Some(deadline));
    }
    log::debug!("[RPC] Rejected request on port {}: queue full", inner.port);
}

/// Service exactly one request on a pool worker, then close the
/// connection.
fn service_connection(inner: &Arc<ReceiverInner>, mut stream: TcpStream) {
    let read_deadline = Instant::now() + WORKER_READ_TIMEOUT;
    let raw = match transport::read_frame(&mut stream, Some(read_deadline), &|| false) {
        Ok(raw) => raw,
        Err(e) => {
            inner.stats.failed.fetch_add(1, Ordering::Relaxed);
            log::debug!("[RPC] Dropping connection on port {}: {}", inner.port, e);
            return;
        }
    };

    let request = match frame::decode(&raw) {
        Ok(request) => request,
        Err(e) => {
            // Malformed request: answer with a well-formed error frame
            // when we can, otherwise just drop the connection.
            inner.stats.failed.fetch_add(1, Ordering::Relaxed);
            log::debug!("[RPC] Undecodable request on port {}: {}", inner.port, e);
            write_response(
                inner,
                &mut stream,
                &IpcMessage::new(IpcCode::InvalidRequest.as_u32()),
            );
            return;
        }
    };

    // The worker boundary converts a panicking handler into an
    // internal-error response; the accept loop and other workers are
    // unaffected.
    let handler = Arc::clone(&inner.handler);
    let (status, response) = match catch_unwind(AssertUnwindSafe(|| handler(&request))) {
        Ok(result) => result,
        Err(_) => {
            log::error!(
                "[RPC] Handler panicked on port {} (request code {})",
                inner.port,
                request.code
            );
            (
                IpcCode::GeneralFailure,
                IpcMessage::new(IpcCode::GeneralFailure.as_u32()),
            )
        }
    };

    if write_response(inner, &mut stream, &response) {
        inner.stats.handled.fetch_add(1, Ordering::Relaxed);
    } else {
        inner.stats.failed.fetch_add(1, Ordering::Relaxed);
    }

    if status == IpcCode::ShutDown {
        trigger_async_shutdown(inner);
    }
}

/// Encode and write a response frame. Returns whether the client got
/// a response.
fn write_response(inner: &Arc<ReceiverInner>, stream: &mut TcpStream, response: &IpcMessage) -> bool {
    let encoded = match frame::encode(response) {
        Ok(encoded) => encoded,
        Err(e) => {
            log::warn!("[RPC] Response on port {} unencodable: {}", inner.port, e);
            match frame::encode(&IpcMessage::new(IpcCode::GeneralFailure.as_u32())) {
                Ok(fallback) => fallback,
                Err(_) => return false,
            }
        }
    };
    let deadline = Instant::now() + RESPONSE_WRITE_TIMEOUT;
    match transport::write_frame(stream, &encoded, Some(deadline)) {
        Ok(()) => true,
        Err(e) => {
            log::debug!("[RPC] Response write failed on port {}: {}", inner.port, e);
            false
        }
    }
}

/// Handler-requested teardown. Runs on a dedicated thread because the
/// requesting worker cannot join its own pool.
fn trigger_async_shutdown(inner: &Arc<ReceiverInner>) {
    if inner
        .shutting_down
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    log::info!("[RPC] Handler requested shutdown of port {}", inner.port);
    let teardown_inner = Arc::clone(inner);
    let spawned = std::thread::Builder::new()
        .name(format!("rpc-teardown-{}", inner.port))
        .spawn(move || teardown(&teardown_inner));
    if let Err(e) = spawned {
        log::error!("[RPC] Failed to spawn teardown thread: {}", e);
    }
}

/// The single teardown path. Caller must have won the
/// `shutting_down` flag.
fn teardown(inner: &Arc<ReceiverInner>) {
    // Wake the accept loop out of its blocking accept; the flag is
    // already set, so the dummy connection is discarded.
    let wake_addr = ServiceVisibility::LocalProcess.bind_addr(inner.port);
    let _ = TcpStream::connect_timeout(&wake_addr, Duration::from_millis(250));

    if let Some(handle) = inner.accept_handle.lock().take() {
        let _ = handle.join();
    }

    // Accepted requests drain; queued ones still run.
    inner.pool.shutdown();

    if let Some(callback) = inner.on_shutdown.lock().take() {
        callback();
    }

    let mut stopped = inner.stopped.lock();
    *stopped = true;
    inner.stopped_cond.notify_all();
    drop(stopped);

    log::info!("[RPC] Receiver on port {} stopped", inner.port);
}
