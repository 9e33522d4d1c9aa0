//! Process-wide profiler state and lifecycle.
//!
//! The profiler is a singleton started once with [`startup`]. It owns the
//! thread-context registry, the serial and frame-image queues, the deferred
//! replay queue, connection state, and the shutdown flags. A background
//! worker thread (spawned at startup) drains the queues and serves the
//! viewer; instrumented threads never block on its behalf.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::clock::{self, Calibration};
use crate::error::{Error, Result};
use crate::record::DeferredEvent;
use crate::serial::{FrameImageQueue, SerialQueue};
use crate::thread::ThreadContext;
use crate::worker;

/// Host callback invoked when the viewer changes a registered parameter.
pub type ParameterCallback = fn(idx: u32, val: i32);

/// Profiler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listen port; 0 picks an ephemeral port.
    pub port: u16,
    /// Gate record production on viewer connection state.
    pub on_demand: bool,
    /// Advertise the profiler over UDP until a viewer connects.
    pub broadcast: bool,
    /// UDP port the advertisement is sent to.
    pub broadcast_port: u16,
    /// Program name reported in the handshake and the advertisement.
    pub program_name: String,
}

impl Default for Config {
    fn default() -> Self {
        let program_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".to_owned());
        Self {
            port: 8086,
            on_demand: false,
            broadcast: true,
            broadcast_port: 8087,
            program_name,
        }
    }
}

pub(crate) struct Profiler {
    pub(crate) config: Config,
    pub(crate) calibration: Calibration,
    /// Unix time at startup, seconds.
    pub(crate) epoch_unix: u64,
    pub(crate) listen_addr: SocketAddr,
    /// Taken by the worker on its first iteration.
    pub(crate) listener: Mutex<Option<TcpListener>>,

    /// Registered thread contexts; locked only at registration and removal.
    pub(crate) threads: Mutex<Vec<Arc<ThreadContext>>>,
    pub(crate) serial: SerialQueue,
    pub(crate) frame_images: FrameImageQueue,
    /// Events replayed to every new connection.
    pub(crate) deferred: Mutex<Vec<DeferredEvent>>,

    pub(crate) frame_count: AtomicU64,
    pub(crate) is_connected: AtomicBool,
    pub(crate) connection_id: AtomicU64,
    zone_id: AtomicU32,
    gpu_ctx_counter: AtomicU8,

    pub(crate) shutdown: AtomicBool,
    pub(crate) shutdown_manual: AtomicBool,
    pub(crate) shutdown_finished: AtomicBool,

    pub(crate) param_callback: Mutex<Option<ParameterCallback>>,
}

static PROFILER: OnceLock<Profiler> = OnceLock::new();

impl Profiler {
    #[inline]
    pub(crate) fn try_global() -> Option<&'static Profiler> {
        PROFILER.get()
    }

    #[inline]
    pub(crate) fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn connection_id(&self) -> u64 {
        self.connection_id.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn next_zone_id(&self) -> u32 {
        self.zone_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Assign the next GPU context id; at most 255 contexts per process.
    pub(crate) fn next_gpu_context(&self) -> Option<u8> {
        self.gpu_ctx_counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                (v != u8::MAX).then_some(v + 1)
            })
            .ok()
    }

    pub(crate) fn register_thread(&self, thread_id: u64) -> Arc<ThreadContext> {
        let active = !self.config.on_demand || self.is_connected();
        let ctx = Arc::new(ThreadContext::new(thread_id, active));
        self.threads.lock().push(Arc::clone(&ctx));
        ctx
    }

    pub(crate) fn defer(&self, event: DeferredEvent) {
        self.deferred.lock().push(event);
    }
}

/// Start the profiler and its background worker.
///
/// May be called once per process; later calls return
/// [`Error::AlreadyStarted`].
pub fn startup(config: Config) -> Result<()> {
    // Bind before constructing so a port clash surfaces to the caller.
    let listener = TcpListener::bind(("0.0.0.0", config.port))?;
    listener.set_nonblocking(true)?;
    let listen_addr = listener.local_addr()?;

    let calibration = clock::calibrate();
    let epoch_unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let profiler = Profiler {
        config,
        calibration,
        epoch_unix,
        listen_addr,
        listener: Mutex::new(Some(listener)),
        threads: Mutex::new(Vec::new()),
        serial: SerialQueue::new(),
        frame_images: FrameImageQueue::new(),
        deferred: Mutex::new(Vec::new()),
        frame_count: AtomicU64::new(0),
        is_connected: AtomicBool::new(false),
        connection_id: AtomicU64::new(0),
        zone_id: AtomicU32::new(0),
        gpu_ctx_counter: AtomicU8::new(0),
        shutdown: AtomicBool::new(false),
        shutdown_manual: AtomicBool::new(false),
        shutdown_finished: AtomicBool::new(false),
        param_callback: Mutex::new(None),
    };

    PROFILER.set(profiler).map_err(|_| Error::AlreadyStarted)?;
    let profiler = PROFILER.get().expect("just set");

    std::thread::Builder::new()
        .name("zonewire-worker".into())
        .spawn(move || worker::run(profiler))?;

    tracing::info!(addr = %listen_addr, "profiler listening");
    Ok(())
}

/// Address the worker is listening on, once started. Useful with `port: 0`.
pub fn listen_addr() -> Option<SocketAddr> {
    Profiler::try_global().map(|p| p.listen_addr)
}

/// Ask the worker to perform a final drain-and-flush and stop.
///
/// Idempotent; producers keep functioning, but after
/// [`has_shutdown_finished`] reports `true` no further records reach the
/// viewer.
pub fn request_shutdown() {
    if let Some(p) = Profiler::try_global() {
        p.shutdown.store(true, Ordering::Relaxed);
        p.shutdown_manual.store(true, Ordering::Relaxed);
    }
}

/// Whether the worker has completed its final drain.
pub fn has_shutdown_finished() -> bool {
    Profiler::try_global()
        .map(|p| p.shutdown_finished.load(Ordering::Relaxed))
        .unwrap_or(false)
}

/// Whether a viewer is currently connected.
pub fn is_connected() -> bool {
    Profiler::try_global().map(Profiler::is_connected).unwrap_or(false)
}

/// Whether the profiler runs in on-demand mode.
pub fn is_on_demand() -> bool {
    Profiler::try_global()
        .map(|p| p.config.on_demand)
        .unwrap_or(false)
}
