//! Background worker: drain → encode → compress → send.
//!
//! A single thread owns the viewer connection. Each iteration it accepts a
//! pending connection if none is live, drains every registered thread queue
//! (tagging the stream with thread-context markers), then the serial queue,
//! resolves payloads referenced by the records just sent, answers viewer
//! queries, reaps thread contexts marked for deletion, and commits the
//! accumulated bytes as LZ4 frames. Frame images are compressed on a second
//! thread so the drain path stays hot.
//!
//! On socket errors the worker drops volatile per-connection state, keeps
//! the deferred queue, and returns to listening.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::callstack;
use crate::proto::{self, RecordType, ServerQuery};
use crate::profiler::Profiler;
use crate::record::{self, DeferredEvent, PlotValue, QueueEvent};
use crate::serial::FrameImage;
use crate::srcloc::{self, SourceLocation};
use crate::thread::ThreadContext;

/// How often the discovery advertisement is repeated while unconnected.
const BROADCAST_INTERVAL: Duration = Duration::from_millis(2500);

/// Idle sleep between loop iterations with nothing to do.
const IDLE_SLEEP: Duration = Duration::from_millis(2);

/// Which delta-encoding reference a record's timestamp belongs to.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Stream {
    Main,
    Serial,
}

/// A frame image after asynchronous compression.
struct CompressedImage {
    frame: u64,
    width: u16,
    height: u16,
    flip: bool,
    /// LZ4 block with prepended decompressed size.
    data: Vec<u8>,
}

pub(crate) fn run(profiler: &'static Profiler) {
    let listener = profiler
        .listener
        .lock()
        .take()
        .expect("worker started twice");

    let (img_tx, img_rx) = mpsc::channel::<FrameImage>();
    let img_results: Arc<Mutex<Vec<CompressedImage>>> = Arc::new(Mutex::new(Vec::new()));
    let results = Arc::clone(&img_results);
    let img_thread = std::thread::Builder::new()
        .name("zonewire-compress".into())
        .spawn(move || {
            while let Ok(image) = img_rx.recv() {
                let data = lz4_flex::compress_prepend_size(&image.pixels);
                results.lock().push(CompressedImage {
                    frame: image.frame,
                    width: image.width,
                    height: image.height,
                    flip: image.flip,
                    data,
                });
            }
        })
        .expect("failed to spawn image compressor");

    let broadcast = if profiler.config.broadcast {
        match UdpSocket::bind(("0.0.0.0", 0)).and_then(|s| {
            s.set_broadcast(true)?;
            Ok(s)
        }) {
            Ok(socket) => {
                let target =
                    SocketAddr::from((Ipv4Addr::BROADCAST, profiler.config.broadcast_port));
                Some((socket, target))
            }
            Err(e) => {
                tracing::warn!("failed to open broadcast socket: {e}");
                None
            }
        }
    } else {
        None
    };

    let mut worker = Worker {
        p: profiler,
        listener,
        conn: None,
        dead: false,
        broadcast,
        last_broadcast: None,
        buf: Vec::with_capacity(proto::TARGET_FRAME_SIZE * 2),
        ref_main: 0,
        ref_serial: 0,
        ref_gpu: 0,
        sent_srclocs: HashSet::new(),
        srcloc_registry: HashMap::new(),
        sent_strings: HashSet::new(),
        string_registry: HashMap::new(),
        last_thread: None,
        serial_scratch: Vec::new(),
        fi_scratch: Vec::new(),
        img_tx: Some(img_tx),
        img_results,
        img_thread: Some(img_thread),
        query_pending: Vec::new(),
    };
    worker.run();
}

struct Worker {
    p: &'static Profiler,
    listener: TcpListener,
    conn: Option<TcpStream>,
    /// Set when a send failed; the connection is torn down at a safe point.
    dead: bool,
    broadcast: Option<(UdpSocket, SocketAddr)>,
    last_broadcast: Option<Instant>,

    /// Record bytes accumulated towards the current wire frame.
    buf: Vec<u8>,
    ref_main: i64,
    ref_serial: i64,
    ref_gpu: i64,

    /// Static source locations already transmitted this connection.
    sent_srclocs: HashSet<u64>,
    /// Identity → record, for viewer re-queries. Cleared per connection.
    srcloc_registry: HashMap<u64, &'static SourceLocation>,
    /// String literals already transmitted this connection.
    sent_strings: HashSet<u64>,
    string_registry: HashMap<u64, &'static str>,
    /// Thread id of the last emitted thread-context marker.
    last_thread: Option<u64>,

    serial_scratch: Vec<QueueEvent>,
    fi_scratch: Vec<FrameImage>,
    img_tx: Option<mpsc::Sender<FrameImage>>,
    img_results: Arc<Mutex<Vec<CompressedImage>>>,
    img_thread: Option<JoinHandle<()>>,

    /// Partially received query packets.
    query_pending: Vec<u8>,
}

impl Worker {
    fn run(&mut self) {
        loop {
            let shutdown = self.p.shutdown_manual.load(Ordering::Relaxed);

            if self.conn.is_none() {
                if shutdown {
                    self.final_unconnected_shutdown();
                    break;
                }
                if !self.try_accept() {
                    self.broadcast_tick();
                    if self.p.config.on_demand {
                        // Disconnected on-demand clients pay near-zero cost;
                        // whatever raced past the gates is discarded here.
                        self.discard_all_queues();
                    }
                    std::thread::sleep(IDLE_SLEEP);
                }
                continue;
            }

            let drained = self.drain_all();
            let disconnect_requested = self.handle_queries();
            self.reap_marked_contexts();
            self.commit();

            if self.dead || disconnect_requested {
                self.disconnect();
                continue;
            }

            if shutdown {
                self.final_connected_shutdown();
                break;
            }

            if drained == 0 {
                std::thread::sleep(IDLE_SLEEP);
            }
        }

        self.p.shutdown_finished.store(true, Ordering::Release);
        tracing::info!("worker stopped");
    }

    /// Last drain-and-flush while a viewer is attached.
    fn final_connected_shutdown(&mut self) {
        self.drain_all();
        // Flush in-flight frame images through the compressor.
        drop(self.img_tx.take());
        if let Some(handle) = self.img_thread.take() {
            let _ = handle.join();
        }
        self.encode_compressed_images();
        self.commit();
        self.disconnect();
    }

    /// Shutdown with no viewer: release every pending heap payload.
    fn final_unconnected_shutdown(&mut self) {
        self.discard_all_queues();
        drop(self.img_tx.take());
        if let Some(handle) = self.img_thread.take() {
            let _ = handle.join();
        }
        self.img_results.lock().clear();
    }

    // --- connection lifecycle -------------------------------------------

    fn try_accept(&mut self) -> bool {
        let (stream, addr) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
            Err(e) => {
                tracing::warn!("accept error: {e}");
                return false;
            }
        };
        tracing::info!(%addr, "viewer connected");
        match self.handshake(stream) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("handshake failed: {e}");
                false
            }
        }
    }

    fn handshake(&mut self, mut stream: TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_secs(2)))?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;

        let mut shake = [0u8; 12];
        stream.read_exact(&mut shake)?;
        let version = u32::from_le_bytes(shake[8..12].try_into().unwrap());
        if &shake[..8] != proto::HANDSHAKE_MAGIC || version != proto::PROTOCOL_VERSION {
            stream.write_all(&[proto::HANDSHAKE_PROTOCOL_MISMATCH])?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "protocol mismatch",
            ));
        }
        stream.write_all(&[proto::HANDSHAKE_WELCOME])?;
        Self::send_welcome(self.p, &mut stream)?;

        // Queries are polled with a short read timeout from here on.
        stream.set_read_timeout(Some(Duration::from_millis(1)))?;

        // New connection epoch: reset volatile per-stream state first so the
        // deferred replay is encoded against fresh references.
        self.p.connection_id.fetch_add(1, Ordering::AcqRel);
        self.buf.clear();
        self.ref_main = 0;
        self.ref_serial = 0;
        self.ref_gpu = 0;
        self.sent_srclocs.clear();
        self.srcloc_registry.clear();
        self.sent_strings.clear();
        self.string_registry.clear();
        self.last_thread = None;
        self.query_pending.clear();
        self.dead = false;
        self.conn = Some(stream);

        // Replay the deferred queue before any live record.
        let deferred = self.p.deferred.lock().clone();
        for event in &deferred {
            self.encode_deferred(event);
        }
        self.commit();

        self.set_contexts_active(true);
        self.p.is_connected.store(true, Ordering::Release);
        Ok(())
    }

    fn send_welcome(p: &Profiler, stream: &mut TcpStream) -> std::io::Result<()> {
        let mut flags = 0u8;
        if p.config.on_demand {
            flags |= proto::WELCOME_FLAG_ON_DEMAND;
        }
        if callstack::has_walker() {
            flags |= proto::WELCOME_FLAG_CALLSTACK;
        }
        if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
            flags |= proto::WELCOME_FLAG_HW_TIMER;
        }

        let topology = proto::cpu_topology();
        let host = hostname();
        let program = p.config.program_name.as_bytes();

        let mut welcome = Vec::with_capacity(128 + topology.len() * 12);
        welcome.extend_from_slice(&p.calibration.timer_mul.to_le_bytes());
        welcome.extend_from_slice(&p.calibration.resolution.to_le_bytes());
        welcome.extend_from_slice(&p.calibration.delay.to_le_bytes());
        welcome.extend_from_slice(&p.calibration.epoch.to_le_bytes());
        welcome.extend_from_slice(&p.epoch_unix.to_le_bytes());
        welcome.extend_from_slice(&(std::process::id() as u64).to_le_bytes());
        welcome.push(flags);
        welcome.extend_from_slice(&(topology.len() as u16).to_le_bytes());
        welcome.extend_from_slice(&(program.len().min(usize::from(u16::MAX)) as u16).to_le_bytes());
        welcome.extend_from_slice(&program[..program.len().min(usize::from(u16::MAX))]);
        let host = host.as_bytes();
        welcome.extend_from_slice(&(host.len().min(usize::from(u16::MAX)) as u16).to_le_bytes());
        welcome.extend_from_slice(&host[..host.len().min(usize::from(u16::MAX))]);
        for slot in &topology {
            welcome.extend_from_slice(&slot.logical.to_le_bytes());
            welcome.extend_from_slice(&slot.core.to_le_bytes());
            welcome.extend_from_slice(&slot.package.to_le_bytes());
        }
        stream.write_all(&welcome)
    }

    fn disconnect(&mut self) {
        tracing::info!("viewer disconnected");
        self.p.is_connected.store(false, Ordering::Release);
        self.set_contexts_active(false);
        self.conn = None;
        self.dead = false;
        self.buf.clear();
        self.ref_main = 0;
        self.ref_serial = 0;
        self.ref_gpu = 0;
        self.sent_srclocs.clear();
        self.srcloc_registry.clear();
        self.sent_strings.clear();
        self.string_registry.clear();
        self.last_thread = None;
        self.query_pending.clear();
        self.last_broadcast = None;
        if self.p.config.on_demand {
            self.discard_all_queues();
        }
    }

    /// Flip every context's on-demand gate under its end-zone lock so the
    /// flip cannot interleave with an in-flight end-zone epoch check.
    fn set_contexts_active(&self, active: bool) {
        let contexts = self.p.threads.lock().clone();
        for ctx in contexts {
            ctx.lock();
            ctx.is_active.store(active, Ordering::Release);
            ctx.unlock();
        }
    }

    fn broadcast_tick(&mut self) {
        let Some((socket, target)) = &self.broadcast else {
            return;
        };
        let due = self
            .last_broadcast
            .map_or(true, |t| t.elapsed() >= BROADCAST_INTERVAL);
        if !due {
            return;
        }
        self.last_broadcast = Some(Instant::now());
        let msg = proto::Advertisement {
            protocol: proto::PROTOCOL_VERSION,
            port: self.p.listen_addr.port(),
            pid: u64::from(std::process::id()),
            program: self.p.config.program_name.clone(),
        };
        match msg.to_datagram() {
            Ok(datagram) => {
                if let Err(e) = socket.send_to(&datagram, *target) {
                    tracing::debug!("broadcast send failed: {e}");
                }
            }
            Err(e) => tracing::debug!("broadcast encode failed: {e}"),
        }
    }

    // --- draining --------------------------------------------------------

    /// Drain every queue into the wire buffer; returns the record count.
    fn drain_all(&mut self) -> usize {
        let mut total = 0usize;

        let contexts = self.p.threads.lock().clone();
        for ctx in &contexts {
            if !ctx.stack.canaries_intact() {
                tracing::error!(
                    thread = ctx.thread_id,
                    "zone stack canary corrupted, aborting"
                );
                std::process::abort();
            }
            total += self.drain_thread(ctx);
        }

        let mut serial = std::mem::take(&mut self.serial_scratch);
        self.p.serial.drain_into(&mut serial);
        total += serial.len();
        for event in &serial {
            self.encode_event(*event, Stream::Serial);
        }
        serial.clear();
        self.serial_scratch = serial;

        total += self.forward_frame_images();
        total += self.encode_compressed_images();
        total
    }

    fn drain_thread(&mut self, ctx: &ThreadContext) -> usize {
        let thread_id = ctx.thread_id;
        let mut announced = false;
        ctx.queue.drain(|event| {
            if !announced {
                self.switch_thread(thread_id);
                announced = true;
            }
            self.encode_event(event, Stream::Main);
        })
    }

    /// Emit a thread-context marker when the originating thread changes.
    fn switch_thread(&mut self, thread_id: u64) {
        if self.last_thread == Some(thread_id) {
            return;
        }
        self.last_thread = Some(thread_id);
        self.tag(RecordType::ThreadContext);
        self.put_u64(thread_id);
    }

    /// Hand pending frame images to the compressor thread.
    fn forward_frame_images(&mut self) -> usize {
        let mut images = std::mem::take(&mut self.fi_scratch);
        self.p.frame_images.drain_into(&mut images);
        let count = images.len();
        if let Some(tx) = &self.img_tx {
            for image in images.drain(..) {
                let _ = tx.send(image);
            }
        }
        images.clear();
        self.fi_scratch = images;
        count
    }

    /// Encode whatever the compressor finished since last iteration.
    fn encode_compressed_images(&mut self) -> usize {
        let done: Vec<CompressedImage> = std::mem::take(&mut *self.img_results.lock());
        let count = done.len();
        for image in done {
            self.tag(RecordType::FrameImage);
            self.put_u64(image.frame);
            self.put_u16(image.width);
            self.put_u16(image.height);
            self.put_u8(u8::from(image.flip));
            self.put_u32(image.data.len() as u32);
            self.buf.extend_from_slice(&image.data);
            self.maybe_commit();
        }
        count
    }

    /// Drop everything queued, releasing owned heap payloads.
    fn discard_all_queues(&mut self) {
        let contexts = self.p.threads.lock().clone();
        for ctx in &contexts {
            ctx.queue.drain(discard_event);
        }
        let mut serial = std::mem::take(&mut self.serial_scratch);
        self.p.serial.drain_into(&mut serial);
        for event in serial.drain(..) {
            discard_event(event);
        }
        self.serial_scratch = serial;
        let mut images = std::mem::take(&mut self.fi_scratch);
        self.p.frame_images.drain_into(&mut images);
        images.clear();
        self.fi_scratch = images;
        self.img_results.lock().clear();
        self.reap_marked_contexts();
    }

    /// Remove contexts whose threads exited, after one last drain.
    fn reap_marked_contexts(&mut self) {
        let marked: Vec<Arc<ThreadContext>> = {
            let threads = self.p.threads.lock();
            threads
                .iter()
                .filter(|c| c.marked_for_deletion.load(Ordering::Acquire))
                .cloned()
                .collect()
        };
        if marked.is_empty() {
            return;
        }
        for ctx in &marked {
            if self.conn.is_some() {
                self.drain_thread(ctx);
            } else {
                ctx.queue.drain(discard_event);
            }
        }
        self.p
            .threads
            .lock()
            .retain(|c| !c.marked_for_deletion.load(Ordering::Acquire));
    }

    // --- encoding --------------------------------------------------------

    #[inline]
    fn tag(&mut self, t: RecordType) {
        self.buf.push(t as u8);
    }

    #[inline]
    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    #[inline]
    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `u16` length-prefixed bytes, truncated at 64 KiB.
    fn put_bytes16(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(usize::from(u16::MAX));
        self.put_u16(len as u16);
        self.buf.extend_from_slice(&bytes[..len]);
    }

    /// Delta-encode a timestamp against its stream reference.
    #[inline]
    fn put_time(&mut self, stream: Stream, t: i64) {
        let reference = match stream {
            Stream::Main => &mut self.ref_main,
            Stream::Serial => &mut self.ref_serial,
        };
        let delta = t.wrapping_sub(*reference);
        *reference = t;
        self.put_i64(delta);
    }

    #[inline]
    fn put_gpu_time(&mut self, t: i64) {
        let delta = t.wrapping_sub(self.ref_gpu);
        self.ref_gpu = t;
        self.put_i64(delta);
    }

    /// Send a string literal's contents the first time its identity appears.
    fn note_string(&mut self, s: &'static str) {
        let id = s.as_ptr() as u64;
        if self.sent_strings.insert(id) {
            self.string_registry.insert(id, s);
            self.tag(RecordType::StringData);
            self.put_u64(id);
            self.put_bytes16(s.as_bytes());
        }
    }

    /// Send a static source location's payload exactly once per connection.
    fn note_srcloc(&mut self, s: &'static SourceLocation) {
        let id = s as *const SourceLocation as u64;
        if self.sent_srclocs.insert(id) {
            self.srcloc_registry.insert(id, s);
            self.write_srcloc_record(RecordType::SourceLocation, id, s);
        }
    }

    fn write_srcloc_record(&mut self, ty: RecordType, id: u64, s: &SourceLocation) {
        self.tag(ty);
        self.put_u64(id);
        self.put_u32(s.line);
        self.put_u32(s.color);
        self.put_bytes16(s.function.as_bytes());
        self.put_bytes16(s.file.as_bytes());
        self.put_bytes16(s.name.unwrap_or("").as_bytes());
    }

    /// Transmit the packed payload of a runtime source location, then free it.
    fn send_alloc_srcloc_payload(&mut self, handle: u64) {
        // SAFETY: the handle arrived in exactly one ZoneBeginAllocSrcLoc
        // record and is freed exactly once, here.
        let bytes = unsafe { srcloc::packed_bytes(handle) };
        let color = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let line = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let tail = &bytes[12..];
        let fn_end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        let function = &tail[..fn_end];
        let rest = tail.get(fn_end + 1..).unwrap_or(&[]);
        let file_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let file = &rest[..file_end];
        let name = rest.get(file_end + 1..).unwrap_or(&[]);

        self.tag(RecordType::SourceLocationPayload);
        self.put_u64(handle);
        self.put_u32(line);
        self.put_u32(color);
        let (function, file, name) = (function.to_vec(), file.to_vec(), name.to_vec());
        self.put_bytes16(&function);
        self.put_bytes16(&file);
        self.put_bytes16(&name);
        unsafe { srcloc::free_packed(handle) };
    }

    /// Transmit an owned text payload inline, then free it.
    fn send_text_payload(&mut self, handle: u64) {
        // SAFETY: each text handle travels in exactly one record and is
        // freed exactly once, here.
        let bytes = unsafe { record::text_bytes(handle) }.to_vec();
        self.put_bytes16(&bytes);
        unsafe { record::free_text(handle) };
    }

    /// Transmit a callstack slab, then free it.
    fn send_callstack_payload(&mut self, handle: u64) {
        // SAFETY: each callstack handle travels in exactly one record and is
        // freed exactly once, here.
        let addrs = unsafe { callstack::addresses(handle) }.to_vec();
        self.put_u8(addrs.len().min(255) as u8);
        #[cfg(target_endian = "little")]
        self.buf
            .extend_from_slice(bytemuck::cast_slice(&addrs[..addrs.len().min(255)]));
        #[cfg(not(target_endian = "little"))]
        for a in &addrs[..addrs.len().min(255)] {
            self.buf.extend_from_slice(&a.to_le_bytes());
        }
        unsafe { callstack::free(handle) };
    }

    fn encode_event(&mut self, event: QueueEvent, stream: Stream) {
        match event {
            QueueEvent::ZoneBegin {
                time,
                srcloc,
                callstack,
            } => {
                self.tag(if callstack {
                    RecordType::ZoneBeginCallstack
                } else {
                    RecordType::ZoneBegin
                });
                self.put_time(stream, time);
                self.put_u64(srcloc as *const SourceLocation as u64);
                self.note_srcloc(srcloc);
            }
            QueueEvent::ZoneBeginAllocSrcLoc {
                time,
                srcloc,
                callstack,
            } => {
                self.tag(if callstack {
                    RecordType::ZoneBeginAllocSrcLocCallstack
                } else {
                    RecordType::ZoneBeginAllocSrcLoc
                });
                self.put_time(stream, time);
                self.put_u64(srcloc);
                self.send_alloc_srcloc_payload(srcloc);
            }
            QueueEvent::ZoneBeginReplay { time, srcloc_id } => {
                // The payload is long freed; the identity alone is re-sent.
                self.tag(RecordType::ZoneBeginAllocSrcLoc);
                self.put_time(stream, time);
                self.put_u64(srcloc_id);
            }
            QueueEvent::ZoneEnd { time } => {
                self.tag(RecordType::ZoneEnd);
                self.put_time(stream, time);
            }
            QueueEvent::ZoneValidation { id } => {
                self.tag(RecordType::ZoneValidation);
                self.put_u32(id);
            }
            QueueEvent::ZoneText { text } => {
                self.tag(RecordType::ZoneText);
                self.send_text_payload(text);
            }
            QueueEvent::ZoneName { text } => {
                self.tag(RecordType::ZoneName);
                self.send_text_payload(text);
            }
            QueueEvent::ZoneValue { value } => {
                self.tag(RecordType::ZoneValue);
                self.put_u64(value);
            }
            QueueEvent::Callstack { handle } => {
                self.tag(RecordType::Callstack);
                self.send_callstack_payload(handle);
            }
            QueueEvent::FrameMark { time, name } => {
                self.tag(RecordType::FrameMarkMsg);
                self.put_time(stream, time);
                match name {
                    Some(name) => {
                        self.put_u64(name.as_ptr() as u64);
                        self.note_string(name);
                    }
                    None => self.put_u64(0),
                }
            }
            QueueEvent::FrameMarkStart { time, name } => {
                self.tag(RecordType::FrameMarkStart);
                self.put_time(stream, time);
                self.put_u64(name.as_ptr() as u64);
                self.note_string(name);
            }
            QueueEvent::FrameMarkEnd { time, name } => {
                self.tag(RecordType::FrameMarkEnd);
                self.put_time(stream, time);
                self.put_u64(name.as_ptr() as u64);
                self.note_string(name);
            }
            QueueEvent::PlotData { name, time, value } => {
                self.tag(RecordType::PlotData);
                self.put_u64(name.as_ptr() as u64);
                self.put_time(stream, time);
                match value {
                    PlotValue::I64(v) => {
                        self.put_u8(0);
                        self.put_i64(v);
                    }
                    PlotValue::F32(v) => {
                        self.put_u8(1);
                        self.put_f32(v);
                    }
                    PlotValue::F64(v) => {
                        self.put_u8(2);
                        self.put_f64(v);
                    }
                }
                self.note_string(name);
            }
            QueueEvent::PlotConfig { name, format } => {
                self.tag(RecordType::PlotConfig);
                self.put_u64(name.as_ptr() as u64);
                self.put_u8(format as u8);
                self.note_string(name);
            }
            QueueEvent::Message {
                time,
                text,
                callstack,
            } => {
                self.tag(if callstack {
                    RecordType::MessageCallstack
                } else {
                    RecordType::Message
                });
                self.put_time(stream, time);
                self.send_text_payload(text);
            }
            QueueEvent::MessageLiteral {
                time,
                text,
                callstack,
            } => {
                self.tag(if callstack {
                    RecordType::MessageLiteralCallstack
                } else {
                    RecordType::MessageLiteral
                });
                self.put_time(stream, time);
                self.put_u64(text.as_ptr() as u64);
                self.note_string(text);
            }
            QueueEvent::MessageColor {
                time,
                text,
                color,
                callstack,
            } => {
                self.tag(if callstack {
                    RecordType::MessageColorCallstack
                } else {
                    RecordType::MessageColor
                });
                self.put_time(stream, time);
                self.put_u32(color);
                self.send_text_payload(text);
            }
            QueueEvent::MessageLiteralColor {
                time,
                text,
                color,
                callstack,
            } => {
                self.tag(if callstack {
                    RecordType::MessageLiteralColorCallstack
                } else {
                    RecordType::MessageLiteralColor
                });
                self.put_time(stream, time);
                self.put_u32(color);
                self.put_u64(text.as_ptr() as u64);
                self.note_string(text);
            }
            QueueEvent::MessageAppInfo { time, text } => {
                self.tag(RecordType::MessageAppInfo);
                self.put_time(stream, time);
                self.send_text_payload(text);
            }
            QueueEvent::MemAlloc {
                time,
                thread,
                ptr,
                size,
                callstack,
            } => {
                self.tag(if callstack {
                    RecordType::MemAllocCallstack
                } else {
                    RecordType::MemAlloc
                });
                self.put_time(stream, time);
                self.put_u64(thread);
                self.put_u64(ptr);
                self.put_u64(size);
            }
            QueueEvent::MemFree {
                time,
                thread,
                ptr,
                callstack,
            } => {
                self.tag(if callstack {
                    RecordType::MemFreeCallstack
                } else {
                    RecordType::MemFree
                });
                self.put_time(stream, time);
                self.put_u64(thread);
                self.put_u64(ptr);
            }
            QueueEvent::CallstackMemory { handle } => {
                self.tag(RecordType::CallstackMemory);
                self.send_callstack_payload(handle);
            }
            QueueEvent::GpuNewContext {
                cpu_time,
                gpu_time,
                period,
                context,
            } => {
                self.tag(RecordType::GpuNewContext);
                self.put_time(stream, cpu_time);
                self.put_i64(gpu_time);
                self.put_f32(period);
                self.put_u8(context);
            }
            QueueEvent::GpuZoneBegin {
                cpu_time,
                srcloc,
                thread,
                query_id,
                context,
                callstack,
            } => {
                self.tag(if callstack {
                    RecordType::GpuZoneBeginCallstackSerial
                } else {
                    RecordType::GpuZoneBeginSerial
                });
                self.put_time(stream, cpu_time);
                self.put_u64(srcloc as *const SourceLocation as u64);
                self.put_u64(thread);
                self.put_u16(query_id);
                self.put_u8(context);
                self.note_srcloc(srcloc);
            }
            QueueEvent::GpuZoneEnd {
                cpu_time,
                thread,
                query_id,
                context,
            } => {
                self.tag(RecordType::GpuZoneEndSerial);
                self.put_time(stream, cpu_time);
                self.put_u64(thread);
                self.put_u16(query_id);
                self.put_u8(context);
            }
            QueueEvent::GpuTime {
                gpu_time,
                query_id,
                context,
            } => {
                self.tag(RecordType::GpuTime);
                self.put_gpu_time(gpu_time);
                self.put_u16(query_id);
                self.put_u8(context);
            }
            QueueEvent::ParamSetup {
                idx,
                name,
                is_bool,
                val,
            } => {
                self.tag(RecordType::ParamSetup);
                self.put_u32(idx);
                self.put_u64(name.as_ptr() as u64);
                self.put_u8(u8::from(is_bool));
                self.put_i64(i64::from(val));
                self.note_string(name);
            }
        }
        self.maybe_commit();
    }

    fn encode_deferred(&mut self, event: &DeferredEvent) {
        match event {
            DeferredEvent::PlotConfig { name, format } => {
                self.encode_event(
                    QueueEvent::PlotConfig {
                        name: *name,
                        format: *format,
                    },
                    Stream::Main,
                );
            }
            DeferredEvent::AppInfo { time, text } => {
                self.tag(RecordType::MessageAppInfo);
                self.put_time(Stream::Main, *time);
                let bytes = text.as_bytes().to_vec();
                self.put_bytes16(&bytes);
                self.maybe_commit();
            }
            DeferredEvent::ParamSetup {
                idx,
                name,
                is_bool,
                val,
            } => {
                self.encode_event(
                    QueueEvent::ParamSetup {
                        idx: *idx,
                        name: *name,
                        is_bool: *is_bool,
                        val: *val,
                    },
                    Stream::Main,
                );
            }
            DeferredEvent::GpuNewContext {
                cpu_time,
                gpu_time,
                period,
                context,
            } => {
                self.encode_event(
                    QueueEvent::GpuNewContext {
                        cpu_time: *cpu_time,
                        gpu_time: *gpu_time,
                        period: *period,
                        context: *context,
                    },
                    Stream::Serial,
                );
            }
        }
    }

    // --- framing ---------------------------------------------------------

    #[inline]
    fn maybe_commit(&mut self) {
        if self.buf.len() >= proto::TARGET_FRAME_SIZE {
            self.commit();
        }
    }

    /// One commit = one wire frame: `[u32 compressed_len][LZ4 block]`.
    fn commit(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        if self.dead || self.conn.is_none() {
            self.buf.clear();
            return;
        }
        let compressed = lz4_flex::compress_prepend_size(&self.buf);
        self.buf.clear();
        let stream = self.conn.as_mut().expect("checked above");
        let header = (compressed.len() as u32).to_le_bytes();
        if let Err(e) = stream
            .write_all(&header)
            .and_then(|()| stream.write_all(&compressed))
        {
            tracing::warn!("send failed: {e}");
            self.dead = true;
        }
    }

    // --- server queries --------------------------------------------------

    /// Read and answer pending viewer queries; `true` requests disconnect.
    fn handle_queries(&mut self) -> bool {
        let mut disconnect = false;
        let mut chunk = [0u8; 256];
        loop {
            let Some(stream) = self.conn.as_mut() else {
                return disconnect;
            };
            match stream.read(&mut chunk) {
                Ok(0) => {
                    // Peer closed its half; treat as disconnect.
                    self.dead = true;
                    return true;
                }
                Ok(n) => self.query_pending.extend_from_slice(&chunk[..n]),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(e) => {
                    tracing::warn!("query read failed: {e}");
                    self.dead = true;
                    return true;
                }
            }
        }

        while self.query_pending.len() >= proto::SERVER_QUERY_SIZE {
            let packet: [u8; proto::SERVER_QUERY_SIZE] = self.query_pending
                [..proto::SERVER_QUERY_SIZE]
                .try_into()
                .unwrap();
            self.query_pending.drain(..proto::SERVER_QUERY_SIZE);
            match ServerQuery::parse(&packet) {
                Some(ServerQuery::Disconnect) => disconnect = true,
                Some(query) => self.answer_query(query),
                None => tracing::warn!(kind = packet[0], "unknown server query"),
            }
        }
        disconnect
    }

    fn answer_query(&mut self, query: ServerQuery) {
        match query {
            ServerQuery::String(id) => {
                if let Some(s) = self.string_registry.get(&id).copied() {
                    self.tag(RecordType::StringData);
                    self.put_u64(id);
                    self.put_bytes16(s.as_bytes());
                }
            }
            ServerQuery::ThreadName(thread_id) => {
                let name = crate::thread::thread_name(thread_id).unwrap_or_default();
                self.tag(RecordType::ThreadName);
                self.put_u64(thread_id);
                self.put_bytes16(name.as_bytes());
            }
            ServerQuery::SourceLocation(id) => {
                if let Some(s) = self.srcloc_registry.get(&id).copied() {
                    self.write_srcloc_record(RecordType::SourceLocation, id, s);
                }
            }
            ServerQuery::SourceFile(id) => {
                let path = self.srcloc_registry.get(&id).map(|s| s.file);
                let contents = path.and_then(|p| {
                    let meta = std::fs::metadata(p).ok()?;
                    (meta.is_file() && meta.len() <= proto::MAX_SOURCE_FILE_SIZE)
                        .then(|| std::fs::read(p).ok())
                        .flatten()
                });
                match contents {
                    Some(bytes) => {
                        self.tag(RecordType::SourceCode);
                        self.put_u64(id);
                        self.put_u32(bytes.len() as u32);
                        self.buf.extend_from_slice(&bytes);
                    }
                    None => {
                        self.tag(RecordType::SourceCodeNotAvailable);
                        self.put_u64(id);
                    }
                }
            }
            ServerQuery::SymbolCode(addr, len) => {
                match callstack::resolver().and_then(|r| r.symbol_code(addr, len)) {
                    Some(bytes) => {
                        self.tag(RecordType::SymbolCode);
                        self.put_u64(addr);
                        self.put_u32(bytes.len() as u32);
                        self.buf.extend_from_slice(&bytes);
                    }
                    None => {
                        self.tag(RecordType::SymbolCodeNotAvailable);
                        self.put_u64(addr);
                    }
                }
            }
            ServerQuery::CallstackFrame(addr) => {
                match callstack::resolver().and_then(|r| r.resolve(addr)) {
                    Some(frames) if !frames.is_empty() => {
                        let last = frames.len() - 1;
                        for (i, frame) in frames.iter().enumerate() {
                            self.tag(RecordType::CallstackFrame);
                            self.put_u64(addr);
                            let name = frame.name.as_bytes().to_vec();
                            let file = frame.file.as_bytes().to_vec();
                            self.put_bytes16(&name);
                            self.put_bytes16(&file);
                            self.put_u32(frame.line);
                            self.put_u8(u8::from(i != last));
                        }
                    }
                    _ => {
                        self.tag(RecordType::CallstackFrameNotAvailable);
                        self.put_u64(addr);
                    }
                }
            }
            ServerQuery::Parameter(idx, val) => {
                let callback = *self.p.param_callback.lock();
                if let Some(cb) = callback {
                    cb(idx, val);
                }
            }
            ServerQuery::Disconnect => unreachable!("handled by caller"),
        }
        self.maybe_commit();
    }
}

/// Free the heap payloads of a record that will never be transmitted.
fn discard_event(event: QueueEvent) {
    // SAFETY: each handle travels in exactly one record; discarding that
    // record transfers the free obligation here.
    unsafe {
        match event {
            QueueEvent::ZoneText { text }
            | QueueEvent::ZoneName { text }
            | QueueEvent::Message { text, .. }
            | QueueEvent::MessageColor { text, .. }
            | QueueEvent::MessageAppInfo { text, .. } => record::free_text(text),
            QueueEvent::ZoneBeginAllocSrcLoc { srcloc, .. } => srcloc::free_packed(srcloc),
            QueueEvent::Callstack { handle } | QueueEvent::CallstackMemory { handle } => {
                callstack::free(handle)
            }
            _ => {}
        }
    }
}

fn hostname() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
            let name = name.trim();
            if !name.is_empty() {
                return name.to_owned();
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned())
}
