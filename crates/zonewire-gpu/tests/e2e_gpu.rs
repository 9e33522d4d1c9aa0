//! GPU bridge end-to-end: queue context announcement, begin/end query
//! pairing, and timestamp collection over a live viewer connection.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use zonewire::proto::{self, RecordType};
use zonewire::{Config, SourceLocation};
use zonewire_gpu::{GpuBackend, GpuCommandAllocatorContext, GpuQueueContext, QueueKind};

static GPU_LOC: SourceLocation = SourceLocation {
    name: Some("shadow pass"),
    function: "record_shadows",
    file: "shadows.rs",
    line: 210,
    color: 0xFF8800,
};

// --- minimal mock backend ------------------------------------------------

struct MockBackend;

struct MockDevice;

struct MockQueue;

#[derive(Default)]
struct MockList {
    resolved: Cell<u32>,
}

struct MockHeap {
    slots: u32,
}

struct MockReadback {
    stamps: RefCell<Vec<i64>>,
}

impl GpuBackend for MockBackend {
    type Device = MockDevice;
    type Queue = MockQueue;
    type CommandList = MockList;
    type QueryHeap = MockHeap;
    type ReadbackBuffer = MockReadback;

    fn queue_kind(_queue: &MockQueue) -> QueueKind {
        QueueKind::Direct
    }

    fn copy_queue_timestamps_supported(_device: &MockDevice) -> bool {
        true
    }

    fn timestamp_frequency(_queue: &MockQueue) -> u64 {
        1_000_000_000
    }

    fn current_gpu_timestamp(_queue: &MockQueue) -> i64 {
        7_000_000
    }

    fn create_query_heap(
        _device: &MockDevice,
        _kind: QueueKind,
        slots: u32,
    ) -> zonewire_gpu::Result<MockHeap> {
        Ok(MockHeap { slots })
    }

    fn create_readback_buffer(
        _device: &MockDevice,
        bytes: u64,
    ) -> zonewire_gpu::Result<MockReadback> {
        Ok(MockReadback {
            stamps: RefCell::new(vec![0; (bytes / 8) as usize]),
        })
    }

    fn end_query(_list: &mut MockList, heap: &MockHeap, index: u32) {
        assert!(index < heap.slots);
    }

    fn resolve_query_data(
        list: &mut MockList,
        _heap: &MockHeap,
        first: u32,
        count: u32,
        readback: &MockReadback,
    ) {
        list.resolved.set(count);
        let mut stamps = readback.stamps.borrow_mut();
        for i in first..first + count {
            stamps[i as usize] = i64::from(i) * 100 + 5_000;
        }
    }

    fn read_timestamps(readback: &MockReadback, count: u32) -> Vec<i64> {
        readback.stamps.borrow()[..count as usize].to_vec()
    }
}

// --- minimal viewer ------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Rec {
    GpuNewContext {
        gpu_time: i64,
        period: f32,
        context: u8,
    },
    GpuZoneBegin {
        srcloc: u64,
        thread: u64,
        query_id: u16,
        context: u8,
    },
    GpuZoneEnd {
        query_id: u16,
        context: u8,
    },
    GpuTime {
        gpu_time: i64,
        query_id: u16,
        context: u8,
    },
    SourceLocation {
        id: u64,
        function: String,
    },
}

struct Viewer {
    stream: TcpStream,
    rx: Vec<u8>,
    ref_serial: i64,
    ref_gpu: i64,
}

impl Viewer {
    fn connect(addr: std::net::SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.set_nodelay(true).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut hello = Vec::new();
        hello.extend_from_slice(proto::HANDSHAKE_MAGIC);
        hello.extend_from_slice(&proto::PROTOCOL_VERSION.to_le_bytes());
        stream.write_all(&hello).unwrap();

        let mut status = [0u8; 1];
        stream.read_exact(&mut status).unwrap();
        assert_eq!(status[0], proto::HANDSHAKE_WELCOME);

        // Skip the welcome: fixed head, then program/host strings, then the
        // topology table.
        let mut head = [0u8; 51];
        stream.read_exact(&mut head).unwrap();
        let cpu_count = u16::from_le_bytes(head[49..51].try_into().unwrap());
        for _ in 0..2 {
            let mut len = [0u8; 2];
            stream.read_exact(&mut len).unwrap();
            let mut skip = vec![0u8; u16::from_le_bytes(len) as usize];
            stream.read_exact(&mut skip).unwrap();
        }
        let mut topo = vec![0u8; usize::from(cpu_count) * 12];
        stream.read_exact(&mut topo).unwrap();

        stream
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        Self {
            stream,
            rx: Vec::new(),
            ref_serial: 0,
            ref_gpu: 0,
        }
    }

    fn wait_for(&mut self, mut pred: impl FnMut(&Rec) -> bool, timeout: Duration) -> Vec<Rec> {
        let deadline = Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            self.pump();
            seen.extend(self.decode_frames());
            if seen.iter().any(&mut pred) {
                return seen;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for record; saw {seen:#?}"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn pump(&mut self) {
        let mut chunk = [0u8; 64 * 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(e) => panic!("viewer read failed: {e}"),
            }
        }
    }

    fn decode_frames(&mut self) -> Vec<Rec> {
        let mut records = Vec::new();
        loop {
            if self.rx.len() < 4 {
                return records;
            }
            let len = u32::from_le_bytes(self.rx[..4].try_into().unwrap()) as usize;
            if self.rx.len() < 4 + len {
                return records;
            }
            let frame: Vec<u8> = self.rx[4..4 + len].to_vec();
            self.rx.drain(..4 + len);
            let payload = lz4_flex::decompress_size_prepended(&frame).expect("valid LZ4 frame");
            let mut pos = 0usize;
            while pos < payload.len() {
                if let Some(rec) = self.decode_record(&payload, &mut pos) {
                    records.push(rec);
                }
            }
        }
    }

    /// Decode one record; only GPU-relevant ones become `Rec`s.
    fn decode_record(&mut self, data: &[u8], pos: &mut usize) -> Option<Rec> {
        let tag = RecordType::from_u8(take::<1>(data, pos)[0]).expect("known tag");
        match tag {
            RecordType::GpuNewContext => {
                let delta = i64::from_le_bytes(take::<8>(data, pos));
                self.ref_serial = self.ref_serial.wrapping_add(delta);
                let gpu_time = i64::from_le_bytes(take::<8>(data, pos));
                let period = f32::from_le_bytes(take::<4>(data, pos));
                let context = take::<1>(data, pos)[0];
                Some(Rec::GpuNewContext {
                    gpu_time,
                    period,
                    context,
                })
            }
            RecordType::GpuZoneBeginSerial | RecordType::GpuZoneBeginCallstackSerial => {
                let delta = i64::from_le_bytes(take::<8>(data, pos));
                self.ref_serial = self.ref_serial.wrapping_add(delta);
                let srcloc = u64::from_le_bytes(take::<8>(data, pos));
                let thread = u64::from_le_bytes(take::<8>(data, pos));
                let query_id = u16::from_le_bytes(take::<2>(data, pos));
                let context = take::<1>(data, pos)[0];
                Some(Rec::GpuZoneBegin {
                    srcloc,
                    thread,
                    query_id,
                    context,
                })
            }
            RecordType::GpuZoneEndSerial => {
                let delta = i64::from_le_bytes(take::<8>(data, pos));
                self.ref_serial = self.ref_serial.wrapping_add(delta);
                let _thread = u64::from_le_bytes(take::<8>(data, pos));
                let query_id = u16::from_le_bytes(take::<2>(data, pos));
                let context = take::<1>(data, pos)[0];
                Some(Rec::GpuZoneEnd { query_id, context })
            }
            RecordType::GpuTime => {
                let delta = i64::from_le_bytes(take::<8>(data, pos));
                self.ref_gpu = self.ref_gpu.wrapping_add(delta);
                let query_id = u16::from_le_bytes(take::<2>(data, pos));
                let context = take::<1>(data, pos)[0];
                Some(Rec::GpuTime {
                    gpu_time: self.ref_gpu,
                    query_id,
                    context,
                })
            }
            RecordType::SourceLocation => {
                let id = u64::from_le_bytes(take::<8>(data, pos));
                let _line = u32::from_le_bytes(take::<4>(data, pos));
                let _color = u32::from_le_bytes(take::<4>(data, pos));
                let function = take_string16(data, pos);
                let _file = take_string16(data, pos);
                let _name = take_string16(data, pos);
                Some(Rec::SourceLocation { id, function })
            }
            RecordType::ThreadContext => {
                take::<8>(data, pos);
                None
            }
            other => panic!("unexpected record in GPU stream: {other:?}"),
        }
    }
}

fn take<const N: usize>(data: &[u8], pos: &mut usize) -> [u8; N] {
    let out: [u8; N] = data[*pos..*pos + N].try_into().unwrap();
    *pos += N;
    out
}

fn take_string16(data: &[u8], pos: &mut usize) -> String {
    let len = u16::from_le_bytes(take::<2>(data, pos)) as usize;
    let s = String::from_utf8(data[*pos..*pos + len].to_vec()).unwrap();
    *pos += len;
    s
}

// --- the scenario --------------------------------------------------------

#[test]
fn gpu_zone_round_trip() {
    zonewire::startup(Config {
        port: 0,
        on_demand: false,
        broadcast: false,
        broadcast_port: 0,
        program_name: "zonewire-gpu-e2e".into(),
    })
    .expect("startup");
    let addr = zonewire::listen_addr().expect("listen addr");

    let device = MockDevice;
    let queue = MockQueue;

    // Created before any viewer: the announcement must be deferred.
    let queue_ctx = GpuQueueContext::new::<MockBackend>(&device, &queue);
    assert!(queue_ctx.is_inited());
    let mut alloc_ctx =
        GpuCommandAllocatorContext::<MockBackend>::new(&queue_ctx, &device, QueueKind::Direct)
            .expect("allocator context");
    assert!(alloc_ctx.is_inited());
    assert_eq!(alloc_ctx.slot_count(), zonewire_gpu::MAX_QUERY_SLOTS);

    let mut viewer = Viewer::connect(addr);
    let ctx_id = queue_ctx.id();
    let seen = viewer.wait_for(
        |r| matches!(r, Rec::GpuNewContext { context, .. } if *context == ctx_id),
        Duration::from_secs(5),
    );
    assert!(seen.iter().any(|r| matches!(
        r,
        Rec::GpuNewContext { gpu_time: 7_000_000, period, .. } if (*period - 1.0).abs() < 1e-6
    )));

    // Begin, end, resolve, execute, collect.
    let mut cmd_list = MockList::default();
    alloc_ctx.begin_zone(&GPU_LOC, &mut cmd_list, true);
    alloc_ctx.end_zone(&mut cmd_list);
    alloc_ctx.pre_execute(&mut cmd_list);
    assert_eq!(cmd_list.resolved.get(), 2);
    // "Execution" is the mock resolve; the GPU is done by construction.
    alloc_ctx.collect();

    let records = viewer.wait_for(
        |r| matches!(r, Rec::GpuTime { query_id: 1, .. }),
        Duration::from_secs(5),
    );

    let begin = records
        .iter()
        .position(|r| matches!(r, Rec::GpuZoneBegin { query_id: 0, .. }))
        .expect("gpu zone begin");
    let end = records
        .iter()
        .position(|r| matches!(r, Rec::GpuZoneEnd { query_id: 1, .. }))
        .expect("gpu zone end");
    assert!(begin < end);
    let Rec::GpuZoneBegin {
        srcloc,
        thread,
        context,
        ..
    } = &records[begin]
    else {
        unreachable!()
    };
    assert_eq!(*srcloc, &GPU_LOC as *const SourceLocation as u64);
    assert_eq!(*thread, zonewire::current_thread_id());
    assert_eq!(*context, ctx_id);

    // The location payload accompanies the first GPU reference too.
    assert!(records.iter().any(|r| matches!(
        r,
        Rec::SourceLocation { id, function }
            if *id == &GPU_LOC as *const SourceLocation as u64 && function == "record_shadows"
    )));

    // Begin/end produced query ids {0, 1}; collect resolves each exactly
    // once, with the mock's timestamps.
    let times: Vec<(u16, i64)> = records
        .iter()
        .filter_map(|r| match r {
            Rec::GpuTime {
                query_id, gpu_time, ..
            } => Some((*query_id, *gpu_time)),
            _ => None,
        })
        .collect();
    assert_eq!(times, vec![(0, 5_000), (1, 5_100)]);

    // A fresh pair after collect keeps numbering from the reset counter.
    let mut cmd_list = MockList::default();
    alloc_ctx.begin_zone(&GPU_LOC, &mut cmd_list, true);
    alloc_ctx.end_zone(&mut cmd_list);
    alloc_ctx.pre_execute(&mut cmd_list);
    alloc_ctx.collect();
    viewer.wait_for(
        |r| matches!(r, Rec::GpuTime { query_id: 1, gpu_time: 5_100, .. }),
        Duration::from_secs(5),
    );

    zonewire::request_shutdown();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !zonewire::has_shutdown_finished() {
        assert!(Instant::now() < deadline, "shutdown never finished");
        std::thread::sleep(Duration::from_millis(10));
    }
}
