//! Test viewer: connects to the worker, performs the handshake, and decodes
//! the compressed record stream back into structured records.

// Each test binary uses a different slice of the decoder.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use zonewire::proto::{self, RecordType, ServerQuery};

/// Parsed welcome message.
#[derive(Debug, Clone)]
pub struct Welcome {
    pub timer_mul: f64,
    pub resolution: i64,
    pub delay: i64,
    pub epoch: i64,
    pub epoch_unix: u64,
    pub pid: u64,
    pub flags: u8,
    pub program: String,
    pub host: String,
    pub topology: Vec<(u32, u32, u32)>,
}

/// A decoded record with timestamps already accumulated to absolute ticks.
#[derive(Debug, Clone, PartialEq)]
pub enum Rec {
    ThreadContext { thread: u64 },
    ZoneBegin { time: i64, srcloc: u64, callstack: bool },
    ZoneBeginAlloc { time: i64, srcloc: u64, callstack: bool },
    ZoneEnd { time: i64 },
    ZoneValidation { id: u32 },
    ZoneText { text: String },
    ZoneName { text: String },
    ZoneValue { value: u64 },
    FrameMark { time: i64, name: u64 },
    FrameMarkStart { time: i64, name: u64 },
    FrameMarkEnd { time: i64, name: u64 },
    FrameImage { frame: u64, width: u16, height: u16, flip: bool, pixels: Vec<u8> },
    PlotData { name: u64, time: i64, value: PlotVal },
    PlotConfig { name: u64, format: u8 },
    Message { time: i64, text: String, callstack: bool },
    MessageLiteral { time: i64, text: u64, callstack: bool },
    MessageColor { time: i64, color: u32, text: String, callstack: bool },
    MessageLiteralColor { time: i64, color: u32, text: u64, callstack: bool },
    AppInfo { time: i64, text: String },
    MemAlloc { time: i64, thread: u64, ptr: u64, size: u64, callstack: bool },
    MemFree { time: i64, thread: u64, ptr: u64, callstack: bool },
    Callstack { addrs: Vec<u64> },
    CallstackMemory { addrs: Vec<u64> },
    GpuNewContext { cpu_time: i64, gpu_time: i64, period: f32, context: u8 },
    GpuZoneBegin { cpu_time: i64, srcloc: u64, thread: u64, query_id: u16, context: u8 },
    GpuZoneEnd { cpu_time: i64, thread: u64, query_id: u16, context: u8 },
    GpuTime { gpu_time: i64, query_id: u16, context: u8 },
    ParamSetup { idx: u32, name: u64, is_bool: bool, val: i32 },
    StringData { id: u64, text: String },
    SourceLocation { id: u64, line: u32, color: u32, function: String, file: String, name: String },
    SourceLocationPayload { id: u64, line: u32, color: u32, function: String, file: String, name: String },
    ThreadName { thread: u64, name: String },
    SourceCode { id: u64, bytes: Vec<u8> },
    SourceCodeNotAvailable { id: u64 },
    SymbolCode { addr: u64, bytes: Vec<u8> },
    SymbolCodeNotAvailable { addr: u64 },
    CallstackFrame { addr: u64, name: String, file: String, line: u32, more: bool },
    CallstackFrameNotAvailable { addr: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlotVal {
    I64(i64),
    F32(f32),
    F64(f64),
}

pub struct Viewer {
    stream: TcpStream,
    pub welcome: Welcome,
    rx: Vec<u8>,
    ref_main: i64,
    ref_serial: i64,
    ref_gpu: i64,
}

impl Viewer {
    /// Connect and complete the handshake.
    pub fn connect(addr: SocketAddr) -> Self {
        let mut stream = connect_with_retry(addr);
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
        assert_eq!(status[0], proto::HANDSHAKE_WELCOME, "handshake rejected");

        let welcome = read_welcome(&mut stream);
        stream
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        Self {
            stream,
            welcome,
            rx: Vec::new(),
            ref_main: 0,
            ref_serial: 0,
            ref_gpu: 0,
        }
    }

    pub fn send_query(&mut self, query: ServerQuery) {
        self.stream.write_all(&query.to_packet()).unwrap();
    }

    /// Read whatever frames arrive within `timeout` and decode them.
    pub fn poll(&mut self, timeout: Duration) -> Vec<Rec> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();
        loop {
            self.pump();
            records.extend(self.decode_frames());
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        records
    }

    /// Keep polling until `pred` matches one record; panics on timeout.
    /// Returns everything received up to and including the match.
    pub fn wait_for(&mut self, mut pred: impl FnMut(&Rec) -> bool, timeout: Duration) -> Vec<Rec> {
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
            let payload =
                lz4_flex::decompress_size_prepended(&frame).expect("valid LZ4 frame");
            let mut cursor = Cursor {
                data: &payload,
                pos: 0,
            };
            while cursor.pos < cursor.data.len() {
                records.push(self.decode_record(&mut cursor));
            }
        }
    }

    fn decode_record(&mut self, c: &mut Cursor<'_>) -> Rec {
        let tag = RecordType::from_u8(c.u8()).expect("known record tag");
        match tag {
            RecordType::ThreadContext => Rec::ThreadContext { thread: c.u64() },
            RecordType::ZoneBegin | RecordType::ZoneBeginCallstack => Rec::ZoneBegin {
                time: self.main_time(c),
                srcloc: c.u64(),
                callstack: tag == RecordType::ZoneBeginCallstack,
            },
            RecordType::ZoneBeginAllocSrcLoc | RecordType::ZoneBeginAllocSrcLocCallstack => {
                Rec::ZoneBeginAlloc {
                    time: self.main_time(c),
                    srcloc: c.u64(),
                    callstack: tag == RecordType::ZoneBeginAllocSrcLocCallstack,
                }
            }
            RecordType::ZoneEnd => Rec::ZoneEnd {
                time: self.main_time(c),
            },
            RecordType::ZoneValidation => Rec::ZoneValidation { id: c.u32() },
            RecordType::ZoneText => Rec::ZoneText { text: c.string16() },
            RecordType::ZoneName => Rec::ZoneName { text: c.string16() },
            RecordType::ZoneValue => Rec::ZoneValue { value: c.u64() },
            RecordType::FrameMarkMsg => Rec::FrameMark {
                time: self.main_time(c),
                name: c.u64(),
            },
            RecordType::FrameMarkStart => Rec::FrameMarkStart {
                time: self.serial_time(c),
                name: c.u64(),
            },
            RecordType::FrameMarkEnd => Rec::FrameMarkEnd {
                time: self.serial_time(c),
                name: c.u64(),
            },
            RecordType::FrameImage => {
                let frame = c.u64();
                let width = c.u16();
                let height = c.u16();
                let flip = c.u8() != 0;
                let len = c.u32() as usize;
                let compressed = c.bytes(len);
                let pixels =
                    lz4_flex::decompress_size_prepended(compressed).expect("valid image block");
                Rec::FrameImage {
                    frame,
                    width,
                    height,
                    flip,
                    pixels,
                }
            }
            RecordType::PlotData => {
                let name = c.u64();
                let time = self.main_time(c);
                let value = match c.u8() {
                    0 => PlotVal::I64(c.i64()),
                    1 => PlotVal::F32(c.f32()),
                    2 => PlotVal::F64(c.f64()),
                    k => panic!("unknown plot value kind {k}"),
                };
                Rec::PlotData { name, time, value }
            }
            RecordType::PlotConfig => Rec::PlotConfig {
                name: c.u64(),
                format: c.u8(),
            },
            RecordType::Message | RecordType::MessageCallstack => Rec::Message {
                time: self.main_time(c),
                text: c.string16(),
                callstack: tag == RecordType::MessageCallstack,
            },
            RecordType::MessageLiteral | RecordType::MessageLiteralCallstack => {
                Rec::MessageLiteral {
                    time: self.main_time(c),
                    text: c.u64(),
                    callstack: tag == RecordType::MessageLiteralCallstack,
                }
            }
            RecordType::MessageColor | RecordType::MessageColorCallstack => Rec::MessageColor {
                time: self.main_time(c),
                color: c.u32(),
                text: c.string16(),
                callstack: tag == RecordType::MessageColorCallstack,
            },
            RecordType::MessageLiteralColor | RecordType::MessageLiteralColorCallstack => {
                Rec::MessageLiteralColor {
                    time: self.main_time(c),
                    color: c.u32(),
                    text: c.u64(),
                    callstack: tag == RecordType::MessageLiteralColorCallstack,
                }
            }
            RecordType::MessageAppInfo => Rec::AppInfo {
                time: self.main_time(c),
                text: c.string16(),
            },
            RecordType::MemAlloc | RecordType::MemAllocCallstack => Rec::MemAlloc {
                time: self.serial_time(c),
                thread: c.u64(),
                ptr: c.u64(),
                size: c.u64(),
                callstack: tag == RecordType::MemAllocCallstack,
            },
            RecordType::MemFree | RecordType::MemFreeCallstack => Rec::MemFree {
                time: self.serial_time(c),
                thread: c.u64(),
                ptr: c.u64(),
                callstack: tag == RecordType::MemFreeCallstack,
            },
            RecordType::Callstack => Rec::Callstack {
                addrs: c.addr_list(),
            },
            RecordType::CallstackMemory => Rec::CallstackMemory {
                addrs: c.addr_list(),
            },
            RecordType::GpuNewContext => Rec::GpuNewContext {
                cpu_time: self.serial_time(c),
                gpu_time: c.i64(),
                period: c.f32(),
                context: c.u8(),
            },
            RecordType::GpuZoneBeginSerial | RecordType::GpuZoneBeginCallstackSerial => {
                Rec::GpuZoneBegin {
                    cpu_time: self.serial_time(c),
                    srcloc: c.u64(),
                    thread: c.u64(),
                    query_id: c.u16(),
                    context: c.u8(),
                }
            }
            RecordType::GpuZoneEndSerial => Rec::GpuZoneEnd {
                cpu_time: self.serial_time(c),
                thread: c.u64(),
                query_id: c.u16(),
                context: c.u8(),
            },
            RecordType::GpuTime => {
                let delta = c.i64();
                self.ref_gpu = self.ref_gpu.wrapping_add(delta);
                Rec::GpuTime {
                    gpu_time: self.ref_gpu,
                    query_id: c.u16(),
                    context: c.u8(),
                }
            }
            RecordType::ParamSetup => Rec::ParamSetup {
                idx: c.u32(),
                name: c.u64(),
                is_bool: c.u8() != 0,
                val: c.i64() as i32,
            },
            RecordType::StringData => Rec::StringData {
                id: c.u64(),
                text: c.string16(),
            },
            RecordType::SourceLocation => {
                let (id, line, color, function, file, name) = c.srcloc_payload();
                Rec::SourceLocation {
                    id,
                    line,
                    color,
                    function,
                    file,
                    name,
                }
            }
            RecordType::SourceLocationPayload => {
                let (id, line, color, function, file, name) = c.srcloc_payload();
                Rec::SourceLocationPayload {
                    id,
                    line,
                    color,
                    function,
                    file,
                    name,
                }
            }
            RecordType::ThreadName => Rec::ThreadName {
                thread: c.u64(),
                name: c.string16(),
            },
            RecordType::SourceCode => {
                let id = c.u64();
                let len = c.u32() as usize;
                Rec::SourceCode {
                    id,
                    bytes: c.bytes(len).to_vec(),
                }
            }
            RecordType::SourceCodeNotAvailable => Rec::SourceCodeNotAvailable { id: c.u64() },
            RecordType::SymbolCode => {
                let addr = c.u64();
                let len = c.u32() as usize;
                Rec::SymbolCode {
                    addr,
                    bytes: c.bytes(len).to_vec(),
                }
            }
            RecordType::SymbolCodeNotAvailable => Rec::SymbolCodeNotAvailable { addr: c.u64() },
            RecordType::CallstackFrame => Rec::CallstackFrame {
                addr: c.u64(),
                name: c.string16(),
                file: c.string16(),
                line: c.u32(),
                more: c.u8() != 0,
            },
            RecordType::CallstackFrameNotAvailable => {
                Rec::CallstackFrameNotAvailable { addr: c.u64() }
            }
        }
    }

    fn main_time(&mut self, c: &mut Cursor<'_>) -> i64 {
        let delta = c.i64();
        self.ref_main = self.ref_main.wrapping_add(delta);
        self.ref_main
    }

    fn serial_time(&mut self, c: &mut Cursor<'_>) -> i64 {
        let delta = c.i64();
        self.ref_serial = self.ref_serial.wrapping_add(delta);
        self.ref_serial
    }
}

fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(e) => {
                assert!(Instant::now() < deadline, "connect failed: {e}");
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

fn read_welcome(stream: &mut TcpStream) -> Welcome {
    let timer_mul = f64::from_le_bytes(read_n::<8>(stream));
    let resolution = i64::from_le_bytes(read_n::<8>(stream));
    let delay = i64::from_le_bytes(read_n::<8>(stream));
    let epoch = i64::from_le_bytes(read_n::<8>(stream));
    let epoch_unix = u64::from_le_bytes(read_n::<8>(stream));
    let pid = u64::from_le_bytes(read_n::<8>(stream));
    let flags = read_n::<1>(stream)[0];
    let cpu_count = u16::from_le_bytes(read_n::<2>(stream));
    let prog_len = u16::from_le_bytes(read_n::<2>(stream)) as usize;
    let program = String::from_utf8(read_vec(stream, prog_len)).unwrap();
    let host_len = u16::from_le_bytes(read_n::<2>(stream)) as usize;
    let host = String::from_utf8(read_vec(stream, host_len)).unwrap();
    let mut topology = Vec::new();
    for _ in 0..cpu_count {
        let logical = u32::from_le_bytes(read_n::<4>(stream));
        let core = u32::from_le_bytes(read_n::<4>(stream));
        let package = u32::from_le_bytes(read_n::<4>(stream));
        topology.push((logical, core, package));
    }
    Welcome {
        timer_mul,
        resolution,
        delay,
        epoch,
        epoch_unix,
        pid,
        flags,
        program,
        host,
        topology,
    }
}

fn read_n<const N: usize>(stream: &mut TcpStream) -> [u8; N] {
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn read_vec(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    fn u8(&mut self) -> u8 {
        self.bytes(1)[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.bytes(2).try_into().unwrap())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.bytes(4).try_into().unwrap())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.bytes(8).try_into().unwrap())
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.bytes(8).try_into().unwrap())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.bytes(4).try_into().unwrap())
    }

    fn f64(&mut self) -> f64 {
        f64::from_le_bytes(self.bytes(8).try_into().unwrap())
    }

    fn string16(&mut self) -> String {
        let len = self.u16() as usize;
        String::from_utf8(self.bytes(len).to_vec()).unwrap()
    }

    fn addr_list(&mut self) -> Vec<u64> {
        let count = self.u8() as usize;
        (0..count).map(|_| self.u64()).collect()
    }

    fn srcloc_payload(&mut self) -> (u64, u32, u32, String, String, String) {
        let id = self.u64();
        let line = self.u32();
        let color = self.u32();
        let function = self.string16();
        let file = self.string16();
        let name = self.string16();
        (id, line, color, function, file, name)
    }
}
