//! Wire protocol shared between the client and the viewer.
//!
//! After the uncompressed handshake, the stream is a sequence of LZ4 frames:
//! `[u32 compressed_len][block]` where each block decompresses to at most
//! [`TARGET_FRAME_SIZE`] bytes of records. A record is a one-byte
//! [`RecordType`] tag followed by its fields in fixed order, little-endian.
//! Timestamps are delta-encoded against the owning stream's running
//! reference (main for thread queues, serial for the serial queue, gpu for
//! GPU timestamps); references reset to zero at every (re)connection.
//!
//! The UDP discovery advertisement travels as a length-prefixed bincode
//! datagram; everything on the TCP side is hand-packed.

use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// First bytes a viewer must send after connecting.
pub const HANDSHAKE_MAGIC: &[u8; 8] = b"ZONEWIRE";

/// Handshake reply status.
pub const HANDSHAKE_WELCOME: u8 = 1;
/// Handshake reply when the viewer speaks a different protocol version.
pub const HANDSHAKE_PROTOCOL_MISMATCH: u8 = 2;

/// Uncompressed payload bound of one wire frame; one worker commit equals
/// one frame.
pub const TARGET_FRAME_SIZE: usize = 256 * 1024;

/// Size cap for source files served to the viewer.
pub const MAX_SOURCE_FILE_SIZE: u64 = 256 * 1024;

/// Handshake flag: client runs in on-demand mode.
pub const WELCOME_FLAG_ON_DEMAND: u8 = 1 << 0;
/// Handshake flag: a stack walker is installed.
pub const WELCOME_FLAG_CALLSTACK: u8 = 1 << 1;
/// Handshake flag: the timestamp source is a hardware cycle counter.
pub const WELCOME_FLAG_HW_TIMER: u8 = 1 << 2;

/// Record tags. Field layouts are fixed per tag; see the worker's encoder
/// for the authoritative field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    ZoneBegin = 0,
    ZoneBeginCallstack = 1,
    ZoneBeginAllocSrcLoc = 2,
    ZoneBeginAllocSrcLocCallstack = 3,
    ZoneEnd = 4,
    ZoneValidation = 5,
    ZoneText = 6,
    ZoneName = 7,
    ZoneValue = 8,
    FrameMarkMsg = 9,
    FrameMarkStart = 10,
    FrameMarkEnd = 11,
    FrameImage = 12,
    PlotData = 13,
    PlotConfig = 14,
    Message = 15,
    MessageCallstack = 16,
    MessageLiteral = 17,
    MessageLiteralCallstack = 18,
    MessageColor = 19,
    MessageColorCallstack = 20,
    MessageLiteralColor = 21,
    MessageLiteralColorCallstack = 22,
    MessageAppInfo = 23,
    MemAlloc = 24,
    MemAllocCallstack = 25,
    MemFree = 26,
    MemFreeCallstack = 27,
    Callstack = 28,
    CallstackMemory = 29,
    GpuNewContext = 30,
    GpuZoneBeginSerial = 31,
    GpuZoneBeginCallstackSerial = 32,
    GpuZoneEndSerial = 33,
    GpuTime = 34,
    ParamSetup = 35,
    ThreadContext = 36,
    StringData = 37,
    SourceLocation = 38,
    SourceLocationPayload = 39,
    ThreadName = 40,
    SourceCode = 41,
    SourceCodeNotAvailable = 42,
    SymbolCode = 43,
    SymbolCodeNotAvailable = 44,
    CallstackFrame = 45,
    CallstackFrameNotAvailable = 46,
}

impl RecordType {
    /// Decode a tag byte. `None` for bytes outside the closed enumeration.
    pub fn from_u8(tag: u8) -> Option<Self> {
        use RecordType::*;
        Some(match tag {
            0 => ZoneBegin,
            1 => ZoneBeginCallstack,
            2 => ZoneBeginAllocSrcLoc,
            3 => ZoneBeginAllocSrcLocCallstack,
            4 => ZoneEnd,
            5 => ZoneValidation,
            6 => ZoneText,
            7 => ZoneName,
            8 => ZoneValue,
            9 => FrameMarkMsg,
            10 => FrameMarkStart,
            11 => FrameMarkEnd,
            12 => FrameImage,
            13 => PlotData,
            14 => PlotConfig,
            15 => Message,
            16 => MessageCallstack,
            17 => MessageLiteral,
            18 => MessageLiteralCallstack,
            19 => MessageColor,
            20 => MessageColorCallstack,
            21 => MessageLiteralColor,
            22 => MessageLiteralColorCallstack,
            23 => MessageAppInfo,
            24 => MemAlloc,
            25 => MemAllocCallstack,
            26 => MemFree,
            27 => MemFreeCallstack,
            28 => Callstack,
            29 => CallstackMemory,
            30 => GpuNewContext,
            31 => GpuZoneBeginSerial,
            32 => GpuZoneBeginCallstackSerial,
            33 => GpuZoneEndSerial,
            34 => GpuTime,
            35 => ParamSetup,
            36 => ThreadContext,
            37 => StringData,
            38 => SourceLocation,
            39 => SourceLocationPayload,
            40 => ThreadName,
            41 => SourceCode,
            42 => SourceCodeNotAvailable,
            43 => SymbolCode,
            44 => SymbolCodeNotAvailable,
            45 => CallstackFrame,
            46 => CallstackFrameNotAvailable,
            _ => return None,
        })
    }
}

/// Server → client query packet: `u8 kind, u64 ptr, u32 extra`, 13 bytes.
pub const SERVER_QUERY_SIZE: usize = 13;

/// Queries the viewer may issue between drain iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerQuery {
    /// Contents of a transmitted string literal; `ptr` is its identity.
    String(u64),
    /// A thread's display name; `ptr` is the thread id.
    ThreadName(u64),
    /// Re-send a static source location payload; `ptr` is its identity.
    SourceLocation(u64),
    /// Contents of the source file behind a static source location.
    SourceFile(u64),
    /// Machine code of the symbol at `ptr`, `extra` bytes long.
    SymbolCode(u64, u32),
    /// Resolved frames for a callstack address.
    CallstackFrame(u64),
    /// Parameter change: index in the high half of `ptr`, value in the low.
    Parameter(u32, i32),
    /// Orderly disconnect.
    Disconnect,
}

impl ServerQuery {
    /// Parse one fixed-size query packet. `None` for unknown kinds.
    pub fn parse(packet: &[u8; SERVER_QUERY_SIZE]) -> Option<Self> {
        let ptr = u64::from_le_bytes(packet[1..9].try_into().unwrap());
        let extra = u32::from_le_bytes(packet[9..13].try_into().unwrap());
        Some(match packet[0] {
            1 => Self::String(ptr),
            2 => Self::ThreadName(ptr),
            3 => Self::SourceLocation(ptr),
            4 => Self::SourceFile(ptr),
            5 => Self::SymbolCode(ptr, extra),
            6 => Self::CallstackFrame(ptr),
            7 => Self::Parameter((ptr >> 32) as u32, ptr as u32 as i32),
            8 => Self::Disconnect,
            _ => return None,
        })
    }

    /// Pack a query for transmission (viewer side; used by the tests).
    pub fn to_packet(self) -> [u8; SERVER_QUERY_SIZE] {
        let (kind, ptr, extra) = match self {
            Self::String(p) => (1u8, p, 0),
            Self::ThreadName(p) => (2, p, 0),
            Self::SourceLocation(p) => (3, p, 0),
            Self::SourceFile(p) => (4, p, 0),
            Self::SymbolCode(p, len) => (5, p, len),
            Self::CallstackFrame(p) => (6, p, 0),
            Self::Parameter(idx, val) => (7, (u64::from(idx) << 32) | u64::from(val as u32), 0),
            Self::Disconnect => (8, 0, 0),
        };
        let mut packet = [0u8; SERVER_QUERY_SIZE];
        packet[0] = kind;
        packet[1..9].copy_from_slice(&ptr.to_le_bytes());
        packet[9..13].copy_from_slice(&extra.to_le_bytes());
        packet
    }
}

/// UDP discovery advertisement, sent until a viewer connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertisement {
    /// Protocol version the client speaks.
    pub protocol: u32,
    /// TCP port the client listens on.
    pub port: u16,
    /// Client process id.
    pub pid: u64,
    /// Program name, for the viewer's connection list.
    pub program: String,
}

impl Advertisement {
    /// Pack one broadcast datagram: bincode body behind a `u32` length.
    pub fn to_datagram(&self) -> Result<Vec<u8>, bincode::Error> {
        let body = bincode::serialize(self)?;
        let mut datagram = Vec::with_capacity(4 + body.len());
        datagram.extend_from_slice(&(body.len() as u32).to_le_bytes());
        datagram.extend_from_slice(&body);
        Ok(datagram)
    }

    /// Parse a datagram, rejecting truncated or padded ones.
    pub fn from_datagram(datagram: &[u8]) -> Option<Self> {
        let len_bytes = datagram.get(..4)?;
        let len = u32::from_le_bytes(len_bytes.try_into().ok()?) as usize;
        let body = datagram.get(4..)?;
        if body.len() != len {
            return None;
        }
        bincode::deserialize(body).ok()
    }
}

/// One logical CPU reported in the handshake topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSlot {
    pub logical: u32,
    pub core: u32,
    pub package: u32,
}

/// Gather the host CPU topology for the handshake.
///
/// Reads sysfs on Linux; elsewhere every logical CPU is reported as its own
/// core on package 0.
pub fn cpu_topology() -> Vec<CpuSlot> {
    let count = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1) as u32;
    (0..count)
        .map(|logical| CpuSlot {
            logical,
            core: sysfs_topology_value(logical, "core_id").unwrap_or(logical),
            package: sysfs_topology_value(logical, "physical_package_id").unwrap_or(0),
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn sysfs_topology_value(cpu: u32, leaf: &str) -> Option<u32> {
    let path = format!("/sys/devices/system/cpu/cpu{cpu}/topology/{leaf}");
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn sysfs_topology_value(_cpu: u32, _leaf: &str) -> Option<u32> {
    None
}
