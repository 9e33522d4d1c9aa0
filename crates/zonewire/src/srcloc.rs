//! Source location identity for zones.
//!
//! A source location is either a `'static` record whose address is its
//! identity, or, for call sites only known at runtime, a packed heap buffer
//! `[u32 size][u32 color][u32 line][function\0][file\0][name…]` whose address
//! serves the same purpose. Packed buffers are transmitted once by the worker
//! and then freed.

/// Static description of an instrumented call site.
///
/// The record must live for the whole program; its address is the identity
/// the viewer keys zone statistics on.
#[derive(Debug)]
pub struct SourceLocation {
    /// Optional zone name shown instead of the function.
    pub name: Option<&'static str>,
    /// Enclosing function.
    pub function: &'static str,
    /// Source file path.
    pub file: &'static str,
    /// 1-based source line.
    pub line: u32,
    /// 0xRRGGBB zone color, 0 for the viewer default.
    pub color: u32,
}

/// Header bytes preceding the string data in a packed location.
const PACKED_HEADER: usize = 12;

/// Allocate the packed runtime form. Returns the address used as identity;
/// ownership passes to the worker with the record that carries it.
pub(crate) fn alloc_source_location(
    line: u32,
    file: &str,
    function: &str,
    name: Option<&str>,
) -> u64 {
    let name_len = name.map_or(0, str::len);
    let size = PACKED_HEADER + function.len() + 1 + file.len() + 1 + name_len;

    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&(size as u32).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // color
    buf.extend_from_slice(&line.to_le_bytes());
    buf.extend_from_slice(function.as_bytes());
    buf.push(0);
    buf.extend_from_slice(file.as_bytes());
    buf.push(0);
    if let Some(name) = name {
        buf.extend_from_slice(name.as_bytes());
    }
    debug_assert_eq!(buf.len(), size);

    Box::into_raw(buf.into_boxed_slice()) as *mut u8 as u64
}

/// Read back the full packed buffer behind a handle.
///
/// # Safety
/// `handle` must come from [`alloc_source_location`] and must not have been
/// freed.
pub(crate) unsafe fn packed_bytes<'a>(handle: u64) -> &'a [u8] {
    let ptr = handle as *const u8;
    let mut size_bytes = [0u8; 4];
    std::ptr::copy_nonoverlapping(ptr, size_bytes.as_mut_ptr(), 4);
    let size = u32::from_le_bytes(size_bytes) as usize;
    std::slice::from_raw_parts(ptr, size)
}

/// Free a packed buffer after transmission.
///
/// # Safety
/// `handle` must come from [`alloc_source_location`] and must not be used
/// again afterwards.
pub(crate) unsafe fn free_packed(handle: u64) {
    let len = packed_bytes(handle).len();
    let slice = std::ptr::slice_from_raw_parts_mut(handle as *mut u8, len);
    drop(Box::from_raw(slice));
}
