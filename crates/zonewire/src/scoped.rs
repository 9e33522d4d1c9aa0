//! RAII zone guard.

use std::marker::PhantomData;

use crate::api;
use crate::srcloc::SourceLocation;

/// A zone that ends when the guard drops.
///
/// Bottoms out in [`api::begin_zone`] / [`api::end_zone`]; the guard is
/// `!Send` because zones must begin and end on the same thread.
pub struct ScopedZone {
    _not_send: PhantomData<*const ()>,
}

impl ScopedZone {
    #[inline]
    #[must_use]
    pub fn new(srcloc: &'static SourceLocation, active: bool) -> Self {
        api::begin_zone(srcloc, active);
        Self {
            _not_send: PhantomData,
        }
    }

    /// Begin with a bounded callstack capture.
    #[inline]
    #[must_use]
    pub fn with_callstack(srcloc: &'static SourceLocation, active: bool, depth: u8) -> Self {
        api::begin_zone_callstack(srcloc, active, depth);
        Self {
            _not_send: PhantomData,
        }
    }

    /// Attach text to this zone.
    #[inline]
    pub fn text(&self, text: &str) {
        api::zone_text(text);
    }

    /// Override this zone's displayed name.
    #[inline]
    pub fn name(&self, text: &str) {
        api::zone_name(text);
    }

    /// Attach a numeric value to this zone.
    #[inline]
    pub fn value(&self, value: u64) {
        api::zone_value(value);
    }
}

impl Drop for ScopedZone {
    #[inline]
    fn drop(&mut self) {
        api::end_zone();
    }
}
