//! Monotonic high-resolution timestamp source.
//!
//! `now()` returns raw counter ticks: `rdtsc` on x86_64, `cntvct_el0` on
//! aarch64, and monotonic-clock nanoseconds elsewhere. The tick-to-nanosecond
//! multiplier is established once at startup by [`calibrate`] and shipped to
//! the viewer in the handshake; the fast path itself performs no syscall and
//! takes no lock. Reads may be observed out of order across CPUs; the viewer
//! post-sorts.

use std::time::Instant;

/// Read the timestamp counter. Single inline instruction on both supported
/// architectures.
#[inline(always)]
pub fn now() -> i64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc() as i64
    }
    #[cfg(target_arch = "aarch64")]
    {
        let val: u64;
        // SAFETY: reading the virtual counter register has no side effects.
        unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) val) };
        val as i64
    }
    // Fallback: monotonic clock nanoseconds against a process-local epoch.
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        use std::sync::OnceLock;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = *EPOCH.get_or_init(Instant::now);
        Instant::now().duration_since(epoch).as_nanos() as i64
    }
}

/// Results of the one-time startup calibration.
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    /// Nanoseconds per tick.
    pub timer_mul: f64,
    /// Smallest observed delta between two successive reads, in ticks.
    pub resolution: i64,
    /// Estimated cost of one begin/end instrumentation pair, in ticks.
    pub delay: i64,
    /// Tick value at calibration time, the stream's origin.
    pub epoch: i64,
}

/// Establish the tick-to-nanosecond multiplier and measure capture quality.
///
/// Spins for a few milliseconds against the wall clock, so this must only be
/// called once, at profiler startup.
pub fn calibrate() -> Calibration {
    let timer_mul = measure_multiplier();
    let resolution = measure_resolution();
    let delay = measure_delay();
    Calibration {
        timer_mul,
        resolution,
        delay,
        epoch: now(),
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn measure_multiplier() -> f64 {
    // The fallback counter already yields nanoseconds.
    1.0
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn measure_multiplier() -> f64 {
    // Spin for ~4ms to get a stable ratio against the wall clock.
    let wall_start = Instant::now();
    let tick_start = now();

    let target = std::time::Duration::from_millis(4);
    while wall_start.elapsed() < target {
        std::hint::spin_loop();
    }

    let tick_end = now();
    let wall_ns = wall_start.elapsed().as_nanos() as f64;
    let ticks = tick_end.wrapping_sub(tick_start);

    // Frozen counter (broken VM): fall back to a 1:1 ratio rather than
    // dividing by zero.
    if ticks <= 0 {
        return 1.0;
    }
    wall_ns / ticks as f64
}

/// Smallest non-zero delta between successive reads, in ticks.
fn measure_resolution() -> i64 {
    let mut res = i64::MAX;
    let mut last = now();
    for _ in 0..250_000 {
        let t = now();
        let d = t.wrapping_sub(last);
        if d > 0 && d < res {
            res = d;
        }
        last = t;
    }
    if res == i64::MAX {
        0
    } else {
        res
    }
}

/// Estimate the self-delay of one timestamped begin/end pair.
fn measure_delay() -> i64 {
    const ROUNDS: i64 = 50_000;
    let begin = now();
    for _ in 0..ROUNDS {
        std::hint::black_box(now());
        std::hint::black_box(now());
    }
    let end = now();
    (end.wrapping_sub(begin)) / ROUNDS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotone_within_thread() {
        // Reads may migrate across CPUs with slightly skewed counters; the
        // contract tolerates that, so only flag real regressions.
        let tolerance = 1_000_000;
        let mut last = now();
        for _ in 0..10_000 {
            let t = now();
            assert!(
                t + tolerance >= last,
                "counter jumped backwards: {t} < {last}"
            );
            if t > last {
                last = t;
            }
        }
    }

    #[test]
    fn calibration_is_sane() {
        let cal = calibrate();
        assert!(cal.timer_mul > 0.0);
        assert!(cal.resolution >= 0);
        assert!(cal.delay >= 0);
        // One millisecond of ticks should convert to roughly one millisecond
        // of nanoseconds; allow a generous factor for noisy CI machines.
        let start = now();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let ticks = now() - start;
        let ns = ticks as f64 * cal.timer_mul;
        assert!(ns > 2_000_000.0, "10ms sleep measured as {ns}ns");
        assert!(ns < 500_000_000.0, "10ms sleep measured as {ns}ns");
    }
}
