use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits. Rail positions
/// are millimetres, speeds are millimetres per second.
pub type Fixed64 = I32F32;

/// Simulated time in whole milliseconds since the run started.
pub type SimTime = u64;

/// Milliseconds per second, as used by travel-time conversions.
pub const MILLIS_PER_SEC: u64 = 1_000;

/// Convert an f64 to Fixed64. Use only for initialization, never in sim loop.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::saturating_from_num(v)
}

/// Convert Fixed64 to f64. Use only for display, never in sim loop.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Convert seconds (display/config units) to simulated milliseconds.
#[inline]
pub fn secs_to_millis(secs: f64) -> SimTime {
    if secs.is_finite() && secs > 0.0 {
        (secs * MILLIS_PER_SEC as f64).round() as SimTime
    } else {
        0
    }
}

/// Convert simulated milliseconds to seconds for display.
#[inline]
pub fn millis_to_secs(ms: SimTime) -> f64 {
    ms as f64 / MILLIS_PER_SEC as f64
}

/// Time to cover `distance` at `speed`, rounded up to the next millisecond.
///
/// A zero distance takes zero time. A non-positive speed yields
/// `SimTime::MAX`; configurations are validated so this never happens in a
/// running engine.
pub fn travel_time(distance: Fixed64, speed: Fixed64) -> SimTime {
    let distance = distance.abs();
    if distance == Fixed64::ZERO {
        return 0;
    }
    if speed <= Fixed64::ZERO {
        return SimTime::MAX;
    }
    let scaled = distance.saturating_mul(Fixed64::from_num(MILLIS_PER_SEC));
    match scaled.checked_div(speed) {
        Some(ms) => ms.saturating_ceil().saturating_to_num::<u64>(),
        None => SimTime::MAX,
    }
}

/// Linear interpolation between `from` and `to` after `elapsed` of `total`
/// milliseconds. Clamps to `to` once the motion is over. Monotone in
/// `elapsed`.
pub fn lerp(from: Fixed64, to: Fixed64, elapsed: SimTime, total: SimTime) -> Fixed64 {
    if total == 0 || elapsed >= total {
        return to;
    }
    let frac = Fixed64::saturating_from_num(elapsed) / Fixed64::saturating_from_num(total);
    from + (to - from) * frac
}
