//! Formatting helpers for short durations in diagnostic output.
use std::fmt::Write;

/// Formats a duration given in microseconds into the most readable unit.
///
/// See [format_short_duration] for examples; this variant writes into any
/// `std::fmt::Write` so it can be used from `Display` implementations.
pub fn format_micros(micros: i32, f: &mut dyn Write) -> std::fmt::Result {
    if micros < 1_000 {
        write!(f, "{} us", micros)
    } else if micros < 10_000 {
        write!(f, "{:.2} ms", micros as f32 / 1_000.)
    } else if micros < 100_000 {
        write!(f, "{:.1} ms", micros as f32 / 1_000.)
    } else if micros < 1_000_000 {
        write!(f, "{} ms", micros / 1_000)
    } else if micros < 10_000_000 {
        write!(f, "{:.2} s", micros as f32 / 1_000_000.)
    } else if micros < 100_000_000 {
        write!(f, "{:.1} s", micros as f32 / 1_000_000.)
    } else {
        write!(f, "{} s", micros / 1_000_000)
    }
}

/// Formats a duration given in microseconds and returns it as a string.
///
/// # Examples
///
/// ```
/// assert_eq!(ganymede::fmt::format_short_duration(100), "100 us");
/// assert_eq!(ganymede::fmt::format_short_duration(8_192), "8.19 ms");
/// assert_eq!(ganymede::fmt::format_short_duration(32_768), "32.8 ms");
/// assert_eq!(ganymede::fmt::format_short_duration(128_123), "128 ms");
/// assert_eq!(ganymede::fmt::format_short_duration(1_128_123), "1.13 s");
/// assert_eq!(ganymede::fmt::format_short_duration(10_128_123), "10.1 s");
/// assert_eq!(ganymede::fmt::format_short_duration(101_000_000), "101 s");
/// ```
pub fn format_short_duration(duration_in_micros: i32) -> String {
    let mut result = String::new();
    let _ = format_micros(duration_in_micros, &mut result);
    result
}
