use bytesize::ByteSize;

pub fn is_multiple(a: usize, b: usize) -> bool {
    a % b == 0
}

pub fn round_down_to_nearest(a: usize, b: usize) -> usize {
    (a / b) * b
}

/// Round `a` to the nearest multiple of `b`. Ties go towards 0.
///
/// ```
/// use memload::units::round_to_nearest;
/// assert_eq!(round_to_nearest(1, 2), 0);
/// assert_eq!(round_to_nearest(3, 2), 2);
/// assert_eq!(round_to_nearest(-1, 2), 0);
/// assert_eq!(round_to_nearest(-3, 2), -2);
/// ```
pub fn round_to_nearest(a: isize, b: usize) -> isize {
    assert!(b > 1);
    let b = b as isize;
    if a > 0 {
        ((a + (b / 2) - 1) / b) * b
    } else {
        ((a - (b / 2) + 1) / b) * b
    }
}

pub fn mb_to_bytes(mb: f64) -> u64 {
    (mb * 1024.0 * 1024.0).round() as u64
}

pub fn fraction_to_percent(fraction: f64) -> f64 {
    fraction * 100.0
}

/// Human-readable binary units (KiB, MiB, GiB, ...).
pub fn conv(size: usize) -> String {
    ByteSize::b(size as u64).to_string_as(true)
}
