//! Test pattern generation for mock camera frames.

/// Simple pseudo-random number generator (LCG) for reproducible noise.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Generates a 16-bit test pattern.
///
/// A diagonal gradient shifted by the frame number, with a small amount of
/// reproducible noise. Two frames with the same number are identical.
pub fn generate_test_pattern(width: u32, height: u32, frame_num: u64) -> Vec<u16> {
    let w = width as usize;
    let h = height as usize;
    let span = (w + h).max(1);
    let shift = (frame_num % 64) as usize * 256;
    let frame_seed = frame_num.wrapping_mul(2654435761);

    let mut buffer = Vec::with_capacity(w * h);
    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let gradient = (x + y) * 60000 / span;
            let noise = (prng(frame_seed ^ idx as u64) & 0x3F) as usize;
            buffer.push(((gradient + shift + noise) % 65536) as u16);
        }
    }
    buffer
}

/// Reduces a 16-bit pattern to 8 bits by keeping the high byte.
pub fn to_gray8(pixels: &[u16]) -> Vec<u8> {
    pixels.iter().map(|p| (p >> 8) as u8).collect()
}
