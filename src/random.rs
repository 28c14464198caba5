//! Deterministic pseudo-random generator.
//!
//! A linear congruential generator `n' = (n * A + C) mod M` using the glibc
//! constants. The same sequence is used for two purposes:
//!
//! - Reproducible payload content: a transfer's sequence number seeds
//!   [`fill`], and the receiving side re-derives the stream with [`validate`].
//! - Scheduling randomness: a [`Random`] instance owned by the client picks
//!   data sizes, operations and rotation positions.

const A: u32 = 1_103_515_245;
const C: u32 = 12_345;
const M: u32 = 0x7fff_ffff;

const WORD: usize = std::mem::size_of::<u64>();

/// Advance the generator and return the new raw value.
#[inline]
fn step(seed: &mut u32) -> u32 {
    *seed = seed.wrapping_mul(A).wrapping_add(C) & M;
    *seed
}

/// Draw a value in `[min, max]` and advance `seed`.
///
/// Raw LCG output alternates between even and odd values, so a two-value
/// range is decided by bit 8 of the output instead of a plain modulo.
pub fn rand_range(seed: &mut u32, min: u64, max: u64) -> u64 {
    assert!(min <= max, "invalid range [{min}, {max}]");
    let value = step(seed) as u64;
    if max - min == 1 {
        if value & 0x100 != 0 {
            max
        } else {
            min
        }
    } else {
        match (max - min).checked_add(1) {
            Some(span) => value % span + min,
            None => value,
        }
    }
}

#[inline]
fn next_word(seed: &mut u32) -> u64 {
    // Full u64 range: the modulo never reduces a 31-bit value.
    step(seed) as u64
}

#[inline]
fn next_byte(seed: &mut u32) -> u8 {
    (step(seed) as u8) % u8::MAX
}

/// Fill `buffer` with the deterministic stream for `seed`.
///
/// The body is written as little-endian 64-bit words and the remaining
/// `len % 8` bytes one generator step each. `seed` is left advanced so that
/// consecutive buffers continue the same stream.
pub fn fill(seed: &mut u32, buffer: &mut [u8]) {
    let mut words = buffer.chunks_exact_mut(WORD);
    for word in &mut words {
        word.copy_from_slice(&next_word(seed).to_le_bytes());
    }
    for byte in words.into_remainder() {
        *byte = next_byte(seed);
    }
}

/// Check `buffer` against the stream for `seed`.
///
/// Returns the offset of the first mismatching byte, or `buffer.len()` when
/// every byte matched.
pub fn validate(seed: &mut u32, buffer: &[u8]) -> usize {
    let mut words = buffer.chunks_exact(WORD);
    let mut offset = 0;
    for word in &mut words {
        let expected = next_word(seed).to_le_bytes();
        if let Some(pos) = word.iter().zip(expected.iter()).position(|(a, b)| a != b) {
            return offset + pos;
        }
        offset += WORD;
    }
    for byte in words.remainder() {
        if *byte != next_byte(seed) {
            return offset;
        }
        offset += 1;
    }
    buffer.len()
}

/// Generator state owned by one run loop.
#[derive(Debug, Clone)]
pub struct Random {
    seed: u32,
}

impl Random {
    pub fn new(seed: u32) -> Self {
        Self { seed: seed & M }
    }

    /// Draw a value in `[min, max]`.
    pub fn rand(&mut self, min: u64, max: u64) -> u64 {
        rand_range(&mut self.seed, min, max)
    }

    /// Draw a uniform index in `[0, max)`.
    pub fn urand(&mut self, max: usize) -> usize {
        assert!(max > 0, "urand over an empty range");
        rand_range(&mut self.seed, 0, (max - 1) as u64) as usize
    }

    pub fn next_u32(&mut self) -> u32 {
        rand_range(&mut self.seed, 0, u32::MAX as u64 - 1) as u32
    }

    /// Shuffle `items` in place, drawing positions from this generator.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in 1..items.len() {
            let j = self.urand(i + 1);
            items.swap(i, j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_then_validate_matches() {
        for size in [0, 1, 7, 8, 9, 63, 64, 100, 4097] {
            let mut buf = vec![0u8; size];
            let mut seed = 42;
            fill(&mut seed, &mut buf);

            let mut seed = 42;
            assert_eq!(validate(&mut seed, &buf), size, "size {size}");
        }
    }

    #[test]
    fn test_fill_is_deterministic() {
        let mut a = vec![0u8; 37];
        let mut b = vec![0u8; 37];
        fill(&mut 7, &mut a);
        fill(&mut 7, &mut b);
        assert_eq!(a, b);

        let mut c = vec![0u8; 37];
        fill(&mut 8, &mut c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_validate_reports_corrupted_byte() {
        let mut buf = vec![0u8; 100];
        fill(&mut 1234, &mut buf);

        // Inside the word-aligned body
        buf[13] ^= 0xff;
        assert_eq!(validate(&mut 1234, &buf), 13);
        buf[13] ^= 0xff;

        // Inside the byte tail (100 = 12 words + 4 bytes)
        buf[98] = buf[98].wrapping_add(1);
        assert_eq!(validate(&mut 1234, &buf), 98);
    }

    #[test]
    fn test_seed_continues_across_buffers() {
        let mut whole = vec![0u8; 16];
        fill(&mut 5, &mut whole);

        let mut seed = 5;
        let mut first = vec![0u8; 8];
        let mut second = vec![0u8; 8];
        fill(&mut seed, &mut first);
        fill(&mut seed, &mut second);

        assert_eq!(&whole[..8], &first[..]);
        assert_eq!(&whole[8..], &second[..]);
    }

    #[test]
    fn test_rand_range_bounds() {
        let mut random = Random::new(99);
        for _ in 0..1000 {
            let v = random.rand(10, 20);
            assert!((10..=20).contains(&v));
        }
        assert_eq!(random.rand(5, 5), 5);
    }

    #[test]
    fn test_two_value_range_does_not_alternate() {
        let mut random = Random::new(3);
        let draws: Vec<usize> = (0..64).map(|_| random.urand(2)).collect();

        assert!(draws.contains(&0));
        assert!(draws.contains(&1));
        // Plain modulo on an LCG would strictly alternate
        assert!(draws.windows(2).any(|w| w[0] == w[1]));
    }

    #[test]
    fn test_shuffle_is_permutation() {
        let mut items: Vec<u32> = (0..10).collect();
        Random::new(17).shuffle(&mut items);

        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }
}
