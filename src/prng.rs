//! Seeded uniform PRNG.
//!
//! The reference harness drives every stochastic decision (destination
//! shuffle, port assignment, Zipf sampling) from a dSFMT instance seeded by
//! a 10-word `u32` vector read off disk, so that two runs given the same
//! seed file produce byte-identical workloads across machines. This module
//! is not an FFI binding to the reference `dSFMT` library (see DESIGN.md,
//! Open Question 3); it is a from-scratch generator satisfying the same
//! contract: seeded by `Seed`, produces i.i.d. doubles in `[0, 1)`, and is
//! perfectly reproducible given the same seed.

use rand::RngCore;

/// Number of `u32` words in one seed (80 bits of seed material).
pub const SEED_WORDS: usize = 10;

/// A seed vector as read from the seed file: `s1`, `s2`, or `node_seed`.
pub type Seed = [u32; SEED_WORDS];

/// Uniform double-precision PRNG seeded from a [`Seed`].
///
/// Internally an xorshift128+ generator, whose 128 bits of state are
/// diffused from the 320 bits of seed material via a splitmix64 mixing
/// step (the same technique used to seed xorshift/xoshiro generators from
/// arbitrary-width seeds across the Rust ecosystem).
pub struct SeededRng {
    s0: u64,
    s1: u64,
}

fn splitmix64_step(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl SeededRng {
    /// Seeds the generator from a 10-word seed vector.
    pub fn from_seed(seed: Seed) -> Self {
        let mut acc: u64 = 0x5327_4F4B_4A54_4159; // arbitrary non-zero IV
        for (i, &word) in seed.iter().enumerate() {
            acc ^= (word as u64).wrapping_shl((i as u32 % 4) * 8);
            acc = acc.wrapping_mul(0xD6E8_FEB8_6659_FD93);
            acc ^= acc >> 32;
        }
        let s0 = splitmix64_step(&mut acc) | 1;
        let s1 = splitmix64_step(&mut acc) | 1;
        SeededRng { s0, s1 }
    }

    /// Next uniform double in `[0, 1)`, using the top 53 bits of a 64-bit
    /// draw (the usual technique for generating a double with full
    /// mantissa precision from a 64-bit generator).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.next_u64() >> 11;
        (bits as f64) * (1.0 / (1u64 << 53) as f64)
    }

    /// `⌊u·n⌋ ∈ [0, n−1]`.
    pub fn sample_0_n1(&mut self, n: u64) -> u64 {
        debug_assert!(n > 0);
        (self.next_f64() * n as f64) as u64
    }

    /// `⌊u·n⌋ + 1 ∈ [1, n]`.
    pub fn sample_1_n(&mut self, n: u64) -> u64 {
        self.sample_0_n1(n) + 1
    }

    /// `⌊u·(n+1)⌋ ∈ [0, n]`.
    pub fn sample_0_n(&mut self, n: u64) -> u64 {
        (self.next_f64() * (n + 1) as f64) as u64
    }
}

impl RngCore for SeededRng {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift128+
        let mut x = self.s0;
        let y = self.s1;
        self.s0 = y;
        x ^= x << 23;
        x ^= x >> 17;
        x ^= y ^ (y >> 26);
        self.s1 = x;
        x.wrapping_add(y)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut chunks = dest.chunks_exact_mut(8);
        for chunk in &mut chunks {
            chunk.copy_from_slice(&self.next_u64().to_le_bytes());
        }
        let rem = chunks.into_remainder();
        if !rem.is_empty() {
            let bytes = self.next_u64().to_le_bytes();
            rem.copy_from_slice(&bytes[..rem.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(n: u32) -> Seed {
        let mut s = [0u32; SEED_WORDS];
        s[0] = n;
        s
    }

    #[test]
    fn same_seed_same_stream() {
        let mut a = SeededRng::from_seed(seed(42));
        let mut b = SeededRng::from_seed(seed(42));
        for _ in 0..1000 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn different_seed_different_stream() {
        let mut a = SeededRng::from_seed(seed(1));
        let mut b = SeededRng::from_seed(seed(2));
        let sa: Vec<u64> = (0..16).map(|_| a.next_u64()).collect();
        let sb: Vec<u64> = (0..16).map(|_| b.next_u64()).collect();
        assert_ne!(sa, sb);
    }

    #[test]
    fn sample_0_n1_in_range() {
        let mut rng = SeededRng::from_seed(seed(7));
        for _ in 0..10_000 {
            let v = rng.sample_0_n1(5);
            assert!(v < 5);
        }
    }

    #[test]
    fn sample_1_n_in_range() {
        let mut rng = SeededRng::from_seed(seed(7));
        for _ in 0..10_000 {
            let v = rng.sample_1_n(5);
            assert!((1..=5).contains(&v));
        }
    }

    #[test]
    fn sample_0_n_in_range() {
        let mut rng = SeededRng::from_seed(seed(7));
        for _ in 0..10_000 {
            let v = rng.sample_0_n(5);
            assert!(v <= 5);
        }
    }

    #[test]
    fn uniform_draws_stay_in_unit_interval() {
        let mut rng = SeededRng::from_seed(seed(99));
        for _ in 0..10_000 {
            let u = rng.next_f64();
            assert!((0.0..1.0).contains(&u));
        }
    }
}
