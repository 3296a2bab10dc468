//! Zipf sampling cache.
//!
//! Draws from the discrete Zipf distribution over `1..=n` with exponent `s`
//! are expensive enough (for small packets, the dominant per-packet cost)
//! that PW precomputes `M = 30n` of them up front and serves them from a
//! circular cache in O(1) per call. Draws are produced by rejection
//! inversion (Hörmann & Derflinger 1996, itself a refinement of Devroye's
//! rejection method for the zeta distribution in *Non-Uniform Random
//! Variate Generation*, 1986) — the same algorithm family the spec calls
//! out by name.

use crate::prng::{Seed, SeededRng};

/// A precomputed, circularly-served stream of Zipf(`n`, `s`) draws.
pub struct ZipfCache {
    values: Vec<u64>,
    cursor: usize,
}

impl ZipfCache {
    /// Precomputes `size` draws from Zipf(`n`, `s`), using a PRNG seeded by
    /// `node_seed`.
    ///
    /// # Panics
    /// Panics if `size == 0` or `n == 0`.
    pub fn new(size: usize, s: f64, n: u64, seed: Seed) -> Self {
        assert!(size > 0, "Zipf cache size must be > 0");
        assert!(n > 0, "Zipf domain must be > 0");
        assert!(s >= 0.0, "Zipf exponent must be >= 0");

        let mut rng = SeededRng::from_seed(seed);
        let sampler = ZipfSampler::new(n, s);
        let values = (0..size).map(|_| sampler.sample(&mut rng)).collect();
        ZipfCache { values, cursor: 0 }
    }

    /// Returns the next draw in the cache, advancing the cursor circularly.
    pub fn sample(&mut self) -> u64 {
        let v = self.values[self.cursor];
        self.cursor = (self.cursor + 1) % self.values.len();
        v
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Rejection-inversion sampler for Zipf(`n`, `s`), `n` finite, `s >= 0`.
struct ZipfSampler {
    n: u64,
    exponent: f64,
    h_integral_x1: f64,
    h_integral_n: f64,
    s: f64,
}

impl ZipfSampler {
    fn new(n: u64, exponent: f64) -> Self {
        let h_integral_x1 = Self::h_integral(1.5, exponent) - 1.0;
        let h_integral_n = Self::h_integral(n as f64 + 0.5, exponent);
        let s = 2.0 - Self::h_integral_inv(Self::h_integral(2.5, exponent) - Self::h(2.0, exponent), exponent);
        ZipfSampler {
            n,
            exponent,
            h_integral_x1,
            h_integral_n,
            s,
        }
    }

    fn sample(&self, rng: &mut SeededRng) -> u64 {
        loop {
            let u = self.h_integral_n + rng.next_f64() * (self.h_integral_x1 - self.h_integral_n);
            let x = Self::h_integral_inv(u, self.exponent);
            let mut k = (x + 0.5) as i64;
            if k < 1 {
                k = 1;
            }
            let k = k as u64;

            if (k as f64) - x <= self.s {
                return k.min(self.n);
            }
            if u >= Self::h_integral(k as f64 + 0.5, self.exponent) - Self::h(k as f64, self.exponent) {
                return k.min(self.n);
            }
        }
    }

    /// `h(x) = x^-exponent`
    fn h(x: f64, exponent: f64) -> f64 {
        (-exponent * x.ln()).exp()
    }

    /// Antiderivative of `h`.
    fn h_integral(x: f64, exponent: f64) -> f64 {
        let log_x = x.ln();
        Self::helper2((1.0 - exponent) * log_x) * log_x
    }

    /// Inverse of `h_integral`.
    fn h_integral_inv(x: f64, exponent: f64) -> f64 {
        let mut t = x * (1.0 - exponent);
        if t < -1.0 {
            t = -1.0;
        }
        (Self::helper1(t) * x).exp()
    }

    fn helper1(x: f64) -> f64 {
        if x.abs() > 1e-8 {
            x.ln_1p() / x
        } else {
            1.0 - x * (0.5 - x * (1.0 / 3.0 - 0.25 * x))
        }
    }

    fn helper2(x: f64) -> f64 {
        if x.abs() > 1e-8 {
            x.exp_m1() / x
        } else {
            1.0 + x * 0.5 * (1.0 + x / 3.0 * (1.0 + 0.25 * x))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_are_in_range() {
        let mut cache = ZipfCache::new(6, 1.0, 3, [9; 10]);
        for _ in 0..1000 {
            let v = cache.sample();
            assert!((1..=3).contains(&v));
        }
    }

    #[test]
    fn identical_seeds_give_identical_sequences() {
        let mut a = ZipfCache::new(100, 1.0, 50, [3; 10]);
        let mut b = ZipfCache::new(100, 1.0, 50, [3; 10]);
        for _ in 0..500 {
            assert_eq!(a.sample(), b.sample());
        }
    }

    #[test]
    fn cursor_wraps_circularly() {
        let mut cache = ZipfCache::new(6, 1.0, 3, [1; 10]);
        let first_pass: Vec<u64> = (0..6).map(|_| cache.sample()).collect();
        let second_pass: Vec<u64> = (0..6).map(|_| cache.sample()).collect();
        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn approximates_zipf_law_over_many_draws() {
        let n = 3u64;
        let size = 6usize;
        let mut cache = ZipfCache::new(size, 1.0, n, [42; 10]);
        let draws = 1_000_000;
        let mut counts = [0u64; 3];
        for _ in 0..draws {
            let v = cache.sample();
            counts[(v - 1) as usize] += 1;
        }
        // H_3 = 1 + 1/2 + 1/3
        let h3 = 1.0 + 0.5 + 1.0 / 3.0;
        for k in 1..=3u64 {
            let expected = 1.0 / (k as f64 * h3);
            let observed = counts[(k - 1) as usize] as f64 / draws as f64;
            assert!(
                (observed - expected).abs() / expected < 0.05,
                "k={k}: expected {expected}, observed {observed}"
            );
        }
    }
}
