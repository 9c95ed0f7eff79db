//! Seeded Mersenne Twister random number generator
//!
//! All randomness in a run (cell subsampling, synthetic data) flows through an
//! explicitly seeded [`MersenneTwister`], so identical seeds give identical
//! results regardless of thread scheduling.

use statrs::function::erf::erfc_inv;
use statrs::function::gamma::ln_gamma;

/// 2^-32
const INV_2_32: f64 = 2.3283064365386963e-10;

/// Mersenne Twister (MT19937) with LCG-based seeding.
///
/// The state is initialised by running the LCG `x <- 69069 x + 1` (mod 2^32):
/// 50 warm-up steps, one discarded value, then 624 values for the state.
#[derive(Debug, Clone)]
pub struct MersenneTwister {
    state: [u32; 624],
    index: usize,
}

impl MersenneTwister {
    const N: usize = 624;
    const M: usize = 397;
    const MATRIX_A: u32 = 0x9908B0DF;
    const UPPER_MASK: u32 = 0x80000000;
    const LOWER_MASK: u32 = 0x7FFFFFFF;

    pub fn new(seed: u32) -> Self {
        let mut mt = MersenneTwister {
            state: [0; Self::N],
            index: Self::N,
        };
        mt.seed_state(seed);
        mt
    }

    fn seed_state(&mut self, seed: u32) {
        let mut x: u32 = seed;
        for _ in 0..50 {
            x = x.wrapping_mul(69069).wrapping_add(1);
        }
        x = x.wrapping_mul(69069).wrapping_add(1);
        for slot in self.state.iter_mut() {
            x = x.wrapping_mul(69069).wrapping_add(1);
            *slot = x;
        }
        self.index = Self::N;
    }

    /// Regenerate the 624-word state block
    fn twist(&mut self) {
        for i in 0..Self::N {
            let y = (self.state[i] & Self::UPPER_MASK)
                | (self.state[(i + 1) % Self::N] & Self::LOWER_MASK);
            self.state[i] = self.state[(i + Self::M) % Self::N] ^ (y >> 1);
            if y & 1 != 0 {
                self.state[i] ^= Self::MATRIX_A;
            }
        }
        self.index = 0;
    }

    fn next_u32(&mut self) -> u32 {
        if self.index >= Self::N {
            self.twist();
        }

        let mut y = self.state[self.index];
        self.index += 1;

        // Tempering
        y ^= y >> 11;
        y ^= (y << 7) & 0x9D2C5680;
        y ^= (y << 15) & 0xEFC60000;
        y ^= y >> 18;

        y
    }

    /// Uniform draw on the open interval (0, 1)
    pub fn runif(&mut self) -> f64 {
        let u = self.next_u32() as f64 * INV_2_32;
        if u <= 0.0 {
            0.5 * INV_2_32
        } else if u >= 1.0 {
            1.0 - 0.5 * INV_2_32
        } else {
            u
        }
    }

    /// Uniform integer in `0..n` by rejection on the smallest covering bit width
    pub fn unif_index(&mut self, n: usize) -> usize {
        if n <= 1 {
            return 0;
        }
        let bits = (n as f64).log2().ceil() as u32;
        loop {
            let v = self.random_bits(bits);
            if (v as usize) < n {
                return v as usize;
            }
        }
    }

    /// `bits` random bits assembled from 16-bit chunks of uniform draws
    fn random_bits(&mut self, bits: u32) -> u64 {
        let mut v: u64 = 0;
        let mut n = 0;
        while n <= bits {
            let chunk = (self.runif() * 65536.0).floor() as u64;
            v = v.wrapping_mul(65536).wrapping_add(chunk);
            n += 16;
        }
        v & ((1u64 << bits) - 1)
    }

    /// Draw `k` distinct indices from `0..n` (partial Fisher-Yates).
    ///
    /// The returned order is the draw order. Returns all of `0..n` when `k >= n`.
    pub fn sample_without_replacement(&mut self, n: usize, k: usize) -> Vec<usize> {
        if k >= n {
            return (0..n).collect();
        }
        let mut pool: Vec<usize> = (0..n).collect();
        let mut remaining = n;
        let mut out = Vec::with_capacity(k);
        for _ in 0..k {
            let j = self.unif_index(remaining);
            out.push(pool[j]);
            remaining -= 1;
            pool[j] = pool[remaining];
        }
        out
    }

    /// Standard normal by inversion
    pub fn rnorm(&mut self) -> f64 {
        let u = self.runif();
        -std::f64::consts::SQRT_2 * erfc_inv(2.0 * u)
    }

    /// Uniform on `[lo, hi)`
    pub fn runif_range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.runif()
    }

    /// Gamma(shape, scale) by Marsaglia-Tsang squeeze
    pub fn rgamma(&mut self, shape: f64, scale: f64) -> f64 {
        if shape < 1.0 {
            let u = self.runif();
            return self.rgamma(shape + 1.0, scale) * u.powf(1.0 / shape);
        }
        let d = shape - 1.0 / 3.0;
        let c = 1.0 / (9.0 * d).sqrt();
        loop {
            let x = self.rnorm();
            let v = 1.0 + c * x;
            if v <= 0.0 {
                continue;
            }
            let v = v * v * v;
            let u = self.runif();
            if u < 1.0 - 0.0331 * x.powi(4) {
                return scale * d * v;
            }
            if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
                return scale * d * v;
            }
        }
    }

    /// Poisson draw: multiplication method for small rates, PTRS above 10
    pub fn rpois(&mut self, lambda: f64) -> f64 {
        if !(lambda > 0.0) || !lambda.is_finite() {
            return 0.0;
        }
        if lambda < 10.0 {
            let limit = (-lambda).exp();
            let mut k = 0.0;
            let mut p = self.runif();
            while p > limit {
                k += 1.0;
                p *= self.runif();
            }
            return k;
        }

        // Transformed rejection with squeeze (Hormann 1993)
        let slam = lambda.sqrt();
        let loglam = lambda.ln();
        let b = 0.931 + 2.53 * slam;
        let a = -0.059 + 0.02483 * b;
        let inv_alpha = 1.1239 + 1.1328 / (b - 3.4);
        let vr = 0.9277 - 3.6224 / (b - 2.0);
        loop {
            let u = self.runif() - 0.5;
            let v = self.runif();
            let us = 0.5 - u.abs();
            let k = ((2.0 * a / us + b) * u + lambda + 0.43).floor();
            if us >= 0.07 && v <= vr {
                return k;
            }
            if k < 0.0 || (us < 0.013 && v > us) {
                continue;
            }
            let lhs = v.ln() + inv_alpha.ln() - (a / (us * us) + b).ln();
            let rhs = -lambda + k * loglam - ln_gamma(k + 1.0);
            if lhs <= rhs {
                return k;
            }
        }
    }

    /// Negative binomial draw with mean `mu` and size `theta` (gamma-Poisson mixture)
    pub fn rnbinom(&mut self, theta: f64, mu: f64) -> f64 {
        if !(mu > 0.0) {
            return 0.0;
        }
        let rate = self.rgamma(theta, mu / theta);
        self.rpois(rate)
    }
}
