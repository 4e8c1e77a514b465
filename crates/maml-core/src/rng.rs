//! Deterministic PRNG for task sampling and parameter initialization.
//!
//! A splitmix64 generator: cheap, seedable, and identical on every
//! platform, so a fixed seed reproduces the same tasks and the same
//! initial parameters.

/// Deterministic PRNG based on splitmix64.
///
/// # Example
///
/// ```
/// use maml_core::SimpleRng;
///
/// let mut rng = SimpleRng::new(42);
/// let val = rng.next_f32();
/// assert!((0.0..1.0).contains(&val));
/// ```
#[derive(Debug, Clone)]
pub struct SimpleRng(u64);

impl SimpleRng {
    /// Creates a new PRNG with the given seed.
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Returns the next pseudo-random u64.
    pub fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    /// Returns a uniform f32 in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / ((1u64 << 24) as f32)
    }

    /// Returns a uniform f32 in [lo, hi).
    pub fn next_f32_range(&mut self, lo: f32, hi: f32) -> f32 {
        lo + (hi - lo) * self.next_f32()
    }

    /// Returns a uniform usize in `[lo, hi]` (inclusive).
    ///
    /// # Example
    ///
    /// ```
    /// use maml_core::SimpleRng;
    ///
    /// let mut rng = SimpleRng::new(7);
    /// let n = rng.next_usize_inclusive(5, 10);
    /// assert!((5..=10).contains(&n));
    /// ```
    pub fn next_usize_inclusive(&mut self, lo: usize, hi: usize) -> usize {
        if hi <= lo {
            return lo;
        }
        match (hi - lo).checked_add(1) {
            Some(span) => lo + (self.next_u64() % span as u64) as usize,
            // The whole of `usize`: `lo` is 0.
            None => self.next_u64() as usize,
        }
    }

    /// Returns a standard normal sample (Box-Muller).
    pub fn next_gaussian(&mut self) -> f32 {
        // Keep u1 away from 0 so ln() stays finite.
        let u1 = self.next_f32().max(f32::MIN_POSITIVE);
        let u2 = self.next_f32();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
    }

    /// Derives an independent generator, advancing this one.
    ///
    /// Used to hand every sampled task its own stream so a task's samples
    /// do not depend on how many other tasks were drawn after it.
    pub fn fork(&mut self) -> SimpleRng {
        SimpleRng::new(self.next_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let mut r1 = SimpleRng::new(42);
        let mut r2 = SimpleRng::new(42);
        for _ in 0..100 {
            assert_eq!(r1.next_u64(), r2.next_u64());
        }
    }

    #[test]
    fn f32_range_in_bounds() {
        let mut rng = SimpleRng::new(42);
        for _ in 0..1000 {
            let v = rng.next_f32_range(-0.5, 0.5);
            assert!((-0.5..0.5).contains(&v));
        }
    }

    #[test]
    fn usize_inclusive_hits_both_ends() {
        let mut rng = SimpleRng::new(3);
        let draws: Vec<usize> = (0..500).map(|_| rng.next_usize_inclusive(1, 3)).collect();
        assert!(draws.contains(&1));
        assert!(draws.contains(&3));
        assert!(draws.iter().all(|&d| (1..=3).contains(&d)));
        assert_eq!(rng.next_usize_inclusive(4, 4), 4);
    }

    #[test]
    fn gaussian_roughly_standard() {
        let mut rng = SimpleRng::new(11);
        let n = 20_000;
        let samples: Vec<f32> = (0..n).map(|_| rng.next_gaussian()).collect();
        let mean = samples.iter().sum::<f32>() / n as f32;
        let var = samples.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n as f32;
        assert!(mean.abs() < 0.05, "mean={mean}");
        assert!((var - 1.0).abs() < 0.1, "var={var}");
    }

    #[test]
    fn fork_is_deterministic_and_distinct() {
        let mut a = SimpleRng::new(5);
        let mut b = SimpleRng::new(5);
        let mut fa = a.fork();
        let mut fb = b.fork();
        assert_eq!(fa.next_u64(), fb.next_u64());
        assert_ne!(a.next_u64(), fa.next_u64());
    }

    #[test]
    fn full_usize_range_does_not_overflow() {
        let mut rng = SimpleRng::new(3);
        for _ in 0..16 {
            rng.next_usize_inclusive(0, usize::MAX);
        }
        let mut a = SimpleRng::new(9);
        let mut b = SimpleRng::new(9);
        assert_eq!(
            a.next_usize_inclusive(0, usize::MAX),
            b.next_u64() as usize
        );
    }
}
