//! Shot/query-count sampling policies.
//!
//! A policy is any zero-argument `FnMut() -> usize`. The helpers below
//! cover the two cases the driver needs: a fixed count and a count drawn
//! uniformly from a range.

use crate::rng::SimpleRng;

/// A policy that always returns `n`.
///
/// # Example
///
/// ```
/// use maml_core::sampling::fixed_count;
///
/// let mut shots = fixed_count(5);
/// assert_eq!(shots(), 5);
/// assert_eq!(shots(), 5);
/// ```
pub fn fixed_count(n: usize) -> impl FnMut() -> usize {
    move || n
}

/// A policy drawing uniformly from `[lo, hi]` (inclusive) with its own seeded
/// generator.
///
/// # Example
///
/// ```
/// use maml_core::sampling::uniform_count;
///
/// let mut shots = uniform_count(1, 10, 42);
/// let n = shots();
/// assert!((1..=10).contains(&n));
/// ```
pub fn uniform_count(lo: usize, hi: usize, seed: u64) -> impl FnMut() -> usize {
    let mut rng = SimpleRng::new(seed);
    move || rng.next_usize_inclusive(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_count_is_seeded() {
        let mut a = uniform_count(1, 20, 9);
        let mut b = uniform_count(1, 20, 9);
        let xs: Vec<usize> = (0..50).map(|_| a()).collect();
        let ys: Vec<usize> = (0..50).map(|_| b()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn degenerate_range_is_constant() {
        let mut c = uniform_count(3, 3, 1);
        assert!((0..10).all(|_| c() == 3));
    }
}
