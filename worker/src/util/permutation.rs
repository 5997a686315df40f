use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Deterministic bijection over `0..n`, parameterised by a seed.
///
/// One family serves two purposes: the global worker ordering (fixed seed 1)
/// from which each rank derives its bounce alternatives, and per-request
/// walks seeded from the request itself so that every worker can reproduce
/// the same hop sequence without coordination.
#[derive(Debug, Clone)]
pub struct RankPermutation {
    order: Vec<usize>,
}

impl RankPermutation {
    pub fn new(n: usize, seed: u64) -> Self {
        let mut order: Vec<usize> = (0..n).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        // Fisher-Yates
        for i in (1..n).rev() {
            let j = rng.gen_range(0..=i);
            order.swap(i, j);
        }
        Self { order }
    }

    /// Seed for the derandomised walk of one placement request.
    pub fn request_seed(job_id: i32, requested_index: i32, requesting_rank: i32) -> u64 {
        (3 * job_id as i64 + 7 * requested_index as i64 + 11 * requesting_rank as i64) as u64
    }

    pub fn get(&self, i: usize) -> usize {
        self.order[i % self.order.len()]
    }

    /// Position of `rank` within the permutation.
    pub fn position_of(&self, rank: usize) -> usize {
        self.order
            .iter()
            .position(|&r| r == rank)
            .expect("rank outside permutation domain")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn permutation_is_a_bijection() {
        for n in [1, 2, 5, 16, 33] {
            let p = RankPermutation::new(n, 7);
            let image: BTreeSet<usize> = (0..n).map(|i| p.get(i)).collect();
            assert_eq!(image.len(), n);
            assert!(image.iter().all(|&r| r < n));
        }
    }

    #[test]
    fn same_seed_same_order() {
        let a = RankPermutation::new(12, 42);
        let b = RankPermutation::new(12, 42);
        assert!((0..12).all(|i| a.get(i) == b.get(i)));
    }

    #[test]
    fn different_seeds_differ() {
        let a = RankPermutation::new(64, 1);
        let b = RankPermutation::new(64, 2);
        assert!((0..64).any(|i| a.get(i) != b.get(i)));
    }

    #[test]
    fn position_inverts_get() {
        let p = RankPermutation::new(9, 3);
        for i in 0..9 {
            assert_eq!(p.position_of(p.get(i)), i);
        }
    }
}
