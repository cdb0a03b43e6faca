//! Deterministic random number generation.
//!
//! RULE: Nothing in the pipeline may call any platform RNG.
//! All randomness flows through StageRng instances derived
//! from the single master seed in the pipeline config.
//!
//! Each stage gets its own RNG stream, seeded deterministically
//! from (master_seed XOR stage_index). This means:
//!   - Adding a new stage never changes existing stages' streams.
//!   - Each stage's stream is fully reproducible in isolation.

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG for a single stage.
pub struct StageRng {
    pub name: &'static str,
    inner: Pcg64Mcg,
}

impl StageRng {
    /// Create a stage RNG from the master seed and a stable
    /// stage index. The index must never change once assigned.
    pub fn new(master_seed: u64, stage_index: u64) -> Self {
        let derived_seed = master_seed ^ (stage_index.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        Self {
            name: "unnamed",
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        use rand::RngCore;
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll an index in [0, n). Uses rejection sampling so every
    /// index is equally likely.
    pub fn index_below(&mut self, n: usize) -> usize {
        use rand::Rng;
        assert!(n > 0, "n must be > 0");
        self.inner.gen_range(0..n)
    }

    /// Draw `count` elements from `pool` with replacement.
    pub fn draw_with_replacement<T: Clone>(&mut self, pool: &[T], count: usize) -> Vec<T> {
        if pool.is_empty() {
            return Vec::new();
        }
        (0..count)
            .map(|_| pool[self.index_below(pool.len())].clone())
            .collect()
    }
}

/// All stage RNGs for a single run, indexed by stable slot.
pub struct RngBank {
    master_seed: u64,
}

impl RngBank {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    pub fn for_stage(&self, slot: StageSlot) -> StageRng {
        StageRng::new(self.master_seed, slot as u64).with_name(slot.name())
    }
}

/// Stable stage slot assignments.
/// NEVER reorder or remove entries. Only append.
/// Reordering changes every stage's seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum StageSlot {
    Apportionment = 0,
}

impl StageSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Apportionment => "apportionment",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_draws() {
        let pool = [1i64, 2, 3, 4];
        let mut a = RngBank::new(7).for_stage(StageSlot::Apportionment);
        let mut b = RngBank::new(7).for_stage(StageSlot::Apportionment);
        assert_eq!(
            a.draw_with_replacement(&pool, 50),
            b.draw_with_replacement(&pool, 50)
        );
    }

    #[test]
    fn stage_index_changes_the_stream() {
        let mut a = StageRng::new(7, 0);
        let mut b = StageRng::new(7, 1);
        let xs: Vec<f64> = (0..8).map(|_| a.next_f64()).collect();
        let ys: Vec<f64> = (0..8).map(|_| b.next_f64()).collect();
        assert_ne!(xs, ys, "different slots must not share a stream");
    }

    #[test]
    fn draws_stay_inside_pool() {
        let pool = [10i64, 20, 30];
        let mut rng = RngBank::new(99).for_stage(StageSlot::Apportionment);
        for v in rng.draw_with_replacement(&pool, 200) {
            assert!(pool.contains(&v), "drew {v} outside the pool");
        }
    }
}
