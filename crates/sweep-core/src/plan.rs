//! Partition planning.
//!
//! A plan is a pure function of `(total_rows, rows_per_shard, seed)`. Every
//! executor re-derives the same canonical order and the same shard slice
//! from those three values, so nothing about the partition is ever stored.

use crate::error::{SweepError, SweepResult};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// One-based shard identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct ShardId(usize);

impl ShardId {
    pub fn new(id: usize) -> SweepResult<Self> {
        if id < 1 {
            return Err(SweepError::contract(format!(
                "shard id must be >= 1, got {}",
                id
            )));
        }
        Ok(ShardId(id))
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl TryFrom<usize> for ShardId {
    type Error = SweepError;

    fn try_from(value: usize) -> SweepResult<Self> {
        ShardId::new(value)
    }
}

impl From<ShardId> for usize {
    fn from(value: ShardId) -> Self {
        value.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn num_shards(total_rows: usize, rows_per_shard: usize) -> SweepResult<usize> {
    if rows_per_shard == 0 {
        return Err(SweepError::contract("rows_per_shard must be > 0"));
    }
    Ok(total_rows.div_ceil(rows_per_shard))
}

/// Half-open position range `[start, end)` of `shard_id` within the
/// canonical order.
pub fn shard_range(
    shard_id: ShardId,
    total_rows: usize,
    rows_per_shard: usize,
) -> SweepResult<Range<usize>> {
    let shards = num_shards(total_rows, rows_per_shard)?;
    if shard_id.get() > shards {
        return Err(SweepError::contract(format!(
            "shard id {} out of range: plan has {} shards for {} rows at {} rows per shard",
            shard_id, shards, total_rows, rows_per_shard
        )));
    }
    let start = (shard_id.get() - 1) * rows_per_shard;
    let end = (shard_id.get() * rows_per_shard).min(total_rows);
    Ok(start..end)
}

/// Seeded permutation of `0..total_rows`.
///
/// ChaCha20 keeps the stream identical across platforms and builds, which
/// is what lets independently scheduled executors agree on the order.
pub fn canonical_order(total_rows: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..total_rows).collect();
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    order.shuffle(&mut rng);
    order
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub total_rows: usize,
    pub rows_per_shard: usize,
    pub seed: u64,
}

impl PartitionPlan {
    pub fn new(total_rows: usize, rows_per_shard: usize, seed: u64) -> SweepResult<Self> {
        if total_rows == 0 {
            return Err(SweepError::contract("dataset has no rows"));
        }
        if rows_per_shard == 0 {
            return Err(SweepError::contract("rows_per_shard must be > 0"));
        }
        Ok(Self {
            total_rows,
            rows_per_shard,
            seed,
        })
    }

    pub fn num_shards(&self) -> usize {
        self.total_rows.div_ceil(self.rows_per_shard)
    }

    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> {
        (1..=self.num_shards()).map(ShardId)
    }

    pub fn shard_range(&self, shard_id: ShardId) -> SweepResult<Range<usize>> {
        shard_range(shard_id, self.total_rows, self.rows_per_shard)
    }

    pub fn canonical_order(&self) -> Vec<usize> {
        canonical_order(self.total_rows, self.seed)
    }

    /// Row indices assigned to `shard_id`, in canonical order.
    pub fn shard_rows(&self, shard_id: ShardId) -> SweepResult<Vec<usize>> {
        let range = self.shard_range(shard_id)?;
        let order = self.canonical_order();
        Ok(order[range].to_vec())
    }

    /// Every shard with its position range, in shard id order.
    pub fn ranges(&self) -> Vec<(ShardId, Range<usize>)> {
        self.shard_ids()
            .map(|id| {
                let start = (id.get() - 1) * self.rows_per_shard;
                let end = (start + self.rows_per_shard).min(self.total_rows);
                (id, start..end)
            })
            .collect()
    }

    /// Maps every row index to the shard that owns it.
    pub fn owners(&self) -> Vec<ShardId> {
        let order = self.canonical_order();
        let mut owners = vec![ShardId(1); self.total_rows];
        for (shard_id, range) in self.ranges() {
            for &row_index in &order[range] {
                owners[row_index] = shard_id;
            }
        }
        owners
    }

    pub fn matches(&self, total_rows: usize, rows_per_shard: usize, seed: u64) -> bool {
        self.total_rows == total_rows && self.rows_per_shard == rows_per_shard && self.seed == seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> ShardId {
        ShardId::new(n).expect("valid shard id")
    }

    #[test]
    fn shard_ranges_partition_the_order_exactly() {
        for total in 1..60usize {
            for per in 1..17usize {
                let plan = PartitionPlan::new(total, per, 1).expect("plan");
                let ranges = plan.ranges();
                assert_eq!(ranges.len(), num_shards(total, per).expect("num shards"));
                let mut covered = vec![0u32; total];
                let mut next_start = 0;
                for (n, range) in ranges {
                    assert_eq!(range, shard_range(n, total, per).expect("range"));
                    assert_eq!(range.start, next_start, "gap before shard {}", n);
                    assert!(!range.is_empty(), "empty shard {} ({}/{})", n, total, per);
                    for pos in range.clone() {
                        covered[pos] += 1;
                    }
                    next_start = range.end;
                }
                assert_eq!(next_start, total);
                assert!(covered.iter().all(|c| *c == 1), "overlap for {}/{}", total, per);
            }
        }
    }

    #[test]
    fn ten_rows_at_four_per_shard() {
        assert_eq!(num_shards(10, 4).expect("num"), 3);
        assert_eq!(shard_range(id(1), 10, 4).expect("r1"), 0..4);
        assert_eq!(shard_range(id(2), 10, 4).expect("r2"), 4..8);
        assert_eq!(shard_range(id(3), 10, 4).expect("r3"), 8..10);
    }

    #[test]
    fn canonical_order_is_a_deterministic_permutation() {
        let a = canonical_order(100, 1234);
        let b = canonical_order(100, 1234);
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
        assert_ne!(a, canonical_order(100, 4321), "different seeds should differ");
    }

    #[test]
    fn contract_violations_fail_fast() {
        assert!(matches!(
            num_shards(10, 0),
            Err(SweepError::Contract(_))
        ));
        assert!(matches!(ShardId::new(0), Err(SweepError::Contract(_))));
        assert!(matches!(
            shard_range(id(4), 10, 4),
            Err(SweepError::Contract(_))
        ));
        assert!(matches!(
            PartitionPlan::new(0, 4, 1),
            Err(SweepError::Contract(_))
        ));
        assert!(matches!(
            PartitionPlan::new(10, 0, 1),
            Err(SweepError::Contract(_))
        ));
    }

    #[test]
    fn shard_rows_and_owners_agree() {
        let plan = PartitionPlan::new(23, 5, 7).expect("plan");
        let owners = plan.owners();
        let mut seen = Vec::new();
        for shard in plan.shard_ids() {
            for row in plan.shard_rows(shard).expect("rows") {
                assert_eq!(owners[row], shard);
                seen.push(row);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..23).collect::<Vec<_>>());
        let order = plan.canonical_order();
        assert_eq!(owners[order[0]], id(1));
        assert_eq!(owners[order[22]], id(5));
    }

    #[test]
    fn shard_id_deserialization_rejects_zero() {
        let ok: ShardId = serde_json::from_str("3").expect("valid id");
        assert_eq!(ok.get(), 3);
        assert!(serde_json::from_str::<ShardId>("0").is_err());
    }
}
