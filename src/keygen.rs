//! Generator of candidate PQ keys in ascending order of distance to a
//! query vector.
//!
//! Given a query and the per-sub-space codewords, the generator lazily
//! enumerates every combination of centroid ids, nearest combination
//! first. It keeps one distance-sorted centroid list per sub-space and
//! expands a best-first frontier over the rank tuples: popping the cheapest
//! candidate and pushing its single-rank advancements yields keys with
//! non-decreasing lower-bound distances, and every key exactly once.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use crate::codekey;
use crate::kmeans;

/// The generator packs its keys into a `u32`, so it handles at most four
/// sub-spaces.
pub const MAX_SUBSPACES: usize = 4;

/// A packed candidate key and its lower-bound squared distance. For any
/// code stored under the key, the lower bound equals the exact asymmetric
/// distance.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct PqKey {
    pub key: u32,
    pub dist: f32,
}

/// One entry of a distance-sorted centroid list.
#[derive(Clone, Copy, Debug)]
struct SortedEntry {
    dist: f32,
    ks: u8,
}

/// A frontier candidate: per-sub-space ranks into the sorted lists and the
/// summed distance.
#[derive(Clone, Copy, Debug)]
struct Cand {
    dist: f32,
    ranks: [u8; MAX_SUBSPACES],
}

impl PartialEq for Cand {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cand {}

impl PartialOrd for Cand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cand {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.ranks.cmp(&other.ranks))
    }
}

/// Lazy enumerator of PQ keys, nearest first.
pub struct KeyGenerator {
    num_subspaces: usize,
    num_centroids: usize,
    sorted: Vec<Vec<SortedEntry>>, // [m][rank]
    cands: BinaryHeap<Reverse<Cand>>,
    enqueued: HashSet<u32>,
}

impl KeyGenerator {
    /// Creates a generator for the query over the given codewords.
    ///
    /// # Panics
    ///
    /// Panics if the codewords span more than [`MAX_SUBSPACES`] sub-spaces,
    /// hold more than 256 centroids, or do not match the query
    /// dimensionality.
    pub fn new(query: &[f32], codewords: &[Vec<Vec<f32>>]) -> Self {
        let num_subspaces = codewords.len();
        assert!(
            (1..=MAX_SUBSPACES).contains(&num_subspaces),
            "the key generator supports 1 to {} sub-spaces, but got {}",
            MAX_SUBSPACES,
            num_subspaces
        );
        let num_centroids = codewords[0].len();
        assert!(num_centroids <= 256);
        let sub_dim = codewords[0][0].len();
        assert_eq!(query.len(), num_subspaces * sub_dim);

        let mut sorted = Vec::with_capacity(num_subspaces);
        for (m, sub) in codewords.iter().enumerate() {
            let query_sub = &query[m * sub_dim..(m + 1) * sub_dim];
            let mut entries: Vec<SortedEntry> = sub
                .iter()
                .enumerate()
                .map(|(ks, centroid)| SortedEntry {
                    dist: kmeans::l2sq(query_sub, centroid),
                    ks: ks as u8,
                })
                .collect();
            entries.sort_by(|a, b| a.dist.total_cmp(&b.dist));
            sorted.push(entries);
        }

        let mut gen = Self {
            num_subspaces,
            num_centroids,
            sorted,
            cands: BinaryHeap::new(),
            enqueued: HashSet::new(),
        };

        // The all-argmin tuple is the nearest possible code.
        gen.push(Cand {
            dist: gen.dist_of(&[0; MAX_SUBSPACES]),
            ranks: [0; MAX_SUBSPACES],
        });
        gen
    }

    /// Checks if an unseen key remains.
    pub fn has_next(&self) -> bool {
        !self.cands.is_empty()
    }

    /// Pops the next-nearest key. The distances of successive calls are
    /// non-decreasing, and all `Ks^M` keys are emitted exactly once.
    ///
    /// # Panics
    ///
    /// Panics when called after the whole key space has been emitted.
    pub fn next_key(&mut self) -> PqKey {
        let Reverse(cand) = self
            .cands
            .pop()
            .expect("the key generator has emitted every code");

        for m in 0..self.num_subspaces {
            let rank = cand.ranks[m] as usize;
            if rank + 1 == self.num_centroids {
                // Already at the last rank; the unchanged tuple is in the
                // dedup set and would be rejected anyway.
                continue;
            }
            let mut next = cand;
            next.ranks[m] = (rank + 1) as u8;
            next.dist = self.dist_of(&next.ranks);
            self.push(next);
        }

        PqKey {
            key: self.key_of(&cand.ranks),
            dist: cand.dist,
        }
    }

    fn push(&mut self, cand: Cand) {
        if self.enqueued.insert(self.key_of(&cand.ranks)) {
            self.cands.push(Reverse(cand));
        }
    }

    /// Sums the sorted-list distances in sub-space order, matching the
    /// summation order of the asymmetric distance.
    fn dist_of(&self, ranks: &[u8; MAX_SUBSPACES]) -> f32 {
        let mut dist = 0.0;
        for m in 0..self.num_subspaces {
            dist += self.sorted[m][ranks[m] as usize].dist;
        }
        dist
    }

    fn key_of(&self, ranks: &[u8; MAX_SUBSPACES]) -> u32 {
        let mut code = [0; MAX_SUBSPACES];
        for m in 0..self.num_subspaces {
            code[m] = self.sorted[m][ranks[m] as usize].ks;
        }
        codekey::pack(&code[..self.num_subspaces])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_codewords(
        num_subspaces: usize,
        num_centroids: usize,
        sub_dim: usize,
        seed: u64,
    ) -> Vec<Vec<Vec<f32>>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..num_subspaces)
            .map(|_| {
                (0..num_centroids)
                    .map(|_| (0..sub_dim).map(|_| rng.gen::<f32>() * 4.0).collect())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn first_key_is_the_argmin_tuple() {
        // One-dimensional sub-spaces with centroids at 0, 1, 2.
        let line = vec![vec![0.0], vec![1.0], vec![2.0]];
        let codewords = vec![line.clone(), line];

        let mut gen = KeyGenerator::new(&[1.9, 0.1], &codewords);
        let first = gen.next_key();
        assert_eq!(first.key, codekey::pack(&[2, 0]));
        let expected = (1.9_f32 - 2.0) * (1.9 - 2.0) + 0.1 * 0.1;
        assert!((first.dist - expected).abs() < 1e-6);
    }

    #[test]
    fn dists_are_non_decreasing() {
        let codewords = random_codewords(4, 8, 2, 11);
        let mut rng = StdRng::seed_from_u64(12);
        let query: Vec<f32> = (0..8).map(|_| rng.gen::<f32>() * 4.0).collect();

        let mut gen = KeyGenerator::new(&query, &codewords);
        let mut prev = gen.next_key().dist;
        for _ in 1..8_usize.pow(4) {
            let next = gen.next_key();
            assert!(prev <= next.dist);
            prev = next.dist;
        }
    }

    #[test]
    fn all_keys_are_emitted_once() {
        let codewords = random_codewords(2, 5, 3, 13);
        let mut rng = StdRng::seed_from_u64(14);
        let query: Vec<f32> = (0..6).map(|_| rng.gen::<f32>() * 4.0).collect();

        let mut gen = KeyGenerator::new(&query, &codewords);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..5_usize.pow(2) {
            assert!(seen.insert(gen.next_key().key));
        }

        // Every centroid pair appears.
        for ks0 in 0..5 {
            for ks1 in 0..5 {
                assert!(seen.contains(&codekey::pack(&[ks0, ks1])));
            }
        }
    }

    #[test]
    #[should_panic]
    fn exhausted_generator_panics() {
        let codewords = vec![vec![vec![0.0], vec![1.0]]];
        let mut gen = KeyGenerator::new(&[0.5], &codewords);
        for _ in 0..3 {
            gen.next_key();
        }
    }

    #[test]
    #[should_panic]
    fn too_many_subspaces_panic() {
        let codewords = random_codewords(5, 4, 1, 15);
        KeyGenerator::new(&[0.0; 5], &codewords);
    }
}
