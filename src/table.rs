//! The PQTable search structures.
//!
//! A [`SingleTable`] hashes whole codes and needs no reranking; a
//! [`MultiTable`] splits the code into T partitions and intersects their
//! candidate streams. [`PqTable`] wraps the two behind one interface and
//! picks T automatically.

mod multi;
mod single;

pub use multi::MultiTable;
pub use single::SingleTable;

use anyhow::{anyhow, Result};

use std::path::Path;

use crate::codes::CodeMatrix;
use crate::pq::{Codewords, Score};

/// A PQ-code search table with an automatically selected backend.
pub enum PqTable {
    Single(SingleTable),
    Multi(MultiTable),
}

impl PqTable {
    /// Builds a table over the codes, selecting the number of partitions
    /// with [`optimal_t`]. The input database `codes` is stolen; the
    /// multi-table keeps it for reranking.
    ///
    /// # Examples
    ///
    /// ```
    /// use pqtable_rs::{PqTable, ProductQuantizer};
    ///
    /// let base: Vec<Vec<f32>> = vec![
    ///     vec![0.0, 0.0],
    ///     vec![0.0, 1.0],
    ///     vec![1.0, 0.0],
    ///     vec![1.0, 1.0],
    /// ];
    ///
    /// let pq = ProductQuantizer::learn(&base, 2, 2).unwrap();
    /// let codes = pq.encode_batch(&base);
    /// let table = PqTable::new(pq.codewords().clone(), codes).unwrap();
    ///
    /// let (id, _dist) = table.query_top1(&[0.9, 0.1]);
    /// assert_eq!(id, 2);
    /// ```
    pub fn new(codewords: Codewords, codes: CodeMatrix) -> Result<Self> {
        let num_subspaces = codewords.len();
        let raw = optimal_t(8 * num_subspaces, codes.num_rows());
        Self::with_t(codewords, codes, clamp_t(num_subspaces, raw))
    }

    /// Builds a table with an explicit number of partitions. `T == 1`
    /// builds a [`SingleTable`], larger values a [`MultiTable`].
    pub fn with_t(codewords: Codewords, codes: CodeMatrix, num_partitions: usize) -> Result<Self> {
        match num_partitions {
            0 => Err(anyhow!("T must be positive")),
            1 => Ok(Self::Single(SingleTable::new(codewords, &codes)?)),
            t => Ok(Self::Multi(MultiTable::new(codewords, codes, t)?)),
        }
    }

    /// Finds the nearest code to the query.
    pub fn query_top1(&self, query: &[f32]) -> Score {
        match self {
            Self::Single(table) => table.query_top1(query),
            Self::Multi(table) => table.query_top1(query),
        }
    }

    /// Finds the `top_k` nearest codes in ascending distance order.
    pub fn query_topk(&self, query: &[f32], top_k: usize) -> Vec<Score> {
        match self {
            Self::Single(table) => table.query_topk(query, top_k),
            Self::Multi(table) => table.query_topk(query, top_k),
        }
    }

    /// Writes the table files into the directory.
    pub fn write<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        match self {
            Self::Single(table) => table.write(dir),
            Self::Multi(table) => table.write(dir),
        }
    }

    /// Reads a table directory, dispatching on the persisted `T.txt`.
    pub fn read<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let num_partitions: usize = std::fs::read_to_string(dir.join("T.txt"))?.trim().parse()?;
        match num_partitions {
            0 => Err(anyhow!("broken table directory: T = 0")),
            1 => Ok(Self::Single(SingleTable::read(dir)?)),
            _ => Ok(Self::Multi(MultiTable::read(dir)?)),
        }
    }

    /// The number of partitions of the chosen backend.
    pub fn num_partitions(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multi(table) => table.num_partitions(),
        }
    }
}

/// Rule-of-thumb number of partitions for codes of `num_bits` bits over a
/// database of `num_codes` entries: `2^round(log2(b / log2 N))`, clamped
/// into `{1, 2, 4}`. Roughly, each partition should address about `log2 N`
/// bits so that its table is neither starved nor overcrowded.
pub fn optimal_t(num_bits: usize, num_codes: usize) -> usize {
    let raw = (num_bits as f64 / (num_codes as f64).log2()).log2().round();
    let t = 2f64.powf(raw);
    t.max(1.0).min(4.0) as usize
}

/// Adjusts a partition count so that it divides M and each partition packs
/// into a 32-bit key. The result may still be unusable for unsupported M
/// (e.g. M = 6); the table constructors report those.
fn clamp_t(num_subspaces: usize, num_partitions: usize) -> usize {
    let mut t = num_partitions.max(1).min(num_subspaces);
    while 1 < t && num_subspaces % t != 0 {
        t /= 2;
    }
    while 4 < num_subspaces / t {
        t *= 2;
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pq::{self, ProductQuantizer};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_vecs(size: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..size)
            .map(|_| (0..dim).map(|_| rng.gen::<f32>() * 10.0).collect())
            .collect()
    }

    #[test]
    fn optimal_t_works() {
        // 32 bits over a million codes: about 1.6 bits per partition bit
        // budget, so two partitions.
        assert_eq!(optimal_t(32, 1 << 20), 2);
        // A tiny database pushes toward many partitions.
        assert_eq!(optimal_t(32, 16), 4);
        // A huge database saturates a single table.
        assert_eq!(optimal_t(16, 1 << 20), 1);
    }

    #[test]
    fn clamp_t_respects_the_code_layout() {
        assert_eq!(clamp_t(1, 4), 1);
        assert_eq!(clamp_t(2, 4), 2);
        assert_eq!(clamp_t(4, 4), 4);
        assert_eq!(clamp_t(8, 1), 2); // 8 sub-spaces never fit one key
        assert_eq!(clamp_t(16, 1), 4);
        assert_eq!(clamp_t(16, 4), 4);
    }

    #[test]
    fn auto_selection_builds_a_working_table() {
        let base = random_vecs(500, 8, 41);
        let pq = ProductQuantizer::learn(&base, 4, 16).unwrap();
        let codes = pq.encode_batch(&base);
        let table = PqTable::new(pq.codewords().clone(), codes.clone()).unwrap();

        for query in base.iter().step_by(111) {
            let (_, dist) = table.query_top1(query);
            let dists = pq.ad_batch(&pq.dtable(query), &codes);
            let best = dists.iter().cloned().fold(f32::INFINITY, f32::min);
            assert!((dist - best).abs() < 1e-5);
        }
    }

    #[test]
    fn directory_roundtrip_reproduces_query_output() {
        let base = random_vecs(400, 8, 42);
        let queries = random_vecs(8, 8, 43);

        for &t in &[1_usize, 2, 4] {
            let pq = ProductQuantizer::learn(&base, 4, 16).unwrap();
            let codes = pq.encode_batch(&base);
            let table = PqTable::with_t(pq.codewords().clone(), codes, t).unwrap();

            let dir = tempfile::tempdir().unwrap();
            table.write(dir.path()).unwrap();
            let reloaded = PqTable::read(dir.path()).unwrap();
            assert_eq!(reloaded.num_partitions(), t);

            for query in &queries {
                let a = table.query_topk(query, 5);
                let b = reloaded.query_topk(query, 5);
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn single_and_multi_agree_on_distances() {
        let base = random_vecs(300, 4, 44);
        let pq = ProductQuantizer::learn(&base, 2, 16).unwrap();
        let codes = pq.encode_batch(&base);

        let single = PqTable::with_t(pq.codewords().clone(), codes.clone(), 1).unwrap();
        let multi = PqTable::with_t(pq.codewords().clone(), codes, 2).unwrap();

        for query in random_vecs(10, 4, 45).iter() {
            let (_, a) = single.query_top1(query);
            let (_, b) = multi.query_top1(query);
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn scores_helper_and_table_agree() {
        let base = random_vecs(300, 4, 46);
        let pq = ProductQuantizer::learn(&base, 2, 16).unwrap();
        let codes = pq.encode_batch(&base);
        let table = PqTable::with_t(pq.codewords().clone(), codes.clone(), 2).unwrap();

        let query = &base[0];
        let scores = table.query_topk(query, 3);
        let dists = pq.ad_batch(&pq.dtable(query), &codes);
        let exhaustive = pq::sort_scores(&dists, Some(3));
        for (a, b) in scores.iter().zip(exhaustive.iter()) {
            assert!((a.1 - b.1).abs() < 1e-5);
        }
    }
}
