//! Search over one hash table keyed on the whole PQ code.

use anyhow::{anyhow, Result};

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::codekey;
use crate::codes::CodeMatrix;
use crate::keygen::{KeyGenerator, MAX_SUBSPACES};
use crate::pq::{self, Codewords, ProductQuantizer, Score};
use crate::sparsehash;

/// A table whose keys are whole packed PQ codes. Because a key determines
/// the code, the generator's lower-bound distance equals the exact
/// asymmetric distance of every id found under it and no reranking is
/// needed.
pub struct SingleTable {
    pq: ProductQuantizer,
    table: sparsehash::Table,
    num_codes: usize,
}

impl SingleTable {
    /// Builds the table from codewords and the database codes.
    ///
    /// # Errors
    ///
    /// `anyhow::Error` will be returned when
    ///
    /// - the codes are empty or their width does not match the codewords,
    /// - there are more than `u32::max_value()` codes, or
    /// - the code spans more than [`MAX_SUBSPACES`] sub-spaces.
    pub fn new(codewords: Codewords, codes: &CodeMatrix) -> Result<Self> {
        let pq = ProductQuantizer::new(codewords)?;
        let num_subspaces = pq.num_subspaces();

        if MAX_SUBSPACES < num_subspaces {
            return Err(anyhow!(
                "a single table supports up to M = {}, but got {}",
                MAX_SUBSPACES,
                num_subspaces
            ));
        }
        if codes.is_empty() {
            return Err(anyhow!("the input codes must not be empty"));
        }
        if (u32::max_value() as usize) < codes.num_rows() {
            return Err(anyhow!(
                "the number of codes {} must be no more than {}",
                codes.num_rows(),
                u32::max_value()
            ));
        }
        if codes.num_cols() != num_subspaces {
            return Err(anyhow!(
                "codes of {} bytes do not match M = {}",
                codes.num_cols(),
                num_subspaces
            ));
        }

        let mut table = sparsehash::Table::new(8 * num_subspaces)?;
        for n in 0..codes.num_rows() {
            table.count_insert(codekey::pack(codes.row(n)));
        }
        for n in 0..codes.num_rows() {
            table.data_insert(codekey::pack(codes.row(n)), n as u32);
        }

        Ok(Self {
            pq,
            table,
            num_codes: codes.num_rows(),
        })
    }

    /// Finds the nearest code: the first generator key with a non-empty
    /// posting list, reported with the generator's distance.
    pub fn query_top1(&self, query: &[f32]) -> Score {
        let mut keygen = KeyGenerator::new(query, self.pq.codewords());
        while keygen.has_next() {
            let pqkey = keygen.next_key();
            if let Some(ids) = self.table.access(pqkey.key) {
                return (ids[0], pqkey.dist);
            }
        }
        unreachable!("a non-empty table always yields a hit");
    }

    /// Finds the `top_k` nearest codes in ascending distance order. Ids
    /// sharing a key share the distance, so the hits can be taken as the
    /// generator emits them. At most the number of stored codes is
    /// returned.
    pub fn query_topk(&self, query: &[f32], top_k: usize) -> Vec<Score> {
        assert!(0 < top_k);
        let top_k = top_k.min(self.num_codes);
        if top_k == 1 {
            return vec![self.query_top1(query)];
        }

        let mut keygen = KeyGenerator::new(query, self.pq.codewords());
        let mut scores = Vec::with_capacity(top_k);
        while keygen.has_next() {
            let pqkey = keygen.next_key();
            if let Some(ids) = self.table.access(pqkey.key) {
                for &id in ids {
                    scores.push((id, pqkey.dist));
                }
            }
            if top_k <= scores.len() {
                scores.truncate(top_k);
                return scores;
            }
        }
        unreachable!("the generator emits the key of every stored code");
    }

    /// Writes `T.txt`, `codeword.txt`, and `table.bin` into the directory,
    /// creating it if needed.
    pub fn write<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("T.txt"), "1")?;

        let writer = BufWriter::new(File::create(dir.join("codeword.txt"))?);
        pq::write_codewords(writer, self.pq.codewords())?;

        let writer = BufWriter::new(File::create(dir.join("table.bin"))?);
        self.table.serialize_into(writer)?;
        Ok(())
    }

    /// Reads a table written by [`SingleTable::write`].
    pub fn read<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();

        let reader = BufReader::new(File::open(dir.join("codeword.txt"))?);
        let pq = ProductQuantizer::new(pq::read_codewords(reader)?)?;

        let reader = BufReader::new(File::open(dir.join("table.bin"))?);
        let table = sparsehash::Table::deserialize_from(reader)?;
        let num_codes = table.num_values();

        Ok(Self {
            pq,
            table,
            num_codes,
        })
    }

    pub fn pq(&self) -> &ProductQuantizer {
        &self.pq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_vecs(size: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..size)
            .map(|_| (0..dim).map(|_| rng.gen::<f32>() * 10.0).collect())
            .collect()
    }

    #[test]
    fn corner_grid_is_found_exactly() {
        let base: Vec<Vec<f32>> = vec![
            vec![0.0, 0.0],
            vec![0.0, 1.0],
            vec![1.0, 0.0],
            vec![1.0, 1.0],
        ];
        let pq = ProductQuantizer::learn(&base, 2, 2).unwrap();
        let codes = pq.encode_batch(&base);
        let table = SingleTable::new(pq.codewords().clone(), &codes).unwrap();

        let (id, dist) = table.query_top1(&[0.9, 0.1]);
        assert_eq!(id, 2);
        assert!(dist < 0.5);

        // Each corner finds itself.
        for (n, vec) in base.iter().enumerate() {
            let (id, _) = table.query_top1(vec);
            assert_eq!(id as usize, n);
        }
    }

    fn gaussian_vecs(size: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..size)
            .map(|_| (0..dim).map(|_| rng.sample(rand_distr::StandardNormal)).collect())
            .collect()
    }

    #[test]
    fn self_queries_return_their_own_code() {
        let base = gaussian_vecs(2000, 4, 21);
        let pq = ProductQuantizer::learn(&base, 2, 32).unwrap();
        let codes = pq.encode_batch(&base);
        let table = SingleTable::new(pq.codewords().clone(), &codes).unwrap();

        for (n, query) in base.iter().enumerate().step_by(97) {
            let (id, dist) = table.query_top1(query);
            // The returned id shares the query's own code and distance.
            assert_eq!(codes.row(id as usize), codes.row(n));
            let own = pq.ad(&pq.dtable(query), codes.row(n));
            assert!((dist - own).abs() < 1e-6);
        }
    }

    #[test]
    fn topk_is_sorted_and_matches_exhaustive_search() {
        let base = random_vecs(500, 4, 22);
        let pq = ProductQuantizer::learn(&base, 2, 16).unwrap();
        let codes = pq.encode_batch(&base);
        let table = SingleTable::new(pq.codewords().clone(), &codes).unwrap();

        for query in base.iter().step_by(53) {
            let scores = table.query_topk(query, 10);
            assert_eq!(scores.len(), 10);
            for pair in scores.windows(2) {
                assert!(pair[0].1 <= pair[1].1);
            }

            let dists = pq.ad_batch(&pq.dtable(query), &codes);
            let exhaustive = pq::sort_scores(&dists, Some(10));
            for (a, b) in scores.iter().zip(exhaustive.iter()) {
                assert!((a.1 - b.1).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn wide_codes_are_rejected() {
        let base = random_vecs(300, 8, 23);
        let pq = ProductQuantizer::learn(&base, 8, 16).unwrap();
        let codes = pq.encode_batch(&base);
        assert!(SingleTable::new(pq.codewords().clone(), &codes).is_err());
    }
}
