//! Search over several hash tables, each keyed on a slice of the PQ code.
//!
//! The M sub-spaces are split into T contiguous partitions of M / T
//! sub-spaces. A code is registered in every partition table under its
//! partition-local key, and a query advances T key generators in
//! round-robin. An id confirmed by all T partitions bounds the distance of
//! everything not seen yet, which makes the early stop safe.

use anyhow::{anyhow, Result};

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::codekey;
use crate::codes::CodeMatrix;
use crate::keygen::{KeyGenerator, MAX_SUBSPACES};
use crate::pq::{self, Codewords, ProductQuantizer, Score};
use crate::sparsehash;

pub struct MultiTable {
    num_partitions: usize, // T
    pq: ProductQuantizer,
    sub_codewords: Vec<Codewords>, // [t][m][ks][ds]
    tables: Vec<sparsehash::Table>,
    codes: CodeMatrix, // kept for asymmetric-distance reranking
}

impl MultiTable {
    /// Builds `num_partitions` tables from codewords and the database
    /// codes. The codes are stolen for reranking at query time.
    ///
    /// # Errors
    ///
    /// `anyhow::Error` will be returned when
    ///
    /// - the codes are empty, wider than `u32::max_value()` rows, or do not
    ///   match the codewords,
    /// - `num_partitions` is less than 2 or does not divide M, or
    /// - a partition would span more than [`MAX_SUBSPACES`] sub-spaces or a
    ///   non-packable number of them.
    pub fn new(codewords: Codewords, codes: CodeMatrix, num_partitions: usize) -> Result<Self> {
        let pq = ProductQuantizer::new(codewords)?;
        let num_subspaces = pq.num_subspaces();

        if num_partitions < 2 || num_subspaces % num_partitions != 0 {
            return Err(anyhow!(
                "T = {} must be at least 2 and divide M = {}",
                num_partitions,
                num_subspaces
            ));
        }
        let each_m = num_subspaces / num_partitions;
        if !matches!(each_m, 1 | 2 | 4) {
            return Err(anyhow!(
                "a partition of M / T = {} sub-spaces is not packable into a key",
                each_m
            ));
        }
        debug_assert!(each_m <= MAX_SUBSPACES);
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

        let sub_codewords = split_codewords(pq.codewords(), num_partitions);

        let mut tables = Vec::with_capacity(num_partitions);
        for t in 0..num_partitions {
            let mut table = sparsehash::Table::new(8 * each_m)?;
            for n in 0..codes.num_rows() {
                table.count_insert(codekey::pack(&codes.row(n)[t * each_m..(t + 1) * each_m]));
            }
            for n in 0..codes.num_rows() {
                table.data_insert(
                    codekey::pack(&codes.row(n)[t * each_m..(t + 1) * each_m]),
                    n as u32,
                );
            }
            tables.push(table);
        }

        Ok(Self {
            num_partitions,
            pq,
            sub_codewords,
            tables,
            codes,
        })
    }

    /// Finds the nearest code by asymmetric distance.
    pub fn query_top1(&self, query: &[f32]) -> Score {
        let dtable = self.pq.dtable(query);
        let mut keygens = self.make_keygens(query);

        // id -> (in how many partitions it was seen, its cached distance)
        let mut counts = HashMap::<u32, (usize, f32)>::new();
        let mut candidates = Vec::<Score>::new();

        loop {
            for (t, keygen) in keygens.iter_mut().enumerate() {
                if !keygen.has_next() {
                    // Every partition runs out of keys only after every id
                    // has been seen by all of them, which returns below.
                    continue;
                }
                let pqkey = keygen.next_key();
                if let Some(ids) = self.tables[t].access(pqkey.key) {
                    for &id in ids {
                        let entry = counts.entry(id).or_insert((0, 0.0));
                        entry.0 += 1;
                        if entry.0 == 1 {
                            entry.1 = self.pq.ad_at(&dtable, &self.codes, id as usize);
                            candidates.push((id, entry.1));
                        }
                        if entry.0 == self.num_partitions {
                            // Seen by every partition; nothing unseen can
                            // be nearer than the best candidate so far.
                            let mut best = candidates[0];
                            for &cand in &candidates[1..] {
                                if cand.1 < best.1 {
                                    best = cand;
                                }
                            }
                            return best;
                        }
                    }
                }
            }
        }
    }

    /// Finds the `top_k` nearest codes in ascending distance order. At
    /// most the number of stored codes is returned.
    pub fn query_topk(&self, query: &[f32], top_k: usize) -> Vec<Score> {
        assert!(0 < top_k);
        let top_k = top_k.min(self.codes.num_rows());
        if top_k == 1 {
            return vec![self.query_top1(query)];
        }

        let dtable = self.pq.dtable(query);
        let mut keygens = self.make_keygens(query);

        let mut counts = HashMap::<u32, (usize, f32)>::new();
        let mut candidates = Vec::<Score>::new();

        loop {
            let mut advanced = false;
            for (t, keygen) in keygens.iter_mut().enumerate() {
                if !keygen.has_next() {
                    continue;
                }
                advanced = true;
                let pqkey = keygen.next_key();
                if let Some(ids) = self.tables[t].access(pqkey.key) {
                    for &id in ids {
                        let entry = counts.entry(id).or_insert((0, 0.0));
                        entry.0 += 1;
                        if entry.0 == 1 {
                            entry.1 = self.pq.ad_at(&dtable, &self.codes, id as usize);
                            candidates.push((id, entry.1));
                        }
                        if entry.0 == self.num_partitions {
                            // Candidates within the bound of the fully seen
                            // id are final.
                            let bound = entry.1;
                            let num_within =
                                candidates.iter().filter(|cand| cand.1 <= bound).count();
                            if top_k <= num_within {
                                candidates.retain(|cand| cand.1 <= bound);
                                pq::partial_sort_scores(&mut candidates, top_k);
                                return candidates;
                            }
                        }
                    }
                }
            }
            if !advanced {
                break;
            }
        }

        // Every key of every partition was probed, so the candidates hold
        // all stored ids with their exact distances.
        pq::partial_sort_scores(&mut candidates, top_k);
        candidates
    }

    /// Writes `T.txt`, `codeword.txt`, `table0.bin` .. `table{T-1}.bin`,
    /// and `pqcode.bin` into the directory, creating it if needed.
    pub fn write<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("T.txt"), format!("{}", self.num_partitions))?;

        let writer = BufWriter::new(File::create(dir.join("codeword.txt"))?);
        pq::write_codewords(writer, self.pq.codewords())?;

        for (t, table) in self.tables.iter().enumerate() {
            let writer = BufWriter::new(File::create(dir.join(format!("table{}.bin", t)))?);
            table.serialize_into(writer)?;
        }

        let writer = BufWriter::new(File::create(dir.join("pqcode.bin"))?);
        self.codes.serialize_into(writer)?;
        Ok(())
    }

    /// Reads a table written by [`MultiTable::write`].
    pub fn read<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();

        let num_partitions: usize = std::fs::read_to_string(dir.join("T.txt"))?.trim().parse()?;

        let reader = BufReader::new(File::open(dir.join("codeword.txt"))?);
        let pq = ProductQuantizer::new(pq::read_codewords(reader)?)?;
        let sub_codewords = split_codewords(pq.codewords(), num_partitions);

        let mut tables = Vec::with_capacity(num_partitions);
        for t in 0..num_partitions {
            let reader = BufReader::new(File::open(dir.join(format!("table{}.bin", t)))?);
            tables.push(sparsehash::Table::deserialize_from(reader)?);
        }

        let reader = BufReader::new(File::open(dir.join("pqcode.bin"))?);
        let codes = CodeMatrix::deserialize_from(reader)?;

        Ok(Self {
            num_partitions,
            pq,
            sub_codewords,
            tables,
            codes,
        })
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn pq(&self) -> &ProductQuantizer {
        &self.pq
    }

    fn make_keygens(&self, query: &[f32]) -> Vec<KeyGenerator> {
        assert_eq!(query.len(), self.pq.dim());
        let each_dim = query.len() / self.num_partitions;
        (0..self.num_partitions)
            .map(|t| {
                KeyGenerator::new(
                    &query[t * each_dim..(t + 1) * each_dim],
                    &self.sub_codewords[t],
                )
            })
            .collect()
    }
}

/// Splits codewords into T contiguous runs of M / T sub-spaces.
fn split_codewords(codewords: &Codewords, num_partitions: usize) -> Vec<Codewords> {
    let each_m = codewords.len() / num_partitions;
    (0..num_partitions)
        .map(|t| codewords[t * each_m..(t + 1) * each_m].to_vec())
        .collect()
}
