//! Product quantizer: codebook learning, encoding, decoding, and
//! asymmetric distance computation.
//!
//! A `D`-dimensional vector is split into `M` sub-vectors of `Ds = D / M`
//! dimensions, and each sub-vector is replaced by the id of its nearest
//! centroid among `Ks` learned per-sub-space centroids. A vector is thereby
//! encoded into `M` bytes when `Ks <= 256`.

use anyhow::{anyhow, Result};

use log::info;

use rayon::prelude::*;

use crate::codes::CodeMatrix;
use crate::kmeans;

/// Codewords indexed as `[m][ks][ds]`: the `ds`-th element of the `ks`-th
/// centroid of the `m`-th sub-space.
pub type Codewords = Vec<Vec<Vec<f32>>>;

/// Per-query table of squared distances, indexed as `[m][ks]`.
pub type DistanceTable = Vec<Vec<f32>>;

/// A search result: base-vector id and squared distance.
pub type Score = (u32, f32);

const KMEANS_SEED: u64 = 20180731;

/// A product quantizer built from codewords.
///
/// # Examples
///
/// ```
/// use pqtable_rs::ProductQuantizer;
///
/// let vecs: Vec<Vec<f32>> = vec![
///     vec![0.0, 0.0],
///     vec![0.0, 1.0],
///     vec![1.0, 0.0],
///     vec![1.0, 1.0],
/// ];
///
/// let pq = ProductQuantizer::learn(&vecs, 2, 2).unwrap();
/// let code = pq.encode(&vecs[2]);
/// assert_eq!(pq.decode(&code), vecs[2]);
/// ```
#[derive(Clone, PartialEq, Debug)]
pub struct ProductQuantizer {
    num_subspaces: usize, // M
    num_centroids: usize, // Ks
    sub_dim: usize,       // Ds
    codewords: Codewords,
}

impl ProductQuantizer {
    /// Wraps existing codewords.
    ///
    /// # Errors
    ///
    /// `anyhow::Error` will be returned when the codewords are empty or not
    /// rectangular.
    pub fn new(codewords: Codewords) -> Result<Self> {
        if codewords.is_empty() || codewords[0].is_empty() || codewords[0][0].is_empty() {
            return Err(anyhow!("codewords must not be empty"));
        }

        let num_centroids = codewords[0].len();
        let sub_dim = codewords[0][0].len();
        for sub in &codewords {
            if sub.len() != num_centroids || sub.iter().any(|c| c.len() != sub_dim) {
                return Err(anyhow!("codewords must be rectangular"));
            }
        }
        if 256 < num_centroids {
            return Err(anyhow!(
                "the number of centroids {} must be no more than 256",
                num_centroids
            ));
        }

        Ok(Self {
            num_subspaces: codewords.len(),
            num_centroids,
            sub_dim,
            codewords,
        })
    }

    /// Learns codewords from training vectors: for each of the
    /// `num_subspaces` sub-spaces, `num_centroids` cluster centers are
    /// computed with k-means. The learning is deterministic, so writing and
    /// re-learning the same training set reproduces the same codebook.
    ///
    /// # Errors
    ///
    /// `anyhow::Error` will be returned when
    ///
    /// - the number of vectors is not more than `num_centroids`, or
    /// - the dimensionality is not divisible by `num_subspaces`.
    pub fn learn(vecs: &[Vec<f32>], num_subspaces: usize, num_centroids: usize) -> Result<Self> {
        if vecs.len() <= num_centroids {
            return Err(anyhow!(
                "the number of training vectors {} must be more than Ks = {}",
                vecs.len(),
                num_centroids
            ));
        }
        let dim = vecs[0].len();
        if num_subspaces == 0 || dim % num_subspaces != 0 {
            return Err(anyhow!(
                "the dimensionality {} must be divisible by M = {}",
                dim,
                num_subspaces
            ));
        }

        let sub_dim = dim / num_subspaces;
        let mut codewords = Vec::with_capacity(num_subspaces);

        for m in 0..num_subspaces {
            info!("learning sub-codebook {} / {}", m + 1, num_subspaces);
            let sub_vecs: Vec<Vec<f32>> = vecs
                .iter()
                .map(|v| v[m * sub_dim..(m + 1) * sub_dim].to_vec())
                .collect();
            codewords.push(kmeans::run(
                &sub_vecs,
                num_centroids,
                KMEANS_SEED.wrapping_add(m as u64),
            )?);
        }

        Self::new(codewords)
    }

    /// Encodes a vector into its `M`-byte PQ code. For each sub-space the
    /// nearest centroid is chosen, ties broken by the lowest centroid id.
    pub fn encode(&self, vec: &[f32]) -> Vec<u8> {
        assert_eq!(vec.len(), self.dim());

        let mut code = Vec::with_capacity(self.num_subspaces);
        for m in 0..self.num_subspaces {
            let sub = &vec[m * self.sub_dim..(m + 1) * self.sub_dim];
            let mut min_ks = 0;
            let mut min_dist = f32::INFINITY;
            for (ks, centroid) in self.codewords[m].iter().enumerate() {
                let dist = kmeans::l2sq(sub, centroid);
                if dist < min_dist {
                    min_dist = dist;
                    min_ks = ks;
                }
            }
            code.push(min_ks as u8);
        }
        code
    }

    /// Encodes vectors in parallel into a code matrix of shape
    /// `(vecs.len(), M)`.
    pub fn encode_batch(&self, vecs: &[Vec<f32>]) -> CodeMatrix {
        if vecs.is_empty() {
            return CodeMatrix::new(0, self.num_subspaces);
        }
        let rows: Vec<Vec<u8>> = vecs.par_iter().map(|v| self.encode(v)).collect();
        CodeMatrix::from_rows(&rows)
    }

    /// Reconstructs the vector a code stands for by concatenating the
    /// indexed centroids.
    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        assert_eq!(code.len(), self.num_subspaces);

        let mut vec = Vec::with_capacity(self.dim());
        for (m, &ks) in code.iter().enumerate() {
            debug_assert!((ks as usize) < self.num_centroids);
            vec.extend_from_slice(&self.codewords[m][ks as usize]);
        }
        vec
    }

    /// Row-wise [`ProductQuantizer::decode`].
    pub fn decode_batch(&self, codes: &CodeMatrix) -> Vec<Vec<f32>> {
        (0..codes.num_rows()).map(|n| self.decode(codes.row(n))).collect()
    }

    /// Computes the `M x Ks` table of squared distances between the query
    /// sub-vectors and every centroid.
    pub fn dtable(&self, query: &[f32]) -> DistanceTable {
        assert_eq!(query.len(), self.dim());

        (0..self.num_subspaces)
            .map(|m| {
                let sub = &query[m * self.sub_dim..(m + 1) * self.sub_dim];
                self.codewords[m].iter().map(|c| kmeans::l2sq(sub, c)).collect()
            })
            .collect()
    }

    /// Asymmetric distance between the query a distance table was built
    /// from and a single code.
    #[inline]
    pub fn ad(&self, dtable: &DistanceTable, code: &[u8]) -> f32 {
        debug_assert_eq!(code.len(), self.num_subspaces);
        code.iter()
            .enumerate()
            .map(|(m, &ks)| dtable[m][ks as usize])
            .sum()
    }

    /// Asymmetric distances to every code in the matrix.
    pub fn ad_batch(&self, dtable: &DistanceTable, codes: &CodeMatrix) -> Vec<f32> {
        (0..codes.num_rows()).map(|n| self.ad_at(dtable, codes, n)).collect()
    }

    /// Asymmetric distance to the `n`-th code, addressing the raw buffer
    /// directly.
    #[inline]
    pub fn ad_at(&self, dtable: &DistanceTable, codes: &CodeMatrix, n: usize) -> f32 {
        let row = &codes.raw_data()[n * self.num_subspaces..(n + 1) * self.num_subspaces];
        let mut dist = 0.0;
        for (m, &ks) in row.iter().enumerate() {
            dist += dtable[m][ks as usize];
        }
        dist
    }

    /// The original dimensionality `M * Ds`.
    pub fn dim(&self) -> usize {
        self.num_subspaces * self.sub_dim
    }

    pub fn num_subspaces(&self) -> usize {
        self.num_subspaces
    }

    pub fn num_centroids(&self) -> usize {
        self.num_centroids
    }

    pub fn sub_dim(&self) -> usize {
        self.sub_dim
    }

    pub fn codewords(&self) -> &Codewords {
        &self.codewords
    }
}

/// Sorts `(id, dist)` pairs of the given distances by ascending distance,
/// keeping the `top_k` smallest. `None` sorts all of them.
pub fn sort_scores(dists: &[f32], top_k: Option<usize>) -> Vec<Score> {
    let top_k = top_k.unwrap_or(dists.len());
    let mut scores: Vec<Score> = dists
        .iter()
        .enumerate()
        .map(|(i, &d)| (i as u32, d))
        .collect();
    partial_sort_scores(&mut scores, top_k);
    scores
}

/// Partially sorts scores so that the `top_k` smallest come first in
/// ascending order, then truncates to `top_k`.
pub(crate) fn partial_sort_scores(scores: &mut Vec<Score>, top_k: usize) {
    let top_k = top_k.min(scores.len());
    if top_k < scores.len() {
        scores.select_nth_unstable_by(top_k, |a, b| a.1.total_cmp(&b.1));
        scores.truncate(top_k);
    }
    scores.sort_by(|a, b| a.1.total_cmp(&b.1));
}

/// Writes codewords in the text codebook format: a `M,Ks,Ds` header line,
/// then per sub-space a `m:` line followed by `Ks` comma-separated centroid
/// lines.
pub fn write_codewords<W: std::io::Write>(mut writer: W, codewords: &Codewords) -> Result<()> {
    let num_subspaces = codewords.len();
    let num_centroids = codewords[0].len();
    let sub_dim = codewords[0][0].len();

    writeln!(writer, "{},{},{}", num_subspaces, num_centroids, sub_dim)?;
    for (m, sub) in codewords.iter().enumerate() {
        writeln!(writer, "{}:", m)?;
        for centroid in sub {
            for v in centroid {
                write!(writer, "{},", v)?;
            }
            writeln!(writer)?;
        }
    }
    Ok(())
}

/// Reads codewords written by [`write_codewords`].
pub fn read_codewords<R: std::io::BufRead>(reader: R) -> Result<Codewords> {
    let mut lines = reader.lines();
    let header = lines
        .next()
        .ok_or_else(|| anyhow!("empty codebook file"))??;
    let fields: Vec<usize> = header
        .split(',')
        .map(|s| s.trim().parse())
        .collect::<std::result::Result<_, _>>()?;
    if fields.len() != 3 {
        return Err(anyhow!("broken codebook header: {}", header));
    }
    let (num_subspaces, num_centroids, sub_dim) = (fields[0], fields[1], fields[2]);

    let mut codewords = Vec::with_capacity(num_subspaces);
    for m in 0..num_subspaces {
        let marker = lines
            .next()
            .ok_or_else(|| anyhow!("truncated codebook file"))??;
        if marker.trim() != format!("{}:", m) {
            return Err(anyhow!("expected sub-space marker {}: but got {}", m, marker));
        }

        let mut sub = Vec::with_capacity(num_centroids);
        for _ in 0..num_centroids {
            let line = lines
                .next()
                .ok_or_else(|| anyhow!("truncated codebook file"))??;
            let centroid: Vec<f32> = line
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().parse())
                .collect::<std::result::Result<_, _>>()?;
            if centroid.len() != sub_dim {
                return Err(anyhow!(
                    "a centroid has {} dims but the header says {}",
                    centroid.len(),
                    sub_dim
                ));
            }
            sub.push(centroid);
        }
        codewords.push(sub);
    }
    Ok(codewords)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    pub fn random_vecs(size: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..size)
            .map(|_| (0..dim).map(|_| rng.gen::<f32>() * 10.0).collect())
            .collect()
    }

    #[test]
    fn encode_minimizes_dtable() {
        let vecs = random_vecs(300, 4, 1);
        let pq = ProductQuantizer::learn(&vecs, 2, 16).unwrap();

        for vec in vecs.iter().step_by(17) {
            let code = pq.encode(vec);
            let dtable = pq.dtable(vec);
            for m in 0..pq.num_subspaces() {
                let min = dtable[m]
                    .iter()
                    .cloned()
                    .fold(f32::INFINITY, f32::min);
                assert_eq!(dtable[m][code[m] as usize], min);
            }
        }
    }

    #[test]
    fn decode_of_a_centroid_is_exact() {
        let vecs = random_vecs(100, 4, 2);
        let pq = ProductQuantizer::learn(&vecs, 2, 8).unwrap();

        for ks in 0..pq.num_centroids() {
            let code = vec![ks as u8; pq.num_subspaces()];
            let vec = pq.decode(&code);
            assert_eq!(pq.encode(&vec), code);
            assert_eq!(pq.decode(&pq.encode(&vec)), vec);
        }
    }

    #[test]
    fn ad_matches_decoded_distance() {
        let vecs = random_vecs(200, 8, 3);
        let pq = ProductQuantizer::learn(&vecs, 4, 8).unwrap();
        let codes = pq.encode_batch(&vecs);

        let query = &vecs[0];
        let dtable = pq.dtable(query);
        let dists = pq.ad_batch(&dtable, &codes);

        for n in (0..codes.num_rows()).step_by(13) {
            let code = codes.row(n);
            let expected: f32 = (0..pq.num_subspaces())
                .map(|m| {
                    kmeans::l2sq(
                        &query[m * pq.sub_dim()..(m + 1) * pq.sub_dim()],
                        &pq.codewords()[m][code[m] as usize],
                    )
                })
                .sum();
            assert!((dists[n] - expected).abs() < 1e-5);
            assert_eq!(dists[n], pq.ad(&dtable, code));
            assert_eq!(dists[n], pq.ad_at(&dtable, &codes, n));
        }
    }

    #[test]
    fn batch_encode_matches_single_encode() {
        let vecs = random_vecs(100, 4, 4);
        let pq = ProductQuantizer::learn(&vecs, 2, 8).unwrap();

        let codes = pq.encode_batch(&vecs);
        assert_eq!(codes.num_rows(), vecs.len());
        for (n, vec) in vecs.iter().enumerate() {
            assert_eq!(codes.row(n), &pq.encode(vec)[..]);
        }
    }

    #[test]
    fn learning_is_deterministic() {
        let vecs = random_vecs(200, 4, 5);
        let a = ProductQuantizer::learn(&vecs, 2, 8).unwrap();
        let b = ProductQuantizer::learn(&vecs, 2, 8).unwrap();
        assert_eq!(a.codewords(), b.codewords());
    }

    #[test]
    fn learn_rejects_bad_shapes() {
        let vecs = random_vecs(10, 4, 6);
        assert!(ProductQuantizer::learn(&vecs, 3, 4).is_err()); // 4 % 3 != 0
        assert!(ProductQuantizer::learn(&vecs, 2, 10).is_err()); // too few vecs
    }

    #[test]
    fn sort_scores_works() {
        let dists = vec![5.0, 1.0, 4.0, 2.0, 3.0];

        let all = sort_scores(&dists, None);
        assert_eq!(all, vec![(1, 1.0), (3, 2.0), (4, 3.0), (2, 4.0), (0, 5.0)]);

        let top2 = sort_scores(&dists, Some(2));
        assert_eq!(top2, vec![(1, 1.0), (3, 2.0)]);
    }

    #[test]
    fn codewords_io_works() {
        let vecs = random_vecs(100, 4, 7);
        let pq = ProductQuantizer::learn(&vecs, 2, 8).unwrap();

        let mut data = vec![];
        write_codewords(&mut data, pq.codewords()).unwrap();
        let other = read_codewords(&data[..]).unwrap();

        assert_eq!(pq.codewords(), &other);
    }
}
