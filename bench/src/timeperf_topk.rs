//! Provides the benchmark of top-K search for PQTable and exhaustive
//! asymmetric-distance scan.
use std::time;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use pqtable_rs::{pq, PqTable, ProductQuantizer};

const SIZES: [usize; 3] = [10_000, 100_000, 1_000_000];
const TOPKS: [usize; 3] = [1, 10, 100];
const DIM: usize = 16;
const NUM_SUBSPACES: usize = 4;
const NUM_TRAINS: usize = 10_000;
const NUM_QUERIES: usize = 100;

fn main() {
    #[cfg(debug_assertions)]
    println!("Debugging enabled");

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let base = gen_gaussian_vecs(&mut rng, SIZES[SIZES.len() - 1]);
    let queries = gen_gaussian_vecs(&mut rng, NUM_QUERIES);

    println!("Training a product quantizer on {} vectors", NUM_TRAINS);
    let pq = ProductQuantizer::learn(&base[0..NUM_TRAINS], NUM_SUBSPACES, 256).unwrap();

    for &size in &SIZES {
        println!("--- N={} ---", size);

        let codes = pq.encode_batch(&base[0..size]);

        let ins = time::Instant::now();
        let table = PqTable::new(pq.codewords().clone(), codes.clone()).unwrap();
        let elapsed_sec = ins.elapsed().as_secs_f64();
        println!("Constr time: {} sec (T={})", elapsed_sec, table.num_partitions());

        for &topk in &TOPKS {
            let ins = time::Instant::now();
            for query in &queries {
                let scores = table.query_topk(query, topk);
                assert_eq!(scores.len(), topk);
            }
            let elapsed_ms = ins.elapsed().as_millis() as f64;
            println!(
                "PQTable (K={}):\t{} ms/query",
                topk,
                elapsed_ms / queries.len() as f64
            );
        }

        let ins = time::Instant::now();
        for query in &queries {
            let dists = pq.ad_batch(&pq.dtable(query), &codes);
            let scores = pq::sort_scores(&dists, Some(TOPKS[TOPKS.len() - 1]));
            assert_eq!(scores.len(), TOPKS[TOPKS.len() - 1]);
        }
        let elapsed_ms = ins.elapsed().as_millis() as f64;
        println!(
            "ExhaustiveScan:\t{} ms/query",
            elapsed_ms / queries.len() as f64
        );
    }
}

fn gen_gaussian_vecs(rng: &mut StdRng, size: usize) -> Vec<Vec<f32>> {
    (0..size)
        .map(|_| (0..DIM).map(|_| rng.sample(StandardNormal)).collect())
        .collect()
}
