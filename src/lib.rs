//! # pqtable-rs
//!
//! Rust implementation of PQTable, a non-exhaustive nearest neighbor search for
//! product-quantized codes using hash tables, described in the paper
//! > Matsui, Yamasaki, and Aizawa, **PQTable: Non-exhaustive Fast Search for
//! > Product-quantized Codes using Hash Tables**, *IEEE Transactions on Multimedia*,
//! > 20(7):1809–1822, 2018.
//!
//! ## Features
//! - **Two types of neighbor searches:** pqtable-rs provides the two search operations:
//!     - *Top-1 search* finds the base vector closest to a given query vector.
//!     - *Top-K search* finds the top-K base vectors that are closest to a given query vector.
//! - **Fast and memory-efficient implementation:** Candidate codes are enumerated
//!   nearest-first and probed in sparse hash tables, so a query touches only a tiny
//!   part of a billion-scale database.
//! - **Parameter free:** pqtable-rs automatically sets an optimal number of table
//!   partitions depending on a given database (although you can set this manually).
//!
//! ## Example
//!
//! ```rust
//! use pqtable_rs::{PqTable, ProductQuantizer};
//!
//! // Database of vectors (used as the training set as well here)
//! let base: Vec<Vec<f32>> = vec![
//!     vec![0.0, 0.0],
//!     vec![0.0, 1.0],
//!     vec![1.0, 0.0],
//!     vec![1.0, 1.0],
//! ];
//!
//! // Learn a product quantizer of M=2 sub-spaces with Ks=2 centroids each
//! let pq = ProductQuantizer::learn(&base, 2, 2).unwrap();
//!
//! // Encode the database into PQ codes
//! let codes = pq.encode_batch(&base);
//!
//! // Construct the table (the number of partitions is selected automatically)
//! let table = PqTable::new(pq.codewords().clone(), codes).unwrap();
//!
//! // Find the nearest base vector
//! let (id, dist) = table.query_top1(&[0.9, 0.1]);
//! assert_eq!(id, 2); // [1.0, 0.0]
//! assert!(dist < 0.5);
//!
//! // Find the top-3 nearest base vectors
//! let scores = table.query_topk(&[0.9, 0.1], 3);
//! assert_eq!(scores[0].0, 2);
//! ```
pub mod codekey;
pub mod codes;
pub mod keygen;
pub mod kmeans;
pub mod pq;
pub mod sparsehash;
pub mod table;
pub mod utils;

pub use codes::CodeMatrix;
pub use pq::ProductQuantizer;
pub use table::{MultiTable, PqTable, SingleTable};
