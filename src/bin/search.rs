use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, Result};
use clap::Parser;

use pqtable_rs::utils::{self, VecsFormat};
use pqtable_rs::PqTable;

/// Runs top-k searches over a saved PQTable and writes the ranked scores.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// The table directory written by build_table
    #[clap(short, long, value_parser)]
    #[arg(default_value = "pqtable")]
    table_dir: PathBuf,

    /// The path of the query vectors (.fvecs or .bvecs)
    #[clap(short, long, value_parser)]
    query_file: PathBuf,

    /// The path of the output scores
    #[clap(short, long, value_parser)]
    #[arg(default_value = "score.txt")]
    output_file: PathBuf,

    /// How many neighbors to report per query
    #[clap(short = 'k', long, value_parser)]
    #[arg(default_value_t = 1)]
    top_k: usize,

    /// Search with only the first n queries
    #[clap(short, long, value_parser)]
    num_queries: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let format = VecsFormat::from_ext(
        args.query_file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(""),
    )?;
    let queries = utils::read_top_n(&args.query_file, format, args.num_queries)?;
    if queries.is_empty() {
        return Err(anyhow!("{} holds no vectors", args.query_file.display()));
    }
    println!("Read {} queries", queries.len());

    let table = PqTable::read(&args.table_dir)?;
    println!("Read a table with T = {}", table.num_partitions());

    let ins = Instant::now();
    let scores: Vec<_> = queries
        .iter()
        .map(|query| table.query_topk(query, args.top_k))
        .collect();
    let elapsed_ms = ins.elapsed().as_millis() as f64;
    println!("{} ms/query", elapsed_ms / queries.len() as f64);

    utils::write_scores_to(&args.output_file, &scores)?;
    println!("Wrote the scores to {}", args.output_file.display());

    Ok(())
}
