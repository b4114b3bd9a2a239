use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use pqtable_rs::pq::{self, ProductQuantizer};
use pqtable_rs::utils::{self, VecsFormat};

/// Learns a PQ codebook from training vectors and writes it as a text file.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// The path of the training vectors (.fvecs or .bvecs)
    #[clap(short, long, value_parser)]
    input_file: PathBuf,

    /// The path of the output codebook
    #[clap(short, long, value_parser)]
    #[arg(default_value = "codeword.txt")]
    output_file: PathBuf,

    /// The number of sub-spaces a vector is split into
    #[clap(short, long, value_parser)]
    #[arg(default_value_t = 4)]
    m: usize,

    /// The number of centroids per sub-space
    #[clap(short, long, value_parser)]
    #[arg(default_value_t = 256)]
    ks: usize,

    /// Learn from only the first n vectors
    #[clap(short, long, value_parser)]
    top_n: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let format = VecsFormat::from_ext(
        args.input_file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(""),
    )?;
    let vecs = utils::read_top_n(&args.input_file, format, args.top_n)?;
    if vecs.is_empty() {
        return Err(anyhow!("{} holds no vectors", args.input_file.display()));
    }
    println!("Read {} vectors of {} dims", vecs.len(), vecs[0].len());

    let pq = ProductQuantizer::learn(&vecs, args.m, args.ks)?;

    let writer = BufWriter::new(File::create(&args.output_file)?);
    pq::write_codewords(writer, pq.codewords())?;
    println!("Wrote the codebook to {}", args.output_file.display());

    Ok(())
}
