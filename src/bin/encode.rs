use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use pqtable_rs::pq::{self, ProductQuantizer};
use pqtable_rs::utils::{VecsFormat, VecsReader};
use pqtable_rs::CodeMatrix;

/// Encodes base vectors into PQ codes with a learned codebook.
///
/// The input is streamed and encoded chunk by chunk in parallel, so the
/// memory consumption stays at one chunk of raw vectors plus the codes.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// The path of the base vectors (.fvecs or .bvecs)
    #[clap(short, long, value_parser)]
    input_file: PathBuf,

    /// The path of the learned codebook
    #[clap(short, long, value_parser)]
    #[arg(default_value = "codeword.txt")]
    codeword_file: PathBuf,

    /// The path of the output codes
    #[clap(short, long, value_parser)]
    #[arg(default_value = "codes.bin")]
    output_file: PathBuf,

    /// The number of vectors encoded per chunk
    #[clap(short, long, value_parser)]
    #[arg(default_value_t = 1_000_000)]
    buffer_size: usize,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let reader = BufReader::new(File::open(&args.codeword_file)?);
    let pq = ProductQuantizer::new(pq::read_codewords(reader)?)?;

    let format = VecsFormat::from_ext(
        args.input_file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(""),
    )?;
    let reader = VecsReader::new(BufReader::new(File::open(&args.input_file)?), format);

    let mut codes = CodeMatrix::new(0, pq.num_subspaces());
    let mut buffer = Vec::with_capacity(args.buffer_size);

    for vec in reader {
        buffer.push(vec?);
        if buffer.len() == args.buffer_size {
            append_encoded(&pq, &buffer, &mut codes);
            buffer.clear();
            info!("{} vectors are encoded in total", codes.num_rows());
        }
    }
    if !buffer.is_empty() {
        append_encoded(&pq, &buffer, &mut codes);
    }
    println!("Encoded {} vectors", codes.num_rows());

    let writer = BufWriter::new(File::create(&args.output_file)?);
    codes.serialize_into(writer)?;
    println!("Wrote the codes to {}", args.output_file.display());

    Ok(())
}

fn append_encoded(pq: &ProductQuantizer, buffer: &[Vec<f32>], codes: &mut CodeMatrix) {
    let chunk = pq.encode_batch(buffer);
    for n in 0..chunk.num_rows() {
        codes.push_row(chunk.row(n));
    }
}
