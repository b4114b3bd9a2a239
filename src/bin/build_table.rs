use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use pqtable_rs::pq;
use pqtable_rs::{CodeMatrix, PqTable};

/// Builds a PQTable from a codebook and encoded codes and writes it into a
/// directory.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// The path of the learned codebook
    #[clap(short, long, value_parser)]
    #[arg(default_value = "codeword.txt")]
    codeword_file: PathBuf,

    /// The path of the encoded codes
    #[clap(short, long, value_parser)]
    #[arg(default_value = "codes.bin")]
    input_file: PathBuf,

    /// The output table directory
    #[clap(short, long, value_parser)]
    #[arg(default_value = "pqtable")]
    output_dir: PathBuf,

    /// The number of table partitions; selected automatically if omitted
    #[clap(short, long, value_parser)]
    num_partitions: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let reader = BufReader::new(File::open(&args.codeword_file)?);
    let codewords = pq::read_codewords(reader)?;

    let reader = BufReader::new(File::open(&args.input_file)?);
    let codes = CodeMatrix::deserialize_from(reader)?;
    println!("Read {} codes of {} bytes", codes.num_rows(), codes.num_cols());

    let table = match args.num_partitions {
        Some(t) => PqTable::with_t(codewords, codes, t)?,
        None => PqTable::new(codewords, codes)?,
    };
    println!("Built a table with T = {}", table.num_partitions());

    table.write(&args.output_dir)?;
    println!("Wrote the table to {}", args.output_dir.display());

    Ok(())
}
