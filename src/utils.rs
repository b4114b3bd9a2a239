//! Readers and writers for the common vector file formats.
//!
//! An `.fvecs` file is a concatenation of `(d: i32 LE, d x f32 LE)`
//! records; a `.bvecs` file stores `(d: i32 LE, d x u8)` records whose
//! bytes are promoted to `f32` on read.

use anyhow::{anyhow, Result};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::pq::Score;

/// The record layout of a vector file.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VecsFormat {
    Fvecs,
    Bvecs,
}

impl VecsFormat {
    /// Maps a file extension, `"fvecs"` or `"bvecs"`, to the format.
    ///
    /// # Errors
    ///
    /// `anyhow::Error` will be returned for any other extension.
    pub fn from_ext(ext: &str) -> Result<Self> {
        match ext {
            "fvecs" => Ok(Self::Fvecs),
            "bvecs" => Ok(Self::Bvecs),
            _ => Err(anyhow!("strange ext type: {}", ext)),
        }
    }
}

/// Streaming reader of vector records. The iterator yields one vector per
/// record and simply ends at end of file; a record cut short mid-way is an
/// error.
///
/// # Examples
///
/// ```
/// use pqtable_rs::utils::{VecsFormat, VecsReader};
///
/// let mut data = vec![];
/// pqtable_rs::utils::write_fvecs(&mut data, &[vec![0.5, 1.5]]).unwrap();
///
/// let reader = VecsReader::new(&data[..], VecsFormat::Fvecs);
/// let vecs: Vec<_> = reader.collect::<anyhow::Result<_>>().unwrap();
/// assert_eq!(vecs, vec![vec![0.5, 1.5]]);
/// ```
pub struct VecsReader<R> {
    reader: R,
    format: VecsFormat,
}

impl VecsReader<BufReader<File>> {
    /// Opens a vector file, deducing the format from its extension.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| anyhow!("cannot tell the format of {}", path.display()))?;
        let format = VecsFormat::from_ext(ext)?;
        Ok(Self::new(BufReader::new(File::open(path)?), format))
    }
}

impl<R: std::io::Read> VecsReader<R> {
    pub fn new(reader: R, format: VecsFormat) -> Self {
        Self { reader, format }
    }

    fn read_record(&mut self) -> Result<Option<Vec<f32>>> {
        let dim = match self.reader.read_i32::<LittleEndian>() {
            Ok(dim) => dim,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if dim <= 0 {
            return Err(anyhow!("broken record header: d = {}", dim));
        }

        let mut vec = Vec::with_capacity(dim as usize);
        match self.format {
            VecsFormat::Fvecs => {
                for _ in 0..dim {
                    vec.push(self.reader.read_f32::<LittleEndian>()?);
                }
            }
            VecsFormat::Bvecs => {
                let mut buf = vec![0; dim as usize];
                self.reader.read_exact(&mut buf)?;
                vec.extend(buf.iter().map(|&b| f32::from(b)));
            }
        }
        Ok(Some(vec))
    }
}

impl<R: std::io::Read> Iterator for VecsReader<R> {
    type Item = Result<Vec<f32>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

/// Reads the first `top_n` vectors of a file, or all of them when `top_n`
/// is `None`.
pub fn read_top_n<P: AsRef<Path>>(
    path: P,
    format: VecsFormat,
    top_n: Option<usize>,
) -> Result<Vec<Vec<f32>>> {
    let reader = VecsReader::new(BufReader::new(File::open(path)?), format);
    let mut vecs = Vec::new();
    for vec in reader {
        if top_n.map_or(false, |n| n <= vecs.len()) {
            break;
        }
        vecs.push(vec?);
    }
    Ok(vecs)
}

/// Writes vectors as `.fvecs` records.
pub fn write_fvecs<W: std::io::Write>(mut writer: W, vecs: &[Vec<f32>]) -> Result<()> {
    for vec in vecs {
        writer.write_i32::<LittleEndian>(vec.len() as i32)?;
        for &v in vec {
            writer.write_f32::<LittleEndian>(v)?;
        }
    }
    Ok(())
}

/// Writes search results as text: the number of queries, then the top-k,
/// then one `id,dist,` line per query.
pub fn write_scores<W: std::io::Write>(mut writer: W, scores: &[Vec<Score>]) -> Result<()> {
    assert!(!scores.is_empty());

    writeln!(writer, "{}", scores.len())?;
    writeln!(writer, "{}", scores[0].len())?;
    for ranked in scores {
        for (id, dist) in ranked {
            write!(writer, "{},{},", id, dist)?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

/// Writes search results into a file.
pub fn write_scores_to<P: AsRef<Path>>(path: P, scores: &[Vec<Score>]) -> Result<()> {
    write_scores(BufWriter::new(File::create(path)?), scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};

    #[test]
    fn fvecs_roundtrip_works() {
        let vecs: Vec<Vec<f32>> = (0..10)
            .map(|n| (0..4).map(|d| (n * 4 + d) as f32 * 0.5).collect())
            .collect();

        let mut data = vec![];
        write_fvecs(&mut data, &vecs).unwrap();
        assert_eq!(data.len(), 10 * (4 + 4 * 4));

        let read: Vec<Vec<f32>> = VecsReader::new(&data[..], VecsFormat::Fvecs)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read, vecs);

        // Re-encoding reproduces the bytes exactly.
        let mut again = vec![];
        write_fvecs(&mut again, &read).unwrap();
        assert_eq!(again, data);
    }

    #[test]
    fn bvecs_are_promoted_to_floats() {
        let mut data = vec![];
        data.write_i32::<LittleEndian>(3).unwrap();
        data.extend_from_slice(&[0, 128, 255]);
        data.write_i32::<LittleEndian>(3).unwrap();
        data.extend_from_slice(&[1, 2, 3]);

        let read: Vec<Vec<f32>> = VecsReader::new(&data[..], VecsFormat::Bvecs)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read, vec![vec![0.0, 128.0, 255.0], vec![1.0, 2.0, 3.0]]);
    }

    #[test]
    fn truncated_records_are_errors() {
        let mut data = vec![];
        data.write_i32::<LittleEndian>(4).unwrap();
        data.write_f32::<LittleEndian>(1.0).unwrap(); // three floats missing

        let result: Result<Vec<Vec<f32>>> =
            VecsReader::new(&data[..], VecsFormat::Fvecs).collect();
        assert!(result.is_err());
    }

    #[test]
    fn score_file_layout_is_stable() {
        let scores = vec![
            vec![(3_u32, 0.5_f32), (1, 1.5)],
            vec![(2, 0.25), (0, 2.0)],
        ];

        let mut data = vec![];
        write_scores(&mut data, &scores).unwrap();
        let text = String::from_utf8(data).unwrap();
        assert_eq!(text, "2\n2\n3,0.5,1,1.5,\n2,0.25,0,2,\n");
    }
}
