//! A dense matrix of PQ codes backed by a single contiguous buffer.

use anyhow::{anyhow, Result};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// A matrix of N PQ codes, each of M bytes, stored row-major in one long
/// byte array. Row access is O(1) and the memory consumption is the ideal
/// `N * M` bytes plus an 8-byte header on disk, which matters when N is on
/// the order of 10^9.
#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct CodeMatrix {
    num_rows: usize,
    num_cols: usize,
    data: Vec<u8>,
}

impl CodeMatrix {
    /// Creates a zero-filled matrix of `num_rows` codes of `num_cols` bytes.
    pub fn new(num_rows: usize, num_cols: usize) -> Self {
        Self {
            num_rows,
            num_cols,
            data: vec![0; num_rows * num_cols],
        }
    }

    /// Builds a matrix from explicit code rows.
    ///
    /// # Panics
    ///
    /// Panics if the rows have unequal lengths.
    pub fn from_rows(rows: &[Vec<u8>]) -> Self {
        if rows.is_empty() {
            return Self::default();
        }
        let num_cols = rows[0].len();
        let mut mat = Self::new(rows.len(), num_cols);
        for (n, row) in rows.iter().enumerate() {
            mat.set_row(n, row);
        }
        mat
    }

    /// Resizes the matrix. The flat buffer is kept, so existing bytes stay
    /// in place and any new area is zero-filled.
    pub fn resize(&mut self, num_rows: usize, num_cols: usize) {
        self.num_rows = num_rows;
        self.num_cols = num_cols;
        self.data.resize(num_rows * num_cols, 0);
    }

    /// Gets the `d`-th byte of the `n`-th code.
    #[inline]
    pub fn get(&self, n: usize, d: usize) -> u8 {
        debug_assert!(n < self.num_rows && d < self.num_cols);
        self.data[n * self.num_cols + d]
    }

    /// Gets the `n`-th code.
    #[inline]
    pub fn row(&self, n: usize) -> &[u8] {
        debug_assert!(n < self.num_rows);
        &self.data[n * self.num_cols..(n + 1) * self.num_cols]
    }

    /// Overwrites the `n`-th code.
    pub fn set_row(&mut self, n: usize, code: &[u8]) {
        assert!(n < self.num_rows);
        assert_eq!(code.len(), self.num_cols);
        self.data[n * self.num_cols..(n + 1) * self.num_cols].copy_from_slice(code);
    }

    /// Appends one code, growing the matrix by a row.
    pub fn push_row(&mut self, code: &[u8]) {
        assert_eq!(code.len(), self.num_cols);
        self.data.extend_from_slice(code);
        self.num_rows += 1;
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// The underlying row-major buffer. Used by the unchecked asymmetric
    /// distance fast path.
    #[inline]
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes the matrix as `N: i32 LE`, `M: i32 LE`, then `N * M` raw
    /// bytes.
    pub fn serialize_into<W: std::io::Write>(&self, mut writer: W) -> Result<()> {
        writer.write_i32::<LittleEndian>(self.num_rows as i32)?;
        writer.write_i32::<LittleEndian>(self.num_cols as i32)?;
        writer.write_all(&self.data)?;
        Ok(())
    }

    /// Deserializes a whole matrix written by [`CodeMatrix::serialize_into`].
    pub fn deserialize_from<R: std::io::Read>(reader: R) -> Result<Self> {
        Self::deserialize_top_n(reader, None)
    }

    /// Deserializes only the first `top_n` codes, or all of them when
    /// `top_n` is `None`. Useful to load a prefix of a billion-scale file.
    pub fn deserialize_top_n<R: std::io::Read>(mut reader: R, top_n: Option<usize>) -> Result<Self> {
        let num_rows = reader.read_i32::<LittleEndian>()?;
        let num_cols = reader.read_i32::<LittleEndian>()?;
        if num_rows < 0 || num_cols < 0 {
            return Err(anyhow!(
                "broken code matrix header: N = {}, M = {}",
                num_rows,
                num_cols
            ));
        }

        let num_rows = match top_n {
            Some(n) => {
                if (num_rows as usize) < n {
                    return Err(anyhow!(
                        "requested {} codes but the file stores only {}",
                        n,
                        num_rows
                    ));
                }
                n
            }
            None => num_rows as usize,
        };

        let mut data = vec![0; num_rows * num_cols as usize];
        reader.read_exact(&mut data)?;

        Ok(Self {
            num_rows,
            num_cols: num_cols as usize,
            data,
        })
    }
}
