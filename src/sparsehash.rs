//! Sparse hash table from packed PQ keys to posting lists of vector ids.
//! Most users do not need to use this module directly.
//!
//! The key space of `2^b` entries is divided into bucket groups of 32
//! consecutive keys. A group stores a 32-bit bitmap of its populated keys
//! and one packed array holding the posting offsets followed by the posting
//! values, so an empty group costs no heap at all. With `N` inserted ids
//! the table takes `O(N)` posting words plus `2^(b-5)` group headers, which
//! is what makes `b = 32` feasible for billion-scale databases.

use anyhow::{anyhow, Result};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use std::sync::atomic::{AtomicU32, Ordering};

const GROUP_SIZE: usize = 32;
const COUNT_FLAG: u32 = u32::MAX;

static RESIZE_FACTOR: AtomicU32 = AtomicU32::new(0x3f8c_cccd); // 1.1f32
static RESIZE_ADD: AtomicU32 = AtomicU32::new(0x4000_0000); // 2.0f32

/// Sets the process-wide growth policy of the packed posting arrays: a full
/// array grows to `capacity * factor + add`. Call this before any table is
/// built; tables built earlier keep their already-allocated arrays.
pub fn set_resize_policy(factor: f32, add: f32) {
    assert!(1.0 <= factor && 0.0 <= add);
    RESIZE_FACTOR.store(factor.to_bits(), Ordering::Relaxed);
    RESIZE_ADD.store(add.to_bits(), Ordering::Relaxed);
}

fn grown_capacity(capacity: usize) -> usize {
    let factor = f32::from_bits(RESIZE_FACTOR.load(Ordering::Relaxed));
    let add = f32::from_bits(RESIZE_ADD.load(Ordering::Relaxed));
    (capacity as f32 * factor + add).ceil() as usize
}

/// Sparse hash table over keys in `[0, 2^b)` with `b` of 8, 16, or 32.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Table {
    num_bits: usize,
    groups: Vec<Group>,
}

impl Table {
    /// Makes a new table accessible with keys in `[0, 2^num_bits)`.
    ///
    /// # Errors
    ///
    /// `anyhow::Error` will be returned when `num_bits` is not 8, 16, or 32.
    pub fn new(num_bits: usize) -> Result<Self> {
        if !matches!(num_bits, 8 | 16 | 32) {
            return Err(anyhow!("num_bits {} must be 8, 16, or 32", num_bits));
        }

        let num_groups = (1usize << num_bits) / GROUP_SIZE;
        Ok(Self {
            num_bits,
            groups: vec![Group::default(); num_groups],
        })
    }

    /// Returns the posting list of the key, or `None` if nothing has been
    /// inserted under it.
    pub fn access(&self, key: u32) -> Option<&[u32]> {
        debug_assert!((key as usize) < self.len());
        let gpos = key as usize / GROUP_SIZE;
        let gmod = key as usize % GROUP_SIZE;
        self.groups[gpos].access(gmod)
    }

    /// Appends a value to the posting list of the key. Values under one key
    /// keep their insertion order.
    pub fn insert(&mut self, key: u32, dat: u32) {
        debug_assert!((key as usize) < self.len());
        let gpos = key as usize / GROUP_SIZE;
        let gmod = key as usize % GROUP_SIZE;
        self.groups[gpos].insert(gmod, dat);
    }

    /// First half of the bulk building scheme: registers that a value will
    /// be inserted under the key.
    pub fn count_insert(&mut self, key: u32) {
        debug_assert!((key as usize) < self.len());
        let gpos = key as usize / GROUP_SIZE;
        let gmod = key as usize % GROUP_SIZE;
        self.groups[gpos].count_insert(gmod);
    }

    /// Second half of the bulk building scheme: stores a value counted
    /// beforehand with [`Table::count_insert`]. Each group allocates its
    /// exactly-sized array on the first `data_insert`, so bulk building
    /// avoids the incremental growth of [`Table::insert`].
    pub fn data_insert(&mut self, key: u32, dat: u32) {
        debug_assert!((key as usize) < self.len());
        let gpos = key as usize / GROUP_SIZE;
        let gmod = key as usize % GROUP_SIZE;
        self.groups[gpos].data_insert(gmod, dat);
    }

    /// The size of the key space, `2^b`.
    pub fn len(&self) -> usize {
        1 << self.num_bits
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// The number of posting-list entries under the key.
    pub fn posting_len(&self, key: u32) -> usize {
        let gpos = key as usize / GROUP_SIZE;
        let gmod = key as usize % GROUP_SIZE;
        self.groups[gpos].posting_len(gmod)
    }

    /// The number of `u32` words held in the packed group arrays: the
    /// posting values plus one offset word per populated key plus one
    /// boundary word per non-empty group.
    pub fn populated_words(&self) -> usize {
        self.groups.iter().map(|g| g.array.len()).sum()
    }

    /// The total number of stored posting values.
    pub fn num_values(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.present != 0)
            .map(|g| g.array.len() - popcnt(g.present) - 1)
            .sum()
    }

    /// Serializes the table: `b: i32 LE`, the group count as `u64 LE`, then
    /// every non-empty group as its index, bitmap, array length twice (the
    /// second word historically held the capacity and is recorded as the
    /// length), and the array words. A sentinel index equal to the group
    /// count terminates the records.
    pub fn serialize_into<W: std::io::Write>(&self, mut writer: W) -> Result<()> {
        writer.write_i32::<LittleEndian>(self.num_bits as i32)?;
        writer.write_u64::<LittleEndian>(self.groups.len() as u64)?;

        for (idx, group) in self.groups.iter().enumerate() {
            if group.present == 0 {
                continue;
            }
            writer.write_u32::<LittleEndian>(idx as u32)?;
            writer.write_u32::<LittleEndian>(group.present)?;
            writer.write_u32::<LittleEndian>(group.array.len() as u32)?;
            writer.write_u32::<LittleEndian>(group.array.len() as u32)?;
            for &x in &group.array {
                writer.write_u32::<LittleEndian>(x)?;
            }
        }

        writer.write_u32::<LittleEndian>(self.groups.len() as u32)?;
        Ok(())
    }

    /// Deserializes a table written by [`Table::serialize_into`].
    pub fn deserialize_from<R: std::io::Read>(mut reader: R) -> Result<Self> {
        let num_bits = reader.read_i32::<LittleEndian>()?;
        if num_bits < 0 {
            return Err(anyhow!("broken table header: b = {}", num_bits));
        }
        let mut table = Self::new(num_bits as usize)?;

        let num_groups = reader.read_u64::<LittleEndian>()? as usize;
        if num_groups != table.groups.len() {
            return Err(anyhow!(
                "the table stores {} groups but b = {} implies {}",
                num_groups,
                num_bits,
                table.groups.len()
            ));
        }

        loop {
            let idx = reader.read_u32::<LittleEndian>()? as usize;
            if idx == num_groups {
                break;
            }
            if num_groups <= idx {
                return Err(anyhow!("broken group index {}", idx));
            }

            let present = reader.read_u32::<LittleEndian>()?;
            let len = reader.read_u32::<LittleEndian>()? as usize;
            let _capacity = reader.read_u32::<LittleEndian>()?;

            let mut array = vec![0; len];
            for x in array.iter_mut() {
                *x = reader.read_u32::<LittleEndian>()?;
            }
            table.groups[idx] = Group { present, array };
        }

        Ok(table)
    }
}

/// A group of 32 consecutive keys. `array[0..=popcnt(present)]` are the
/// cumulative posting offsets of the populated keys; the posting values are
/// packed behind them.
#[derive(Default, Clone, PartialEq, Eq, Debug)]
struct Group {
    present: u32,
    array: Vec<u32>,
}

impl Group {
    fn access(&self, idx: usize) -> Option<&[u32]> {
        debug_assert!(idx < GROUP_SIZE);

        if !get(self.present, idx) {
            return None;
        }

        let howmany = popcnt_mask(self.present, idx);
        let totones = popcnt(self.present);

        let bpos = totones + 1 + self.array[howmany] as usize;
        let epos = bpos + (self.array[howmany + 1] - self.array[howmany]) as usize;

        Some(&self.array[bpos..epos])
    }

    fn insert(&mut self, idx: usize, dat: u32) {
        debug_assert!(idx < GROUP_SIZE);

        if self.present == 0 {
            self.present = set(self.present, idx);
            self.array = vec![0, 1, dat]; // beg, end, dat
            return;
        }

        // An insert adds at most two words: a new offset and the value.
        if self.array.capacity() < self.array.len() + 2 {
            let grown = grown_capacity(self.array.capacity()).max(self.array.len() + 2);
            self.array.reserve_exact(grown - self.array.len());
        }

        let howmany = popcnt_mask(self.present, idx);

        if !get(self.present, idx) {
            self.array.insert(howmany, self.array[howmany]);
            self.present = set(self.present, idx);
        }

        let totones = popcnt(self.present);
        let position = totones + 1 + self.array[howmany + 1] as usize;
        self.array.insert(position, dat);

        for i in howmany + 1..totones + 1 {
            self.array[i] += 1;
        }
    }

    fn count_insert(&mut self, idx: usize) {
        debug_assert!(idx < GROUP_SIZE);

        if self.present == 0 {
            self.array.push(COUNT_FLAG);
        }

        let howmany = popcnt_mask(self.present, idx);

        if !get(self.present, idx) {
            self.array.insert(howmany + 1, 1);
            self.present = set(self.present, idx);
        } else {
            self.array[howmany + 1] += 1;
        }
    }

    fn data_insert(&mut self, idx: usize, dat: u32) {
        debug_assert!(idx < GROUP_SIZE);
        debug_assert!(get(self.present, idx));

        if self.array[0] == COUNT_FLAG {
            self.allocate_mem_based_on_counts();
        }

        let totones = popcnt(self.present);
        let howmany = popcnt_mask(self.present, idx);

        let offset = self.array[howmany + 1] as usize;
        self.array[totones + 1 + offset] = dat;
        self.array[howmany + 1] += 1;
    }

    /// Turns the counts recorded by `count_insert` into cumulative offsets
    /// and allocates the packed value area in one shot.
    fn allocate_mem_based_on_counts(&mut self) {
        debug_assert_ne!(self.present, 0);
        debug_assert_eq!(self.array[0], COUNT_FLAG);

        let totones = popcnt(self.present);
        debug_assert_eq!(totones + 1, self.array.len());

        self.array[0] = 0;
        for i in 0..totones {
            self.array[i + 1] += self.array[i];
        }

        let new_size = self.array.len() + self.array[totones] as usize;
        self.array.resize(new_size, 0);

        for i in (0..totones).rev() {
            self.array[i + 1] = self.array[i];
        }
    }

    fn posting_len(&self, idx: usize) -> usize {
        debug_assert!(idx < GROUP_SIZE);

        if !get(self.present, idx) {
            0
        } else {
            let howmany = popcnt_mask(self.present, idx);
            (self.array[howmany + 1] - self.array[howmany]) as usize
        }
    }
}

const fn popcnt(x: u32) -> usize {
    x.count_ones() as usize
}

fn popcnt_mask(x: u32, i: usize) -> usize {
    debug_assert!(i < GROUP_SIZE);
    popcnt(x & ((1 << i) - 1))
}

fn get(x: u32, i: usize) -> bool {
    debug_assert!(i < GROUP_SIZE);
    (x & (1 << i)) != 0
}

fn set(x: u32, i: usize) -> u32 {
    debug_assert!(i < GROUP_SIZE);
    x | (1 << i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn table_works() {
        let mut obj1 = vec![Vec::<u32>::default(); 1 << 16];
        let mut obj2 = Table::new(16).unwrap();
        assert_eq!(obj2.num_bits(), 16);
        assert_eq!(obj2.len(), obj1.len());

        let mut rng = thread_rng();
        for i in 0..1000 {
            let key = rng.gen_range(0..obj2.len()) as u32;
            obj1[key as usize].push(i);
            obj2.insert(key, i);
        }

        for key in 0..obj1.len() {
            let org = &obj1[key];
            match obj2.access(key as u32) {
                None => assert!(org.is_empty()),
                Some(a) => assert_eq!(&org[..], a),
            }
        }
    }

    #[test]
    fn table_works_in_bulk_manner() {
        let mut obj1 = vec![Vec::<u32>::default(); 1 << 16];
        let mut obj2 = Table::new(16).unwrap();

        let mut rng = thread_rng();
        let keys: Vec<u32> = (0..1000)
            .map(|_| rng.gen_range(0..obj2.len()) as u32)
            .collect();

        for &key in &keys {
            obj2.count_insert(key);
        }

        for (i, &key) in keys.iter().enumerate() {
            obj1[key as usize].push(i as u32);
            obj2.data_insert(key, i as u32);
        }

        for key in 0..obj1.len() {
            let org = &obj1[key];
            match obj2.access(key as u32) {
                None => assert!(org.is_empty()),
                Some(a) => assert_eq!(&org[..], a),
            }
        }
    }

    #[test]
    fn bulk_and_incremental_layouts_agree() {
        let mut rng = thread_rng();
        let keys: Vec<u32> = (0..500).map(|_| rng.gen_range(0..1 << 8)).collect();

        let mut inc = Table::new(8).unwrap();
        let mut bulk = Table::new(8).unwrap();

        for (i, &key) in keys.iter().enumerate() {
            inc.insert(key, i as u32);
            bulk.count_insert(key);
        }
        for (i, &key) in keys.iter().enumerate() {
            bulk.data_insert(key, i as u32);
        }

        for key in 0..1 << 8 {
            assert_eq!(inc.access(key), bulk.access(key));
        }
    }

    #[test]
    fn posting_order_is_insertion_order() {
        let mut table = Table::new(8).unwrap();
        for i in 0..10 {
            table.insert(42, i * 7);
        }
        let expected: Vec<u32> = (0..10).map(|i| i * 7).collect();
        assert_eq!(table.access(42).unwrap(), &expected[..]);
    }

    #[test]
    fn memory_stays_proportional_to_postings() {
        let mut table = Table::new(16).unwrap();

        let keys = [3_u32, 40_000, 999, 31, 35];
        for (i, &key) in keys.iter().enumerate() {
            table.insert(key, i as u32);
        }

        // Keys 3 and 31 share a group; each of the four non-empty groups
        // also holds one boundary offset word.
        assert_eq!(table.populated_words(), 4 + 2 * keys.len());
        assert_eq!(table.posting_len(3), 1);
        assert_eq!(table.posting_len(4), 0);
    }

    #[test]
    fn io_works() {
        let mut rng = thread_rng();
        let mut table = Table::new(16).unwrap();

        for i in 0..1000 {
            let key = rng.gen_range(0..table.len()) as u32;
            table.insert(key, i);
        }

        let mut data = vec![];
        table.serialize_into(&mut data).unwrap();
        let other = Table::deserialize_from(&data[..]).unwrap();

        assert_eq!(table, other);
    }

    #[test]
    fn io_preserves_posting_order() {
        let mut table = Table::new(16).unwrap();
        let keys = [17_u32, 1000, 65_535, 17, 42];
        for (i, &key) in keys.iter().enumerate() {
            table.insert(key, i as u32);
        }

        let mut data = vec![];
        table.serialize_into(&mut data).unwrap();
        let other = Table::deserialize_from(&data[..]).unwrap();

        assert_eq!(other.access(17).unwrap(), &[0, 3]);
        assert_eq!(other.access(1000).unwrap(), &[1]);
        assert_eq!(other.access(65_535).unwrap(), &[2]);
        assert_eq!(other.access(42).unwrap(), &[4]);
        assert_eq!(other.access(0), None);
    }

    #[test]
    fn new_rejects_odd_widths() {
        assert!(Table::new(0).is_err());
        assert!(Table::new(10).is_err());
        assert!(Table::new(33).is_err());
    }
}
