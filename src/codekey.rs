//! Conversion between PQ codes and packed hash-table keys.
//! Most users do not need to use this module directly.

/// Packs a PQ code into a single integer key by concatenating its bytes in
/// big-endian order. Supported code lengths are 1, 2, and 4 bytes, giving
/// key widths of 8, 16, and 32 bits.
///
/// # Panics
///
/// Panics if the code length is not 1, 2, or 4.
#[inline]
pub fn pack(code: &[u8]) -> u32 {
    match *code {
        [b0] => u32::from(b0),
        [b0, b1] => (u32::from(b0) << 8) | u32::from(b1),
        [b0, b1, b2, b3] => {
            (u32::from(b0) << 24) | (u32::from(b1) << 16) | (u32::from(b2) << 8) | u32::from(b3)
        }
        _ => panic!(
            "a packable code must have 1, 2, or 4 bytes, but has {}",
            code.len()
        ),
    }
}

/// Restores the code bytes of a packed key. `num_bytes` is the code length
/// the key was packed from.
///
/// # Panics
///
/// Panics if `num_bytes` is not 1, 2, or 4.
#[inline]
pub fn unpack(key: u32, num_bytes: usize) -> Vec<u8> {
    match num_bytes {
        1 => {
            debug_assert!(key < 1 << 8);
            vec![key as u8]
        }
        2 => {
            debug_assert!(key < 1 << 16);
            vec![(key >> 8) as u8, key as u8]
        }
        4 => vec![
            (key >> 24) as u8,
            (key >> 16) as u8,
            (key >> 8) as u8,
            key as u8,
        ],
        _ => panic!(
            "a packable code must have 1, 2, or 4 bytes, but has {}",
            num_bytes
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{thread_rng, Rng};

    #[test]
    fn pack_works() {
        assert_eq!(pack(&[0xab]), 0xab);
        assert_eq!(pack(&[0x01, 0x02]), 0x0102);
        assert_eq!(pack(&[0x01, 0x02, 0x03, 0x04]), 0x01020304);
    }

    #[test]
    fn roundtrip_works() {
        let mut rng = thread_rng();
        for &num_bytes in &[1, 2, 4] {
            for _ in 0..100 {
                let code: Vec<u8> = (0..num_bytes).map(|_| rng.gen()).collect();
                assert_eq!(unpack(pack(&code), num_bytes), code);
            }
        }
    }

    #[test]
    #[should_panic]
    fn pack_rejects_odd_lengths() {
        pack(&[1, 2, 3]);
    }
}
