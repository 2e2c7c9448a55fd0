//! Per-(cluster, month) JobID dedupe set.
//!
//! A file-backed bloom filter: membership tests may rarely report a job as
//! already seen (bounded by the target false-positive rate) but never miss
//! one that was inserted, which is the direction re-ingest idempotence needs.
//!
//! File layout, little-endian:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ HEADER (40 bytes)                            │
//! │   magic: [u8; 4]   = b"SBDS"                 │
//! │   version: u16     = 1                       │
//! │   _pad: u16        = 0                       │
//! │   m: u64           (bit count)               │
//! │   k: u32           (hash count)              │
//! │   _pad: u32        = 0                       │
//! │   n: u64           (inserted count)          │
//! │   p: f64           (target fp rate)          │
//! ├──────────────────────────────────────────────┤
//! │ BIT ARRAY (⌈m/8⌉ bytes)                      │
//! └──────────────────────────────────────────────┘
//! ```

use std::io::Write;
use std::path::Path;

use xxhash_rust::xxh3::xxh3_128;

use crate::error::{Error, Result};

const MAGIC: [u8; 4] = *b"SBDS";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 40;

/// Default expected jobs per (cluster, month).
pub const DEFAULT_CAPACITY: u64 = 2_000_000;
/// Default target false-positive rate.
pub const DEFAULT_FP_RATE: f64 = 1e-4;

/// Probabilistic set of JobIDs with no false negatives.
#[derive(Debug, Clone)]
pub struct DedupeSet {
    m: u64,
    k: u32,
    n: u64,
    p: f64,
    bits: Vec<u8>,
}

impl DedupeSet {
    /// Sizes the filter for `expected` insertions at false-positive rate `p`:
    /// m = -n·ln(p)/ln(2)², k = (m/n)·ln(2). Exceeding `expected` keeps the
    /// filter correct, only degrading p; monthly partitioning bounds growth.
    pub fn with_capacity(expected: u64, p: f64) -> Self {
        let expected = expected.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-(expected) * p.ln() / (ln2 * ln2)).ceil().max(8.0) as u64;
        let k = ((m as f64 / expected) * ln2).round().max(1.0) as u32;
        Self {
            m,
            k,
            n: 0,
            p,
            bits: vec![0u8; m.div_ceil(8) as usize],
        }
    }

    /// Number of successful (previously absent) insertions.
    pub fn inserted(&self) -> u64 {
        self.n
    }

    /// Bit offsets for a JobID: the 128-bit hash split into two 64-bit
    /// halves drives double hashing, h1 + i·h2 mod m. The stride is forced
    /// odd so the k probes never collapse onto one bit.
    fn offsets(&self, job_id: &str) -> impl Iterator<Item = u64> + '_ {
        let h = xxh3_128(job_id.as_bytes());
        let h1 = h as u64;
        let h2 = ((h >> 64) as u64) | 1;
        let m = self.m;
        (0..self.k as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }

    fn get_bit(&self, offset: u64) -> bool {
        self.bits[(offset / 8) as usize] & (1 << (offset % 8)) != 0
    }

    fn set_bit(&mut self, offset: u64) {
        self.bits[(offset / 8) as usize] |= 1 << (offset % 8);
    }

    /// Membership test; false positives possible, false negatives never.
    pub fn contains(&self, job_id: &str) -> bool {
        self.offsets(job_id).all(|o| self.get_bit(o))
    }

    /// Contains-then-set. Returns whether the id was already present.
    pub fn add(&mut self, job_id: &str) -> bool {
        let offsets: Vec<u64> = self.offsets(job_id).collect();
        let was_present = offsets.iter().all(|&o| self.get_bit(o));
        if !was_present {
            for o in offsets {
                self.set_bit(o);
            }
            self.n += 1;
        }
        was_present
    }

    /// Loads a set from disk, validating the header against the body.
    pub fn load(path: &Path) -> Result<Self> {
        let corrupt = |reason: &str| Error::Corrupt {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let data = std::fs::read(path)?;
        if data.len() < HEADER_SIZE {
            return Err(corrupt("file shorter than header"));
        }
        if data[0..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(corrupt("unsupported version"));
        }
        let m = u64::from_le_bytes(data[8..16].try_into().expect("slice is 8 bytes"));
        let k = u32::from_le_bytes(data[16..20].try_into().expect("slice is 4 bytes"));
        let n = u64::from_le_bytes(data[24..32].try_into().expect("slice is 8 bytes"));
        let p = f64::from_le_bytes(data[32..40].try_into().expect("slice is 8 bytes"));

        if m == 0 || k == 0 {
            return Err(corrupt("zero filter dimensions"));
        }
        let body_len = m.div_ceil(8) as usize;
        if data.len() != HEADER_SIZE + body_len {
            return Err(corrupt("truncated bit array"));
        }

        Ok(Self {
            m,
            k,
            n,
            p,
            bits: data[HEADER_SIZE..].to_vec(),
        })
    }

    /// Writes the set via a same-directory temp file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = crate::store::tmp_sibling(path);
        let mut file = std::fs::File::create(&tmp_path)?;

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_le_bytes());
        // bytes 6..8 reserved
        header[8..16].copy_from_slice(&self.m.to_le_bytes());
        header[16..20].copy_from_slice(&self.k.to_le_bytes());
        // bytes 20..24 reserved
        header[24..32].copy_from_slice(&self.n.to_le_bytes());
        header[32..40].copy_from_slice(&self.p.to_le_bytes());

        file.write_all(&header)?;
        file.write_all(&self.bits)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sizing_matches_formula() {
        let set = DedupeSet::with_capacity(2_000_000, 1e-4);
        // m ≈ n · 19.17 bits, k ≈ 13
        assert!(set.m > 38_000_000 && set.m < 38_400_000);
        assert_eq!(set.k, 13);
        assert_eq!(set.bits.len(), set.m.div_ceil(8) as usize);
    }

    #[test]
    fn add_then_contains_never_misses() {
        let mut set = DedupeSet::with_capacity(10_000, 1e-4);
        for i in 0..10_000 {
            let id = format!("job-{}", i);
            assert!(!set.add(&id), "fresh id reported present: {}", id);
        }
        assert_eq!(set.inserted(), 10_000);
        for i in 0..10_000 {
            assert!(set.contains(&format!("job-{}", i)));
        }
    }

    #[test]
    fn re_add_reports_present_and_does_not_grow() {
        let mut set = DedupeSet::with_capacity(100, 1e-4);
        assert!(!set.add("42"));
        assert!(set.add("42"));
        assert_eq!(set.inserted(), 1);
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let mut set = DedupeSet::with_capacity(10_000, 1e-4);
        for i in 0..10_000 {
            set.add(&format!("present-{}", i));
        }
        let false_positives = (0..10_000)
            .filter(|i| set.contains(&format!("absent-{}", i)))
            .count();
        // target 1e-4 over 10k probes: expect ~1, allow generous slack
        assert!(false_positives < 20, "fp count {}", false_positives);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2024-02.bloom");

        let mut set = DedupeSet::with_capacity(1000, 1e-4);
        set.add("1");
        set.add("2");
        set.save(&path).unwrap();

        let loaded = DedupeSet::load(&path).unwrap();
        assert_eq!(loaded.inserted(), 2);
        assert_eq!(loaded.m, set.m);
        assert_eq!(loaded.k, set.k);
        assert!(loaded.contains("1"));
        assert!(loaded.contains("2"));
        assert!(!loaded.contains("3"));
        assert!(!dir.path().join("2024-02.bloom.tmp").exists());
    }

    #[test]
    fn corruption_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.bloom");

        let set = DedupeSet::with_capacity(100, 1e-4);
        set.save(&path).unwrap();

        // bad magic
        let mut data = std::fs::read(&path).unwrap();
        data[0] = b'X';
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(
            DedupeSet::load(&path),
            Err(Error::Corrupt { .. })
        ));

        // truncated body
        let set2 = DedupeSet::with_capacity(100, 1e-4);
        set2.save(&path).unwrap();
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 3]).unwrap();
        assert!(matches!(
            DedupeSet::load(&path),
            Err(Error::Corrupt { .. })
        ));
    }
}
