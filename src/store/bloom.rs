// Path bloom filter
//
// Lock-free, insert-only. A negative answer means the path was never inserted.
// Rebuilt from the assets table on every startup; never persisted.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::hash::PathHash;

pub struct BloomFilter {
    words: Vec<AtomicU64>,
    num_bits: u64,
    num_hashes: u32,
    inserted: AtomicU64,
}

impl BloomFilter {
    /// Optimal size for `expected_items` at `false_positive_rate`.
    pub fn with_capacity(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let bits = (-(n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_words = bits.div_ceil(64);
        let num_bits = num_words * 64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().clamp(1.0, 32.0) as u32;

        let words = (0..num_words).map(|_| AtomicU64::new(0)).collect();

        Self {
            words,
            num_bits,
            num_hashes,
            inserted: AtomicU64::new(0),
        }
    }

    fn bit_positions(&self, key: &PathHash) -> impl Iterator<Item = u64> + '_ {
        let num_bits = self.num_bits;
        let key = *key;
        (0..self.num_hashes as u64)
            .map(move |i| key.h1.wrapping_add(i.wrapping_mul(key.h2)) % num_bits)
    }

    pub fn insert(&self, key: &PathHash) {
        for bit in self.bit_positions(key) {
            let word = (bit / 64) as usize;
            let mask = 1u64 << (bit % 64);
            self.words[word].fetch_or(mask, Ordering::Relaxed);
        }
        self.inserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn contains(&self, key: &PathHash) -> bool {
        self.bit_positions(key).all(|bit| {
            let word = (bit / 64) as usize;
            let mask = 1u64 << (bit % 64);
            self.words[word].load(Ordering::Relaxed) & mask != 0
        })
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Insert calls since construction (duplicates included)
    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .field("inserted", &self.inserted())
            .finish()
    }
}
