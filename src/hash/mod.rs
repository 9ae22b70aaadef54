// Hashing module using BLAKE3
//
// Three hashes with different jobs:
// - content fingerprint: exact duplicate detection and parent linking
// - path hash: bloom filter keys
// - dHash: near-duplicate image search

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use image::DynamicImage;

use crate::constants::{HASH_CHUNK_SIZE, HASH_FAST_SCHEME, HASH_FULL_READ_LIMIT};
use crate::error::Result;
use crate::jobs::cancel::CancelToken;

/// Content fingerprint. Full read up to HASH_FULL_READ_LIMIT, sampled above.
pub fn compute_fingerprint(path: &Path, cancel: &CancelToken) -> Result<String> {
    let size = std::fs::metadata(path)?.len();
    if size <= HASH_FULL_READ_LIMIT {
        compute_full_hash(path, cancel)
    } else {
        compute_fast_hash(path, cancel)
    }
}

/// Compute fast hash: first 1MB + last 1MB + file size
/// Format: "blake3:first_last_size_v1:<hash>"
pub fn compute_fast_hash(path: &Path, cancel: &CancelToken) -> Result<String> {
    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();

    let mut hasher = blake3::Hasher::new();

    let mut first_chunk = vec![0u8; HASH_CHUNK_SIZE.min(file_size as usize)];
    file.read_exact(&mut first_chunk)?;
    hasher.update(&first_chunk);

    cancel.check()?;

    if file_size > HASH_CHUNK_SIZE as u64 {
        let last_offset = file_size.saturating_sub(HASH_CHUNK_SIZE as u64);
        file.seek(SeekFrom::Start(last_offset))?;

        let mut last_chunk = vec![0u8; HASH_CHUNK_SIZE];
        file.read_exact(&mut last_chunk)?;
        hasher.update(&last_chunk);
    }

    hasher.update(&file_size.to_le_bytes());

    let hash = hasher.finalize();
    Ok(format!("blake3:{}:{}", HASH_FAST_SCHEME, hash.to_hex()))
}

/// Compute full BLAKE3 hash of entire file, checking `cancel` between chunks
pub fn compute_full_hash(path: &Path, cancel: &CancelToken) -> Result<String> {
    let mut file = File::open(path)?;

    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        cancel.check()?;
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let hash = hasher.finalize();
    Ok(format!("blake3:full:{}", hash.to_hex()))
}

/// Two independent 64-bit halves of blake3(path), used for double hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathHash {
    pub h1: u64,
    pub h2: u64,
}

impl PathHash {
    pub fn of(path: &str) -> Self {
        let digest = blake3::hash(path.as_bytes());
        let bytes = digest.as_bytes();
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&bytes[0..8]);
        b.copy_from_slice(&bytes[8..16]);
        Self {
            h1: u64::from_le_bytes(a),
            // Odd step so probes cover the whole table
            h2: u64::from_le_bytes(b) | 1,
        }
    }

    pub fn of_path(path: &Path) -> Self {
        Self::of(&path.to_string_lossy())
    }
}

/// Difference hash: 9x8 grayscale, one bit per horizontal gradient.
pub fn dhash(img: &DynamicImage) -> u64 {
    let small = img
        .resize_exact(9, 8, image::imageops::FilterType::Triangle)
        .to_luma8();

    let mut hash = 0u64;
    for y in 0..8 {
        for x in 0..8 {
            let left = small.get_pixel(x, y)[0];
            let right = small.get_pixel(x + 1, y)[0];
            hash <<= 1;
            if left > right {
                hash |= 1;
            }
        }
    }
    hash
}

pub fn dhash_to_hex(hash: u64) -> String {
    format!("{:016x}", hash)
}

pub fn dhash_from_hex(hex: &str) -> Option<u64> {
    u64::from_str_radix(hex.trim(), 16).ok()
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_fast_hash_small_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();

        let hash = compute_fast_hash(file.path(), &CancelToken::new()).unwrap();
        assert!(hash.starts_with("blake3:first_last_size_v1:"));
    }

    #[test]
    fn test_small_files_get_full_hash() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();

        let hash = compute_fingerprint(file.path(), &CancelToken::new()).unwrap();
        assert_eq!(
            hash,
            format!("blake3:full:{}", blake3::hash(b"Hello, World!").to_hex())
        );
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let mut a = NamedTempFile::new().unwrap();
        a.write_all(b"first").unwrap();
        let mut b = NamedTempFile::new().unwrap();
        b.write_all(b"second").unwrap();

        let token = CancelToken::new();
        assert_ne!(
            compute_fingerprint(a.path(), &token).unwrap(),
            compute_fingerprint(b.path(), &token).unwrap()
        );
    }

    #[test]
    fn test_cancelled_hash() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"data").unwrap();
        let token = CancelToken::new();
        token.cancel();
        assert!(compute_full_hash(file.path(), &token).is_err());
    }

    #[test]
    fn test_path_hash_is_stable() {
        assert_eq!(PathHash::of("/r/a.jpg"), PathHash::of("/r/a.jpg"));
        assert_ne!(PathHash::of("/r/a.jpg"), PathHash::of("/r/b.jpg"));
        assert_eq!(PathHash::of("/r/a.jpg").h2 & 1, 1);
    }

    #[test]
    fn test_dhash_similar_images_are_close() {
        let gradient = GrayImage::from_fn(64, 64, |x, _| Luma([(x * 4) as u8]));
        let mut tweaked = gradient.clone();
        tweaked.put_pixel(10, 10, Luma([255]));
        let reversed = GrayImage::from_fn(64, 64, |x, _| Luma([255 - (x * 4) as u8]));

        let a = dhash(&DynamicImage::ImageLuma8(gradient));
        let b = dhash(&DynamicImage::ImageLuma8(tweaked));
        let c = dhash(&DynamicImage::ImageLuma8(reversed));

        assert!(hamming_distance(a, b) <= 4);
        assert!(hamming_distance(a, c) > 32);
    }

    #[test]
    fn test_dhash_hex() {
        let hex = dhash_to_hex(0xdead_beef);
        assert_eq!(hex, "00000000deadbeef");
        assert_eq!(dhash_from_hex(&hex), Some(0xdead_beef));
        assert_eq!(dhash_from_hex("zz"), None);
    }
}
