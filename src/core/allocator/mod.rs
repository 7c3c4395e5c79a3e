//! Allocators for data blocks and inode slots
//!
//! - [`block_map`] - bitmap of device blocks, first-fit contiguous extents
//! - [`node_map`] - fixed-capacity inode table with sentinel-based slots
//!
//! The first-fit search lives here so the offline injector can run the same
//! algorithm directly over a bitmap read from an image.

pub mod block_map;
pub mod node_map;

/// First-fit search for `n` contiguous clear bits in `[start, end)`
///
/// `word_at(i)` returns the i-th 64-bit bitmap word (bit `b % 64` of word
/// `b / 64` is block `b`). Fully used or fully free words are skipped whole
/// when the scan is word aligned.
pub fn find_contiguous(word_at: impl Fn(usize) -> u64, start: u64, end: u64, n: u64) -> Option<u64> {
    if n == 0 || end <= start || end - start < n {
        return None;
    }

    let mut run_start = start;
    let mut block = start;

    while block < end {
        let word = word_at((block / 64) as usize);

        if block % 64 == 0 && word == u64::MAX {
            block += 64;
            run_start = block;
            continue;
        }

        if block % 64 == 0 && word == 0 {
            block += 64.min(end - block);
        } else if word & (1u64 << (block % 64)) != 0 {
            block += 1;
            run_start = block;
            continue;
        } else {
            block += 1;
        }

        if block - run_start >= n {
            return Some(run_start);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_in_empty_bitmap() {
        let words = vec![0u64; 4];
        assert_eq!(find_contiguous(|i| words[i], 10, 256, 5), Some(10));
        assert_eq!(find_contiguous(|i| words[i], 0, 256, 256), Some(0));
        assert_eq!(find_contiguous(|i| words[i], 0, 256, 257), None);
    }

    #[test]
    fn test_find_skips_used_runs() {
        // Blocks 0..64 used, 64..66 free, 66 used, 67.. free
        let words = vec![u64::MAX, 1u64 << 2, 0];
        assert_eq!(find_contiguous(|i| words[i], 0, 192, 2), Some(64));
        assert_eq!(find_contiguous(|i| words[i], 0, 192, 3), Some(67));
    }

    #[test]
    fn test_find_respects_end() {
        let words = vec![0u64; 2];
        assert_eq!(find_contiguous(|i| words[i], 0, 70, 70), Some(0));
        assert_eq!(find_contiguous(|i| words[i], 0, 70, 71), None);
        assert_eq!(find_contiguous(|i| words[i], 65, 70, 5), Some(65));
    }

    #[test]
    fn test_find_zero_length() {
        let words = vec![0u64; 1];
        assert_eq!(find_contiguous(|i| words[i], 0, 64, 0), None);
    }
}
