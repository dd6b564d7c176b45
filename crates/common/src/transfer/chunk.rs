//! Chunk boundaries.
//!
//! Chunks grow by 128 KiB per step (128, 256, ... 1024 KiB) and are 1 MiB
//! each after that, so small files finish in one request while large ones
//! keep request overhead bounded.

use std::collections::BTreeMap;

pub const CHUNK_UNIT: u64 = 128 * 1024;
pub const MAX_CHUNK: u64 = 1024 * 1024;
const GROWTH_STEPS: u64 = 8;

/// Start of the chunk containing `pos`
pub fn chunk_floor(pos: u64) -> u64 {
    let mut start = 0;
    for step in 1..=GROWTH_STEPS {
        let end = start + step * CHUNK_UNIT;
        if pos < end {
            return start;
        }
        start = end;
    }
    start + (pos - start) / MAX_CHUNK * MAX_CHUNK
}

/// End (exclusive) of the chunk containing `pos`
pub fn chunk_ceil(pos: u64) -> u64 {
    let mut start = 0;
    for step in 1..=GROWTH_STEPS {
        let end = start + step * CHUNK_UNIT;
        if pos < end {
            return end;
        }
        start = end;
    }
    start + ((pos - start) / MAX_CHUNK + 1) * MAX_CHUNK
}

/// End of the run of completed chunks starting at offset zero
pub fn contiguous_end<T>(completed: &BTreeMap<u64, T>, size: u64) -> u64 {
    let mut pos = 0;
    while pos < size && completed.contains_key(&pos) {
        pos = chunk_ceil(pos).min(size);
    }
    pos
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_growing_boundaries() {
        assert_eq!(chunk_floor(0), 0);
        assert_eq!(chunk_ceil(0), CHUNK_UNIT);
        assert_eq!(chunk_floor(CHUNK_UNIT), CHUNK_UNIT);
        assert_eq!(chunk_ceil(CHUNK_UNIT), 3 * CHUNK_UNIT);
        assert_eq!(chunk_ceil(3 * CHUNK_UNIT), 6 * CHUNK_UNIT);

        // the eighth step ends at 36 units, then chunks are 1 MiB
        let last_growing = 36 * CHUNK_UNIT;
        assert_eq!(chunk_floor(last_growing - 1), 28 * CHUNK_UNIT);
        assert_eq!(chunk_ceil(last_growing), last_growing + MAX_CHUNK);
        assert_eq!(chunk_floor(last_growing + MAX_CHUNK + 5), last_growing + MAX_CHUNK);
    }

    #[test]
    fn test_contiguous_end() {
        let mut done = BTreeMap::new();
        done.insert(0u64, ());
        done.insert(3 * CHUNK_UNIT, ());
        assert_eq!(contiguous_end(&done, 10 * CHUNK_UNIT), CHUNK_UNIT);
        done.insert(CHUNK_UNIT, ());
        assert_eq!(contiguous_end(&done, 10 * CHUNK_UNIT), 6 * CHUNK_UNIT);
        assert_eq!(contiguous_end(&done, 2 * CHUNK_UNIT), 2 * CHUNK_UNIT);
    }
}
