//! Component 4.D: the out-of-place (copy-on-write) block writer, plus the
//! paired block reader both it and the public read path use.
//!
//! Every write lands on the *inactive* physical copy of a block and flips
//! that block's bit in a caller-supplied staging [`FileMeta`]; nothing here
//! commits anything; see [`crate::commit`] for that.
//!
//! # Reference Implementation
//! - C: `tee_ree_fs.c` (`read_block`, `write_block`, `out_of_place_write`)

use tracing::instrument;

use crate::block_io::{encrypt_and_write, read_and_decrypt};
use crate::error::StorageError;
use crate::key_manager::{FileType, KeyManager};
use crate::layout::{self, BLOCK_SIZE};
use crate::meta::FileMeta;
use crate::rpc::{RpcFd, RpcStorage};

fn block_raw_size(km: &dyn KeyManager) -> u64 {
    (km.header_size(FileType::Block) + BLOCK_SIZE) as u64
}

/// Read the *active* physical copy of `block_num`. A block that was never
/// written (a zero-length RPC read) decodes as all-zero, matching the
/// writer's own treatment of unwritten ranges — see SPEC_FULL.md §9.
#[instrument(level = "debug", skip(rpc, km, meta))]
pub fn read_block(
    rpc: &dyn RpcStorage,
    km: &dyn KeyManager,
    fd: RpcFd,
    meta: &FileMeta,
    meta_size: u64,
    block_num: u64,
) -> Result<[u8; BLOCK_SIZE], StorageError> {
    let block_raw = block_raw_size(km);
    let offs = layout::block_slot_offset(
        meta_size,
        block_raw,
        &meta.info.backup_version_table,
        block_num as usize,
        true,
    );

    let mut fek = meta.encrypted_fek;
    let plaintext = read_and_decrypt(rpc, km, fd, FileType::Block, offs, BLOCK_SIZE, &mut fek)?;

    let mut out = [0u8; BLOCK_SIZE];
    if let Some(plaintext) = plaintext {
        if plaintext.len() != BLOCK_SIZE {
            return Err(StorageError::CorruptObject(format!(
                "block {block_num} decrypted to {} bytes, expected {BLOCK_SIZE}",
                plaintext.len()
            )));
        }
        out.copy_from_slice(&plaintext);
    }
    Ok(out)
}

/// Write `data` to the *inactive* physical copy of `block_num` against
/// `new_meta`'s current `backup_version_table`, then flip that block's bit
/// so it becomes active once `new_meta` is committed.
#[instrument(level = "debug", skip(rpc, km, new_meta, data))]
pub fn write_block(
    rpc: &dyn RpcStorage,
    km: &dyn KeyManager,
    fd: RpcFd,
    new_meta: &mut FileMeta,
    meta_size: u64,
    block_num: u64,
    data: &[u8; BLOCK_SIZE],
) -> Result<(), StorageError> {
    let block_raw = block_raw_size(km);
    let offs = layout::block_slot_offset(
        meta_size,
        block_raw,
        &new_meta.info.backup_version_table,
        block_num as usize,
        false,
    );
    encrypt_and_write(
        rpc,
        km,
        fd,
        FileType::Block,
        offs,
        data,
        &new_meta.encrypted_fek,
    )?;
    layout::toggle_backup_bit(&mut new_meta.info.backup_version_table, block_num as usize);
    Ok(())
}

/// Read-modify-write `buf` (or zero-fill if `buf` is `None`, used by
/// truncate's extend path) starting at `*pos`, staging every touched block
/// into its inactive copy and updating `new_meta.info.length` as it goes.
///
/// On success `*pos` has advanced by `len`. On failure `*pos` is restored
/// to its value on entry — nothing about the write is visible until the
/// caller commits `new_meta`.
#[instrument(level = "debug", skip(rpc, km, pos, buf, new_meta), fields(len))]
pub fn out_of_place_write(
    rpc: &dyn RpcStorage,
    km: &dyn KeyManager,
    fd: RpcFd,
    pos: &mut u64,
    buf: Option<&[u8]>,
    len: u64,
    new_meta: &mut FileMeta,
) -> Result<(), StorageError> {
    let meta_size = crate::meta::meta_size(km);
    let orig_pos = *pos;
    let result = out_of_place_write_inner(rpc, km, fd, pos, buf, len, new_meta, meta_size);
    if result.is_err() {
        *pos = orig_pos;
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn out_of_place_write_inner(
    rpc: &dyn RpcStorage,
    km: &dyn KeyManager,
    fd: RpcFd,
    pos: &mut u64,
    buf: Option<&[u8]>,
    len: u64,
    new_meta: &mut FileMeta,
    meta_size: u64,
) -> Result<(), StorageError> {
    if len == 0 {
        return Ok(());
    }

    let start_block = layout::block_of(*pos);
    let end_block = layout::block_of(*pos + len - 1);
    let mut remaining = len;
    let mut src_offset: usize = 0;

    for block_num in start_block..=end_block {
        let offset_in_block = (*pos % BLOCK_SIZE as u64) as usize;
        let mut size_to_write = remaining.min(BLOCK_SIZE as u64) as usize;
        if size_to_write + offset_in_block > BLOCK_SIZE {
            size_to_write = BLOCK_SIZE - offset_in_block;
        }

        let mut block = read_block(rpc, km, fd, new_meta, meta_size, block_num)?;

        match buf {
            Some(data) => {
                block[offset_in_block..offset_in_block + size_to_write]
                    .copy_from_slice(&data[src_offset..src_offset + size_to_write]);
                src_offset += size_to_write;
            }
            None => {
                block[offset_in_block..offset_in_block + size_to_write].fill(0);
            }
        }

        write_block(rpc, km, fd, new_meta, meta_size, block_num, &block)?;

        remaining -= size_to_write as u64;
        *pos += size_to_write as u64;
    }

    if *pos > u64::from(new_meta.info.length) {
        new_meta.info.length = u32::try_from(*pos).map_err(|_| {
            StorageError::BadParameters(format!("resulting length {} exceeds u32 range", *pos))
        })?;
    }
    Ok(())
}
