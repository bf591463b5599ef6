//! Component 4.B: the encrypt-then-write and read-then-decrypt primitives
//! shared by the meta layer and the block writer. Every byte that crosses
//! the RPC boundary passes through exactly one of these two functions.
//!
//! # Reference Implementation
//! - C: `tee_ree_fs.c` (`encrypt_and_write_file`, `read_and_decrypt_file`)

use tracing::instrument;

use crate::error::StorageError;
use crate::key_manager::{FEK_SIZE, FileType, KeyManager};
use crate::rpc::{RpcFd, RpcStorage};

/// Encrypt `plaintext` under `encrypted_fek` and write it at raw offset
/// `offs` of `fd`. `encrypted_fek` is always an input here: for
/// [`FileType::Meta`] it gets folded into the authenticated header; for
/// [`FileType::Block`] it only selects which content key to use.
#[instrument(level = "debug", skip(rpc, km, plaintext, encrypted_fek), fields(file_type = ?file_type, offs, len = plaintext.len()))]
pub fn encrypt_and_write(
    rpc: &dyn RpcStorage,
    km: &dyn KeyManager,
    fd: RpcFd,
    file_type: FileType,
    offs: u64,
    plaintext: &[u8],
    encrypted_fek: &[u8; FEK_SIZE],
) -> Result<(), StorageError> {
    let ciphertext = km.encrypt_file(file_type, plaintext, encrypted_fek)?;
    let written = rpc.write(fd, &ciphertext, offs)?;
    if written != ciphertext.len() {
        return Err(StorageError::CorruptObject(format!(
            "short write: wrote {written} of {} bytes",
            ciphertext.len()
        )));
    }
    Ok(())
}

/// Read up to `header_size(file_type) + max_plaintext_len` bytes at raw
/// offset `offs` of `fd` and decrypt them.
///
/// A zero-length read (the object does not have data at this offset) is
/// not an error: it returns `Ok(None)`, mirroring `read_and_decrypt_file`'s
/// "block does not exist" path, which callers treat as all-zero content.
///
/// For [`FileType::Meta`], `encrypted_fek` is an output: the wrapped key
/// recovered from the header is written back into it. For
/// [`FileType::Block`], it is an input the caller must already know.
#[instrument(level = "debug", skip(rpc, km, encrypted_fek), fields(file_type = ?file_type, offs, max_plaintext_len))]
pub fn read_and_decrypt(
    rpc: &dyn RpcStorage,
    km: &dyn KeyManager,
    fd: RpcFd,
    file_type: FileType,
    offs: u64,
    max_plaintext_len: usize,
    encrypted_fek: &mut [u8; FEK_SIZE],
) -> Result<Option<Vec<u8>>, StorageError> {
    let header_size = km.header_size(file_type);
    let mut ciphertext = vec![0u8; header_size + max_plaintext_len];
    let bytes = rpc.read(fd, &mut ciphertext, offs)?;
    if bytes == 0 {
        return Ok(None);
    }
    ciphertext.truncate(bytes);

    let plaintext = km
        .decrypt_file(file_type, &ciphertext, encrypted_fek)
        .map_err(|e| StorageError::CorruptObject(e.to_string()))?;
    Ok(Some(plaintext))
}
