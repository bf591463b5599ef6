//! Component 4.C: the double-buffered meta block — `FileInfo`'s on-disk
//! encoding, the 4-byte meta counter at offset 0, and the read/write/create
//! primitives that move a [`FileMeta`] to and from the medium.
//!
//! # Reference Implementation
//! - C: `tee_ree_fs.c` (`struct tee_fs_file_info`, `meta_size`,
//!   `meta_pos_raw`, `read_meta_counter`, `write_meta_counter`,
//!   `read_meta_file`, `write_meta_file`, `create_meta`, `read_meta`)

use tracing::instrument;

use crate::block_io::{encrypt_and_write, read_and_decrypt};
use crate::error::StorageError;
use crate::key_manager::{FEK_SIZE, FileType, KeyManager, SessionId};
use crate::layout::{self, BACKUP_TABLE_WORDS};
use crate::rpc::{RpcFd, RpcStorage};

/// The plaintext on-disk payload of a meta block: everything about a file
/// except its encryption key, which lives in the key-manager's own header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub length: u32,
    pub backup_version_table: [u32; BACKUP_TABLE_WORDS],
}

impl FileInfo {
    /// A brand-new, empty file: zero length, every block's backup bit set
    /// (matches `create_meta`'s `memset(..., 0xff, ...)`).
    #[must_use]
    pub fn new_empty() -> Self {
        Self {
            length: 0,
            backup_version_table: [u32::MAX; BACKUP_TABLE_WORDS],
        }
    }

    /// Exact serialized size in bytes: little-endian `length` followed by
    /// the backup-version-table words, also little-endian.
    #[must_use]
    pub const fn encoded_len() -> usize {
        4 + BACKUP_TABLE_WORDS * 4
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len());
        out.extend_from_slice(&self.length.to_le_bytes());
        for word in &self.backup_version_table {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() != Self::encoded_len() {
            return Err(StorageError::CorruptObject(format!(
                "expected {} bytes of file info, got {}",
                Self::encoded_len(),
                bytes.len()
            )));
        }
        let length = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let mut backup_version_table = [0u32; BACKUP_TABLE_WORDS];
        for (i, word) in backup_version_table.iter_mut().enumerate() {
            let start = 4 + i * 4;
            *word = u32::from_le_bytes(bytes[start..start + 4].try_into().unwrap());
        }
        Ok(Self {
            length,
            backup_version_table,
        })
    }
}

/// A file's meta block together with its wrapped file-encryption key. The
/// staging `counter` the C struct carries is not part of this type: it is
/// a transient field the handle layer threads through commit instead (see
/// [`crate::handle`]).
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub info: FileInfo,
    pub encrypted_fek: [u8; FEK_SIZE],
}

/// Size in bytes of one meta slot: key-manager header plus encoded
/// `FileInfo`.
#[must_use]
pub fn meta_size(km: &dyn KeyManager) -> u64 {
    (km.header_size(FileType::Meta) + FileInfo::encoded_len()) as u64
}

#[instrument(level = "debug", skip(rpc))]
pub fn read_meta_counter(rpc: &dyn RpcStorage, fd: RpcFd) -> Result<u32, StorageError> {
    let mut buf = [0u8; 4];
    let bytes = rpc.read(fd, &mut buf, 0)?;
    if bytes != 4 {
        return Err(StorageError::CorruptObject(format!(
            "meta counter read returned {bytes} bytes, expected 4"
        )));
    }
    Ok(u32::from_le_bytes(buf))
}

#[instrument(level = "debug", skip(rpc))]
pub fn write_meta_counter(
    rpc: &dyn RpcStorage,
    fd: RpcFd,
    counter: u32,
) -> Result<(), StorageError> {
    let buf = counter.to_le_bytes();
    let written = rpc.write(fd, &buf, 0)?;
    if written != 4 {
        return Err(StorageError::CorruptObject(format!(
            "meta counter write wrote {written} bytes, expected 4"
        )));
    }
    Ok(())
}

/// Read the active meta slot (the one `meta_counter`'s parity currently
/// selects).
#[instrument(level = "debug", skip(rpc, km))]
pub fn read_meta_file(
    rpc: &dyn RpcStorage,
    km: &dyn KeyManager,
    fd: RpcFd,
    meta_counter: u32,
) -> Result<FileMeta, StorageError> {
    let meta_size = meta_size(km);
    let offs = layout::active_meta_offset(meta_counter, meta_size);
    let mut encrypted_fek = [0u8; FEK_SIZE];
    let plaintext = read_and_decrypt(
        rpc,
        km,
        fd,
        FileType::Meta,
        offs,
        FileInfo::encoded_len(),
        &mut encrypted_fek,
    )?
    .ok_or_else(|| StorageError::CorruptObject("active meta slot is empty".into()))?;
    let info = FileInfo::decode(&plaintext)?;
    Ok(FileMeta {
        info,
        encrypted_fek,
    })
}

/// Write `meta` into the *inactive* slot (the one the next counter
/// increment will promote). This never touches the counter word itself.
#[instrument(level = "debug", skip(rpc, km, meta))]
pub fn write_meta_file(
    rpc: &dyn RpcStorage,
    km: &dyn KeyManager,
    fd: RpcFd,
    meta_counter: u32,
    meta: &FileMeta,
) -> Result<(), StorageError> {
    let meta_size = meta_size(km);
    let offs = layout::inactive_meta_offset(meta_counter, meta_size);
    encrypt_and_write(
        rpc,
        km,
        fd,
        FileType::Meta,
        offs,
        &meta.info.encode(),
        &meta.encrypted_fek,
    )
}

/// Initialize a new, empty object's meta on an already-opened `fd`: mint a
/// fresh FEK, write meta slot 0 and the counter word. Mirrors the
/// meta-handling half of `create_meta` (the RPC `open` itself is the
/// caller's responsibility — see [`crate::handle::open_internal`] — so
/// that a failure here can still roll the medium-level open back).
#[instrument(level = "debug", skip(rpc, km))]
pub fn create_meta(
    rpc: &dyn RpcStorage,
    km: &dyn KeyManager,
    fd: RpcFd,
    session: SessionId,
) -> Result<(u32, FileMeta), StorageError> {
    let encrypted_fek = km.generate_fek(session)?;
    let meta = FileMeta {
        info: FileInfo::new_empty(),
        encrypted_fek,
    };

    let meta_counter = 0u32;
    write_meta_file(rpc, km, fd, meta_counter, &meta)?;
    write_meta_counter(rpc, fd, meta_counter)?;
    Ok((meta_counter, meta))
}

/// Recover an existing object's current meta on an already-opened `fd`.
/// Mirrors the meta-handling half of `read_meta`.
#[instrument(level = "debug", skip(rpc, km))]
pub fn read_meta(
    rpc: &dyn RpcStorage,
    km: &dyn KeyManager,
    fd: RpcFd,
) -> Result<(u32, FileMeta), StorageError> {
    let meta_counter = read_meta_counter(rpc, fd)?;
    let meta = read_meta_file(rpc, km, fd, meta_counter)?;
    Ok((meta_counter, meta))
}
