//! Component 4.F: the public, POSIX-shaped file operations built on top of
//! [`crate::handle`], [`crate::writer`], and [`crate::commit`].
//!
//! [`StorageFile`] is the crate's single public entry point: open/create an
//! object, then read, write, seek, truncate, and fsync it. `rename` and
//! `remove` operate on names directly and take no handle, matching the
//! reference implementation's split between per-handle and name-addressed
//! operations.
//!
//! # Reference Implementation
//! - C: `tee_ree_fs.c` (`ree_fs_open`, `ree_fs_create`, `ree_fs_close`,
//!   `ree_fs_read`, `ree_fs_write`, `ree_fs_seek`,
//!   `ree_fs_ftruncate_internal`, `ree_fs_truncate`, `ree_fs_fsync`,
//!   `ree_fs_rename`, `ree_fs_remove`)

use std::sync::Arc;

use tracing::instrument;

use crate::commit::commit_meta;
use crate::error::StorageError;
use crate::handle::{self, Handle};
use crate::key_manager::{KeyManager, SessionId};
use crate::layout::{self, BLOCK_SIZE, MAX_FILE_SIZE, TEE_DATA_MAX_POSITION};
use crate::meta;
use crate::rpc::RpcStorage;
use crate::writer::{self, out_of_place_write};

/// Seek origin, matching the GlobalPlatform TEE Internal API's
/// `TEE_Whence` (`TEE_DATA_SEEK_SET/CUR/END`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// An open, encrypted, crash-atomic object.
pub struct StorageFile {
    rpc: Arc<dyn RpcStorage>,
    km: Arc<dyn KeyManager>,
    handle: Handle,
}

impl StorageFile {
    /// Create a new, empty object. Fails with [`StorageError::ItemNotFound`]
    /// mapped from the underlying `AlreadyExists` only if the RPC layer
    /// refuses to create over an existing name — this mirrors
    /// `ree_fs_create` / `open_internal(create = true)`.
    #[instrument(level = "info", skip(rpc, km))]
    pub fn create(
        rpc: Arc<dyn RpcStorage>,
        km: Arc<dyn KeyManager>,
        name: &str,
        session: SessionId,
    ) -> Result<Self, StorageError> {
        let handle = handle::open_internal(rpc.as_ref(), km.as_ref(), name, true, session)?;
        Ok(Self { rpc, km, handle })
    }

    /// Open an existing object. Mirrors `ree_fs_open` /
    /// `open_internal(create = false)`.
    #[instrument(level = "info", skip(rpc, km))]
    pub fn open(
        rpc: Arc<dyn RpcStorage>,
        km: Arc<dyn KeyManager>,
        name: &str,
        session: SessionId,
    ) -> Result<Self, StorageError> {
        let handle = handle::open_internal(rpc.as_ref(), km.as_ref(), name, false, session)?;
        Ok(Self { rpc, km, handle })
    }

    /// Close the object, releasing its RPC fd. Mirrors `ree_fs_close`.
    pub fn close(self) -> Result<(), StorageError> {
        handle::close(self.rpc.as_ref(), self.handle)
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.handle.position()
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.handle.length()
    }

    #[must_use]
    pub fn counter(&self) -> u32 {
        self.handle.counter()
    }

    /// Move the read/write cursor. Clamped to zero on the low end; rejected
    /// with [`StorageError::BadParameters`] above
    /// [`TEE_DATA_MAX_POSITION`]. Mirrors `ree_fs_seek`.
    #[instrument(level = "debug", skip(self))]
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, StorageError> {
        let file_len = self.handle.length() as i64;
        let new_pos = match whence {
            Whence::Set => offset,
            Whence::Cur => self.handle.pos as i64 + offset,
            Whence::End => file_len + offset,
        };
        let new_pos = new_pos.max(0);
        if new_pos > TEE_DATA_MAX_POSITION {
            return Err(StorageError::BadParameters(format!(
                "seek target {new_pos} exceeds TEE_DATA_MAX_POSITION"
            )));
        }
        self.handle.pos = new_pos as u64;
        Ok(self.handle.pos)
    }

    /// Read up to `buf.len()` bytes starting at the current cursor,
    /// clamped to the object's current length; advances the cursor by the
    /// number of bytes actually read. Mirrors `ree_fs_read`.
    #[instrument(level = "debug", skip(self, buf), fields(requested = buf.len()))]
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let file_len = self.handle.length();
        let mut remaining = buf.len() as u64;

        if self.handle.pos.checked_add(remaining).is_none() || self.handle.pos > file_len {
            remaining = 0;
        } else if self.handle.pos + remaining > file_len {
            remaining = file_len - self.handle.pos;
        }

        if remaining == 0 {
            return Ok(0);
        }

        let meta_size = meta::meta_size(self.km.as_ref());
        let start_block = layout::block_of(self.handle.pos);
        let end_block = layout::block_of(self.handle.pos + remaining - 1);
        let mut written = 0usize;

        for block_num in start_block..=end_block {
            let offset_in_block = (self.handle.pos % BLOCK_SIZE as u64) as usize;
            let mut size_to_read = remaining.min(BLOCK_SIZE as u64) as usize;
            if size_to_read + offset_in_block > BLOCK_SIZE {
                size_to_read = BLOCK_SIZE - offset_in_block;
            }

            let block = writer::read_block(
                self.rpc.as_ref(),
                self.km.as_ref(),
                self.handle.fd,
                &self.handle.meta,
                meta_size,
                block_num,
            )?;
            buf[written..written + size_to_read]
                .copy_from_slice(&block[offset_in_block..offset_in_block + size_to_read]);

            written += size_to_read;
            remaining -= size_to_read as u64;
            self.handle.pos += size_to_read as u64;
        }

        Ok(written)
    }

    /// Write `buf` at the current cursor, atomically: stages every touched
    /// block and the new meta, then commits in one step. If the cursor is
    /// past the current end of file, first atomically extends the file
    /// with zeros up to the cursor (its own separate commit, matching
    /// `ree_fs_write`'s implicit ftruncate).
    #[instrument(level = "debug", skip(self, buf), fields(len = buf.len()))]
    pub fn write(&mut self, buf: &[u8]) -> Result<(), StorageError> {
        if buf.is_empty() {
            return Ok(());
        }
        let len = buf.len() as u64;

        if self.handle.pos.checked_add(len).is_none_or(|end| end > MAX_FILE_SIZE) {
            return Err(StorageError::BadParameters(format!(
                "write of {len} bytes at position {} exceeds MAX_FILE_SIZE",
                self.handle.pos
            )));
        }

        let file_size = self.handle.length();
        if file_size < self.handle.pos {
            self.ftruncate_internal(self.handle.pos)?;
        }

        let mut new_meta = self.handle.meta.clone();
        out_of_place_write(
            self.rpc.as_ref(),
            self.km.as_ref(),
            self.handle.fd,
            &mut self.handle.pos,
            Some(buf),
            len,
            &mut new_meta,
        )?;

        commit_meta(
            self.rpc.as_ref(),
            self.km.as_ref(),
            self.handle.fd,
            &mut self.handle.meta_counter,
            &mut self.handle.meta,
            new_meta,
        )
    }

    /// Grow or shrink the object to exactly `new_len` bytes, zero-filling
    /// any newly-exposed range; atomic via a single meta commit. Mirrors
    /// `ree_fs_truncate` / `ree_fs_ftruncate_internal`.
    #[instrument(level = "debug", skip(self))]
    pub fn truncate(&mut self, new_len: u64) -> Result<(), StorageError> {
        self.ftruncate_internal(new_len)
    }

    fn ftruncate_internal(&mut self, new_len: u64) -> Result<(), StorageError> {
        if new_len > MAX_FILE_SIZE {
            return Err(StorageError::BadParameters(format!(
                "new length {new_len} exceeds MAX_FILE_SIZE"
            )));
        }

        let old_len = self.handle.length();
        let mut new_meta = self.handle.meta.clone();
        new_meta.info.length = new_len as u32;

        if new_len > old_len {
            let ext_len = new_len - old_len;
            let orig_pos = self.handle.pos;
            self.handle.pos = old_len;
            let result = out_of_place_write(
                self.rpc.as_ref(),
                self.km.as_ref(),
                self.handle.fd,
                &mut self.handle.pos,
                None,
                ext_len,
                &mut new_meta,
            );
            self.handle.pos = orig_pos;
            result?;
        }

        commit_meta(
            self.rpc.as_ref(),
            self.km.as_ref(),
            self.handle.fd,
            &mut self.handle.meta_counter,
            &mut self.handle.meta,
            new_meta,
        )
    }

    /// Flush the underlying RPC fd. Mirrors `ree_fs_fsync`.
    pub fn fsync(&self) -> Result<(), StorageError> {
        self.rpc.fsync(self.handle.fd)?;
        Ok(())
    }

    /// Rename an object by name. Does not require the object to be open,
    /// and does not invalidate any handle already open on it (see
    /// SPEC_FULL.md §9). Mirrors `ree_fs_rename`.
    pub fn rename(
        rpc: &dyn RpcStorage,
        old: &str,
        new: &str,
        overwrite: bool,
    ) -> Result<(), StorageError> {
        rpc.rename(old, new, overwrite)?;
        Ok(())
    }

    /// Remove an object by name. Mirrors `ree_fs_remove`.
    pub fn remove(rpc: &dyn RpcStorage, name: &str) -> Result<(), StorageError> {
        rpc.remove(name)?;
        Ok(())
    }
}
