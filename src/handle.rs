//! Component 4.E and spec §3.2: the open object handle and the
//! open/create entry point that builds one, including the rollback of a
//! partially-created object on failure.
//!
//! # Reference Implementation
//! - C: `tee_ree_fs.c` (`struct tee_fs_fd`, `open_internal`)

use tracing::instrument;

use crate::error::StorageError;
use crate::key_manager::{KeyManager, SessionId};
use crate::layout::TEE_FS_NAME_MAX;
use crate::meta::{self, FileMeta};
use crate::rpc::{RpcFd, RpcStorage};

/// An open object. Holds everything needed to serve reads, writes, and
/// truncates without touching the medium again for bookkeeping: the RPC
/// file descriptor, the currently-committed meta counter and its
/// [`FileMeta`], and the read/write cursor.
///
/// Not `Sync`: callers must serialize calls against a single `Handle`
/// themselves (see SPEC_FULL.md §5).
pub struct Handle {
    pub(crate) fd: RpcFd,
    pub(crate) meta_counter: u32,
    pub(crate) meta: FileMeta,
    pub(crate) pos: u64,
}

impl Handle {
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        u64::from(self.meta.info.length)
    }

    /// The last meta counter value observed durable on the medium (spec.md
    /// §3.3 "active meta slot"). Even, the active slot is 0; odd, it's 1.
    #[must_use]
    pub fn counter(&self) -> u32 {
        self.meta_counter
    }
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    // +1 for the NUL terminator the original C API reserves space for.
    if name.is_empty() || name.len() + 1 > TEE_FS_NAME_MAX {
        return Err(StorageError::BadParameters(format!(
            "object name length {} exceeds TEE_FS_NAME_MAX",
            name.len()
        )));
    }
    Ok(())
}

/// Open (`create = false`) or create (`create = true`) `name`.
///
/// On any failure after the medium-level `open`/`create` succeeded, the
/// RPC fd is closed and, if this was a create, the half-built object is
/// removed — the object either exists in a fully-initialized state or not
/// at all.
#[instrument(level = "debug", skip(rpc, km))]
pub fn open_internal(
    rpc: &dyn RpcStorage,
    km: &dyn KeyManager,
    name: &str,
    create: bool,
    session: SessionId,
) -> Result<Handle, StorageError> {
    validate_name(name)?;

    let fd = rpc.open(name, create)?;

    let result = if create {
        meta::create_meta(rpc, km, fd, session)
    } else {
        meta::read_meta(rpc, km, fd)
    };

    match result {
        Ok((meta_counter, meta)) => Ok(Handle {
            fd,
            meta_counter,
            meta,
            pos: 0,
        }),
        Err(err) => {
            let _ = rpc.close(fd);
            if create {
                let _ = rpc.remove(name);
            }
            Err(err)
        }
    }
}

/// Close `handle`, releasing its RPC fd. Mirrors `ree_fs_close`.
#[instrument(level = "debug", skip(rpc, handle))]
pub fn close(rpc: &dyn RpcStorage, handle: Handle) -> Result<(), StorageError> {
    rpc.close(handle.fd)?;
    Ok(())
}
