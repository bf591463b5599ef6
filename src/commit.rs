//! Component 4.G: the single atomic step that makes a staged write or
//! truncate visible — write the staged meta to the slot the *current*
//! counter's parity leaves inactive, then flip the counter.
//!
//! Until [`commit_meta`] returns successfully, every block and meta byte
//! written during the preceding write/truncate is reachable only through
//! the staging [`FileMeta`] the caller has been threading through
//! [`crate::writer::out_of_place_write`]; a crash before this point leaves
//! the previous commit's state fully intact.
//!
//! # Reference Implementation
//! - C: `tee_ree_fs.c` (`commit_meta_file`)

use tracing::instrument;

use crate::error::StorageError;
use crate::key_manager::KeyManager;
use crate::meta::{FileMeta, write_meta_counter, write_meta_file};
use crate::rpc::{RpcFd, RpcStorage};

/// Commit `new_meta` as the file's current state.
///
/// `meta_counter` and `meta` are updated in place on success, mirroring
/// `fdp->meta = *new_meta; fdp->meta_counter = new_meta->counter;` from the
/// reference implementation. On failure neither is touched.
#[instrument(level = "debug", skip(rpc, km, meta, new_meta))]
pub fn commit_meta(
    rpc: &dyn RpcStorage,
    km: &dyn KeyManager,
    fd: RpcFd,
    meta_counter: &mut u32,
    meta: &mut FileMeta,
    new_meta: FileMeta,
) -> Result<(), StorageError> {
    let committed_counter = meta_counter.wrapping_add(1);

    write_meta_file(rpc, km, fd, *meta_counter, &new_meta)?;

    // From here on the new meta is durable in its slot; adopt it and
    // publish the flip by writing the counter word last.
    *meta = new_meta;
    *meta_counter = committed_counter;
    write_meta_counter(rpc, fd, *meta_counter)
}
