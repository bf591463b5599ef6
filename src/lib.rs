//! An atomic, authenticated, encrypted single-file secure storage backend
//! for an untrusted, RPC-addressed medium.
//!
//! The medium (an [`rpc::RpcStorage`]) may crash or be reset at any point;
//! every object this crate manages is always either in its last fully
//! committed state or, after an incomplete write, in the state before that
//! write started — never a torn mix of the two. Confidentiality and
//! integrity of both file metadata and file data are delegated to a
//! [`key_manager::KeyManager`]; [`key_manager::LocalKeyManager`] ships a
//! software reference implementation (AES-256-CTR + HMAC-SHA256).
//!
//! [`ops::StorageFile`] is the entry point: create or open an object by
//! name, then read/write/seek/truncate/fsync it like a regular file.
//!
//! ```no_run
//! use std::sync::Arc;
//! use reefs_core::{key_manager::{LocalKeyManager, SessionId}, ops::{StorageFile, Whence}, rpc::LocalFileRpc};
//!
//! # fn main() -> Result<(), reefs_core::error::StorageError> {
//! let rpc = Arc::new(LocalFileRpc::new("/tmp/secure-storage"));
//! let km = Arc::new(LocalKeyManager::new_random());
//! let session = SessionId([0u8; 16]);
//!
//! let mut file = StorageFile::create(rpc.clone(), km.clone(), "secret", session)?;
//! file.write(b"hello")?;
//! file.seek(0, Whence::Set)?;
//! let mut buf = [0u8; 5];
//! file.read(&mut buf)?;
//! file.close()?;
//! # Ok(())
//! # }
//! ```

pub mod block_io;
pub mod commit;
pub mod error;
pub mod handle;
pub mod key_manager;
pub mod layout;
pub mod meta;
pub mod ops;
pub mod rpc;
pub mod writer;

pub use error::StorageError;
pub use handle::Handle;
pub use key_manager::{KeyManager, LocalKeyManager, SessionId};
pub use ops::{StorageFile, Whence};
pub use rpc::{LocalFileRpc, RpcStorage};
