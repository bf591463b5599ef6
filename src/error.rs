//! The five-kind error surface every public operation returns, in the
//! style of `oxcrypt-core`'s `CryptoError`/`FileError`: one `thiserror`
//! enum, `#[from]` conversions from the external-collaborator error types,
//! no panics.
//!
//! # Reference Implementation
//! - C: `TEE_Result` values returned from `tee_ree_fs.c`
//!   (`TEE_ERROR_BAD_PARAMETERS`, `TEE_ERROR_OUT_OF_MEMORY`,
//!   `TEE_ERROR_CORRUPT_OBJECT`, `TEE_ERROR_ITEM_NOT_FOUND`, generic).

use thiserror::Error;

use crate::key_manager::KeyManagerError;
use crate::rpc::RpcError;

#[derive(Error, Debug)]
pub enum StorageError {
    /// An argument was out of range or otherwise invalid: an object name
    /// longer than [`crate::layout::TEE_FS_NAME_MAX`], a seek target above
    /// [`crate::layout::TEE_DATA_MAX_POSITION`], a write that would push a
    /// file past [`crate::layout::MAX_FILE_SIZE`].
    #[error("bad parameters: {0}")]
    BadParameters(String),

    /// A memory allocation failed, or a size computation would overflow.
    #[error("out of memory")]
    OutOfMemory,

    /// Authenticated decryption failed, or the on-medium layout violated an
    /// invariant the core relies on (short counter read, truncated header).
    /// Always the result of tampering, corruption, or a crash that this
    /// layer's atomicity guarantees should have prevented.
    #[error("corrupt object: {0}")]
    CorruptObject(String),

    /// The named object does not exist.
    #[error("item not found")]
    ItemNotFound,

    /// Anything else: a transport-level I/O failure that isn't itself
    /// evidence of tampering.
    #[error("generic storage error: {0}")]
    Generic(String),
}

impl From<RpcError> for StorageError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::NotFound => StorageError::ItemNotFound,
            RpcError::AlreadyExists => StorageError::Generic(err.to_string()),
            RpcError::Io(_) => StorageError::Generic(err.to_string()),
        }
    }
}

impl From<KeyManagerError> for StorageError {
    fn from(err: KeyManagerError) -> Self {
        StorageError::CorruptObject(err.to_string())
    }
}
