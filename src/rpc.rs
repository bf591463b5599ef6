//! The untrusted RPC transport: a best-effort byte-addressable file that
//! lives outside the trust boundary. Everything in this module is the
//! "external collaborator" spec.md §6.2 describes — the core never assumes
//! anything about the medium's honesty beyond what [`RpcStorage`] promises
//! (it may observe, replay, reorder, or truncate writes across crashes).
//!
//! # Reference Implementation
//! - C: `tee_ree_fs.c` (`tee_fs_rpc_open/read/write/close/fsync/rename/remove`)

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing::instrument;

/// Opaque handle into the untrusted medium. `-1` denotes "unset", matching
/// the C backend's `fdp->fd = -1` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcFd(pub i32);

impl RpcFd {
    pub const INVALID: RpcFd = RpcFd(-1);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != -1
    }
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("RPC transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
}

/// The eight operations the core requires of the untrusted medium.
///
/// Implementations are free to be lossy or adversarial with respect to
/// *data* (the core authenticates every block), but must not silently
/// corrupt the *handle* bookkeeping within a single call: a `read`/`write`
/// either returns a byte count it actually transferred or an error.
pub trait RpcStorage: Send + Sync {
    fn open(&self, name: &str, create: bool) -> Result<RpcFd, RpcError>;
    fn read(&self, fd: RpcFd, buf: &mut [u8], offset: u64) -> Result<usize, RpcError>;
    fn write(&self, fd: RpcFd, buf: &[u8], offset: u64) -> Result<usize, RpcError>;
    fn close(&self, fd: RpcFd) -> Result<(), RpcError>;
    fn fsync(&self, fd: RpcFd) -> Result<(), RpcError>;
    fn rename(&self, old: &str, new: &str, overwrite: bool) -> Result<(), RpcError>;
    fn remove(&self, name: &str) -> Result<(), RpcError>;
}

struct OpenFile {
    name: String,
    file: std::fs::File,
}

/// Reference `RpcStorage` backed by ordinary files in a directory on disk.
///
/// This is the reference/test transport a consumer reaches for when
/// exercising the crate standalone (no real TEE/REE split available); a
/// production deployment substitutes a real cross-world RPC channel.
pub struct LocalFileRpc {
    root: PathBuf,
    open: Mutex<Vec<Option<OpenFile>>>,
}

impl LocalFileRpc {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: Mutex::new(Vec::new()),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl RpcStorage for LocalFileRpc {
    #[instrument(level = "debug", skip(self))]
    fn open(&self, name: &str, create: bool) -> Result<RpcFd, RpcError> {
        let path = self.path_for(name);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RpcError::NotFound
                } else {
                    RpcError::Io(e)
                }
            })?;

        let mut slots = self.open.lock().unwrap();
        let entry = OpenFile {
            name: name.to_string(),
            file,
        };
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(RpcFd(i as i32));
            }
        }
        slots.push(Some(entry));
        Ok(RpcFd((slots.len() - 1) as i32))
    }

    fn read(&self, fd: RpcFd, buf: &mut [u8], offset: u64) -> Result<usize, RpcError> {
        let mut slots = self.open.lock().unwrap();
        let entry = slots
            .get_mut(fd.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(RpcError::NotFound)?;
        let len = entry.file.metadata()?.len();
        if offset >= len {
            return Ok(0);
        }
        entry.file.seek(SeekFrom::Start(offset))?;
        let want = buf.len().min((len - offset) as usize);
        entry.file.read_exact(&mut buf[..want])?;
        Ok(want)
    }

    fn write(&self, fd: RpcFd, buf: &[u8], offset: u64) -> Result<usize, RpcError> {
        let mut slots = self.open.lock().unwrap();
        let entry = slots
            .get_mut(fd.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(RpcError::NotFound)?;
        entry.file.seek(SeekFrom::Start(offset))?;
        entry.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn close(&self, fd: RpcFd) -> Result<(), RpcError> {
        let mut slots = self.open.lock().unwrap();
        if let Some(slot) = slots.get_mut(fd.0 as usize) {
            *slot = None;
        }
        Ok(())
    }

    fn fsync(&self, fd: RpcFd) -> Result<(), RpcError> {
        let mut slots = self.open.lock().unwrap();
        let entry = slots
            .get_mut(fd.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(RpcError::NotFound)?;
        entry.file.sync_data()?;
        Ok(())
    }

    fn rename(&self, old: &str, new: &str, overwrite: bool) -> Result<(), RpcError> {
        let old_path = self.path_for(old);
        let new_path = self.path_for(new);
        if !overwrite && new_path.exists() {
            return Err(RpcError::AlreadyExists);
        }
        std::fs::rename(old_path, new_path)?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), RpcError> {
        let path = self.path_for(name);
        std::fs::remove_file(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RpcError::NotFound
            } else {
                RpcError::Io(e)
            }
        })
    }
}

/// A crash/fault-injection harness: decorates any [`RpcStorage`] and lets
/// a test drop, truncate, or fail specific calls by sequence number. This
/// is how the property and scenario tests simulate the medium crashing
/// mid-commit (SPEC_FULL.md §6.2). Not production surface.
#[cfg(any(test, feature = "test-util"))]
pub mod fault {
    use super::{RpcError, RpcFd, RpcStorage};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// What to do to the call at a given sequence number.
    #[derive(Debug, Clone, Copy)]
    pub enum Fault {
        /// Return `RpcError::Io` instead of performing the call.
        Fail,
        /// For a `write`: perform it but report a short byte count, as if
        /// the medium crashed partway through.
        TruncateWrite(usize),
        /// For a `write`: silently drop it (report success with the full
        /// byte count, but never touch the inner storage) — models a
        /// write that the medium acknowledged before crashing but never
        /// actually persisted.
        DropWrite,
    }

    /// Decorates `R` with a sequence counter over every call and an
    /// injectable fault table keyed by that sequence number.
    pub struct FaultInjectingRpc<R> {
        inner: R,
        seq: AtomicU64,
        faults: Mutex<HashMap<u64, Fault>>,
    }

    impl<R: RpcStorage> FaultInjectingRpc<R> {
        #[must_use]
        pub fn new(inner: R) -> Self {
            Self {
                inner,
                seq: AtomicU64::new(0),
                faults: Mutex::new(HashMap::new()),
            }
        }

        /// Arrange for the `n`th call (0-indexed, across all `RpcStorage`
        /// methods) to be affected by `fault`.
        pub fn inject(&self, seq: u64, fault: Fault) {
            self.faults.lock().unwrap().insert(seq, fault);
        }

        /// Sequence number of the next call, and the fault (if any)
        /// registered for it.
        fn next_seq(&self) -> (u64, Option<Fault>) {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            let fault = self.faults.lock().unwrap().get(&seq).copied();
            (seq, fault)
        }
    }

    impl<R: RpcStorage> RpcStorage for FaultInjectingRpc<R> {
        fn open(&self, name: &str, create: bool) -> Result<RpcFd, RpcError> {
            let (_, fault) = self.next_seq();
            if matches!(fault, Some(Fault::Fail)) {
                return Err(RpcError::Io(std::io::Error::other("injected fault")));
            }
            self.inner.open(name, create)
        }

        fn read(&self, fd: RpcFd, buf: &mut [u8], offset: u64) -> Result<usize, RpcError> {
            let (_, fault) = self.next_seq();
            if matches!(fault, Some(Fault::Fail)) {
                return Err(RpcError::Io(std::io::Error::other("injected fault")));
            }
            self.inner.read(fd, buf, offset)
        }

        fn write(&self, fd: RpcFd, buf: &[u8], offset: u64) -> Result<usize, RpcError> {
            let (_, fault) = self.next_seq();
            match fault {
                Some(Fault::Fail) => Err(RpcError::Io(std::io::Error::other("injected fault"))),
                Some(Fault::DropWrite) => Ok(buf.len()),
                Some(Fault::TruncateWrite(n)) => {
                    let written = self.inner.write(fd, &buf[..n.min(buf.len())], offset)?;
                    Ok(written)
                }
                None => self.inner.write(fd, buf, offset),
            }
        }

        fn close(&self, fd: RpcFd) -> Result<(), RpcError> {
            let (_, fault) = self.next_seq();
            if matches!(fault, Some(Fault::Fail)) {
                return Err(RpcError::Io(std::io::Error::other("injected fault")));
            }
            self.inner.close(fd)
        }

        fn fsync(&self, fd: RpcFd) -> Result<(), RpcError> {
            let (_, fault) = self.next_seq();
            if matches!(fault, Some(Fault::Fail)) {
                return Err(RpcError::Io(std::io::Error::other("injected fault")));
            }
            self.inner.fsync(fd)
        }

        fn rename(&self, old: &str, new: &str, overwrite: bool) -> Result<(), RpcError> {
            let (_, fault) = self.next_seq();
            if matches!(fault, Some(Fault::Fail)) {
                return Err(RpcError::Io(std::io::Error::other("injected fault")));
            }
            self.inner.rename(old, new, overwrite)
        }

        fn remove(&self, name: &str) -> Result<(), RpcError> {
            let (_, fault) = self.next_seq();
            if matches!(fault, Some(Fault::Fail)) {
                return Err(RpcError::Io(std::io::Error::other("injected fault")));
            }
            self.inner.remove(name)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::rpc::LocalFileRpc;
        use tempfile::TempDir;

        #[test]
        fn injected_failure_surfaces_as_io_error() {
            let dir = TempDir::new().unwrap();
            let rpc = FaultInjectingRpc::new(LocalFileRpc::new(dir.path()));
            // call 0 = open
            rpc.inject(1, Fault::Fail); // call 1 = write
            let fd = rpc.open("obj", true).unwrap();
            assert!(matches!(rpc.write(fd, b"data", 0), Err(RpcError::Io(_))));
        }

        #[test]
        fn dropped_write_reports_success_without_persisting() {
            let dir = TempDir::new().unwrap();
            let rpc = FaultInjectingRpc::new(LocalFileRpc::new(dir.path()));
            let fd = rpc.open("obj", true).unwrap();
            rpc.inject(1, Fault::DropWrite);
            assert_eq!(rpc.write(fd, b"data", 0).unwrap(), 4);

            let mut buf = [0u8; 4];
            assert_eq!(rpc.read(fd, &mut buf, 0).unwrap(), 0);
        }

        #[test]
        fn truncated_write_persists_only_a_prefix() {
            let dir = TempDir::new().unwrap();
            let rpc = FaultInjectingRpc::new(LocalFileRpc::new(dir.path()));
            let fd = rpc.open("obj", true).unwrap();
            rpc.inject(1, Fault::TruncateWrite(2));
            assert_eq!(rpc.write(fd, b"data", 0).unwrap(), 2);

            let mut buf = [0u8; 4];
            let n = rpc.read(fd, &mut buf, 0).unwrap();
            assert_eq!(n, 2);
            assert_eq!(&buf[..2], b"da");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_create_then_read_write_roundtrip() {
        let dir = TempDir::new().unwrap();
        let rpc = LocalFileRpc::new(dir.path());
        let fd = rpc.open("obj", true).unwrap();
        assert_eq!(rpc.write(fd, b"hello", 0).unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(rpc.read(fd, &mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        rpc.close(fd).unwrap();
    }

    #[test]
    fn read_past_eof_returns_zero() {
        let dir = TempDir::new().unwrap();
        let rpc = LocalFileRpc::new(dir.path());
        let fd = rpc.open("obj", true).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(rpc.read(fd, &mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn open_without_create_on_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let rpc = LocalFileRpc::new(dir.path());
        assert!(matches!(rpc.open("missing", false), Err(RpcError::NotFound)));
    }

    #[test]
    fn rename_without_overwrite_rejects_existing_target() {
        let dir = TempDir::new().unwrap();
        let rpc = LocalFileRpc::new(dir.path());
        rpc.open("a", true).unwrap();
        rpc.open("b", true).unwrap();
        assert!(matches!(
            rpc.rename("a", "b", false),
            Err(RpcError::AlreadyExists)
        ));
        rpc.rename("a", "b", true).unwrap();
    }
}
