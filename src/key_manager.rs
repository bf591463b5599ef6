//! The key-manager contract: per-block AEAD-equivalent encryption and the
//! wrapped file-encryption-key (FEK) that binds a file's meta and all of
//! its blocks together. This is the "external collaborator" of spec.md
//! §6.3 — the core only ever sees ciphertext and the opaque wrapped FEK.
//!
//! [`LocalKeyManager`] is a software reference implementation built the
//! way `oxcrypt-core::fs::file_ctrmac` builds its CTR+HMAC cipher combo:
//! AES-256-CTR for confidentiality and HMAC-SHA256 for integrity, with a
//! random nonce and MAC per header. A real TEE deployment substitutes a
//! hardware-rooted key manager behind the same [`KeyManager`] trait.
//!
//! # Reference Implementation
//! - C: `tee_ree_fs.c` calls into `tee_fs_get_header_size`,
//!   `tee_fs_generate_fek`, `tee_fs_encrypt_file`, `tee_fs_decrypt_file`
//!   (defined in the external `tee_fs_key_manager` module, not part of
//!   this crate).
//! - Cipher combo: `oxcrypt-core::fs::file_ctrmac` (AES-256-CTR + HMAC-SHA256).

use aes::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use ring::hmac;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{instrument, trace, warn};
use zeroize::Zeroizing;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Which logical file the key manager is operating on. Meta and block
/// payloads are both encrypted under the same per-file key, but only the
/// meta header carries the wrapped FEK (see module docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Meta,
    Block,
}

const NONCE_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const WRAP_NONCE_SIZE: usize = 16;
const RAW_FEK_SIZE: usize = 32;

/// Size of the wrapped file-encryption key as carried in `FileMeta`:
/// a 16-byte wrap nonce followed by a 32-byte CTR-wrapped raw key.
pub const FEK_SIZE: usize = WRAP_NONCE_SIZE + RAW_FEK_SIZE;

const META_HEADER_SIZE: usize = NONCE_SIZE + FEK_SIZE + MAC_SIZE;
const BLOCK_HEADER_SIZE: usize = NONCE_SIZE + MAC_SIZE;

/// Opaque identifier for the principal requesting a fresh FEK (the
/// session/TA identity in the original API). Accepted for parity with the
/// external contract; `LocalKeyManager` does not cryptographically bind to
/// it since later `encrypt_file`/`decrypt_file` calls never see it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(pub [u8; 16]);

#[derive(Error, Debug)]
pub enum KeyManagerError {
    #[error("authentication failed: possible tampering or wrong key")]
    AuthenticationFailed,
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },
}

/// The key-manager contract consumed by [`crate::block_io`].
pub trait KeyManager: Send + Sync {
    /// Size in bytes of the opaque header prepended to an encrypted
    /// META_FILE or BLOCK_FILE payload.
    fn header_size(&self, file_type: FileType) -> usize;

    /// Mint a fresh, wrapped file-encryption key for a newly created file.
    fn generate_fek(&self, session: SessionId) -> Result<[u8; FEK_SIZE], KeyManagerError>;

    /// Encrypt `plaintext`, returning `header || ciphertext`.
    ///
    /// `encrypted_fek` is always an input: for `Meta` it is embedded
    /// verbatim into the header so it can be recovered without the caller
    /// supplying it again; for `Block` it only selects the encryption key.
    fn encrypt_file(
        &self,
        file_type: FileType,
        plaintext: &[u8],
        encrypted_fek: &[u8; FEK_SIZE],
    ) -> Result<Vec<u8>, KeyManagerError>;

    /// Decrypt a `header || ciphertext` blob produced by `encrypt_file`.
    ///
    /// For `Meta`, `encrypted_fek` is an output: the wrapped key embedded
    /// in the header is written back into it. For `Block`, `encrypted_fek`
    /// is an input the caller must already know (from a previously-read
    /// meta) and is used unchanged to select the decryption key.
    fn decrypt_file(
        &self,
        file_type: FileType,
        ciphertext: &[u8],
        encrypted_fek: &mut [u8; FEK_SIZE],
    ) -> Result<Vec<u8>, KeyManagerError>;
}

/// Software reference [`KeyManager`]: AES-256-CTR + HMAC-SHA256.
pub struct LocalKeyManager {
    wrap_key: Zeroizing<[u8; 32]>,
    wrap_mac_key: Zeroizing<[u8; 32]>,
}

impl LocalKeyManager {
    /// Build a key manager with a freshly generated random wrapping key.
    /// In a real deployment this key would be derived from hardware root
    /// of trust, not generated in-process.
    #[must_use]
    pub fn new_random() -> Self {
        let mut wrap_key = [0u8; 32];
        let mut wrap_mac_key = [0u8; 32];
        rand::rng().fill_bytes(&mut wrap_key);
        rand::rng().fill_bytes(&mut wrap_mac_key);
        Self {
            wrap_key: Zeroizing::new(wrap_key),
            wrap_mac_key: Zeroizing::new(wrap_mac_key),
        }
    }

    /// Build a key manager from explicit wrapping keys (useful for
    /// deterministic tests).
    #[must_use]
    pub fn from_keys(wrap_key: [u8; 32], wrap_mac_key: [u8; 32]) -> Self {
        Self {
            wrap_key: Zeroizing::new(wrap_key),
            wrap_mac_key: Zeroizing::new(wrap_mac_key),
        }
    }

    fn wrap_fek(&self, raw_fek: &[u8; RAW_FEK_SIZE]) -> [u8; FEK_SIZE] {
        let mut nonce = [0u8; WRAP_NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);

        let mut ciphertext = *raw_fek;
        let mut cipher = Aes256Ctr::new((&*self.wrap_key).into(), (&nonce).into());
        cipher.apply_keystream(&mut ciphertext);

        let mut out = [0u8; FEK_SIZE];
        out[..WRAP_NONCE_SIZE].copy_from_slice(&nonce);
        out[WRAP_NONCE_SIZE..].copy_from_slice(&ciphertext);
        out
    }

    fn unwrap_fek(&self, encrypted_fek: &[u8; FEK_SIZE]) -> Zeroizing<[u8; RAW_FEK_SIZE]> {
        let nonce: [u8; WRAP_NONCE_SIZE] = encrypted_fek[..WRAP_NONCE_SIZE].try_into().unwrap();
        let mut raw = Zeroizing::new([0u8; RAW_FEK_SIZE]);
        raw.copy_from_slice(&encrypted_fek[WRAP_NONCE_SIZE..]);
        let mut cipher = Aes256Ctr::new((&*self.wrap_key).into(), (&nonce).into());
        cipher.apply_keystream(raw.as_mut());
        raw
    }

    /// Derive the per-file content encryption and MAC subkeys from the raw
    /// FEK. A simple HMAC-based expansion, in the spirit of the teacher's
    /// `with_aes_key`/`with_mac_key` split of a single master secret.
    fn file_subkeys(&self, raw_fek: &[u8; RAW_FEK_SIZE]) -> (Zeroizing<[u8; 32]>, [u8; 32]) {
        let derive = |label: &[u8]| -> [u8; 32] {
            let key = hmac::Key::new(hmac::HMAC_SHA256, raw_fek);
            let tag = hmac::sign(&key, label);
            let mut out = [0u8; 32];
            out.copy_from_slice(tag.as_ref());
            out
        };
        (
            Zeroizing::new(derive(b"reefs-content-enc")),
            derive(b"reefs-content-mac"),
        )
    }
}

impl KeyManager for LocalKeyManager {
    fn header_size(&self, file_type: FileType) -> usize {
        match file_type {
            FileType::Meta => META_HEADER_SIZE,
            FileType::Block => BLOCK_HEADER_SIZE,
        }
    }

    #[instrument(level = "debug", skip(self))]
    fn generate_fek(&self, session: SessionId) -> Result<[u8; FEK_SIZE], KeyManagerError> {
        trace!(session = ?hex_session(session), "generating fresh FEK");
        let mut raw_fek = Zeroizing::new([0u8; RAW_FEK_SIZE]);
        rand::rng().fill_bytes(raw_fek.as_mut());
        Ok(self.wrap_fek(&raw_fek))
    }

    #[instrument(level = "debug", skip(self, plaintext, encrypted_fek), fields(plaintext_len = plaintext.len()))]
    fn encrypt_file(
        &self,
        file_type: FileType,
        plaintext: &[u8],
        encrypted_fek: &[u8; FEK_SIZE],
    ) -> Result<Vec<u8>, KeyManagerError> {
        let raw_fek = self.unwrap_fek(encrypted_fek);
        let (enc_key, mac_key) = self.file_subkeys(&raw_fek);

        let mut header_nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut header_nonce);

        let mut ciphertext = plaintext.to_vec();
        let mut cipher = Aes256Ctr::new((&*enc_key).into(), (&header_nonce).into());
        cipher.apply_keystream(&mut ciphertext);

        let mac_key = hmac::Key::new(hmac::HMAC_SHA256, &mac_key);
        let mut mac_ctx = hmac::Context::with_key(&mac_key);
        mac_ctx.update(&header_nonce);
        if file_type == FileType::Meta {
            mac_ctx.update(encrypted_fek);
        }
        mac_ctx.update(&ciphertext);
        let mac = mac_ctx.sign();

        let mut out = Vec::with_capacity(self.header_size(file_type) + ciphertext.len());
        out.extend_from_slice(&header_nonce);
        if file_type == FileType::Meta {
            out.extend_from_slice(encrypted_fek);
        }
        out.extend_from_slice(mac.as_ref());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    #[instrument(level = "debug", skip(self, ciphertext, encrypted_fek), fields(ciphertext_len = ciphertext.len()))]
    fn decrypt_file(
        &self,
        file_type: FileType,
        ciphertext: &[u8],
        encrypted_fek: &mut [u8; FEK_SIZE],
    ) -> Result<Vec<u8>, KeyManagerError> {
        let header_size = self.header_size(file_type);
        if ciphertext.len() < header_size {
            return Err(KeyManagerError::InvalidHeader {
                reason: format!(
                    "expected at least {header_size} bytes, got {}",
                    ciphertext.len()
                ),
            });
        }

        let header_nonce: [u8; NONCE_SIZE] = ciphertext[..NONCE_SIZE].try_into().unwrap();
        let mut cursor = NONCE_SIZE;

        if file_type == FileType::Meta {
            encrypted_fek.copy_from_slice(&ciphertext[cursor..cursor + FEK_SIZE]);
            cursor += FEK_SIZE;
        }

        let expected_mac = &ciphertext[cursor..cursor + MAC_SIZE];
        cursor += MAC_SIZE;
        let payload = &ciphertext[cursor..];

        let raw_fek = self.unwrap_fek(encrypted_fek);
        let (enc_key, mac_key) = self.file_subkeys(&raw_fek);

        let mac_key = hmac::Key::new(hmac::HMAC_SHA256, &mac_key);
        let mut mac_ctx = hmac::Context::with_key(&mac_key);
        mac_ctx.update(&header_nonce);
        if file_type == FileType::Meta {
            mac_ctx.update(encrypted_fek);
        }
        mac_ctx.update(payload);
        let computed_mac = mac_ctx.sign();

        if !bool::from(computed_mac.as_ref().ct_eq(expected_mac)) {
            warn!(?file_type, "MAC verification failed");
            return Err(KeyManagerError::AuthenticationFailed);
        }

        let mut plaintext = payload.to_vec();
        let mut cipher = Aes256Ctr::new((&*enc_key).into(), (&header_nonce).into());
        cipher.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }
}

fn hex_session(session: SessionId) -> String {
    session.0.iter().map(|b| format!("{b:02x}")).collect()
}
