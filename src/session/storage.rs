//! Durable session blobs, optionally encrypted at rest.
//!
//! One file per session key: `{dir}/{key}.session`. With a master key the
//! file holds `MAGIC || nonce || XChaCha20-Poly1305(json)`; without one it is
//! plain JSON. Plain files are still readable after a key is configured, so
//! existing sessions survive turning encryption on.

use std::fs;
use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::store::SessionRecord;
use crate::pipeline::sanitize_path_segment;

const SESSION_FILE_EXT: &str = "session";
const MAGIC: &[u8; 4] = b"HVS1";
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Errors for durable session storage.
#[derive(Debug, thiserror::Error)]
pub enum SessionStorageError {
    /// Filesystem I/O failed.
    #[error("session storage I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Serialization/deserialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// An encrypted blob was found but no master key is configured.
    #[error("session {path} is encrypted; set the session master key to read it")]
    KeyRequired { path: PathBuf },
    /// Stored encrypted payload is malformed.
    #[error("persisted session payload is invalid")]
    InvalidPayload,
    /// Encryption failed.
    #[error("failed to encrypt session")]
    EncryptionFailed,
    /// Decryption failed (wrong key or tampered file).
    #[error("failed to decrypt session")]
    DecryptionFailed,
}

impl SessionStorageError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// File-backed session storage.
#[derive(Clone)]
pub struct SessionStorage {
    dir: PathBuf,
    master_key: Option<String>,
}

impl std::fmt::Debug for SessionStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStorage")
            .field("dir", &self.dir)
            .field("encrypted", &self.master_key.is_some())
            .finish()
    }
}

impl SessionStorage {
    /// Creates storage rooted at `dir`. A blank master key means plain JSON.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, master_key: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            master_key: master_key.filter(|key| !key.trim().is_empty()),
        }
    }

    /// Directory holding the session files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether new blobs are written encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.master_key.is_some()
    }

    /// File path for a session key.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name = sanitize_path_segment(key);
        self.dir.join(format!("{name}.{SESSION_FILE_EXT}"))
    }

    /// Loads a session blob. Returns `Ok(None)` when no file exists.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStorageError`] when the file cannot be read, decrypted,
    /// or parsed.
    pub fn load(&self, key: &str) -> Result<Option<SessionRecord>, SessionStorageError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SessionStorageError::io(&path, e)),
        };

        let plaintext = if bytes.starts_with(MAGIC) {
            let key_material = self
                .master_key
                .as_deref()
                .ok_or_else(|| SessionStorageError::KeyRequired { path: path.clone() })?;
            decrypt_bytes(&bytes, key_material)?
        } else {
            bytes
        };

        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    /// Writes a session blob, replacing any previous one.
    ///
    /// The blob is written to a sibling temp file and renamed into place, so
    /// readers never see a half-written session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStorageError`] when serialization, encryption, or the
    /// file write fails.
    pub fn save(&self, key: &str, record: &SessionRecord) -> Result<PathBuf, SessionStorageError> {
        let plaintext = serde_json::to_vec_pretty(record)?;
        let payload = match self.master_key.as_deref() {
            Some(key_material) => encrypt_bytes(&plaintext, key_material)?,
            None => plaintext,
        };

        fs::create_dir_all(&self.dir).map_err(|e| SessionStorageError::io(&self.dir, e))?;

        let path = self.path_for(key);
        let tmp = path.with_extension(format!("{SESSION_FILE_EXT}.{:08x}.tmp", rand::random::<u32>()));
        fs::write(&tmp, &payload).map_err(|e| SessionStorageError::io(&tmp, e))?;
        set_owner_only_permissions(&tmp)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(SessionStorageError::io(&path, e));
        }

        debug!(path = %path.display(), encrypted = self.is_encrypted(), "session written");
        Ok(path)
    }

    /// Deletes a session blob. Returns `true` when a file was removed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStorageError::Io`] when removal fails for a reason other
    /// than the file being absent.
    pub fn remove(&self, key: &str) -> Result<bool, SessionStorageError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SessionStorageError::io(&path, e)),
        }
    }
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<(), SessionStorageError> {
    use std::os::unix::fs::PermissionsExt;

    let permissions = fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, permissions).map_err(|e| SessionStorageError::io(path, e))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<(), SessionStorageError> {
    Ok(())
}

fn derive_key_bytes(key_material: &str) -> [u8; KEY_LEN] {
    let digest = Sha256::digest(key_material.as_bytes());
    let mut key = [0_u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    key
}

fn encrypt_bytes(plaintext: &[u8], key_material: &str) -> Result<Vec<u8>, SessionStorageError> {
    let key_bytes = derive_key_bytes(key_material);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));

    let mut nonce = [0_u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| SessionStorageError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
    output.extend_from_slice(MAGIC);
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

fn decrypt_bytes(payload: &[u8], key_material: &str) -> Result<Vec<u8>, SessionStorageError> {
    if payload.len() < MAGIC.len() + NONCE_LEN || &payload[..MAGIC.len()] != MAGIC {
        return Err(SessionStorageError::InvalidPayload);
    }

    let key_bytes = derive_key_bytes(key_material);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    let nonce_end = MAGIC.len() + NONCE_LEN;
    let nonce = XNonce::from_slice(&payload[MAGIC.len()..nonce_end]);

    cipher
        .decrypt(nonce, &payload[nonce_end..])
        .map_err(|_| SessionStorageError::DecryptionFailed)
}
