//! Per-device pre-shared key generation, persistence and retrieval.
//!
//! One key file per device uid, stored as 64 lowercase hex characters
//! under a 0700 directory. The key is written to the device's `key`
//! attribute in exactly this hex form, so the file content and the
//! on-wire payload are the same bytes.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::AuthError;

/// Raw key length in bytes.
pub const KEY_BYTES: usize = 32;
/// On-wire and on-disk key length: hex encoding of [`KEY_BYTES`].
pub const KEY_CHARS: usize = 64;

/// A device key, held as its hex encoding. Zeroized on drop.
#[derive(Debug, Zeroize, ZeroizeOnDrop)]
pub struct Key(Vec<u8>);

impl Key {
    /// The hex-encoded key bytes, as written to the `key` attribute.
    pub fn hex_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Filesystem-backed key store.
///
/// All mutating operations take `&mut self`; key creation for a uid is
/// therefore serialized by the borrow, which is all the one-key-per-uid
/// invariant needs in the single-threaded model.
pub struct KeyStore {
    root: PathBuf,
}

impl KeyStore {
    /// Open (creating if needed) the key directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, AuthError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| AuthError::Store(format!("create key dir {}: {e}", root.display())))?;
        restrict_mode(&root, 0o700)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the key for `uid`, generating and persisting one if absent.
    ///
    /// The second element reports whether a new key was created in this
    /// call. Callers must not write anything to the device if this fails.
    pub fn ensure_key(
        &mut self,
        uid: &str,
        force_regenerate: bool,
    ) -> Result<(Key, bool), AuthError> {
        let path = self.key_path(uid)?;
        if !force_regenerate && path.exists() {
            return Ok((self.load_key(uid)?, false));
        }

        let mut raw = [0u8; KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        let encoded = hex::encode(raw);
        raw.zeroize();

        write_atomic(&path, encoded.as_bytes())
            .map_err(|e| AuthError::Store(format!("persist key for {uid}: {e}")))?;
        restrict_mode(&path, 0o600)?;

        Ok((Key(encoded.into_bytes()), true))
    }

    /// Load an existing key in one complete read.
    ///
    /// A file of the wrong length is corruption, not "no key".
    pub fn load_key(&self, uid: &str) -> Result<Key, AuthError> {
        let path = self.key_path(uid)?;
        let bytes = fs::read(&path)
            .map_err(|e| AuthError::Store(format!("read key for {uid}: {e}")))?;
        if bytes.len() != KEY_CHARS {
            return Err(AuthError::Store(format!(
                "key file for {uid} is corrupt: {} of {KEY_CHARS} bytes",
                bytes.len()
            )));
        }
        if !bytes.iter().all(u8::is_ascii_hexdigit) {
            return Err(AuthError::Store(format!(
                "key file for {uid} is corrupt: not hex"
            )));
        }
        Ok(Key(bytes))
    }

    /// Whether a key has previously been provisioned for `uid`.
    pub fn has_key(&self, uid: &str) -> bool {
        self.key_path(uid).map(|p| p.exists()).unwrap_or(false)
    }

    /// Discard the key for `uid`. Returns whether one existed.
    pub fn forget_key(&mut self, uid: &str) -> Result<bool, AuthError> {
        let path = self.key_path(uid)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AuthError::Store(format!("forget key for {uid}: {e}"))),
        }
    }

    fn key_path(&self, uid: &str) -> Result<PathBuf, AuthError> {
        let sanitized = sanitize_uid(uid)?;
        Ok(self.root.join(format!("{sanitized}.key")))
    }
}

/// A uid names a file in the key directory, so only the characters that
/// appear in real Thunderbolt uids are allowed through.
fn sanitize_uid(uid: &str) -> Result<String, AuthError> {
    let trimmed = uid.trim();
    if trimmed.is_empty() {
        return Err(AuthError::Store("device uid cannot be empty".into()));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(AuthError::Store(format!(
            "device uid {trimmed:?} contains characters unsuitable for a key file name"
        )));
    }
    Ok(trimmed.to_lowercase())
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)
}

fn restrict_mode(path: &Path, mode: u32) -> Result<(), AuthError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| AuthError::Store(format!("restrict mode on {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID: &str = "c4010000-0060-8718-23a5-a10e21a1a6e1";

    fn open_store() -> (tempfile::TempDir, KeyStore) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = KeyStore::open(tmp.path().join("keys")).expect("open");
        (tmp, store)
    }

    #[test]
    fn ensure_key_is_idempotent() {
        let (_tmp, mut store) = open_store();
        let (first, created) = store.ensure_key(UID, false).expect("create");
        assert!(created);
        assert_eq!(first.len(), KEY_CHARS);

        let (second, created) = store.ensure_key(UID, false).expect("reuse");
        assert!(!created);
        assert_eq!(first.hex_bytes(), second.hex_bytes());
    }

    #[test]
    fn force_regenerate_replaces_the_key() {
        let (_tmp, mut store) = open_store();
        let (first, _) = store.ensure_key(UID, false).expect("create");
        let (second, created) = store.ensure_key(UID, true).expect("regenerate");
        assert!(created);
        assert_ne!(first.hex_bytes(), second.hex_bytes());
    }

    #[test]
    fn truncated_key_file_is_corruption() {
        let (_tmp, mut store) = open_store();
        store.ensure_key(UID, false).expect("create");
        let path = store.key_path(UID).expect("path");
        fs::write(&path, b"deadbeef").expect("truncate");

        let err = store.ensure_key(UID, false).expect_err("must fail");
        assert!(matches!(err, AuthError::Store(_)), "got {err}");
    }

    #[test]
    fn forget_key_removes_the_file() {
        let (_tmp, mut store) = open_store();
        store.ensure_key(UID, false).expect("create");
        assert!(store.has_key(UID));
        assert!(store.forget_key(UID).expect("forget"));
        assert!(!store.has_key(UID));
        assert!(!store.forget_key(UID).expect("second forget"));
    }

    #[test]
    fn hostile_uid_is_rejected() {
        let (_tmp, mut store) = open_store();
        let err = store
            .ensure_key("../../etc/shadow", false)
            .expect_err("must fail");
        assert!(matches!(err, AuthError::Store(_)));
    }
}
