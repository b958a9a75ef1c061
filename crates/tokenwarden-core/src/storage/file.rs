use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use tracing::debug;

use super::{StorageBackend, StorageError, StorageResult};
use crate::utils::lock;

/// Default credential file name in the data directory
pub const CREDENTIALS_FILE: &str = "credentials.bin";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

type Entries = BTreeMap<String, String>;

/// Stores all keys as one JSON object in a single file.
///
/// With a passphrase the file is sealed with ChaCha20-Poly1305; the key is
/// derived with Argon2 and the file layout is `salt || nonce || ciphertext`.
/// The salt is kept for the life of the file, the nonce changes on every write.
pub struct FileBackend {
    path: PathBuf,
    encryption: Option<Encryption>,
    io_lock: Mutex<()>,
}

struct Encryption {
    passphrase: String,
    /// Last derived key and the salt it belongs to
    derived: Mutex<Option<([u8; SALT_LEN], [u8; KEY_LEN])>>,
}

impl FileBackend {
    /// Plaintext JSON file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            encryption: None,
            io_lock: Mutex::new(()),
        }
    }

    /// File encrypted at rest with a key derived from `passphrase`
    pub fn encrypted(path: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            encryption: Some(Encryption {
                passphrase: passphrase.into(),
                derived: Mutex::new(None),
            }),
            io_lock: Mutex::new(()),
        }
    }

    /// Default location under the platform's local data directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join(crate::APP_NAME).join(CREDENTIALS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    fn read_entries(&self) -> StorageResult<Entries> {
        if !self.path.exists() {
            return Ok(Entries::new());
        }
        let bytes = std::fs::read(&self.path)?;
        if bytes.is_empty() {
            return Ok(Entries::new());
        }
        let plaintext = match &self.encryption {
            Some(enc) => enc.open(&bytes)?,
            None => bytes,
        };
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn write_entries(&self, entries: &Entries) -> StorageResult<()> {
        let plaintext = serde_json::to_vec(entries)?;
        let contents = match &self.encryption {
            Some(enc) => enc.seal(&plaintext)?,
            None => plaintext,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let _guard = lock(&self.io_lock);
        Ok(self.read_entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let _guard = lock(&self.io_lock);
        let mut entries = self.read_entries()?;
        entries.insert(key.to_string(), value.to_string());
        self.write_entries(&entries)
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        let _guard = lock(&self.io_lock);
        let mut entries = self.read_entries()?;
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        if entries.is_empty() {
            std::fs::remove_file(&self.path)?;
            debug!(path = ?self.path, "Removed empty credential file");
        } else {
            self.write_entries(&entries)?;
        }
        Ok(true)
    }

    fn is_available(&self) -> bool {
        match self.path.parent() {
            Some(parent) => std::fs::create_dir_all(parent).is_ok(),
            None => false,
        }
    }
}

impl Encryption {
    fn key_for(&self, salt: &[u8; SALT_LEN]) -> StorageResult<[u8; KEY_LEN]> {
        let mut derived = lock(&self.derived);
        if let Some((cached_salt, key)) = derived.as_ref() {
            if cached_salt == salt {
                return Ok(*key);
            }
        }
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| StorageError::Crypto(format!("key derivation failed: {}", e)))?;
        *derived = Some((*salt, key));
        Ok(key)
    }

    fn current_salt(&self) -> [u8; SALT_LEN] {
        if let Some((salt, _)) = lock(&self.derived).as_ref() {
            return *salt;
        }
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        salt
    }

    fn seal(&self, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let salt = self.current_salt();
        let key = self.key_for(&salt)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StorageError::Crypto("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, bytes: &[u8]) -> StorageResult<Vec<u8>> {
        if bytes.len() < SALT_LEN + NONCE_LEN {
            return Err(StorageError::Crypto("credential file is truncated".to_string()));
        }
        let (salt, rest) = bytes.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let mut salt_arr = [0u8; SALT_LEN];
        salt_arr.copy_from_slice(salt);

        let key = self.key_for(&salt_arr)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                StorageError::Crypto("decryption failed (wrong passphrase or tampered file)".to_string())
            })
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
