use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use taskgate_core::{Error, Result};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::credential::{CredentialRecord, CredentialStore};

/// Environment variable holding a base64-encoded 32-byte master key.
pub const CREDENTIAL_KEY_ENV: &str = "TASKGATE_CREDENTIAL_KEY";

const RECORD_EXTENSION: &str = "cred";
const FORMAT_VERSION: u32 = 1;
const NONCE_LEN: usize = 24;

#[derive(Debug, Serialize, Deserialize)]
struct SealedRecord {
    version: u32,
    nonce: String,
    ciphertext: String,
}

/// Credential store keeping one XChaCha20-Poly1305 sealed file per id.
/// The id is bound as associated data, so a file renamed to another id
/// fails authentication.
pub struct EncryptedFileStore {
    dir: PathBuf,
    key: Zeroizing<[u8; 32]>,
}

impl EncryptedFileStore {
    /// Opens the store in `dir`. The key comes from `TASKGATE_CREDENTIAL_KEY`
    /// when set, otherwise from `key_file`, which is created on first use.
    pub fn open(dir: PathBuf, key_file: &Path) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let key = match std::env::var(CREDENTIAL_KEY_ENV) {
            Ok(encoded) if !encoded.trim().is_empty() => {
                debug!("Using credential key from environment");
                decode_key(encoded.trim())?
            }
            _ => load_or_create_key(key_file)?,
        };
        Ok(Self { dir, key })
    }

    pub fn with_key(dir: PathBuf, key: [u8; 32]) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            key: Zeroizing::new(key),
        })
    }

    /// Drops the store and wipes the in-memory key.
    pub fn close(self) {
        debug!(dir = %self.dir.display(), "Closing credential store");
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key[..]))
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", URL_SAFE_NO_PAD.encode(id.as_bytes()), RECORD_EXTENSION))
    }

    fn seal(&self, record: &CredentialRecord) -> Result<SealedRecord> {
        let plaintext = Zeroizing::new(serde_json::to_vec(record)?);
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_slice(),
                    aad: record.id.as_bytes(),
                },
            )
            .map_err(|e| Error::Crypto(format!("seal failed: {}", e)))?;

        Ok(SealedRecord {
            version: FORMAT_VERSION,
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    fn unseal(&self, id: &str, sealed: &SealedRecord) -> Result<CredentialRecord> {
        if sealed.version != FORMAT_VERSION {
            return Err(Error::Storage(format!(
                "unsupported credential format version {}",
                sealed.version
            )));
        }
        let nonce = STANDARD
            .decode(&sealed.nonce)
            .map_err(|_| Error::Crypto("malformed nonce".to_string()))?;
        if nonce.len() != NONCE_LEN {
            return Err(Error::Crypto("malformed nonce".to_string()));
        }
        let ciphertext = STANDARD
            .decode(&sealed.ciphertext)
            .map_err(|_| Error::Crypto("malformed ciphertext".to_string()))?;

        let plaintext = Zeroizing::new(
            self.cipher()
                .decrypt(
                    XNonce::from_slice(&nonce),
                    Payload {
                        msg: ciphertext.as_slice(),
                        aad: id.as_bytes(),
                    },
                )
                .map_err(|_| Error::Crypto("ciphertext authentication failed".to_string()))?,
        );

        let record: CredentialRecord = serde_json::from_slice(&plaintext)?;
        if record.id != id {
            return Err(Error::Crypto("record id mismatch".to_string()));
        }
        Ok(record)
    }
}

impl CredentialStore for EncryptedFileStore {
    fn get(&self, id: &str) -> Result<Option<CredentialRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let sealed: SealedRecord = serde_json::from_str(&content)?;
        self.unseal(id, &sealed).map(Some)
    }

    fn put(&self, record: &CredentialRecord) -> Result<()> {
        let sealed = self.seal(record)?;
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("tmp");
        write_private(&tmp, serde_json::to_string_pretty(&sealed)?.as_bytes())?;
        fs::rename(&tmp, &path)?;
        debug!(id = %record.id, "Stored credential record");
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        info!(id = %id, "Deleted credential record");
        Ok(true)
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match URL_SAFE_NO_PAD
                .decode(stem)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
            {
                Some(id) => ids.push(id),
                None => warn!(file = %path.display(), "Skipping credential file with undecodable name"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn decode_key(encoded: &str) -> Result<Zeroizing<[u8; 32]>> {
    let bytes = Zeroizing::new(
        STANDARD
            .decode(encoded)
            .map_err(|_| Error::Crypto("credential key is not valid base64".to_string()))?,
    );
    if bytes.len() != 32 {
        return Err(Error::Crypto("credential key must be 32 bytes".to_string()));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn load_or_create_key(key_file: &Path) -> Result<Zeroizing<[u8; 32]>> {
    if key_file.exists() {
        let encoded = Zeroizing::new(fs::read_to_string(key_file)?);
        return decode_key(encoded.trim());
    }

    let generated = XChaCha20Poly1305::generate_key(&mut OsRng);
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(generated.as_slice());

    if let Some(parent) = key_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let encoded = Zeroizing::new(STANDARD.encode(&key[..]));
    write_private(key_file, encoded.as_bytes())?;
    info!(path = %key_file.display(), "Generated new credential master key");
    Ok(key)
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}
