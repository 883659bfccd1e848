use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use argon2::Argon2;
use parking_lot::Mutex;
use rand::RngCore;

use crate::error::{AdminError, Result};

/// The two tokens the console keeps between runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    /// Durable storage key for this token
    pub fn storage_key(&self) -> &'static str {
        match self {
            Self::Access => "accessToken",
            Self::Refresh => "refreshToken",
        }
    }
}

/// Process-wide token storage.
///
/// Implementations must not cache: every `get` reflects the last `set`/`clear`
/// made through any handle, so a refresh done by the gateway is immediately
/// visible to the channel manager.
pub trait CredentialStore: Send + Sync {
    fn get(&self, kind: TokenKind) -> Result<Option<String>>;

    fn set(&self, kind: TokenKind, token: &str) -> Result<()>;

    fn clear(&self, kind: TokenKind) -> Result<()>;

    /// Forget both tokens
    fn clear_all(&self) -> Result<()> {
        self.clear(TokenKind::Access)?;
        self.clear(TokenKind::Refresh)
    }
}

/// Plaintext layout inside the encrypted envelope
#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialPair {
    #[serde(rename = "accessToken", skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(rename = "refreshToken", skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

impl CredentialPair {
    fn slot(&mut self, kind: TokenKind) -> &mut Option<String> {
        match kind {
            TokenKind::Access => &mut self.access_token,
            TokenKind::Refresh => &mut self.refresh_token,
        }
    }

    fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

/// Encrypted envelope written to disk
#[derive(Debug, Serialize, Deserialize)]
struct TokenStorage {
    encrypted_data: String,
    nonce: String,
    salt: String,
    stored_at: i64,
}

impl TokenStorage {
    /// Encrypt `plaintext` under a fresh salt and nonce
    fn seal(plaintext: &[u8]) -> anyhow::Result<Self> {
        let mut salt = [0u8; 32];
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = machine_cipher(&salt)?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        Ok(Self {
            encrypted_data: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce),
            salt: BASE64.encode(salt),
            stored_at: chrono::Utc::now().timestamp(),
        })
    }

    fn open(&self) -> anyhow::Result<Vec<u8>> {
        let decode = |field: &str, value: &str| {
            BASE64.decode(value).with_context(|| format!("Credential file has a corrupt {}", field))
        };
        let ciphertext = decode("payload", &self.encrypted_data)?;
        let nonce = decode("nonce", &self.nonce)?;
        let salt = decode("salt", &self.salt)?;
        if nonce.len() != 12 {
            anyhow::bail!("Credential file has a malformed nonce");
        }

        machine_cipher(&salt)?
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|e| anyhow::anyhow!("Decryption failed: {}", e))
    }
}

/// Cipher keyed from the current user and host, so the file is useless elsewhere
fn machine_cipher(salt: &[u8]) -> anyhow::Result<Aes256Gcm> {
    let user = std::env::var("USER").or_else(|_| std::env::var("USERNAME")).unwrap_or_default();
    let host = gethostname::gethostname();
    let material = format!("{}{}rental-admin-credentials-v1", user, host.to_string_lossy());

    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(material.as_bytes(), salt, &mut key)
        .map_err(|e| anyhow::anyhow!("Failed to derive key: {}", e))?;

    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)))
}

/// Credential pair persisted as an encrypted JSON file
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> anyhow::Result<CredentialPair> {
        if !self.path.exists() {
            return Ok(CredentialPair::default());
        }

        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let envelope: TokenStorage = serde_json::from_str(&raw)
            .context("Credential file is not a valid envelope")?;

        serde_json::from_slice(&envelope.open()?)
            .context("Failed to parse decrypted credentials")
    }

    /// Persist `pair`, or delete the file once both tokens are gone
    fn store(&self, pair: &CredentialPair) -> anyhow::Result<()> {
        if pair.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
                debug!("Removed credential file {}", self.path.display());
            }
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let envelope = TokenStorage::seal(&serde_json::to_vec(pair)?)?;
        std::fs::write(&self.path, serde_json::to_string_pretty(&envelope)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        debug!("Credentials written to {}", self.path.display());
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, kind: TokenKind) -> Result<Option<String>> {
        let mut pair = self.load().map_err(AdminError::Storage)?;
        Ok(pair.slot(kind).take())
    }

    fn set(&self, kind: TokenKind, token: &str) -> Result<()> {
        let mut pair = self.load().map_err(AdminError::Storage)?;
        *pair.slot(kind) = Some(token.to_string());
        self.store(&pair).map_err(AdminError::Storage)?;
        info!("Stored {}", kind.storage_key());
        Ok(())
    }

    fn clear(&self, kind: TokenKind) -> Result<()> {
        let mut pair = self.load().map_err(AdminError::Storage)?;
        if pair.slot(kind).take().is_none() {
            return Ok(());
        }
        self.store(&pair).map_err(AdminError::Storage)
    }

    fn clear_all(&self) -> Result<()> {
        self.store(&CredentialPair::default()).map_err(AdminError::Storage)
    }
}

/// In-process credential storage
#[derive(Default)]
pub struct MemoryCredentialStore {
    tokens: Mutex<HashMap<TokenKind, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated store
    pub fn with_tokens(access: Option<&str>, refresh: Option<&str>) -> Self {
        let store = Self::new();
        {
            let mut tokens = store.tokens.lock();
            if let Some(access) = access {
                tokens.insert(TokenKind::Access, access.to_string());
            }
            if let Some(refresh) = refresh {
                tokens.insert(TokenKind::Refresh, refresh.to_string());
            }
        }
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, kind: TokenKind) -> Result<Option<String>> {
        Ok(self.tokens.lock().get(&kind).cloned())
    }

    fn set(&self, kind: TokenKind, token: &str) -> Result<()> {
        self.tokens.lock().insert(kind, token.to_string());
        Ok(())
    }

    fn clear(&self, kind: TokenKind) -> Result<()> {
        self.tokens.lock().remove(&kind);
        Ok(())
    }
}
