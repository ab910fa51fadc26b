//! Exchange credential storage and decryption.
//!
//! Key pairs are stored encrypted. They are decrypted into `SecretString`s
//! that redact themselves in `Debug` output and are zeroed on drop.

use crate::db::{CredentialRepository, Store};
use crate::error::CredentialError;
use crate::models::credential::{ApiCredential, NewCredential};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::Arc;

const NONCE_LEN: usize = 12;

/// Decrypted key pair, valid for one execution cycle
pub struct CredentialPair {
    api_key: SecretString,
    secret: SecretString,
}

impl CredentialPair {
    pub fn new(api_key: SecretString, secret: SecretString) -> Self {
        Self { api_key, secret }
    }

    /// Only for building signed requests. Never log the result.
    pub fn expose_api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Only for building signed requests. Never log the result.
    pub fn expose_secret(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("api_key", &"[REDACTED]")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialStatus {
    pub active: bool,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `None` when the credential does not exist or belongs to someone else
    async fn get(
        &self,
        credential_id: i64,
        owner_id: i64,
    ) -> Result<Option<CredentialStatus>, CredentialError>;

    async fn decrypt(&self, credential_id: i64) -> Result<CredentialPair, CredentialError>;
}

/// Symmetric cipher for credential fields
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError>;
    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, CredentialError>;
}

/// AES-256-GCM; ciphertext is base64 of `nonce || ciphertext`
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> Result<Self, CredentialError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| CredentialError::InvalidKey(format!("expected 32 bytes, got {}", key.len())))?;
        Ok(Self { cipher })
    }

    /// Key given as base64 (the `CREDENTIAL_KEY` format)
    pub fn from_base64(key: &str) -> Result<Self, CredentialError> {
        let bytes = STANDARD
            .decode(key.trim())
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        Self::new(&bytes)
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CredentialError::Encrypt(e.to_string()))?;

        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(payload))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, CredentialError> {
        let payload = STANDARD
            .decode(ciphertext)
            .map_err(|e| CredentialError::Decrypt(e.to_string()))?;
        if payload.len() <= NONCE_LEN {
            return Err(CredentialError::Decrypt("payload too short".to_string()));
        }

        let (nonce, body) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CredentialError::Decrypt("authentication failed".to_string()))?;
        let text =
            String::from_utf8(plaintext).map_err(|e| CredentialError::Decrypt(e.to_string()))?;
        Ok(SecretString::from(text))
    }
}

/// Stand-in when no `CREDENTIAL_KEY` is configured. Status lookups still
/// work; anything needing the plaintext fails with `MissingKey`.
pub struct MissingKeyCipher;

impl SecretCipher for MissingKeyCipher {
    fn encrypt(&self, _plaintext: &str) -> Result<String, CredentialError> {
        Err(CredentialError::MissingKey)
    }

    fn decrypt(&self, _ciphertext: &str) -> Result<SecretString, CredentialError> {
        Err(CredentialError::MissingKey)
    }
}

/// AES-GCM when a key is configured, [`MissingKeyCipher`] otherwise
pub fn cipher_from_key(key: Option<&str>) -> Result<Arc<dyn SecretCipher>, CredentialError> {
    match key {
        Some(key) => Ok(Arc::new(AesGcmCipher::from_base64(key)?)),
        None => Ok(Arc::new(MissingKeyCipher)),
    }
}

/// Credential store over the repository and a cipher
pub struct CredentialVault {
    store: Arc<dyn Store>,
    cipher: Arc<dyn SecretCipher>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn Store>, cipher: Arc<dyn SecretCipher>) -> Self {
        Self { store, cipher }
    }

    /// Encrypt and persist a new key pair
    pub async fn register(
        &self,
        user_id: i64,
        exchange: &str,
        api_key: &str,
        secret: &str,
    ) -> Result<ApiCredential, CredentialError> {
        let credential = NewCredential {
            user_id,
            exchange: exchange.to_string(),
            api_key_encrypted: self.cipher.encrypt(api_key)?,
            secret_key_encrypted: self.cipher.encrypt(secret)?,
            is_active: true,
        };
        Ok(self.store.insert_credential(credential).await?)
    }
}

#[async_trait]
impl CredentialStore for CredentialVault {
    async fn get(
        &self,
        credential_id: i64,
        owner_id: i64,
    ) -> Result<Option<CredentialStatus>, CredentialError> {
        let credential = self.store.get_credential(credential_id).await?;
        Ok(credential
            .filter(|c| c.user_id == owner_id)
            .map(|c| CredentialStatus {
                active: c.is_active,
            }))
    }

    async fn decrypt(&self, credential_id: i64) -> Result<CredentialPair, CredentialError> {
        let credential = self
            .store
            .get_credential(credential_id)
            .await?
            .ok_or(CredentialError::NotFound(credential_id))?;
        if !credential.is_active {
            return Err(CredentialError::Inactive(credential_id));
        }

        Ok(CredentialPair::new(
            self.cipher.decrypt(&credential.api_key_encrypted)?,
            self.cipher.decrypt(&credential.secret_key_encrypted)?,
        ))
    }
}
