//! Credential provider: decrypts a source's stored API credentials and
//! performs the authentication round-trip against the upstream token
//! endpoint. Ciphertext handling stays entirely inside this module; the
//! pipeline only ever sees a usable access token.

use std::path::Path;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use serde::Deserialize;
use tracing::info;

use logrelay_core::config::{EncryptionConfig, UpstreamConfig};
use logrelay_store::SourceRow;

use crate::error::PipelineError;

/// Decrypted, authenticated credentials for one source.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_email: String,
    pub access_token: String,
}

/// Capability consumed by the fetch pipeline.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Decrypt and authenticate. `Credential` failures deactivate the
    /// source upstream of this call.
    async fn resolve(&self, source: &SourceRow) -> Result<Credentials, PipelineError>;
}

// ── Encryption helpers ────────────────────────────────────────────

/// Encrypt a credential field using AES-256-GCM. Returns "iv:tag:ciphertext"
/// in hex. Used by the external registration layer and by tests.
pub fn encrypt_field(key: &[u8; 32], plaintext: &str) -> anyhow::Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("failed to create cipher: {}", e))?;

    let mut iv_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut iv_bytes);
    let nonce = Nonce::from_slice(&iv_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| anyhow::anyhow!("encryption failed: {}", e))?;

    // AES-GCM appends the 16-byte tag; split it out for storage clarity.
    let tag_offset = ciphertext.len() - 16;
    let ct = &ciphertext[..tag_offset];
    let tag = &ciphertext[tag_offset..];

    Ok(format!(
        "{}:{}:{}",
        hex::encode(iv_bytes),
        hex::encode(tag),
        hex::encode(ct)
    ))
}

/// Decrypt a credential field from "iv:tag:ciphertext" hex format.
pub fn decrypt_field(key: &[u8; 32], encrypted: &str) -> anyhow::Result<String> {
    let parts: Vec<&str> = encrypted.splitn(3, ':').collect();
    if parts.len() != 3 {
        anyhow::bail!("invalid encrypted field format (expected iv:tag:ciphertext)");
    }

    let iv_bytes = hex::decode(parts[0])?;
    let tag_bytes = hex::decode(parts[1])?;
    let ct_bytes = hex::decode(parts[2])?;

    if iv_bytes.len() != 12 {
        anyhow::bail!("invalid IV length: expected 12, got {}", iv_bytes.len());
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("failed to create cipher: {}", e))?;
    let nonce = Nonce::from_slice(&iv_bytes);

    let mut combined = ct_bytes;
    combined.extend_from_slice(&tag_bytes);

    let plaintext = cipher
        .decrypt(nonce, combined.as_ref())
        .map_err(|e| anyhow::anyhow!("decryption failed: {}", e))?;

    Ok(String::from_utf8(plaintext)?)
}

/// Load the encryption key from config or auto-generate a key file in
/// `{data_dir}/.relay_key`.
pub fn load_or_generate_key(config: &EncryptionConfig) -> anyhow::Result<[u8; 32]> {
    if let Some(ref env_key) = config.key_hex {
        let key_bytes = hex::decode(env_key.trim())?;
        if key_bytes.len() != 32 {
            anyhow::bail!(
                "RELAY_ENCRYPTION_KEY must be 64 hex characters (32 bytes), got {} bytes",
                key_bytes.len()
            );
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);
        info!("Using encryption key from RELAY_ENCRYPTION_KEY");
        return Ok(key);
    }

    let data_dir = Path::new(&config.data_dir);
    let key_path = data_dir.join(".relay_key");
    if key_path.exists() {
        let hex_key = std::fs::read_to_string(&key_path)?;
        let key_bytes = hex::decode(hex_key.trim())?;
        if key_bytes.len() != 32 {
            anyhow::bail!(
                "invalid key file at {}: expected 32 bytes, got {}",
                key_path.display(),
                key_bytes.len()
            );
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);
        info!("Loaded encryption key from {}", key_path.display());
        return Ok(key);
    }

    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&key_path, hex::encode(key))?;
    info!("Generated new encryption key at {}", key_path.display());
    Ok(key)
}

// ── Provider ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Provider backed by AES-256-GCM encrypted columns and an OAuth-style
/// token endpoint.
pub struct AesCredentialProvider {
    key: [u8; 32],
    token_url: String,
    client: reqwest::Client,
}

impl AesCredentialProvider {
    pub fn new(key: [u8; 32], upstream: &UpstreamConfig) -> Self {
        Self {
            key,
            token_url: upstream.token_url.clone(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl CredentialProvider for AesCredentialProvider {
    async fn resolve(&self, source: &SourceRow) -> Result<Credentials, PipelineError> {
        let client_email = decrypt_field(&self.key, &source.credentials_client_email)
            .map_err(|e| PipelineError::Credential(format!("decrypt failed: {e}")))?;
        let private_key = decrypt_field(&self.key, &source.credentials_private_key)
            .map_err(|e| PipelineError::Credential(format!("decrypt failed: {e}")))?;

        let response = self
            .client
            .post(&self.token_url)
            .json(&serde_json::json!({
                "client_email": client_email,
                "private_key": private_key,
                "scopes": source.credentials_scopes,
            }))
            .send()
            .await
            .map_err(|e| PipelineError::Upstream(format!("token request failed: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Credential(format!(
                "authentication rejected ({status}): {body}"
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::Upstream(format!(
                "token endpoint returned {status}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Upstream(format!("malformed token response: {e}")))?;

        Ok(Credentials {
            client_email,
            access_token: token.access_token,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
