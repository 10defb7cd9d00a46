//! AEAD-at-rest credential storage, spec §4.9. Grounded on the private-key
//! encryption helper in `omo-protocol-defi-flow`'s `api/auth.rs`
//! (`aes_gcm::Aes256Gcm`, random 12-byte nonce stored alongside the
//! ciphertext) — adapted here to wrap an `ExchangeAdapter` credential
//! instead of a single private key, and to persist through the same
//! `credentials` table `SignalRepository`'s sibling repositories use.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use rand::RngCore;
use sqlx::Row;
use std::sync::Arc;

use crate::adapters::outbound::persistence::Database;
use crate::domain::models::{ApprovalStatus, Credential, PlaintextCredential};
use crate::ports::CredentialStore;

const NONCE_LEN: usize = 12;

pub struct AesGcmCredentialStore {
    db: Arc<Database>,
    key: [u8; 32],
}

impl AesGcmCredentialStore {
    /// `key_base64` is the standard-base64 encoding of a 32-byte AES-256 key,
    /// loaded once at startup from `MasterKeyConfig` and never logged.
    pub fn new(db: Arc<Database>, key_base64: &str) -> Result<Self> {
        let decoded = base64::engine::general_purpose::STANDARD.decode(key_base64).context("master key is not valid base64")?;
        if decoded.len() != 32 {
            bail!("master key must decode to exactly 32 bytes, got {}", decoded.len());
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded);
        Ok(AesGcmCredentialStore { db, key })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(&self.key).expect("key is always 32 bytes")
    }

    fn encrypt(&self, plaintext: &PlaintextCredential) -> Result<(Vec<u8>, Vec<u8>)> {
        #[derive(serde::Serialize)]
        struct Wire<'a> {
            api_key: &'a str,
            api_secret: &'a str,
            passphrase: &'a Option<String>,
        }
        let json = serde_json::to_vec(&Wire { api_key: &plaintext.api_key, api_secret: &plaintext.api_secret, passphrase: &plaintext.passphrase })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self.cipher().encrypt(nonce, json.as_ref()).map_err(|e| anyhow::anyhow!("credential encryption failed: {e}"))?;
        Ok((ciphertext, nonce_bytes.to_vec()))
    }

    fn decrypt(&self, ciphertext: &[u8], nonce_bytes: &[u8]) -> Result<PlaintextCredential> {
        if nonce_bytes.len() != NONCE_LEN {
            bail!("stored nonce has unexpected length {}", nonce_bytes.len());
        }
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self.cipher().decrypt(nonce, ciphertext).map_err(|e| anyhow::anyhow!("credential decryption failed: {e}"))?;

        #[derive(serde::Deserialize)]
        struct Wire {
            api_key: String,
            api_secret: String,
            passphrase: Option<String>,
        }
        let wire: Wire = serde_json::from_slice(&plaintext)?;
        Ok(PlaintextCredential { api_key: wire.api_key, api_secret: wire.api_secret, passphrase: wire.passphrase })
    }
}

#[async_trait]
impl CredentialStore for AesGcmCredentialStore {
    async fn put(&self, subscriber_id: &str, exchange_id: &str, plaintext: PlaintextCredential) -> Result<Credential> {
        let (ciphertext, nonce) = self.encrypt(&plaintext)?;
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO credentials (id, subscriber_id, exchange_id, status, active, last_error, ciphertext, nonce)
            VALUES (?, ?, ?, 'pending', 1, NULL, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(subscriber_id)
        .bind(exchange_id)
        .bind(&ciphertext)
        .bind(&nonce)
        .execute(&self.db.pool)
        .await?;

        Ok(Credential { id, subscriber_id: subscriber_id.to_string(), exchange_id: exchange_id.to_string(), status: ApprovalStatus::Pending, active: true, last_error: None })
    }

    async fn get_plaintext(&self, credential_id: &str) -> Result<PlaintextCredential> {
        let row = sqlx::query("SELECT ciphertext, nonce FROM credentials WHERE id = ?").bind(credential_id).fetch_one(&self.db.pool).await?;
        let ciphertext: Vec<u8> = row.try_get("ciphertext")?;
        let nonce: Vec<u8> = row.try_get("nonce")?;
        self.decrypt(&ciphertext, &nonce)
    }

    async fn disable(&self, credential_id: &str) -> Result<()> {
        sqlx::query("UPDATE credentials SET active = 0 WHERE id = ?").bind(credential_id).execute(&self.db.pool).await?;
        Ok(())
    }

    async fn status(&self, credential_id: &str) -> Result<Credential> {
        let row = sqlx::query("SELECT * FROM credentials WHERE id = ?").bind(credential_id).fetch_one(&self.db.pool).await?;
        let status: String = row.try_get("status")?;
        Ok(Credential {
            id: row.try_get("id")?,
            subscriber_id: row.try_get("subscriber_id")?,
            exchange_id: row.try_get("exchange_id")?,
            status: match status.as_str() {
                "approved" => ApprovalStatus::Approved,
                "rejected" => ApprovalStatus::Rejected,
                _ => ApprovalStatus::Pending,
            },
            active: row.try_get::<i64, _>("active")? != 0,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> String {
        base64::engine::general_purpose::STANDARD.encode([7u8; 32])
    }

    #[tokio::test]
    async fn round_trips_plaintext_through_encryption() {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let store = AesGcmCredentialStore::new(db, &sample_key()).unwrap();

        let credential = store
            .put("sub-1", "binance", PlaintextCredential { api_key: "key123".to_string(), api_secret: "secret456".to_string(), passphrase: None })
            .await
            .unwrap();

        let plaintext = store.get_plaintext(&credential.id).await.unwrap();
        assert_eq!(plaintext.api_key, "key123");
        assert_eq!(plaintext.api_secret, "secret456");
    }

    #[tokio::test]
    async fn rejects_master_key_of_wrong_length() {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let bad_key = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(AesGcmCredentialStore::new(db, &bad_key).is_err());
    }
}
