//! Envelope AEAD encryption with attribute-bound AAD (spec §4.K).

use std::collections::BTreeMap;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use tabletheory_core::AttributeValue;
use zeroize::Zeroize;

use crate::client::KmsClient;
use crate::error::{Result, TableTheoryError};

const ENVELOPE_VERSION: i64 = 1;
const NONCE_LEN: usize = 12;

/// Injectable randomness source for nonce generation (spec §6's
/// `encryption_rand` configuration option).
pub trait RandSource: Send + Sync {
    fn fill(&self, buf: &mut [u8]);
}

/// [`RandSource`] backed by the OS CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandSource;

impl RandSource for OsRandSource {
    fn fill(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }
}

/// A fixed byte sequence, repeated to fill any buffer. Deterministic nonces
/// exist only for tests; never use this outside one.
pub struct FixedRandSource(pub Vec<u8>);

impl RandSource for FixedRandSource {
    fn fill(&self, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.0[i % self.0.len().max(1)];
        }
    }
}

/// Handles per-attribute envelope encryption, given a configured KMS key
/// and randomness source.
pub struct Encryptor {
    kms: Arc<dyn KmsClient>,
    key_arn: String,
    rand: Arc<dyn RandSource>,
}

impl Encryptor {
    pub fn new(kms: Arc<dyn KmsClient>, key_arn: impl Into<String>, rand: Arc<dyn RandSource>) -> Self {
        Self {
            kms,
            key_arn: key_arn.into(),
            rand,
        }
    }

    /// Encrypts `plaintext` for `store_attr_name`, producing the `{v, edk,
    /// nonce, ct}` envelope map attribute.
    pub async fn encrypt(&self, store_attr_name: &str, plaintext: &str) -> Result<AttributeValue> {
        let mut data_key = self.kms.generate_data_key(&self.key_arn).await?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rand.fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&data_key.plaintext).map_err(|e| {
            TableTheoryError::Internal(format!("invalid data key length: {e}"))
        })?;

        let aad = aad_for(store_attr_name);
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|e| TableTheoryError::Internal(format!("encryption failed: {e}")))?;

        data_key.plaintext.zeroize();

        let mut envelope = BTreeMap::new();
        envelope.insert("v".to_string(), AttributeValue::N(ENVELOPE_VERSION.to_string()));
        envelope.insert("edk".to_string(), AttributeValue::B(data_key.encrypted));
        envelope.insert("nonce".to_string(), AttributeValue::B(nonce_bytes.to_vec()));
        envelope.insert("ct".to_string(), AttributeValue::B(ciphertext));

        Ok(AttributeValue::M(envelope))
    }

    /// Decrypts an envelope previously produced by [`Self::encrypt`] for
    /// `store_attr_name`. Any tampering — including an envelope swapped in
    /// from a different attribute — fails here because the AAD is bound to
    /// `store_attr_name`.
    pub async fn decrypt(&self, store_attr_name: &str, envelope: &AttributeValue) -> Result<String> {
        let map = envelope.as_m()?;

        let version = map
            .get("v")
            .ok_or_else(|| TableTheoryError::InvalidAttributeValue("envelope missing v".into()))?
            .as_n()?;
        if version as i64 != ENVELOPE_VERSION {
            return Err(TableTheoryError::InvalidAttributeValue(format!(
                "unsupported envelope version {version}"
            )));
        }

        let edk = map
            .get("edk")
            .ok_or_else(|| TableTheoryError::InvalidAttributeValue("envelope missing edk".into()))?
            .as_b()?;
        let nonce_bytes = map
            .get("nonce")
            .ok_or_else(|| TableTheoryError::InvalidAttributeValue("envelope missing nonce".into()))?
            .as_b()?;
        let ciphertext = map
            .get("ct")
            .ok_or_else(|| TableTheoryError::InvalidAttributeValue("envelope missing ct".into()))?
            .as_b()?;

        let mut data_key = self.kms.decrypt(&self.key_arn, edk).await?;

        let cipher = Aes256Gcm::new_from_slice(&data_key).map_err(|e| {
            TableTheoryError::Internal(format!("invalid data key length: {e}"))
        })?;
        let nonce = Nonce::from_slice(nonce_bytes);
        let aad = aad_for(store_attr_name);

        let plaintext = cipher.decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        );

        data_key.zeroize();

        let plaintext = plaintext.map_err(|_| {
            TableTheoryError::Internal(format!("decryption failed for attribute {store_attr_name:?}"))
        })?;

        String::from_utf8(plaintext)
            .map_err(|e| TableTheoryError::InvalidAttributeValue(format!("decrypted payload not UTF-8: {e}")))
    }
}

fn aad_for(store_attr_name: &str) -> Vec<u8> {
    format!("theorydb:encrypted:v1|attr={store_attr_name}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubKms {
        key: Mutex<Option<Vec<u8>>>,
    }

    #[async_trait]
    impl KmsClient for StubKms {
        async fn generate_data_key(&self, _key_arn: &str) -> Result<crate::client::DataKey> {
            let plaintext = vec![7u8; 32];
            *self.key.lock().unwrap() = Some(plaintext.clone());
            Ok(crate::client::DataKey {
                plaintext,
                encrypted: vec![9u8; 16],
            })
        }

        async fn decrypt(&self, _key_arn: &str, _ciphertext_blob: &[u8]) -> Result<Vec<u8>> {
            Ok(self.key.lock().unwrap().clone().unwrap())
        }
    }

    fn encryptor() -> Encryptor {
        Encryptor::new(
            Arc::new(StubKms { key: Mutex::new(None) }),
            "arn:aws:kms:test",
            Arc::new(FixedRandSource(vec![1, 2, 3, 4])),
        )
    }

    #[tokio::test]
    async fn round_trips() {
        let enc = encryptor();
        let envelope = enc.encrypt("secretA", "top-secret").await.unwrap();
        let plaintext = enc.decrypt("secretA", &envelope).await.unwrap();
        assert_eq!(plaintext, "top-secret");
    }

    #[tokio::test]
    async fn envelope_swap_fails_decryption() {
        let enc = encryptor();
        let envelope_a = enc.encrypt("secretA", "top-secret").await.unwrap();
        let envelope_b = enc.encrypt("secretB", "other-secret").await.unwrap();

        // Swap: decrypt A's envelope as if it were stored under secretB.
        let err = enc.decrypt("secretB", &envelope_a).await.unwrap_err();
        assert!(matches!(err, TableTheoryError::Internal(_)));

        let err = enc.decrypt("secretA", &envelope_b).await.unwrap_err();
        assert!(matches!(err, TableTheoryError::Internal(_)));
    }

    #[tokio::test]
    async fn envelope_carries_version_one() {
        let enc = encryptor();
        let envelope = enc.encrypt("secretA", "x").await.unwrap();
        let map = envelope.as_m().unwrap();
        assert_eq!(map.get("v").unwrap().as_n().unwrap(), 1.0);
    }
}
