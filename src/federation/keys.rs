//! Signing key management
//!
//! Each local user owns one key pair per supported algorithm, generated
//! lazily on first use and stored as JWK JSON. Concurrent first requests
//! may both generate a pair, but the database keeps exactly one and both
//! callers end up signing with the same key.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::SigningKey as Ed25519SigningKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::data::Database;
use crate::data::models::KeyAlgorithm;
use crate::error::{AppError, Result};

const RSA_KEY_BITS: usize = 2048;

/// Decoded key material for one algorithm
#[derive(Clone)]
pub enum KeyMaterial {
    Rsa {
        private: RsaPrivateKey,
        public: RsaPublicKey,
    },
    Ed25519 { signing: Ed25519SigningKey },
}

/// A user's key pair, ready for signing and document rendering
#[derive(Clone)]
pub struct UserKey {
    pub algorithm: KeyAlgorithm,
    pub material: KeyMaterial,
}

impl UserKey {
    /// SPKI PEM of the public half, for `publicKeyPem` in actor documents
    ///
    /// Only defined for RSA; Ed25519 keys are published as JWK.
    pub fn public_key_pem(&self) -> Result<Option<String>> {
        match &self.material {
            KeyMaterial::Rsa { public, .. } => {
                let pem = public
                    .to_public_key_pem(LineEnding::LF)
                    .map_err(|e| AppError::Federation(format!("PEM encoding failed: {}", e)))?;
                Ok(Some(pem))
            }
            KeyMaterial::Ed25519 { .. } => Ok(None),
        }
    }

    /// Public half as a JWK value, for `assertionMethod` entries
    pub fn public_jwk(&self) -> serde_json::Value {
        match &self.material {
            KeyMaterial::Rsa { public, .. } => jwk::from_rsa_public(public).to_value(),
            KeyMaterial::Ed25519 { signing } => {
                jwk::from_ed25519_public(&signing.verifying_key()).to_value()
            }
        }
    }
}

/// Lazy per-user key pair store
#[derive(Clone)]
pub struct KeyStore {
    db: Database,
}

impl KeyStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fetch the user's pair for one algorithm, generating it on first use
    pub async fn get_or_create(&self, user_id: i64, algorithm: KeyAlgorithm) -> Result<UserKey> {
        if let Some(row) = self.db.get_key(user_id, algorithm.as_str()).await? {
            return decode_pair(algorithm, &row.private_key);
        }

        let (private_jwk, public_jwk) = generate_pair(algorithm)?;
        // Insert-or-ignore; a concurrent generator may have won the race,
        // so decode whatever row the database kept.
        let row = self
            .db
            .insert_key(user_id, algorithm.as_str(), &private_jwk, &public_jwk)
            .await?;
        decode_pair(algorithm, &row.private_key)
    }

    /// All of the user's pairs, in preference order
    pub async fn get_or_create_all(&self, user_id: i64) -> Result<Vec<UserKey>> {
        let mut keys = Vec::with_capacity(KeyAlgorithm::ALL.len());
        for algorithm in KeyAlgorithm::ALL {
            keys.push(self.get_or_create(user_id, algorithm).await?);
        }
        Ok(keys)
    }

    /// The RSA pair used for HTTP signature signing
    pub async fn signing_key(&self, user_id: i64) -> Result<UserKey> {
        self.get_or_create(user_id, KeyAlgorithm::RsaPkcs1V15).await
    }
}

fn generate_pair(algorithm: KeyAlgorithm) -> Result<(String, String)> {
    let mut rng = rand::thread_rng();
    match algorithm {
        KeyAlgorithm::RsaPkcs1V15 => {
            let private = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
                .map_err(|e| AppError::Federation(format!("RSA key generation failed: {}", e)))?;
            let public = RsaPublicKey::from(&private);
            Ok((
                jwk::from_rsa_private(&private).to_json()?,
                jwk::from_rsa_public(&public).to_json()?,
            ))
        }
        KeyAlgorithm::Ed25519 => {
            let signing = Ed25519SigningKey::generate(&mut rng);
            Ok((
                jwk::from_ed25519_private(&signing).to_json()?,
                jwk::from_ed25519_public(&signing.verifying_key()).to_json()?,
            ))
        }
    }
}

fn decode_pair(algorithm: KeyAlgorithm, private_jwk: &str) -> Result<UserKey> {
    let jwk = jwk::Jwk::from_json(private_jwk)?;
    let material = match algorithm {
        KeyAlgorithm::RsaPkcs1V15 => {
            let private = jwk.to_rsa_private()?;
            let public = RsaPublicKey::from(&private);
            KeyMaterial::Rsa { private, public }
        }
        KeyAlgorithm::Ed25519 => KeyMaterial::Ed25519 {
            signing: jwk.to_ed25519_private()?,
        },
    };
    Ok(UserKey {
        algorithm,
        material,
    })
}

/// JWK (RFC 7517/7518) serialization of key material
///
/// Only the two key types this server mints are supported: RSA and
/// OKP/Ed25519. Private JWKs carry the minimal private fields; the RSA
/// CRT parameters are recomputed from the primes on import.
pub mod jwk {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Jwk {
        pub kty: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub crv: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub n: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub e: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub d: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub p: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub q: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub x: Option<String>,
    }

    impl Jwk {
        pub fn to_json(&self) -> Result<String> {
            serde_json::to_string(self)
                .map_err(|e| AppError::Federation(format!("JWK serialization failed: {}", e)))
        }

        pub fn to_value(&self) -> serde_json::Value {
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
        }

        pub fn from_json(json: &str) -> Result<Self> {
            serde_json::from_str(json)
                .map_err(|e| AppError::Federation(format!("malformed JWK: {}", e)))
        }

        pub fn to_rsa_private(&self) -> Result<RsaPrivateKey> {
            if self.kty != "RSA" {
                return Err(AppError::Federation(format!(
                    "expected RSA JWK, got kty {}",
                    self.kty
                )));
            }
            let n = decode_uint(self.n.as_deref(), "n")?;
            let e = decode_uint(self.e.as_deref(), "e")?;
            let d = decode_uint(self.d.as_deref(), "d")?;
            let p = decode_uint(self.p.as_deref(), "p")?;
            let q = decode_uint(self.q.as_deref(), "q")?;

            RsaPrivateKey::from_components(n, e, d, vec![p, q])
                .map_err(|e| AppError::Federation(format!("invalid RSA JWK: {}", e)))
        }

        pub fn to_ed25519_private(&self) -> Result<Ed25519SigningKey> {
            if self.kty != "OKP" || self.crv.as_deref() != Some("Ed25519") {
                return Err(AppError::Federation(
                    "expected OKP/Ed25519 JWK".to_string(),
                ));
            }
            let d = self
                .d
                .as_deref()
                .ok_or_else(|| AppError::Federation("JWK missing field d".to_string()))?;
            let bytes = URL_SAFE_NO_PAD
                .decode(d)
                .map_err(|e| AppError::Federation(format!("invalid JWK field d: {}", e)))?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| AppError::Federation("Ed25519 seed must be 32 bytes".to_string()))?;
            Ok(Ed25519SigningKey::from_bytes(&bytes))
        }
    }

    pub fn from_rsa_private(key: &RsaPrivateKey) -> Jwk {
        let primes = key.primes();
        Jwk {
            kty: "RSA".to_string(),
            crv: None,
            n: Some(encode_uint(key.n())),
            e: Some(encode_uint(key.e())),
            d: Some(encode_uint(key.d())),
            p: primes.first().map(encode_uint),
            q: primes.get(1).map(encode_uint),
            x: None,
        }
    }

    pub fn from_rsa_public(key: &RsaPublicKey) -> Jwk {
        Jwk {
            kty: "RSA".to_string(),
            crv: None,
            n: Some(encode_uint(key.n())),
            e: Some(encode_uint(key.e())),
            d: None,
            p: None,
            q: None,
            x: None,
        }
    }

    pub fn from_ed25519_private(key: &Ed25519SigningKey) -> Jwk {
        Jwk {
            kty: "OKP".to_string(),
            crv: Some("Ed25519".to_string()),
            n: None,
            e: None,
            d: Some(URL_SAFE_NO_PAD.encode(key.to_bytes())),
            p: None,
            q: None,
            x: Some(URL_SAFE_NO_PAD.encode(key.verifying_key().to_bytes())),
        }
    }

    pub fn from_ed25519_public(key: &ed25519_dalek::VerifyingKey) -> Jwk {
        Jwk {
            kty: "OKP".to_string(),
            crv: Some("Ed25519".to_string()),
            n: None,
            e: None,
            d: None,
            p: None,
            q: None,
            x: Some(URL_SAFE_NO_PAD.encode(key.to_bytes())),
        }
    }

    fn encode_uint(value: &BigUint) -> String {
        URL_SAFE_NO_PAD.encode(value.to_bytes_be())
    }

    fn decode_uint(value: Option<&str>, field: &str) -> Result<BigUint> {
        let value =
            value.ok_or_else(|| AppError::Federation(format!("JWK missing field {}", field)))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|e| AppError::Federation(format!("invalid JWK field {}: {}", field, e)))?;
        Ok(BigUint::from_bytes_be(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Small modulus keeps tests fast; production keys are 2048-bit.
    fn test_rsa_key() -> RsaPrivateKey {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, 1024).expect("test key generation")
    }

    #[test]
    fn rsa_jwk_round_trip_preserves_key() {
        let original = test_rsa_key();

        let json = jwk::from_rsa_private(&original).to_json().expect("encode");
        let restored = jwk::Jwk::from_json(&json)
            .expect("parse")
            .to_rsa_private()
            .expect("decode");

        assert_eq!(original.n(), restored.n());
        assert_eq!(original.d(), restored.d());
    }

    #[test]
    fn ed25519_jwk_round_trip_preserves_key() {
        let mut rng = rand::thread_rng();
        let original = Ed25519SigningKey::generate(&mut rng);

        let json = jwk::from_ed25519_private(&original)
            .to_json()
            .expect("encode");
        let restored = jwk::Jwk::from_json(&json)
            .expect("parse")
            .to_ed25519_private()
            .expect("decode");

        assert_eq!(original.to_bytes(), restored.to_bytes());
    }

    #[test]
    fn public_jwk_omits_private_fields() {
        let key = test_rsa_key();
        let public = jwk::from_rsa_public(&RsaPublicKey::from(&key));

        assert!(public.d.is_none());
        assert!(public.p.is_none());
        assert!(public.q.is_none());

        let value = public.to_value();
        assert_eq!(value["kty"], "RSA");
        assert!(value.get("d").is_none());
    }

    #[test]
    fn rsa_private_jwk_rejected_as_ed25519() {
        let key = test_rsa_key();
        let jwk = jwk::from_rsa_private(&key);
        assert!(jwk.to_ed25519_private().is_err());
    }
}
