//! CA Signing Tokens
//!
//! The signing capability the protected log consumes, and a secp256k1 key
//! ring that provides it for named CAs.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::RwLock;

use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::signatures::{parse_secret_key, SignatureManager};
use crate::config::CaKeyConfig;
use crate::error::ProtectedLogError;

/// How chains are signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenReference {
    /// No signing capability; chains accumulate unsigned.
    None,
    /// Delegate to the named CA's signing key.
    CaName(String),
}

impl TokenReference {
    /// Build from the `token_ref_type` / `token_ref` configuration pair.
    pub fn from_config(ref_type: &str, reference: Option<&str>) -> Result<Self, ProtectedLogError> {
        match ref_type.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(TokenReference::None),
            "CA-NAME" | "CANAME" => match reference {
                Some(name) if !name.trim().is_empty() => {
                    Ok(TokenReference::CaName(name.trim().to_string()))
                }
                _ => Err(ProtectedLogError::Config(
                    "token_ref is required when token_ref_type is CA-NAME".to_string(),
                )),
            },
            other => Err(ProtectedLogError::Config(format!(
                "Unknown token_ref_type: {}",
                other
            ))),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, TokenReference::None)
    }
}

impl fmt::Display for TokenReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenReference::None => write!(f, "NONE"),
            TokenReference::CaName(name) => write!(f, "CA-NAME:{}", name),
        }
    }
}

/// Certificate reference carried next to every signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SigningCertificate {
    pub ca_name: String,
    pub serial_number: String,
    /// Hex encoded compressed secp256k1 public key.
    pub public_key: String,
}

impl SigningCertificate {
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.ca_name.as_bytes());
        hasher.update(self.public_key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// External signing capability: `sign(bytes, tokenRef)` and `verify(bytes, signature, certificate)`.
pub trait SigningCapability: Send + Sync {
    /// Sign `data`, returning a hex encoded signature and the signer certificate.
    fn sign(
        &self,
        data: &[u8],
        token: &TokenReference,
    ) -> Result<(String, SigningCertificate), ProtectedLogError>;

    /// `Err` when the certificate cannot be resolved to a trusted CA.
    fn verify(
        &self,
        data: &[u8],
        signature: &str,
        certificate: &SigningCertificate,
    ) -> Result<bool, ProtectedLogError>;
}

struct CaKey {
    secret: SecretKey,
    certificate: SigningCertificate,
}

/// Named CA keys held in process memory.
pub struct CaKeyRing {
    keys: RwLock<HashMap<String, CaKey>>,
    signatures: SignatureManager,
}

impl CaKeyRing {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            signatures: SignatureManager::new(),
        }
    }

    /// Load every configured CA key file.
    pub fn from_config(keys: &[CaKeyConfig]) -> Result<Self, ProtectedLogError> {
        let ring = Self::new();
        for key in keys {
            let contents = std::fs::read_to_string(Path::new(&key.secret_key_path)).map_err(|e| {
                ProtectedLogError::Config(format!(
                    "Failed to read CA key {:?}: {}",
                    key.secret_key_path, e
                ))
            })?;
            ring.register(&key.name, parse_secret_key(&contents)?)?;
        }
        info!("Loaded {} CA signing keys", keys.len());
        Ok(ring)
    }

    pub fn register(
        &self,
        ca_name: &str,
        secret: SecretKey,
    ) -> Result<SigningCertificate, ProtectedLogError> {
        let public_key = self.signatures.public_key_from_secret(&secret).to_string();
        let serial = Sha256::digest(public_key.as_bytes());
        let certificate = SigningCertificate {
            ca_name: ca_name.to_string(),
            serial_number: hex::encode(&serial[..8]),
            public_key,
        };

        let mut keys = self.write_keys()?;
        keys.insert(
            ca_name.to_string(),
            CaKey {
                secret,
                certificate: certificate.clone(),
            },
        );
        debug!("Registered CA {} ({})", ca_name, certificate.serial_number);
        Ok(certificate)
    }

    /// Create a fresh key for `ca_name`, replacing any existing one.
    pub fn generate(&self, ca_name: &str) -> Result<SigningCertificate, ProtectedLogError> {
        let (secret, _) = self.signatures.generate_keypair();
        self.register(ca_name, secret)
    }

    pub fn remove(&self, ca_name: &str) -> Result<bool, ProtectedLogError> {
        Ok(self.write_keys()?.remove(ca_name).is_some())
    }

    pub fn certificate(&self, ca_name: &str) -> Result<Option<SigningCertificate>, ProtectedLogError> {
        Ok(self.read_keys()?.get(ca_name).map(|k| k.certificate.clone()))
    }

    fn read_keys(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, CaKey>>, ProtectedLogError> {
        self.keys
            .read()
            .map_err(|_| ProtectedLogError::Crypto("CA key ring lock poisoned".to_string()))
    }

    fn write_keys(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, CaKey>>, ProtectedLogError> {
        self.keys
            .write()
            .map_err(|_| ProtectedLogError::Crypto("CA key ring lock poisoned".to_string()))
    }
}

impl Default for CaKeyRing {
    fn default() -> Self {
        Self::new()
    }
}

impl SigningCapability for CaKeyRing {
    fn sign(
        &self,
        data: &[u8],
        token: &TokenReference,
    ) -> Result<(String, SigningCertificate), ProtectedLogError> {
        let ca_name = match token {
            TokenReference::None => {
                return Err(ProtectedLogError::TokenUnavailable(
                    "no signing token configured".to_string(),
                ))
            }
            TokenReference::CaName(name) => name,
        };

        let keys = self.read_keys()?;
        let key = keys.get(ca_name).ok_or_else(|| {
            ProtectedLogError::TokenUnavailable(format!("CA {} is not available", ca_name))
        })?;
        let signature = self.signatures.create_signature(data, &key.secret)?;
        Ok((hex::encode(signature.serialize_der()), key.certificate.clone()))
    }

    fn verify(
        &self,
        data: &[u8],
        signature: &str,
        certificate: &SigningCertificate,
    ) -> Result<bool, ProtectedLogError> {
        let keys = self.read_keys()?;
        let trusted = keys.get(&certificate.ca_name).ok_or_else(|| {
            ProtectedLogError::TokenUnavailable(format!(
                "certificate issuer {} is unknown",
                certificate.ca_name
            ))
        })?;
        if trusted.certificate.public_key != certificate.public_key {
            return Err(ProtectedLogError::TokenUnavailable(format!(
                "certificate {} is not the trusted key of {}",
                certificate.serial_number, certificate.ca_name
            )));
        }
        self.signatures
            .verify_hex_signature(data, signature, &certificate.public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_reference_from_config() {
        assert_eq!(
            TokenReference::from_config("none", None).unwrap(),
            TokenReference::None
        );
        assert_eq!(
            TokenReference::from_config("CA-NAME", Some("AdminCA1")).unwrap(),
            TokenReference::CaName("AdminCA1".to_string())
        );
        assert!(TokenReference::from_config("CA-NAME", None).is_err());
        assert!(TokenReference::from_config("URI", Some("x")).is_err());
    }

    #[test]
    fn test_sign_and_verify_with_named_ca() {
        let ring = CaKeyRing::new();
        ring.generate("AdminCA1").unwrap();
        let token = TokenReference::CaName("AdminCA1".to_string());

        let (signature, certificate) = ring.sign(b"sha256:abc", &token).unwrap();
        assert_eq!(certificate.ca_name, "AdminCA1");
        assert!(ring.verify(b"sha256:abc", &signature, &certificate).unwrap());
        assert!(!ring.verify(b"sha256:abd", &signature, &certificate).unwrap());
    }

    #[test]
    fn test_none_token_cannot_sign() {
        let ring = CaKeyRing::new();
        assert!(matches!(
            ring.sign(b"data", &TokenReference::None),
            Err(ProtectedLogError::TokenUnavailable(_))
        ));
    }

    #[test]
    fn test_rotated_or_removed_ca_is_untrusted() {
        let ring = CaKeyRing::new();
        ring.generate("AdminCA1").unwrap();
        let token = TokenReference::CaName("AdminCA1".to_string());
        let (signature, certificate) = ring.sign(b"data", &token).unwrap();

        ring.generate("AdminCA1").unwrap();
        assert!(ring.verify(b"data", &signature, &certificate).is_err());

        assert!(ring.remove("AdminCA1").unwrap());
        assert!(ring.verify(b"data", &signature, &certificate).is_err());
        assert!(ring.sign(b"data", &token).is_err());
    }
}
