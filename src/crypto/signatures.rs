use crate::error::ProtectedLogError;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

fn digest_message(message: &[u8]) -> Result<Message, ProtectedLogError> {
    Message::from_digest_slice(&Sha256::digest(message))
        .map_err(|e| ProtectedLogError::Crypto(format!("Invalid message digest: {}", e)))
}

/// ECDSA over the SHA-256 digest of a message.
pub struct SignatureManager {
    secp: Secp256k1<secp256k1::All>,
}

impl SignatureManager {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    pub fn create_signature(
        &self,
        message: &[u8],
        secret_key: &SecretKey,
    ) -> Result<Signature, ProtectedLogError> {
        Ok(self.secp.sign_ecdsa(&digest_message(message)?, secret_key))
    }

    pub fn verify_signature(
        &self,
        message: &[u8],
        signature: &Signature,
        public_key: &PublicKey,
    ) -> Result<bool, ProtectedLogError> {
        let digest = digest_message(message)?;
        Ok(self.secp.verify_ecdsa(&digest, signature, public_key).is_ok())
    }

    /// Verify a hex encoded DER signature against a hex encoded public key
    pub fn verify_hex_signature(
        &self,
        message: &[u8],
        signature: &str,
        public_key: &str,
    ) -> Result<bool, ProtectedLogError> {
        let signature_bytes = hex::decode(signature)
            .map_err(|e| ProtectedLogError::Crypto(format!("Invalid signature hex: {}", e)))?;
        let signature = match Signature::from_der(&signature_bytes) {
            Ok(signature) => signature,
            // A signature that does not even parse cannot be valid.
            Err(_) => return Ok(false),
        };

        let public_key = parse_public_key(public_key)?;
        self.verify_signature(message, &signature, &public_key)
    }

    pub fn public_key_from_secret(&self, secret_key: &SecretKey) -> PublicKey {
        PublicKey::from_secret_key(&self.secp, secret_key)
    }

    /// Generate a new keypair
    pub fn generate_keypair(&self) -> (SecretKey, PublicKey) {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        let public_key = PublicKey::from_secret_key(&self.secp, &secret_key);
        (secret_key, public_key)
    }
}

impl Default for SignatureManager {
    fn default() -> Self {
        Self::new()
    }
}

pub fn parse_public_key(public_key: &str) -> Result<PublicKey, ProtectedLogError> {
    let bytes = hex::decode(public_key)
        .map_err(|e| ProtectedLogError::Crypto(format!("Invalid public key hex: {}", e)))?;
    PublicKey::from_slice(&bytes)
        .map_err(|e| ProtectedLogError::Crypto(format!("Invalid public key format: {}", e)))
}

pub fn parse_secret_key(secret_key: &str) -> Result<SecretKey, ProtectedLogError> {
    let bytes = hex::decode(secret_key.trim())
        .map_err(|e| ProtectedLogError::Crypto(format!("Invalid secret key hex: {}", e)))?;
    SecretKey::from_slice(&bytes)
        .map_err(|e| ProtectedLogError::Crypto(format!("Invalid secret key: {}", e)))
}
