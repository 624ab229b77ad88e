//! Key material injected into the signing path.

use std::fmt;

use secp256k1::{Keypair, SecretKey, SECP256K1};

use crate::error::{Error, Result};

/// Supplies the signing key and the matching public identifier.
///
/// Generation, storage and rotation of credentials happen outside the core. The
/// core only asks for the key at signing time and never keeps it.
pub trait KeyMaterialProvider: Send + Sync {
    fn signing_key(&self) -> Option<SecretKey>;

    /// Hex x-only public key.
    fn public_identifier(&self) -> Option<String>;
}

/// In-memory secp256k1 keypair.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
}

impl Keys {
    pub fn new(secret: SecretKey) -> Self {
        Self {
            keypair: Keypair::from_secret_key(SECP256K1, &secret),
        }
    }

    /// Parse a 32-byte hex secret key.
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| Error::crypto(format!("secret key is not hex: {e}")))?;
        let secret = SecretKey::from_slice(&bytes)?;
        Ok(Self::new(secret))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

impl KeyMaterialProvider for Keys {
    fn signing_key(&self) -> Option<SecretKey> {
        Some(self.keypair.secret_key())
    }

    fn public_identifier(&self) -> Option<String> {
        Some(self.public_key_hex())
    }
}

/// Provider for a process with no credentials loaded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeys;

impl KeyMaterialProvider for NoKeys {
    fn signing_key(&self) -> Option<SecretKey> {
        None
    }

    fn public_identifier(&self) -> Option<String> {
        None
    }
}
