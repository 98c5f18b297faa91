//! Node and account keys.
//!
//! A node's Ed25519 private key lives in `<data_dir>/identity.key` and is
//! created on first boot. The same type signs transactions for accounts in
//! tests and the workload; keys and signatures travel hex-encoded.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

pub const IDENTITY_FILE: &str = "identity.key";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
}

#[derive(Clone)]
pub struct NodeIdentity {
    signing_key: SigningKey,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load the key at `path`, or generate and save one if it doesn't exist.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<(Self, bool), IdentityError> {
        let path = path.as_ref();
        if path.exists() {
            Ok((Self::load(path)?, false))
        } else {
            let identity = Self::generate();
            identity.save(path)?;
            Ok((identity, true))
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let bytes = fs::read(path)?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength(bytes.len()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key),
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), IdentityError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(self.signing_key.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Hex-encoded public key, as registered on identity streams.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }

    /// Hex-encoded signature over `message`.
    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(IDENTITY_FILE);

        let (first, created) = NodeIdentity::load_or_generate(&path).unwrap();
        assert!(created);
        let (second, created) = NodeIdentity::load_or_generate(&path).unwrap();
        assert!(!created);
        assert_eq!(first.public_key_hex(), second.public_key_hex());
    }

    #[test]
    fn truncated_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(IDENTITY_FILE);
        fs::write(&path, [7u8; 12]).unwrap();
        assert!(matches!(
            NodeIdentity::load(&path),
            Err(IdentityError::InvalidKeyLength(12))
        ));
    }
}
