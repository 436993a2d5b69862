//! Dilithium5 identity keypair
//!
//! Post-quantum signing identity used to authenticate every DHT record this
//! node writes. Implements both [`Signer`] and [`Verifier`].

use crate::error::CourierError;
use crate::identity::{Fingerprint, Signer, Verifier};
use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{
    DetachedSignature as PqDetachedSignature, PublicKey as PqPublicKey,
    SecretKey as PqSecretKey,
};

/// Dilithium5 keypair with a cached fingerprint.
pub struct DilithiumIdentity {
    secret: dilithium5::SecretKey,
    public: dilithium5::PublicKey,
    fingerprint: Fingerprint,
}

impl DilithiumIdentity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let (public, secret) = dilithium5::keypair();
        let fingerprint = Fingerprint::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            fingerprint,
        }
    }

    /// Serialize the keypair to bytes
    ///
    /// Format: [secret_len: u32 LE][secret][public_len: u32 LE][public]
    pub fn to_bytes(&self) -> Vec<u8> {
        let secret = self.secret.as_bytes();
        let public = self.public.as_bytes();

        let mut bytes = Vec::with_capacity(8 + secret.len() + public.len());
        bytes.extend_from_slice(&(secret.len() as u32).to_le_bytes());
        bytes.extend_from_slice(secret);
        bytes.extend_from_slice(&(public.len() as u32).to_le_bytes());
        bytes.extend_from_slice(public);
        bytes
    }

    /// Deserialize a keypair from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CourierError> {
        let (secret_bytes, rest) = split_length_prefixed(bytes)
            .ok_or_else(|| CourierError::Param("keypair data truncated (secret)".to_string()))?;
        let (public_bytes, rest) = split_length_prefixed(rest)
            .ok_or_else(|| CourierError::Param("keypair data truncated (public)".to_string()))?;
        if !rest.is_empty() {
            return Err(CourierError::Param(format!(
                "keypair data has {} trailing bytes",
                rest.len()
            )));
        }

        let secret = dilithium5::SecretKey::from_bytes(secret_bytes)
            .map_err(|_| CourierError::Param("invalid Dilithium5 secret key".to_string()))?;
        let public = dilithium5::PublicKey::from_bytes(public_bytes)
            .map_err(|_| CourierError::Param("invalid Dilithium5 public key".to_string()))?;
        let fingerprint = Fingerprint::from_public_key(public.as_bytes());

        Ok(Self {
            secret,
            public,
            fingerprint,
        })
    }
}

fn split_length_prefixed(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let len_bytes: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let body = bytes.get(4..4usize.checked_add(len)?)?;
    Some((body, &bytes[4 + len..]))
}

impl Signer for DilithiumIdentity {
    fn public_key(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        dilithium5::detached_sign(message, &self.secret)
            .as_bytes()
            .to_vec()
    }
}

/// Stateless Dilithium5 signature verifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct DilithiumVerifier;

impl Verifier for DilithiumVerifier {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(public) = dilithium5::PublicKey::from_bytes(public_key) else {
            return false;
        };
        let Ok(signature) = dilithium5::DetachedSignature::from_bytes(signature) else {
            return false;
        };
        dilithium5::verify_detached_signature(&signature, message, &public).is_ok()
    }
}

impl Verifier for DilithiumIdentity {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        DilithiumVerifier.verify(public_key, message, signature)
    }
}

impl std::fmt::Debug for DilithiumIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DilithiumIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}
