//! Identity capabilities
//!
//! The transport never handles key material directly. It consumes two
//! narrow capabilities:
//!
//! - [`Signer`]: this node's identity; signs every record it publishes
//! - [`Verifier`]: checks signatures on records written by other identities
//!
//! [`DilithiumIdentity`] is the post-quantum implementation shipped with the
//! crate. Anything else (HSM-backed keys, test doubles) can be injected.
//!
//! ## Example
//!
//! ```rust
//! use courier_core::identity::{DilithiumIdentity, DilithiumVerifier, Signer, Verifier};
//!
//! let identity = DilithiumIdentity::generate();
//! let signature = identity.sign(b"hello");
//! assert!(DilithiumVerifier.verify(&identity.public_key(), b"hello", &signature));
//! println!("fingerprint: {}", identity.fingerprint());
//! ```

mod fingerprint;
mod keypair;

pub use fingerprint::{Fingerprint, FINGERPRINT_LEN};
pub use keypair::{DilithiumIdentity, DilithiumVerifier};

/// Signing half of an identity.
pub trait Signer: Send + Sync {
    /// Serialized public key
    fn public_key(&self) -> Vec<u8>;

    /// Fingerprint of [`Signer::public_key`]
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_public_key(&self.public_key())
    }

    /// Produce a detached signature over `message`.
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// Signature verification capability.
pub trait Verifier: Send + Sync {
    /// True if `signature` over `message` was produced by `public_key`.
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}
