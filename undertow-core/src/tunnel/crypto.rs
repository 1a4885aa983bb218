//! Key agreement, per-hop sealing and node signatures.
//!
//! Circuits agree one X25519 secret per hop and expand it with HKDF-SHA256
//! into a forward and a backward AES-256-GCM key. Every sealed layer is
//! `nonce(12) || ciphertext`.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use super::TunnelError;

const NONCE_LEN: usize = 12;
const FORWARD_INFO: &[u8] = b"undertow circuit forward";
const BACKWARD_INFO: &[u8] = b"undertow circuit backward";

/// Ephemeral X25519 key pair offered in `create` and `extend` cells.
pub struct DhKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::from(rand::random::<[u8; 32]>());
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Session keys shared with the holder of `peer_public`.
    pub fn agree(&self, peer_public: &[u8; 32]) -> SessionKeys {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        SessionKeys::derive(shared.as_bytes())
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}

/// Directional keys of one hop.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    forward: [u8; 32],
    backward: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

impl SessionKeys {
    pub fn derive(shared_secret: &[u8; 32]) -> Self {
        let hk = Hkdf::<Sha256>::new(None, shared_secret);
        let mut forward = [0u8; 32];
        let mut backward = [0u8; 32];
        // 32 bytes is far below the HKDF-SHA256 output limit.
        let _ = hk.expand(FORWARD_INFO, &mut forward);
        let _ = hk.expand(BACKWARD_INFO, &mut backward);
        Self { forward, backward }
    }

    /// Layer added by the initiator for traffic heading away from it.
    pub fn seal_forward(&self, plaintext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        seal(&self.forward, plaintext)
    }

    pub fn open_forward(&self, sealed: &[u8]) -> Result<Vec<u8>, TunnelError> {
        open(&self.forward, sealed)
    }

    /// Layer added by a hop for traffic heading back to the initiator.
    pub fn seal_backward(&self, plaintext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        seal(&self.backward, plaintext)
    }

    pub fn open_backward(&self, sealed: &[u8]) -> Result<Vec<u8>, TunnelError> {
        open(&self.backward, sealed)
    }
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, TunnelError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| TunnelError::crypto("encryption failed"))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, TunnelError> {
    if sealed.len() < NONCE_LEN {
        return Err(TunnelError::crypto("sealed layer too short"));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| TunnelError::crypto("authentication failed"))
}

/// Long-lived Ed25519 identity of a node, used to sign ledger blocks.
#[derive(Clone)]
pub struct NodeIdentity {
    signing: SigningKey,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        Self::from_secret(rand::random())
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

/// Checks an Ed25519 signature; malformed keys never verify.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(signature)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_agree_on_keys() {
        let initiator = DhKeyPair::generate();
        let relay = DhKeyPair::generate();
        let a = initiator.agree(&relay.public_bytes());
        let b = relay.agree(&initiator.public_bytes());
        assert_eq!(a, b);

        let sealed = a.seal_forward(b"extend").unwrap();
        assert_eq!(b.open_forward(&sealed).unwrap(), b"extend");
        // Directions use different keys.
        assert!(b.open_backward(&sealed).is_err());
    }

    #[test]
    fn test_tampered_layer_is_rejected() {
        let keys = SessionKeys::derive(&[9; 32]);
        let mut sealed = keys.seal_backward(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(keys.open_backward(&sealed).is_err());
        assert!(keys.open_backward(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_signatures() {
        let identity = NodeIdentity::from_secret([3; 32]);
        let signature = identity.sign(b"block");
        assert!(verify_signature(&identity.public_key(), b"block", &signature));
        assert!(!verify_signature(&identity.public_key(), b"other", &signature));
        let stranger = NodeIdentity::generate();
        assert!(!verify_signature(&stranger.public_key(), b"block", &signature));
    }
}
