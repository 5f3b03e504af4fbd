//! Node identity and frame crypto: key pair, node id, identity files, and the
//! pairwise session cipher.

use std::fs;
use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::model::{NetworkId, NodeId};

pub const IDENTITY_PUBLIC_FILE: &str = "identity.public";
pub const IDENTITY_SECRET_FILE: &str = "identity.secret";

/// Node public key (32 bytes, X25519).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Node id: first 40 bits of SHA-256 over the key.
    pub fn node_id(&self) -> NodeId {
        let digest = Sha256::digest(self.0);
        let mut id = [0u8; 5];
        id.copy_from_slice(&digest[..5]);
        NodeId::from_bytes(&id)
    }
}

/// X25519 key pair plus the node id derived from it.
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
    node_id: NodeId,
}

impl Identity {
    /// Generate a new identity, retrying until the derived id is not reserved.
    pub fn generate() -> Self {
        loop {
            let secret = StaticSecret::random_from_rng(OsRng);
            let id = Self::from_secret(secret);
            if !id.node_id.is_reserved() {
                return id;
            }
        }
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let node_id = public.node_id();
        Self {
            secret,
            public,
            node_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Shared secret with another node's public key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }

    /// `<node id>:0:<public hex>`
    pub fn to_public_string(&self) -> String {
        format!("{}:0:{}", self.node_id, hex::encode(self.public.0))
    }

    /// `<node id>:0:<public hex>:<secret hex>`
    pub fn to_secret_string(&self) -> String {
        format!(
            "{}:{}",
            self.to_public_string(),
            hex::encode(self.secret.to_bytes())
        )
    }

    /// Parse the secret identity text form and check it is self-consistent.
    pub fn from_secret_string(s: &str) -> Result<Self, IdentityError> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 4 || parts[1] != "0" {
            return Err(IdentityError::Malformed("expected id:0:public:secret"));
        }
        let secret_bytes = decode_key(parts[3])?;
        let id = Self::from_secret(StaticSecret::from(secret_bytes));
        if hex::encode(id.public.0) != parts[2].to_ascii_lowercase() {
            return Err(IdentityError::Mismatch);
        }
        if id.node_id.to_string() != parts[0].to_ascii_lowercase() {
            return Err(IdentityError::Mismatch);
        }
        Ok(id)
    }

    /// Load the identity stored under `dir`, or generate and persist one if
    /// none exists. The flag is true when a new identity was generated.
    pub fn load_or_generate(dir: &Path) -> Result<(Self, bool), IdentityError> {
        let secret_path = dir.join(IDENTITY_SECRET_FILE);
        if secret_path.exists() {
            let text = fs::read_to_string(&secret_path)?;
            let id = Self::from_secret_string(&text)?;
            debug!(node = %id.node_id, path = %secret_path.display(), "identity loaded");
            return Ok((id, false));
        }
        fs::create_dir_all(dir)?;
        let id = Self::generate();
        fs::write(&secret_path, id.to_secret_string())?;
        fs::write(dir.join(IDENTITY_PUBLIC_FILE), id.to_public_string())?;
        info!(node = %id.node_id, path = %dir.display(), "generated new identity");
        Ok((id, true))
    }
}

fn decode_key(s: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = hex::decode(s).map_err(|_| IdentityError::Malformed("key is not hex"))?;
    bytes
        .try_into()
        .map_err(|_| IdentityError::Malformed("key must be 32 bytes"))
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed identity: {0}")]
    Malformed(&'static str),
    #[error("identity keys do not match the stored node id")]
    Mismatch,
}

/// Pairwise frame cipher: ChaCha20-Poly1305 under a key both ends derive from
/// their X25519 secret. Frames are bound to their network id as associated data.
#[derive(Clone)]
pub struct SessionCipher {
    aead: ChaCha20Poly1305,
}

impl SessionCipher {
    pub fn new(local: &Identity, peer: &PublicKey) -> Self {
        let (lo, hi) = if local.public.0 <= peer.0 {
            (&local.public.0, &peer.0)
        } else {
            (&peer.0, &local.public.0)
        };
        let key: [u8; 32] = Sha256::new()
            .chain_update(SESSION_KEY_TAG)
            .chain_update(local.shared_secret(peer))
            .chain_update(lo)
            .chain_update(hi)
            .finalize()
            .into();
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// `nonce` must never repeat under one session key.
    pub fn seal(&self, nwid: NetworkId, nonce: u64, frame: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
        let aad = nwid.0.to_be_bytes();
        self.aead
            .encrypt(&frame_nonce(nonce), Payload { msg: frame, aad: &aad })
            .map_err(|_| WireCryptoError::Seal)
    }

    pub fn open(&self, nwid: NetworkId, nonce: u64, sealed: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
        let aad = nwid.0.to_be_bytes();
        self.aead
            .decrypt(&frame_nonce(nonce), Payload { msg: sealed, aad: &aad })
            .map_err(|_| WireCryptoError::Open)
    }
}

const SESSION_KEY_TAG: &[u8] = b"zts-session-v1";

fn frame_nonce(counter: u64) -> Nonce {
    let mut n = [0u8; 12];
    n[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(n)
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("frame sealing failed")]
    Seal,
    #[error("frame failed authentication")]
    Open,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_derivation() {
        let id = Identity::generate();
        assert_eq!(id.public_key().node_id(), id.node_id());
        assert!(!id.node_id().is_reserved());
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_eq!(
            a.shared_secret(b.public_key()),
            b.shared_secret(a.public_key())
        );
    }

    #[test]
    fn session_cipher_is_pairwise_and_network_bound() {
        let a = Identity::generate();
        let b = Identity::generate();
        let eve = Identity::generate();
        let nwid = NetworkId(0x8056_c2e2_1c00_0001);
        let sealed = SessionCipher::new(&a, b.public_key()).seal(nwid, 7, b"frame").unwrap();
        let at_b = SessionCipher::new(&b, a.public_key());
        assert_eq!(at_b.open(nwid, 7, &sealed).unwrap(), b"frame");
        assert!(at_b.open(nwid, 8, &sealed).is_err());
        assert!(at_b.open(NetworkId(1), 7, &sealed).is_err());
        assert!(SessionCipher::new(&eve, a.public_key()).open(nwid, 7, &sealed).is_err());
    }

    #[test]
    fn secret_string_reload() {
        let id = Identity::generate();
        let back = Identity::from_secret_string(&id.to_secret_string()).unwrap();
        assert_eq!(back.node_id(), id.node_id());
        assert_eq!(back.public_key(), id.public_key());
    }

    #[test]
    fn tampered_identity_rejected() {
        let id = Identity::generate();
        let text = id.to_secret_string();
        let mut parts: Vec<String> = text.split(':').map(str::to_owned).collect();
        parts[0] = "0000000001".into();
        assert!(matches!(
            Identity::from_secret_string(&parts.join(":")),
            Err(IdentityError::Mismatch)
        ));
        assert!(matches!(
            Identity::from_secret_string("garbage"),
            Err(IdentityError::Malformed(_))
        ));
    }

    #[test]
    fn first_start_generates_then_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let (first, generated) = Identity::load_or_generate(dir.path()).unwrap();
        assert!(generated);
        assert!(dir.path().join(IDENTITY_PUBLIC_FILE).exists());
        let (second, generated) = Identity::load_or_generate(dir.path()).unwrap();
        assert!(!generated);
        assert_eq!(first.node_id(), second.node_id());
    }
}
