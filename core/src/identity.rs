// Relay key management
//
// Every node holds one X25519 static secret used only to open onion layers
// addressed to it. The secret never leaves this type: callers get the public
// key and derived peer id, and layer decryption goes through shared_secret().

use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Node identifier: blake3 hash of the X25519 public key, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Derive a peer id from a raw X25519 public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let hash = blake3::hash(public_key);
        PeerId(hex::encode(hash.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        PeerId(value)
    }
}

/// Opaque relay keypair.
///
/// Models a non-extractable platform key handle: the secret is generated
/// inside and there is no export path, only ECDH against an ephemeral key
/// presented by an onion layer.
pub struct RelayKeys {
    secret: StaticSecret,
}

impl RelayKeys {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_bytes);
        let secret = StaticSecret::from(secret_bytes);
        secret_bytes.zeroize();
        Self { secret }
    }

    /// Raw X25519 public key.
    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.secret).to_bytes()
    }

    /// Public key as hex for the signaling wire.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Peer id derived from the public key.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }

    /// ECDH against a layer's ephemeral public key. The only operation
    /// exposed on the secret.
    pub(crate) fn shared_secret(&self, ephemeral_pk: &[u8; 32]) -> [u8; 32] {
        self.secret
            .diffie_hellman(&PublicKey::from(*ephemeral_pk))
            .to_bytes()
    }
}
