// Onion envelope construction and peeling
//
// Each layer is sealed with an ephemeral X25519 key against one hop's static
// public key. A hop removes exactly its own layer and learns only the next
// hop; the exit hop finds `next_hop = None` and the plaintext request bytes.

use crate::identity::{PeerId, RelayKeys};
use crate::wire::{ForwardEnvelope, ForwardPayload, RequestId};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::XChaCha20Poly1305;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Maximum number of onion layers (hops) in a circuit.
pub const MAX_ONION_HOPS: usize = 5;

/// Size of an XChaCha20-Poly1305 nonce (bytes).
const XCHACHA_NONCE_SIZE: usize = 24;

#[derive(Debug, Error)]
pub enum OnionError {
    #[error("Invalid onion envelope")]
    InvalidEnvelope,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Too many hops (max {0})")]
    TooManyHops(usize),
    #[error("Empty hop list")]
    EmptyPath,
}

/// Ciphertext addressed to exactly one hop, together with the ephemeral
/// public key used to seal it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedLayer {
    /// Ephemeral X25519 public key (32 bytes).
    pub ephemeral_pk: [u8; 32],
    /// XChaCha20-Poly1305 ciphertext of the inner envelope.
    pub ciphertext: Vec<u8>,
}

/// One addressable hop: transport identity plus layer encryption key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopAddr {
    pub peer_id: PeerId,
    pub public_key: [u8; 32],
}

/// Seal plaintext for a single recipient.
///
/// Generates a fresh ephemeral key, performs ECDH against the recipient's
/// static key and encrypts under a key and nonce derived from the shared
/// secret. The nonce doubles as AAD so a tampered header fails the tag check.
pub fn seal_layer(recipient_pk: &[u8; 32], plaintext: &[u8]) -> Result<SealedLayer, OnionError> {
    let ephemeral_secret = EphemeralSecret::random_from_rng(rand::thread_rng());
    let ephemeral_pk = PublicKey::from(&ephemeral_secret);

    let shared_secret = ephemeral_secret.diffie_hellman(&PublicKey::from(*recipient_pk));
    let key = derive_layer_key(shared_secret.as_bytes());
    let nonce_bytes = derive_nonce(shared_secret.as_bytes());

    let cipher = XChaCha20Poly1305::new(&key);
    let nonce = chacha20poly1305::XNonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &nonce_bytes,
            },
        )
        .map_err(|_| OnionError::EncryptionFailed)?;

    Ok(SealedLayer {
        ephemeral_pk: ephemeral_pk.to_bytes(),
        ciphertext,
    })
}

/// Open a layer sealed for this node's keys.
pub fn open_layer(keys: &RelayKeys, layer: &SealedLayer) -> Result<Vec<u8>, OnionError> {
    let shared_secret = keys.shared_secret(&layer.ephemeral_pk);
    let key = derive_layer_key(&shared_secret);
    let nonce_bytes = derive_nonce(&shared_secret);

    let cipher = XChaCha20Poly1305::new(&key);
    let nonce = chacha20poly1305::XNonce::from_slice(&nonce_bytes);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: layer.ciphertext.as_slice(),
                aad: &nonce_bytes,
            },
        )
        .map_err(|_| OnionError::DecryptionFailed)
}

/// Wrap a request into nested onion layers for the given hop chain.
///
/// `hops[0]` is the entry hop, `hops[len-1]` the exit. Layers are built from
/// the exit inward: the innermost envelope carries `next_hop = None` and the
/// plaintext request bytes, every outer envelope names the hop its sealed
/// payload must be delivered to. The returned envelope is the only one the
/// originator transmits, addressed to the entry hop.
pub fn wrap_request(
    hops: &[HopAddr],
    request_id: RequestId,
    plaintext: &[u8],
    timestamp: u64,
) -> Result<ForwardEnvelope, OnionError> {
    if hops.is_empty() {
        return Err(OnionError::EmptyPath);
    }
    if hops.len() > MAX_ONION_HOPS {
        return Err(OnionError::TooManyHops(MAX_ONION_HOPS));
    }

    let mut envelope = ForwardEnvelope {
        request_id,
        next_hop: None,
        payload: ForwardPayload::Exit(plaintext.to_vec()),
        timestamp,
    };

    for hop in hops.iter().rev() {
        let inner = bincode::serialize(&envelope).map_err(|_| OnionError::InvalidEnvelope)?;
        let sealed = seal_layer(&hop.public_key, &inner)?;
        envelope = ForwardEnvelope {
            request_id,
            next_hop: Some(hop.peer_id.clone()),
            payload: ForwardPayload::Sealed(sealed),
            timestamp,
        };
    }

    Ok(envelope)
}

/// Peel one layer: decrypt the sealed payload with this node's keys and
/// decode the inner envelope.
pub fn peel_envelope(
    keys: &RelayKeys,
    envelope: &ForwardEnvelope,
) -> Result<ForwardEnvelope, OnionError> {
    let sealed = match &envelope.payload {
        ForwardPayload::Sealed(sealed) => sealed,
        ForwardPayload::Exit(_) => return Err(OnionError::InvalidEnvelope),
    };
    let inner = open_layer(keys, sealed)?;
    bincode::deserialize(&inner).map_err(|_| OnionError::InvalidEnvelope)
}

/// Derive a 32-byte encryption key from a shared secret.
fn derive_layer_key(shared_secret: &[u8]) -> chacha20poly1305::Key {
    let key_bytes = blake3::derive_key("veilway-onion-layer-key-v1", shared_secret);
    *chacha20poly1305::Key::from_slice(&key_bytes)
}

/// Derive a 24-byte nonce deterministically from a shared secret, so the
/// peeling side can reconstruct it without a header field.
fn derive_nonce(shared_secret: &[u8]) -> [u8; XCHACHA_NONCE_SIZE] {
    let hash = blake3::derive_key("veilway-onion-layer-nonce-v1", shared_secret);
    let mut nonce = [0u8; XCHACHA_NONCE_SIZE];
    nonce.copy_from_slice(&hash[..XCHACHA_NONCE_SIZE]);
    nonce
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::unix_timestamp;
    use proptest::prelude::*;

    fn hop_chain(count: usize) -> (Vec<RelayKeys>, Vec<HopAddr>) {
        let keys: Vec<RelayKeys> = (0..count).map(|_| RelayKeys::generate()).collect();
        let hops = keys
            .iter()
            .map(|k| HopAddr {
                peer_id: k.peer_id(),
                public_key: k.public_key(),
            })
            .collect();
        (keys, hops)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let keys = RelayKeys::generate();
        let sealed = seal_layer(&keys.public_key(), b"layer body").unwrap();
        let opened = open_layer(&keys, &sealed).unwrap();
        assert_eq!(opened, b"layer body");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let keys = RelayKeys::generate();
        let other = RelayKeys::generate();
        let sealed = seal_layer(&keys.public_key(), b"not for you").unwrap();
        assert!(matches!(
            open_layer(&other, &sealed),
            Err(OnionError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let keys = RelayKeys::generate();
        let mut sealed = seal_layer(&keys.public_key(), b"payload").unwrap();
        sealed.ciphertext[0] ^= 0xff;
        assert!(open_layer(&keys, &sealed).is_err());
    }

    #[test]
    fn test_wrap_request_empty_path() {
        let result = wrap_request(&[], RequestId::random(), b"req", 0);
        assert!(matches!(result, Err(OnionError::EmptyPath)));
    }

    #[test]
    fn test_wrap_request_too_many_hops() {
        let (_, hops) = hop_chain(MAX_ONION_HOPS + 1);
        let result = wrap_request(&hops, RequestId::random(), b"req", 0);
        assert!(matches!(result, Err(OnionError::TooManyHops(_))));
    }

    #[test]
    fn test_outer_envelope_addressed_to_entry_hop() {
        let (_, hops) = hop_chain(3);
        let envelope =
            wrap_request(&hops, RequestId::random(), b"req", unix_timestamp()).unwrap();
        // Corrected ordering: the transmitted envelope names the first
        // selected peer, not the last.
        assert_eq!(envelope.next_hop.as_ref(), Some(&hops[0].peer_id));
    }

    #[test]
    fn test_peel_reveals_only_next_hop() {
        let (keys, hops) = hop_chain(3);
        let envelope =
            wrap_request(&hops, RequestId::random(), b"req", unix_timestamp()).unwrap();

        let inner = peel_envelope(&keys[0], &envelope).unwrap();
        assert_eq!(inner.next_hop.as_ref(), Some(&hops[1].peer_id));
        // Entry hop must not be able to read past its own layer.
        assert!(peel_envelope(&keys[0], &inner).is_err());
    }

    #[test]
    fn test_exit_layer_has_no_next_hop() {
        let (keys, hops) = hop_chain(3);
        let envelope =
            wrap_request(&hops, RequestId::random(), b"the request", unix_timestamp()).unwrap();

        let at_second = peel_envelope(&keys[0], &envelope).unwrap();
        let at_exit = peel_envelope(&keys[1], &at_second).unwrap();
        let innermost = peel_envelope(&keys[2], &at_exit).unwrap();
        assert!(innermost.next_hop.is_none());
        match innermost.payload {
            ForwardPayload::Exit(body) => assert_eq!(body, b"the request"),
            _ => panic!("exit layer must carry plaintext"),
        }
    }

    #[test]
    fn test_middle_hop_cannot_open_entry_layer() {
        let (keys, hops) = hop_chain(4);
        let envelope =
            wrap_request(&hops, RequestId::random(), b"req", unix_timestamp()).unwrap();
        assert!(peel_envelope(&keys[2], &envelope).is_err());
    }

    #[test]
    fn test_request_id_stable_across_layers() {
        let (keys, hops) = hop_chain(3);
        let request_id = RequestId::random();
        let mut envelope = wrap_request(&hops, request_id, b"req", unix_timestamp()).unwrap();
        for key in &keys {
            assert_eq!(envelope.request_id, request_id);
            envelope = peel_envelope(key, &envelope).unwrap();
        }
        assert_eq!(envelope.request_id, request_id);
    }

    #[test]
    fn test_ephemeral_keys_unique_per_wrap() {
        let (_, hops) = hop_chain(1);
        let a = wrap_request(&hops, RequestId::random(), b"x", 0).unwrap();
        let b = wrap_request(&hops, RequestId::random(), b"x", 0).unwrap();
        match (a.payload, b.payload) {
            (ForwardPayload::Sealed(sa), ForwardPayload::Sealed(sb)) => {
                assert_ne!(sa.ephemeral_pk, sb.ephemeral_pk);
            }
            _ => panic!("outer payloads must be sealed"),
        }
    }

    proptest! {
        // Round-trip law: wrapping then peeling n layers recovers the
        // request exactly, for every circuit length in range.
        #[test]
        fn prop_wrap_peel_roundtrip(
            hop_count in 3usize..=MAX_ONION_HOPS,
            body in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let (keys, hops) = hop_chain(hop_count);
            let mut envelope =
                wrap_request(&hops, RequestId::random(), &body, 0).unwrap();
            for (i, key) in keys.iter().enumerate() {
                envelope = peel_envelope(key, &envelope).unwrap();
                if i + 1 < keys.len() {
                    prop_assert_eq!(
                        envelope.next_hop.as_ref(),
                        Some(&hops[i + 1].peer_id)
                    );
                }
            }
            prop_assert!(envelope.next_hop.is_none());
            match envelope.payload {
                ForwardPayload::Exit(recovered) => prop_assert_eq!(recovered, body),
                _ => prop_assert!(false, "innermost payload must be plaintext"),
            }
        }
    }
}
