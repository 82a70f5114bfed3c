//! Heartbeat envelope - authenticated encryption of status payloads
//!
//! Envelope format: `crypt:` + base64(nonce || ciphertext || tag)
//!
//! The sealed plaintext is a JSON document carrying the cluster name, the
//! sender node name and the payload. The cluster name is also bound as AEAD
//! associated data, so traffic sealed for another cluster fails the tag check
//! before any plaintext is interpreted.
//!
//! Security properties:
//! - Key is SHA-256 of the pre-shared cluster secret
//! - Fresh random 96-bit nonce per envelope
//! - Any integrity failure yields `None`, never an error or a panic

use base64::{Engine, engine::general_purpose::STANDARD};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use pulse_common::PulseError;
use pulse_common::constants::CRYPT_PREFIX;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// How the embedded sender relates to the identity the caller expected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// No expectation was given
    Unverified,
    /// Embedded sender equals the expected one
    Confirmed,
    /// Embedded sender differs from the expected one
    Mismatch { expected: String },
}

/// A successfully opened envelope
#[derive(Debug, Clone)]
pub struct Decrypted<T> {
    /// Sender identity sealed inside the envelope
    pub sender: String,
    pub payload: T,
    pub identity: Identity,
}

#[derive(Serialize)]
struct SealRef<'a, T> {
    clustername: &'a str,
    nodename: &'a str,
    data: &'a T,
}

#[derive(Deserialize)]
struct Sealed<T> {
    clustername: String,
    nodename: String,
    data: T,
}

/// Envelope codec keyed by per-cluster secrets
#[derive(Clone)]
pub struct Crypt {
    /// Cluster whose traffic we accept
    cluster_name: String,
    /// Cluster name -> cipher
    keys: HashMap<String, ChaCha20Poly1305>,
}

impl Crypt {
    /// Create a codec for the local cluster, without any secret yet
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            keys: HashMap::new(),
        }
    }

    /// Register the pre-shared secret of a cluster. Empty secrets are ignored.
    pub fn with_secret(mut self, cluster_name: &str, secret: &str) -> Self {
        if !secret.is_empty() {
            let digest = Sha256::digest(secret.as_bytes());
            let cipher = ChaCha20Poly1305::new(Key::from_slice(&digest));
            self.keys.insert(cluster_name.to_string(), cipher);
        }
        self
    }

    /// Check that the local cluster can seal envelopes
    pub fn ensure_ready(&self) -> Result<(), PulseError> {
        self.cipher(&self.cluster_name).map(|_| ())
    }

    fn cipher(&self, cluster_name: &str) -> Result<&ChaCha20Poly1305, PulseError> {
        self.keys.get(cluster_name).ok_or_else(|| {
            PulseError::Config(format!("no secret configured for cluster {cluster_name}"))
        })
    }

    /// Seal `payload` from `sender` for `cluster_name`
    pub fn encrypt<T: Serialize>(
        &self,
        cluster_name: &str,
        sender: &str,
        payload: &T,
    ) -> Result<String, PulseError> {
        let cipher = self.cipher(cluster_name)?;

        let plaintext = serde_json::to_vec(&SealRef {
            clustername: cluster_name,
            nodename: sender,
            data: payload,
        })
        .map_err(|e| PulseError::Crypt(format!("serialize payload: {e}")))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: cluster_name.as_bytes(),
                },
            )
            .map_err(|_| PulseError::Crypt("seal failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);

        Ok(format!("{}{}", CRYPT_PREFIX, STANDARD.encode(blob)))
    }

    /// Open an envelope received from the network.
    ///
    /// `expected_sender` is what the transport believes the sender is (the
    /// node owning the source address, or the relay slot name). A
    /// disagreement is reported in `Decrypted::identity`, not corrected.
    pub fn decrypt<T: DeserializeOwned>(
        &self,
        envelope: &[u8],
        expected_sender: Option<&str>,
    ) -> Option<Decrypted<T>> {
        let sealed: Sealed<T> = match self.open(envelope) {
            Ok(sealed) => sealed,
            Err(reason) => {
                tracing::trace!(reason, len = envelope.len(), "Envelope rejected");
                return None;
            }
        };

        let identity = match expected_sender {
            None => Identity::Unverified,
            Some(expected) if expected == sealed.nodename => Identity::Confirmed,
            Some(expected) => Identity::Mismatch {
                expected: expected.to_string(),
            },
        };

        Some(Decrypted {
            sender: sealed.nodename,
            payload: sealed.data,
            identity,
        })
    }

    fn open<T: DeserializeOwned>(&self, envelope: &[u8]) -> Result<Sealed<T>, &'static str> {
        let cipher = self
            .cipher(&self.cluster_name)
            .map_err(|_| "no local cluster secret")?;

        let text = trim_frame(envelope);
        let encoded = text
            .strip_prefix(CRYPT_PREFIX.as_bytes())
            .ok_or("missing prefix")?;
        let blob = STANDARD.decode(encoded).map_err(|_| "bad base64")?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err("truncated");
        }

        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: self.cluster_name.as_bytes(),
                },
            )
            .map_err(|_| "authentication failed")?;

        let opened: Sealed<T> = serde_json::from_slice(&plaintext).map_err(|_| "bad plaintext")?;
        if opened.clustername != self.cluster_name {
            return Err("foreign cluster");
        }
        if opened.nodename.is_empty() {
            return Err("anonymous sender");
        }

        Ok(opened)
    }
}

/// Strip the unicast terminator and surrounding whitespace
fn trim_frame(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    let start = data[..end]
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(end);
    &data[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_common::NodeStatus;

    fn codec(cluster: &str, secret: &str) -> Crypt {
        Crypt::new(cluster).with_secret(cluster, secret)
    }

    #[test]
    fn test_round_trip() {
        let crypt = codec("prod", "s3cret");
        let status = NodeStatus::new("node-1", 1000);

        let envelope = crypt.encrypt("prod", "node-1", &status).unwrap();
        assert!(envelope.starts_with("crypt:"));
        assert!(envelope.is_ascii());

        let opened: Decrypted<NodeStatus> = crypt.decrypt(envelope.as_bytes(), None).unwrap();
        assert_eq!(opened.sender, "node-1");
        assert_eq!(opened.payload, status);
        assert_eq!(opened.identity, Identity::Unverified);
    }

    #[test]
    fn test_nonce_is_fresh() {
        let crypt = codec("prod", "s3cret");
        let status = NodeStatus::new("node-1", 1);
        let a = crypt.encrypt("prod", "node-1", &status).unwrap();
        let b = crypt.encrypt("prod", "node-1", &status).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_trailing_terminator_tolerated() {
        let crypt = codec("prod", "s3cret");
        let mut framed = crypt
            .encrypt("prod", "node-1", &NodeStatus::new("node-1", 7))
            .unwrap()
            .into_bytes();
        framed.push(0);

        let opened: Option<Decrypted<NodeStatus>> = crypt.decrypt(&framed, None);
        assert_eq!(opened.unwrap().payload.updated, 7);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let sender = codec("prod", "s3cret");
        let receiver = codec("prod", "other");
        let envelope = sender
            .encrypt("prod", "node-1", &NodeStatus::new("node-1", 1))
            .unwrap();

        let opened: Option<Decrypted<NodeStatus>> = receiver.decrypt(envelope.as_bytes(), None);
        assert!(opened.is_none());
    }

    #[test]
    fn test_foreign_cluster_rejected() {
        // Same secret, different cluster name: associated data differs
        let sender = codec("staging", "s3cret");
        let receiver = codec("prod", "s3cret");
        let envelope = sender
            .encrypt("staging", "node-1", &NodeStatus::new("node-1", 1))
            .unwrap();

        let opened: Option<Decrypted<NodeStatus>> = receiver.decrypt(envelope.as_bytes(), None);
        assert!(opened.is_none());
    }

    #[test]
    fn test_malformed_input_rejected() {
        let crypt = codec("prod", "s3cret");
        let inputs: [&[u8]; 6] = [
            b"",
            b"\x00\x01\x02garbage\xff",
            b"crypt:",
            b"crypt:not base64 !!",
            b"crypt:AAAA",
            b"plain:aGVsbG8=",
        ];

        for input in inputs {
            let opened: Option<Decrypted<NodeStatus>> = crypt.decrypt(input, None);
            assert!(opened.is_none(), "accepted {input:?}");
        }
    }

    #[test]
    fn test_tampered_envelope_rejected() {
        let crypt = codec("prod", "s3cret");
        let envelope = crypt
            .encrypt("prod", "node-1", &NodeStatus::new("node-1", 1))
            .unwrap();

        let mut blob = STANDARD.decode(&envelope[CRYPT_PREFIX.len()..]).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let forged = format!("{}{}", CRYPT_PREFIX, STANDARD.encode(blob));

        let opened: Option<Decrypted<NodeStatus>> = crypt.decrypt(forged.as_bytes(), None);
        assert!(opened.is_none());
    }

    #[test]
    fn test_identity_mismatch_surfaced() {
        let crypt = codec("prod", "s3cret");
        let envelope = crypt
            .encrypt("prod", "node-3", &NodeStatus::new("node-3", 1))
            .unwrap();

        let opened: Decrypted<NodeStatus> =
            crypt.decrypt(envelope.as_bytes(), Some("node-4")).unwrap();
        assert_eq!(opened.sender, "node-3");
        assert_eq!(
            opened.identity,
            Identity::Mismatch {
                expected: "node-4".to_string()
            }
        );

        let opened: Decrypted<NodeStatus> =
            crypt.decrypt(envelope.as_bytes(), Some("node-3")).unwrap();
        assert_eq!(opened.identity, Identity::Confirmed);
    }

    #[test]
    fn test_missing_secret_is_config_error() {
        let crypt = Crypt::new("prod").with_secret("prod", "");
        let result = crypt.encrypt("prod", "node-1", &NodeStatus::new("node-1", 1));
        assert!(matches!(result, Err(PulseError::Config(_))));
        assert!(crypt.ensure_ready().is_err());

        let crypt = codec("prod", "s3cret");
        let result = crypt.encrypt("staging", "node-1", &NodeStatus::new("node-1", 1));
        assert!(matches!(result, Err(PulseError::Config(_))));
    }

    #[test]
    fn test_decrypt_without_secret_is_none() {
        let crypt = Crypt::new("prod");
        let opened: Option<Decrypted<NodeStatus>> = crypt.decrypt(b"crypt:AAAA", None);
        assert!(opened.is_none());
    }
}
