//! On-disk message envelope.
//!
//! Every stored message is wrapped in an envelope: either `PLAINTEXT`
//! (the message JSON embedded directly) or `AES-256-GCM` (base64 nonce,
//! ciphertext and tag as separate fields). The 256-bit key is derived from
//! the configured passphrase with SHA-256; each write uses a fresh random
//! nonce.

use crate::error::{AssistantError, Result};
use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// The envelope written to each message file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "alg")]
pub enum Envelope {
    /// Message JSON stored as-is.
    #[serde(rename = "PLAINTEXT")]
    Plaintext {
        /// The embedded message object.
        content: serde_json::Value,
    },
    /// Message JSON encrypted with AES-256-GCM.
    #[serde(rename = "AES-256-GCM")]
    AesGcm {
        /// Base64 of the 12-byte nonce.
        iv: String,
        /// Base64 of the ciphertext (tag excluded).
        content: String,
        /// Base64 of the 16-byte authentication tag.
        tag: String,
    },
}

/// Derive a 256-bit envelope key from a passphrase.
#[must_use]
pub fn derive_key(passphrase: &str) -> [u8; 32] {
    let digest = Sha256::digest(passphrase.as_bytes());
    digest.into()
}

/// Seal message JSON into an encrypted envelope with a fresh nonce.
///
/// # Errors
///
/// Returns an error if encryption fails.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Envelope> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| AssistantError::Store("envelope key has the wrong length".into()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| AssistantError::Store("envelope encryption failed".into()))?;

    // aes-gcm appends the tag to the ciphertext; the envelope keeps them
    // in separate fields.
    let split = sealed.len() - TAG_LEN;
    Ok(Envelope::AesGcm {
        iv: BASE64.encode(nonce),
        content: BASE64.encode(&sealed[..split]),
        tag: BASE64.encode(&sealed[split..]),
    })
}

/// Open an envelope, returning the message JSON bytes.
///
/// Returns `Ok(None)` for an encrypted envelope when no key is configured;
/// the caller skips the file.
///
/// # Errors
///
/// Returns an error for malformed base64, wrong nonce/tag lengths, or a
/// failed decryption (wrong key or tampering).
pub fn open(envelope: &Envelope, key: Option<&[u8; 32]>) -> Result<Option<Vec<u8>>> {
    match envelope {
        Envelope::Plaintext { content } => {
            let bytes = serde_json::to_vec(content)
                .map_err(|e| AssistantError::Store(format!("cannot re-serialize content: {e}")))?;
            Ok(Some(bytes))
        }
        Envelope::AesGcm { iv, content, tag } => {
            let Some(key) = key else {
                return Ok(None);
            };

            let nonce_bytes = BASE64
                .decode(iv)
                .map_err(|e| AssistantError::Store(format!("invalid envelope iv: {e}")))?;
            if nonce_bytes.len() != NONCE_LEN {
                return Err(AssistantError::Store(format!(
                    "envelope nonce must be {NONCE_LEN} bytes, got {}",
                    nonce_bytes.len()
                )));
            }
            let mut sealed = BASE64
                .decode(content)
                .map_err(|e| AssistantError::Store(format!("invalid envelope content: {e}")))?;
            let tag_bytes = BASE64
                .decode(tag)
                .map_err(|e| AssistantError::Store(format!("invalid envelope tag: {e}")))?;
            if tag_bytes.len() != TAG_LEN {
                return Err(AssistantError::Store(format!(
                    "envelope tag must be {TAG_LEN} bytes, got {}",
                    tag_bytes.len()
                )));
            }
            sealed.extend_from_slice(&tag_bytes);

            let cipher = Aes256Gcm::new_from_slice(key)
                .map_err(|_| AssistantError::Store("envelope key has the wrong length".into()))?;
            let plaintext = cipher
                .decrypt(Nonce::from_slice(&nonce_bytes), sealed.as_ref())
                .map_err(|_| AssistantError::Store("envelope decryption failed".into()))?;
            Ok(Some(plaintext))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_is_deterministic() {
        let a = derive_key("correct horse battery staple");
        let b = derive_key("correct horse battery staple");
        let c = derive_key("different");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn seal_open_round_trip() {
        let key = derive_key("test-key");
        let payload = br#"{"role":"User","content":"hello"}"#;

        let envelope = seal(&key, payload).expect("seal");
        let opened = open(&envelope, Some(&key)).expect("open").expect("present");
        assert_eq!(opened, payload);
    }

    #[test]
    fn fresh_nonce_per_seal() {
        let key = derive_key("test-key");
        let a = seal(&key, b"same payload").expect("seal");
        let b = seal(&key, b"same payload").expect("seal");
        let (Envelope::AesGcm { iv: iv_a, .. }, Envelope::AesGcm { iv: iv_b, .. }) = (&a, &b)
        else {
            panic!("expected encrypted envelopes");
        };
        assert_ne!(iv_a, iv_b);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let envelope = seal(&derive_key("right"), b"payload").expect("seal");
        assert!(open(&envelope, Some(&derive_key("wrong"))).is_err());
    }

    #[test]
    fn tampered_content_is_rejected() {
        let key = derive_key("test-key");
        let envelope = seal(&key, b"payload").expect("seal");
        let Envelope::AesGcm { iv, content, tag } = envelope else {
            panic!("expected encrypted envelope");
        };
        let mut raw = BASE64.decode(&content).expect("decode");
        raw[0] ^= 0x55;
        let tampered = Envelope::AesGcm {
            iv,
            content: BASE64.encode(raw),
            tag,
        };
        assert!(open(&tampered, Some(&key)).is_err());
    }

    #[test]
    fn encrypted_without_key_is_skipped() {
        let envelope = seal(&derive_key("k"), b"payload").expect("seal");
        assert!(open(&envelope, None).expect("open").is_none());
    }

    #[test]
    fn plaintext_passes_through() {
        let content: serde_json::Value =
            serde_json::from_str(r#"{"role":"User","content":"hi"}"#).expect("json");
        let envelope = Envelope::Plaintext {
            content: content.clone(),
        };
        let opened = open(&envelope, None).expect("open").expect("present");
        let parsed: serde_json::Value = serde_json::from_slice(&opened).expect("json");
        assert_eq!(parsed, content);
    }

    #[test]
    fn wire_shape_matches_the_format() {
        let key = derive_key("test-key");
        let envelope = seal(&key, b"payload").expect("seal");
        let json = serde_json::to_value(&envelope).expect("serialize");

        assert_eq!(json["alg"], "AES-256-GCM");
        let iv = BASE64
            .decode(json["iv"].as_str().expect("iv"))
            .expect("base64");
        let tag = BASE64
            .decode(json["tag"].as_str().expect("tag"))
            .expect("base64");
        assert_eq!(iv.len(), NONCE_LEN);
        assert_eq!(tag.len(), TAG_LEN);

        let plain = Envelope::Plaintext {
            content: serde_json::json!({"x": 1}),
        };
        let json = serde_json::to_value(&plain).expect("serialize");
        assert_eq!(json["alg"], "PLAINTEXT");
        assert_eq!(json["content"]["x"], 1);
    }
}
