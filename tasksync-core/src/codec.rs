//! Payload codec for remote records.
//!
//! Encoding: JSON, then gzip, then base64 text, then ChaCha20-Poly1305.
//!
//! # Wire Format
//!
//! Current: `[format_version (2 bytes, BE)] + [nonce (12 bytes)] + [ciphertext + tag]`,
//! keyed by a hash of the scope identifier.
//!
//! Legacy: `[nonce (12 bytes)] + [ciphertext + tag]`, keyed by the fixed
//! application-wide key.
//!
//! The whole frame is base64 encoded for transport.

use crate::errors::{SyncError, SyncResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

pub const FORMAT_VERSION: u16 = 2;
pub const VERSION_MARKER_SIZE: usize = 2;
pub const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

const SHARED_KEY_CONTEXT: &str = "tasksync/shared-scope/v2:";
const PERSONAL_KEY_CONTEXT: &str = "tasksync/personal/v2:";

/// Who may read a payload, and therefore which key encrypts it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyScope {
    /// A sharing group, e.g. a category id. Every member derives the same key
    /// from the identifier alone.
    Shared(String),
    /// Private data, keyed by the owner's stable account id.
    Personal(String),
}

impl KeyScope {
    pub fn shared(group_id: impl ToString) -> Self {
        KeyScope::Shared(group_id.to_string())
    }

    pub fn personal(account_id: impl ToString) -> Self {
        KeyScope::Personal(account_id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiphertextFormat {
    Versioned(u16),
    Legacy,
}

/// A parsed candidate framing of a ciphertext.
enum Frame<'a> {
    Versioned {
        version: u16,
        nonce: &'a [u8],
        body: &'a [u8],
    },
    Legacy {
        nonce: &'a [u8],
        body: &'a [u8],
    },
}

impl<'a> Frame<'a> {
    /// Candidate framings in the order they must be tried: the versioned
    /// layout when the marker is recognised, then the legacy layout.
    fn candidates(bytes: &'a [u8]) -> Vec<Frame<'a>> {
        let mut frames = Vec::with_capacity(2);
        if bytes.len() > VERSION_MARKER_SIZE + NONCE_SIZE {
            let version = u16::from_be_bytes([bytes[0], bytes[1]]);
            if version == FORMAT_VERSION {
                let (nonce, body) = bytes[VERSION_MARKER_SIZE..].split_at(NONCE_SIZE);
                frames.push(Frame::Versioned {
                    version,
                    nonce,
                    body,
                });
            }
        }
        if bytes.len() > NONCE_SIZE {
            let (nonce, body) = bytes.split_at(NONCE_SIZE);
            frames.push(Frame::Legacy { nonce, body });
        }
        frames
    }

    fn format(&self) -> CiphertextFormat {
        match self {
            Frame::Versioned { version, .. } => CiphertextFormat::Versioned(*version),
            Frame::Legacy { .. } => CiphertextFormat::Legacy,
        }
    }
}

/// Pure transform between payloads and transport strings. No I/O.
#[derive(Clone)]
pub struct Codec {
    legacy_key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec").finish_non_exhaustive()
    }
}

impl Codec {
    /// `legacy_key` is padded with `'0'` and truncated to 32 bytes.
    pub fn new(legacy_key: &str) -> Self {
        let mut key = [b'0'; KEY_SIZE];
        for (slot, byte) in key.iter_mut().zip(legacy_key.as_bytes()) {
            *slot = *byte;
        }
        Self { legacy_key: key }
    }

    /// Deterministic one-way key for a scope.
    pub fn derive_key(scope: &KeyScope) -> [u8; KEY_SIZE] {
        let mut hasher = Sha256::new();
        match scope {
            KeyScope::Shared(group_id) => {
                hasher.update(SHARED_KEY_CONTEXT.as_bytes());
                hasher.update(group_id.as_bytes());
            }
            KeyScope::Personal(account_id) => {
                hasher.update(PERSONAL_KEY_CONTEXT.as_bytes());
                hasher.update(account_id.as_bytes());
            }
        }
        let digest = hasher.finalize();
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest);
        key
    }

    /// Short hex id of a scope key, safe to log.
    pub fn key_fingerprint(scope: &KeyScope) -> String {
        let key = Self::derive_key(scope);
        let digest = Sha256::digest(key);
        hex::encode(&digest[..4])
    }

    pub fn encode<P: Serialize>(&self, payload: &P, scope: &KeyScope) -> SyncResult<String> {
        let plaintext = compress(payload)?;
        let key = Self::derive_key(scope);
        let sealed = seal(&key, &plaintext)?;

        let mut framed = Vec::with_capacity(VERSION_MARKER_SIZE + sealed.len());
        framed.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        framed.extend_from_slice(&sealed);
        Ok(STANDARD.encode(framed))
    }

    /// Produces the legacy, unversioned layout under the fixed key. Kept for
    /// interoperability with older clients and for migration tests.
    pub fn encode_legacy<P: Serialize>(&self, payload: &P) -> SyncResult<String> {
        let plaintext = compress(payload)?;
        let sealed = seal(&self.legacy_key, &plaintext)?;
        Ok(STANDARD.encode(sealed))
    }

    pub fn decode<P: DeserializeOwned>(&self, data: &str, scope: &KeyScope) -> SyncResult<P> {
        self.decode_with_format(data, scope).map(|(payload, _)| payload)
    }

    /// Decodes and reports which format succeeded. The versioned layout is
    /// tried first; the legacy layout only when it is absent or fails.
    pub fn decode_with_format<P: DeserializeOwned>(
        &self,
        data: &str,
        scope: &KeyScope,
    ) -> SyncResult<(P, CiphertextFormat)> {
        let bytes = STANDARD
            .decode(data.trim())
            .map_err(|e| SyncError::Decode(format!("invalid base64: {}", e)))?;

        let mut failures = Vec::new();
        for frame in Frame::candidates(&bytes) {
            let format = frame.format();
            let attempt = match frame {
                Frame::Versioned { nonce, body, .. } => {
                    open(&Self::derive_key(scope), nonce, body)
                }
                Frame::Legacy { nonce, body } => open(&self.legacy_key, nonce, body),
            };
            match attempt.and_then(|plaintext| decompress(&plaintext)) {
                Ok(payload) => {
                    if format == CiphertextFormat::Legacy {
                        tracing::debug!("CODEC: decoded payload via legacy format");
                    }
                    return Ok((payload, format));
                }
                Err(e) => failures.push(format!("{:?}: {}", format, e)),
            }
        }

        if failures.is_empty() {
            return Err(SyncError::Decode("ciphertext too short".to_string()));
        }
        Err(SyncError::Decode(failures.join("; ")))
    }

    /// Re-encodes a legacy ciphertext under the scope key. Returns `None` when
    /// the input already uses the current format.
    pub fn migrate(&self, data: &str, scope: &KeyScope) -> SyncResult<Option<String>> {
        let (payload, format) = self.decode_with_format::<serde_json::Value>(data, scope)?;
        match format {
            CiphertextFormat::Legacy => Ok(Some(self.encode(&payload, scope)?)),
            CiphertextFormat::Versioned(_) => Ok(None),
        }
    }
}

fn compress<P: Serialize>(payload: &P) -> SyncResult<Vec<u8>> {
    let json = serde_json::to_vec(payload)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| SyncError::Crypto(format!("compression failed: {}", e)))?;
    let compressed = encoder
        .finish()
        .map_err(|e| SyncError::Crypto(format!("compression failed: {}", e)))?;
    Ok(STANDARD.encode(compressed).into_bytes())
}

fn decompress<P: DeserializeOwned>(plaintext: &[u8]) -> SyncResult<P> {
    let text = std::str::from_utf8(plaintext)
        .map_err(|e| SyncError::Decode(format!("plaintext is not UTF-8: {}", e)))?;
    let compressed = STANDARD
        .decode(text)
        .map_err(|e| SyncError::Decode(format!("plaintext is not base64: {}", e)))?;
    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| SyncError::Decode(format!("decompression failed: {}", e)))?;
    serde_json::from_slice(&json).map_err(|e| SyncError::Decode(format!("invalid payload: {}", e)))
}

fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> SyncResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| SyncError::Crypto(format!("encryption failed: {}", e)))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn open(key: &[u8; KEY_SIZE], nonce: &[u8], body: &[u8]) -> SyncResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| SyncError::Decode("decryption failed".to_string()))
}
