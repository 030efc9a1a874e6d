//! Encrypted connection tokens.
//!
//! Format: `base64(JSON {"iv": base64, "value": base64})`, where `value` is
//! the AEAD ciphertext (tag appended) of the JSON [`TokenPayload`] and `iv`
//! is the 12-byte nonce it was sealed with.
//!
//! Every decryption failure collapses into [`GuacError::TokenValidation`];
//! callers cannot tell a bad base64 string from a forged tag.

use crate::error::{GuacError, GuacResult};
use crate::settings::ConnectionType;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Standard alphabet, padding optional on decode.
const TOKEN_B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// AEAD algorithms accepted for connection tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    fn aead(self) -> &'static aead::Algorithm {
        match self {
            CipherAlgorithm::Aes128Gcm => &aead::AES_128_GCM,
            CipherAlgorithm::Aes256Gcm => &aead::AES_256_GCM,
            CipherAlgorithm::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    /// Required key length in bytes.
    pub fn key_len(self) -> usize {
        self.aead().key_len()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Gcm => "aes-128-gcm",
            CipherAlgorithm::Aes256Gcm => "aes-256-gcm",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = GuacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            CipherAlgorithm::Aes128Gcm,
            CipherAlgorithm::Aes256Gcm,
            CipherAlgorithm::ChaCha20Poly1305,
        ]
        .into_iter()
        .find(|a| a.as_str() == s)
        .ok_or_else(|| GuacError::Config(format!("unsupported cipher: {s}")))
    }
}

/// Decrypted token contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub connection: TokenConnection,
}

/// The `connection` object of a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenConnection {
    /// Authoritative protocol for the session.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<ConnectionType>,
    /// Protocol parameters, merged over the gateway defaults.
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// Outer JSON envelope, after the first base64 layer.
#[derive(Debug, Serialize, Deserialize)]
struct TokenEnvelope {
    iv: String,
    value: String,
}

/// Symmetric cipher for connection tokens.
pub struct TokenCipher {
    algorithm: CipherAlgorithm,
    key: LessSafeKey,
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Build a cipher. Fails if `key` has the wrong length for `algorithm`.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8]) -> GuacResult<Self> {
        let unbound = UnboundKey::new(algorithm.aead(), key).map_err(|_| {
            GuacError::Config(format!(
                "{algorithm} requires a {}-byte key, got {} bytes",
                algorithm.key_len(),
                key.len()
            ))
        })?;
        Ok(Self {
            algorithm,
            key: LessSafeKey::new(unbound),
        })
    }

    /// Decrypt and parse a token.
    pub fn decrypt(&self, token: &str) -> GuacResult<TokenPayload> {
        self.open(token).ok_or(GuacError::TokenValidation)
    }

    fn open(&self, token: &str) -> Option<TokenPayload> {
        let outer = TOKEN_B64.decode(token.trim()).ok()?;
        let envelope: TokenEnvelope = serde_json::from_slice(&outer).ok()?;

        let iv = TOKEN_B64.decode(&envelope.iv).ok()?;
        let nonce = Nonce::try_assume_unique_for_key(&iv).ok()?;
        let mut in_out = TOKEN_B64.decode(&envelope.value).ok()?;

        let plaintext = self.key.open_in_place(nonce, Aad::empty(), &mut in_out).ok()?;
        serde_json::from_slice(plaintext).ok()
    }

    /// Seal a payload into a token under a fresh random iv.
    pub fn encrypt(&self, payload: &TokenPayload) -> GuacResult<String> {
        let mut iv = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut iv)
            .map_err(|_| GuacError::Other("RNG failure".into()))?;

        let mut in_out = serde_json::to_vec(payload)?;
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
            .map_err(|_| GuacError::Other("token encryption failed".into()))?;

        let envelope = TokenEnvelope {
            iv: TOKEN_B64.encode(iv),
            value: TOKEN_B64.encode(&in_out),
        };
        Ok(TOKEN_B64.encode(serde_json::to_vec(&envelope)?))
    }
}

/// Generate a random key of the right length for `algorithm`.
pub fn generate_key(algorithm: CipherAlgorithm) -> GuacResult<Vec<u8>> {
    let mut key = vec![0u8; algorithm.key_len()];
    SystemRandom::new()
        .fill(&mut key)
        .map_err(|_| GuacError::Other("RNG failure".into()))?;
    Ok(key)
}

/// Parse a configured key: `base64:<data>`, or the raw UTF-8 bytes of the string.
pub fn parse_key(text: &str) -> GuacResult<Vec<u8>> {
    match text.strip_prefix("base64:") {
        Some(encoded) => TOKEN_B64
            .decode(encoded.trim())
            .map_err(|e| GuacError::Config(format!("invalid base64 key: {e}"))),
        None => Ok(text.as_bytes().to_vec()),
    }
}

/// Render a key in the form [`parse_key`] accepts.
pub fn format_key(key: &[u8]) -> String {
    format!("base64:{}", TOKEN_B64.encode(key))
}
