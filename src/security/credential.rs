//! Credential material and the codec that derives, seals and verifies it.
//!
//! A [`SecretCodec`] is built once from configuration and shared by the
//! providers that fill the store and the middleware that verifies requests,
//! so the stored representation and the verification path always agree.
//!
//! ```text
//! key ──transform──▶ digest ──encoding──▶ lookup id   (API-key mode)
//!                      └─────cipher─────▶ stored secret
//! ```

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("unknown hash algorithm {0:?}")]
    UnknownHash(String),
    #[error("unknown encoding {0:?}")]
    UnknownEncoding(String),
    #[error("raw encoding cannot carry a hashed or HMAC'd key")]
    RawDigest,
    #[error("cipher key must be 16 or 32 bytes, got {0}")]
    CipherKeyLength(usize),
    #[error("decode: {0}")]
    Decode(String),
    #[error("sealed secret is malformed or was tampered with")]
    Open,
    #[error("seal failed")]
    Seal,
}

/// Stored credential: derived secret plus free-form attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(with = "hex_bytes")]
    pub secret: Vec<u8>,
    #[serde(default)]
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub fn digest(&self, msg: &[u8]) -> Vec<u8> {
        match self {
            HashAlg::Sha224 => Sha224::digest(msg).to_vec(),
            HashAlg::Sha256 => Sha256::digest(msg).to_vec(),
            HashAlg::Sha384 => Sha384::digest(msg).to_vec(),
            HashAlg::Sha512 => Sha512::digest(msg).to_vec(),
        }
    }

    pub fn hmac(&self, key: &[u8], msg: &[u8]) -> Vec<u8> {
        match self {
            HashAlg::Sha224 => mac::<Hmac<Sha224>>(key, msg),
            HashAlg::Sha256 => mac::<Hmac<Sha256>>(key, msg),
            HashAlg::Sha384 => mac::<Hmac<Sha384>>(key, msg),
            HashAlg::Sha512 => mac::<Hmac<Sha512>>(key, msg),
        }
    }
}

fn mac<M: Mac + KeyInit>(key: &[u8], msg: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let Ok(mut m) = <M as Mac>::new_from_slice(key) else {
        return Vec::new();
    };
    m.update(msg);
    m.finalize().into_bytes().to_vec()
}

impl FromStr for HashAlg {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "SHA224" => Ok(HashAlg::Sha224),
            "SHA256" => Ok(HashAlg::Sha256),
            "SHA384" => Ok(HashAlg::Sha384),
            "SHA512" => Ok(HashAlg::Sha512),
            _ => Err(CredentialError::UnknownHash(s.to_string())),
        }
    }
}

/// Text encoding of keys and lookup ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Bytes used as-is.
    #[default]
    Raw,
    Hex,
    Base64,
    Base64Url,
    Base64RawStd,
    Base64RawUrl,
}

impl Encoding {
    pub fn encode(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Raw => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Hex => hex::encode(bytes),
            Encoding::Base64 => STANDARD.encode(bytes),
            Encoding::Base64Url => URL_SAFE.encode(bytes),
            Encoding::Base64RawStd => STANDARD_NO_PAD.encode(bytes),
            Encoding::Base64RawUrl => URL_SAFE_NO_PAD.encode(bytes),
        }
    }

    pub fn decode(&self, text: &str) -> Result<Vec<u8>, CredentialError> {
        let decoded = match self {
            Encoding::Raw => return Ok(text.as_bytes().to_vec()),
            Encoding::Hex => hex::decode(text).map_err(|e| e.to_string()),
            Encoding::Base64 => STANDARD.decode(text).map_err(|e| e.to_string()),
            Encoding::Base64Url => URL_SAFE.decode(text).map_err(|e| e.to_string()),
            Encoding::Base64RawStd => STANDARD_NO_PAD.decode(text).map_err(|e| e.to_string()),
            Encoding::Base64RawUrl => URL_SAFE_NO_PAD.decode(text).map_err(|e| e.to_string()),
        };
        decoded.map_err(CredentialError::Decode)
    }
}

impl FromStr for Encoding {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "raw" => Ok(Encoding::Raw),
            "hex" | "base16" => Ok(Encoding::Hex),
            "base64" | "base64std" => Ok(Encoding::Base64),
            "base64url" => Ok(Encoding::Base64Url),
            "base64raw" | "base64rawstd" => Ok(Encoding::Base64RawStd),
            "base64rawurl" => Ok(Encoding::Base64RawUrl),
            _ => Err(CredentialError::UnknownEncoding(s.to_string())),
        }
    }
}

/// How a presented key becomes the stored secret.
#[derive(Clone, PartialEq, Eq)]
pub enum Transform {
    Plain,
    Hash(HashAlg),
    Hmac { alg: HashAlg, key: Vec<u8> },
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Plain => f.write_str("Plain"),
            Transform::Hash(alg) => f.debug_tuple("Hash").field(alg).finish(),
            Transform::Hmac { alg, .. } => f.debug_struct("Hmac").field("alg", alg).finish_non_exhaustive(),
        }
    }
}

impl Transform {
    pub fn apply(&self, key: &[u8]) -> Vec<u8> {
        match self {
            Transform::Plain => key.to_vec(),
            Transform::Hash(alg) => alg.digest(key),
            Transform::Hmac { alg, key: secret } => alg.hmac(secret, key),
        }
    }
}

/// AES-GCM sealing of stored secrets. Sealed form: `nonce || ciphertext`.
pub enum Cipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cipher::Aes128(_) => f.write_str("Cipher(AES-128-GCM)"),
            Cipher::Aes256(_) => f.write_str("Cipher(AES-256-GCM)"),
        }
    }
}

impl Cipher {
    pub fn new(key: &[u8]) -> Result<Self, CredentialError> {
        match key.len() {
            16 => Aes128Gcm::new_from_slice(key)
                .map(|c| Cipher::Aes128(Box::new(c)))
                .map_err(|_| CredentialError::CipherKeyLength(16)),
            32 => Aes256Gcm::new_from_slice(key)
                .map(|c| Cipher::Aes256(Box::new(c)))
                .map_err(|_| CredentialError::CipherKeyLength(32)),
            n => Err(CredentialError::CipherKeyLength(n)),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let nonce_ref = Nonce::from_slice(&nonce);
        let sealed = match self {
            Cipher::Aes128(c) => c.encrypt(nonce_ref, plaintext),
            Cipher::Aes256(c) => c.encrypt(nonce_ref, plaintext),
        }
        .map_err(|_| CredentialError::Seal)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CredentialError> {
        if sealed.len() < NONCE_LEN {
            return Err(CredentialError::Open);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce);
        match self {
            Cipher::Aes128(c) => c.decrypt(nonce, ciphertext),
            Cipher::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| CredentialError::Open)
    }
}

#[derive(Debug)]
pub struct SecretCodec {
    transform: Transform,
    encoding: Encoding,
    cipher: Option<Cipher>,
}

impl SecretCodec {
    /// Raw encoding only carries plain keys; digests are not text.
    pub fn new(transform: Transform, encoding: Encoding, cipher: Option<Cipher>) -> Result<Self, CredentialError> {
        if encoding == Encoding::Raw && transform != Transform::Plain {
            return Err(CredentialError::RawDigest);
        }
        Ok(Self {
            transform,
            encoding,
            cipher,
        })
    }

    pub fn plain() -> Self {
        Self {
            transform: Transform::Plain,
            encoding: Encoding::Raw,
            cipher: None,
        }
    }

    /// Store id for an API key.
    pub fn lookup_id(&self, key: &[u8]) -> String {
        self.encoding.encode(&self.transform.apply(key))
    }

    /// Secret to store for a key.
    pub fn seal(&self, key: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let derived = self.transform.apply(key);
        match &self.cipher {
            Some(cipher) => cipher.seal(&derived),
            None => Ok(derived),
        }
    }

    /// Constant-time check of a presented key against a stored secret.
    pub fn verify(&self, stored: &[u8], key: &[u8]) -> Result<bool, CredentialError> {
        let expected = match &self.cipher {
            Some(cipher) => cipher.open(stored)?,
            None => stored.to_vec(),
        };
        let derived = self.transform.apply(key);
        Ok(bool::from(expected.ct_eq(&derived)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_lookup_and_verify() {
        let codec = SecretCodec::new(Transform::Hash(HashAlg::Sha256), Encoding::Hex, None).unwrap();
        let id = codec.lookup_id(b"s3cret");
        assert_eq!(id, hex::encode(Sha256::digest(b"s3cret")));

        let stored = codec.seal(b"s3cret").unwrap();
        assert!(codec.verify(&stored, b"s3cret").unwrap());
        assert!(!codec.verify(&stored, b"wrong").unwrap());
    }

    #[test]
    fn hmac_depends_on_key() {
        let a = SecretCodec::new(
            Transform::Hmac { alg: HashAlg::Sha256, key: b"k1".to_vec() },
            Encoding::Base64RawUrl,
            None,
        )
        .unwrap();
        let b = SecretCodec::new(
            Transform::Hmac { alg: HashAlg::Sha256, key: b"k2".to_vec() },
            Encoding::Base64RawUrl,
            None,
        )
        .unwrap();
        assert_ne!(a.lookup_id(b"key"), b.lookup_id(b"key"));
        assert_eq!(a.lookup_id(b"key"), a.lookup_id(b"key"));
    }

    #[test]
    fn raw_encoding_rejects_digests() {
        assert_eq!(
            SecretCodec::new(Transform::Hash(HashAlg::Sha512), Encoding::Raw, None).unwrap_err(),
            CredentialError::RawDigest
        );
        assert_eq!(SecretCodec::plain().lookup_id(b"abc"), "abc");
    }

    #[test]
    fn sealed_secrets_open_only_with_the_same_key() {
        let codec = SecretCodec::new(Transform::Plain, Encoding::Raw, Some(Cipher::new(&[7u8; 32]).unwrap())).unwrap();
        let sealed = codec.seal(b"pw").unwrap();
        assert_ne!(sealed, b"pw");
        assert!(codec.verify(&sealed, b"pw").unwrap());
        assert!(!codec.verify(&sealed, b"other").unwrap());

        let other = SecretCodec::new(Transform::Plain, Encoding::Raw, Some(Cipher::new(&[8u8; 16]).unwrap())).unwrap();
        assert_eq!(other.verify(&sealed, b"pw").unwrap_err(), CredentialError::Open);
        assert!(matches!(Cipher::new(&[0u8; 20]), Err(CredentialError::CipherKeyLength(20))));
    }

    #[test]
    fn names_parse() {
        assert_eq!("sha-256".parse::<HashAlg>().unwrap(), HashAlg::Sha256);
        assert_eq!("Base64RawURL".parse::<Encoding>().unwrap(), Encoding::Base64RawUrl);
        assert!("md5".parse::<HashAlg>().is_err());
        assert_eq!(Encoding::Base64.decode("aGk=").unwrap(), b"hi");
        assert!(Encoding::Hex.decode("zz").is_err());
    }

    #[test]
    fn credential_serializes_secret_as_hex() {
        let cred = Credential {
            secret: vec![0xde, 0xad],
            attrs: serde_json::Map::new(),
        };
        let json = serde_json::to_string(&cred).unwrap();
        assert_eq!(json, r#"{"secret":"dead","attrs":{}}"#);
        assert_eq!(serde_json::from_str::<Credential>(&json).unwrap(), cred);
    }
}
