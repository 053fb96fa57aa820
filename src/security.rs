//! Pluggable block-level encryption.
//!
//! `DataBlock` never touches AES-GCM directly — it asks a [`SecurityManager`]
//! for an [`Encoder`]/[`Decoder`] bound to the block's expected cleartext
//! length. The default implementation reuses [`crate::crypto`] (AES-256-GCM,
//! Argon2id-derived key) one frame per block, since blocks are capped at
//! [`crate::config::Config::max_data_block_size`] and don't need incremental
//! AEAD framing.

use crate::crypto::{self, NONCE_LEN};

const GCM_TAG_LEN: usize = 16;

pub trait SecurityManager: Send + Sync {
    fn encoder(&self, raw_len: Option<u64>) -> Box<dyn Encoder>;
    fn decoder(&self, raw_len: Option<u64>) -> Box<dyn Decoder>;
}

pub trait Encoder: Send {
    /// Encrypt one write's worth of cleartext. `finalize` marks the last
    /// call for this block; implementations that buffer until finalize
    /// return the whole ciphertext only then.
    fn encrypt(&mut self, data: &[u8], finalize: bool) -> Vec<u8>;
    /// Ciphertext length for a block whose cleartext is `raw_len` bytes.
    fn expected_data_len(&self, raw_len: u64) -> u64;
}

pub trait Decoder: Send {
    fn decrypt(&mut self, data: &[u8]) -> Vec<u8>;
}

/// AES-256-GCM, one seal per block. Cleartext is buffered until `finalize`
/// because GCM has no streaming mode that preserves single-tag integrity
/// across an open-ended sequence of `write` calls.
pub struct AesGcmSecurityManager {
    key: [u8; 32],
}

impl AesGcmSecurityManager {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn from_password(password: &str, salt: &[u8]) -> Result<Self, crypto::CryptoError> {
        let key = crypto::derive_key(password, salt)?;
        Ok(Self::new(key))
    }
}

impl SecurityManager for AesGcmSecurityManager {
    fn encoder(&self, _raw_len: Option<u64>) -> Box<dyn Encoder> {
        Box::new(AesGcmEncoder {
            key: self.key,
            buf: Vec::new(),
        })
    }

    fn decoder(&self, _raw_len: Option<u64>) -> Box<dyn Decoder> {
        Box::new(AesGcmDecoder {
            key: self.key,
            buf: Vec::new(),
            sealed: false,
        })
    }
}

struct AesGcmEncoder {
    key: [u8; 32],
    buf: Vec<u8>,
}

impl Encoder for AesGcmEncoder {
    fn encrypt(&mut self, data: &[u8], finalize: bool) -> Vec<u8> {
        self.buf.extend_from_slice(data);
        if !finalize {
            return Vec::new();
        }
        crypto::encrypt(&self.key, &self.buf).expect("AES-GCM seal never fails on well-formed input")
    }

    fn expected_data_len(&self, raw_len: u64) -> u64 {
        raw_len + NONCE_LEN as u64 + GCM_TAG_LEN as u64
    }
}

struct AesGcmDecoder {
    key: [u8; 32],
    buf: Vec<u8>,
    sealed: bool,
}

impl Decoder for AesGcmDecoder {
    fn decrypt(&mut self, data: &[u8]) -> Vec<u8> {
        if self.sealed {
            return Vec::new();
        }
        self.buf.extend_from_slice(data);
        if self.buf.len() < NONCE_LEN + GCM_TAG_LEN {
            return Vec::new();
        }
        self.sealed = true;
        crypto::decrypt(&self.key, &self.buf).unwrap_or_default()
    }
}

/// No-op security manager — cleartext is the ciphertext. Used for tests and
/// deployments that terminate encryption elsewhere.
pub struct NullSecurityManager;

impl SecurityManager for NullSecurityManager {
    fn encoder(&self, _raw_len: Option<u64>) -> Box<dyn Encoder> {
        Box::new(NullEncoder)
    }
    fn decoder(&self, _raw_len: Option<u64>) -> Box<dyn Decoder> {
        Box::new(NullDecoder)
    }
}

struct NullEncoder;
impl Encoder for NullEncoder {
    fn encrypt(&mut self, data: &[u8], _finalize: bool) -> Vec<u8> {
        data.to_vec()
    }
    fn expected_data_len(&self, raw_len: u64) -> u64 {
        raw_len
    }
}

struct NullDecoder;
impl Decoder for NullDecoder {
    fn decrypt(&mut self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_gcm_round_trips() {
        let mgr = AesGcmSecurityManager::new([7u8; 32]);
        let mut enc = mgr.encoder(Some(11));
        let mut ct = enc.encrypt(b"hello ", false);
        assert!(ct.is_empty());
        ct = enc.encrypt(b"world", true);
        assert!(!ct.is_empty());

        let mut dec = mgr.decoder(Some(11));
        let pt = dec.decrypt(&ct);
        assert_eq!(pt, b"hello world");
    }

    #[test]
    fn null_manager_is_identity() {
        let mgr = NullSecurityManager;
        let mut enc = mgr.encoder(None);
        let ct = enc.encrypt(b"abc", true);
        assert_eq!(ct, b"abc");
    }
}
