//! Event payload decryption and request signatures.
//!
//! Encrypted pushes carry `{"encrypt": base64(iv || aes256cbc(plaintext))}`
//! where the AES key is the SHA-256 digest of the configured encrypt key and
//! the plaintext is PKCS#7 padded.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const BLOCK_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("payload is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("ciphertext too short or not block aligned ({0} bytes)")]
    Length(usize),
    #[error("bad padding")]
    Padding,
    #[error("plaintext is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub struct AesCipher {
    key: [u8; 32],
}

impl AesCipher {
    pub fn new(encrypt_key: &str) -> Self {
        Self {
            key: Sha256::digest(encrypt_key.as_bytes()).into(),
        }
    }

    /// Decrypt raw `iv || ciphertext` bytes.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, DecryptError> {
        if data.len() < 2 * BLOCK_SIZE || data.len() % BLOCK_SIZE != 0 {
            return Err(DecryptError::Length(data.len()));
        }
        let (iv, ciphertext) = data.split_at(BLOCK_SIZE);
        let cipher = Aes256CbcDec::new_from_slices(&self.key, iv)
            .map_err(|_| DecryptError::Length(data.len()))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| DecryptError::Padding)
    }

    /// Decode the base64 `encrypt` field and decrypt it to a string.
    pub fn decrypt_string(&self, encoded: &str) -> Result<String, DecryptError> {
        let data = STANDARD.decode(encoded.trim())?;
        let plain = self.decrypt(&data)?;
        Ok(String::from_utf8(plain)?)
    }

    #[cfg(test)]
    pub fn encrypt_string(&self, plaintext: &str, iv: [u8; BLOCK_SIZE]) -> String {
        use aes::cipher::BlockEncryptMut;
        type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &iv).unwrap();
        let mut out = iv.to_vec();
        out.extend(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes()));
        STANDARD.encode(out)
    }
}

/// `hex(sha256(timestamp || nonce || encrypt_key || body))`
pub fn compute_signature(timestamp: &str, nonce: &str, encrypt_key: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(encrypt_key.as_bytes());
    hasher.update(body);
    hex::encode(hasher.finalize())
}

pub fn verify_signature(
    timestamp: &str,
    nonce: &str,
    encrypt_key: &str,
    body: &[u8],
    signature: &str,
) -> bool {
    let expected = compute_signature(timestamp, nonce, encrypt_key, body);
    // Length mismatch compares unequal
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}
