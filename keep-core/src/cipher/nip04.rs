// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Legacy NIP-04 payloads: AES-256-CBC keyed by the raw ECDH x-coordinate,
//! encoded as `base64(ciphertext)?iv=base64(iv)`.

#![forbid(unsafe_code)]

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::Rng;
use zeroize::Zeroizing;

use super::SharedSecret;
use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_SIZE: usize = 16;
const IV_SEPARATOR: &str = "?iv=";

pub fn encrypt(shared: &SharedSecret, plaintext: &str) -> Result<String, CryptoError> {
    let iv: [u8; IV_SIZE] = rand::rng().random();
    encrypt_with_iv(shared, plaintext, &iv)
}

pub fn encrypt_with_iv(
    shared: &SharedSecret,
    plaintext: &str,
    iv: &[u8; IV_SIZE],
) -> Result<String, CryptoError> {
    let cipher = Aes256CbcEnc::new_from_slices(shared.as_bytes(), iv)
        .map_err(|_| CryptoError::invalid_key("AES-256-CBC key or IV length"))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(format!(
        "{}{IV_SEPARATOR}{}",
        STANDARD.encode(ciphertext),
        STANDARD.encode(iv)
    ))
}

pub fn decrypt(shared: &SharedSecret, payload: &str) -> Result<String, CryptoError> {
    let (ct_b64, iv_b64) = payload
        .split_once(IV_SEPARATOR)
        .ok_or_else(|| CryptoError::decryption("missing iv"))?;

    let ciphertext = STANDARD
        .decode(ct_b64)
        .map_err(|e| CryptoError::InvalidBase64(e.to_string()))?;
    let iv = STANDARD
        .decode(iv_b64)
        .map_err(|e| CryptoError::InvalidBase64(e.to_string()))?;
    if iv.len() != IV_SIZE {
        return Err(CryptoError::invalid_length(format!(
            "iv must be {IV_SIZE} bytes, got {}",
            iv.len()
        )));
    }
    if ciphertext.is_empty() {
        return Err(CryptoError::invalid_length("empty ciphertext"));
    }

    let cipher = Aes256CbcDec::new_from_slices(shared.as_bytes(), &iv)
        .map_err(|_| CryptoError::invalid_key("AES-256-CBC key or IV length"))?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CryptoError::InvalidPadding)?,
    );

    String::from_utf8(plaintext.to_vec())
        .map_err(|_| CryptoError::decryption("plaintext is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SharedSecret {
        SharedSecret::new([7u8; 32])
    }

    #[test]
    fn test_known_vector() {
        let mut iv = [0u8; 16];
        for (i, b) in iv.iter_mut().enumerate() {
            *b = i as u8;
        }
        let payload = encrypt_with_iv(&key(), "hello nip04", &iv).unwrap();
        assert_eq!(
            payload,
            "FeWzxV3AUen3HCBu2JciRg==?iv=AAECAwQFBgcICQoLDA0ODw=="
        );
        assert_eq!(decrypt(&key(), &payload).unwrap(), "hello nip04");
    }

    #[test]
    fn test_roundtrip_random_iv() {
        let a = encrypt(&key(), "same text").unwrap();
        let b = encrypt(&key(), "same text").unwrap();
        assert_ne!(a, b);
        assert_eq!(decrypt(&key(), &a).unwrap(), "same text");
        assert_eq!(decrypt(&key(), &b).unwrap(), "same text");
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let payload = encrypt(&key(), "").unwrap();
        assert_eq!(decrypt(&key(), &payload).unwrap(), "");
    }

    #[test]
    fn test_missing_iv_rejected() {
        assert!(matches!(
            decrypt(&key(), "FeWzxV3AUen3HCBu2JciRg=="),
            Err(CryptoError::Decryption(_))
        ));
    }

    #[test]
    fn test_bad_iv_length_rejected() {
        assert!(matches!(
            decrypt(&key(), "FeWzxV3AUen3HCBu2JciRg==?iv=AAEC"),
            Err(CryptoError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_bad_base64_rejected() {
        assert!(matches!(
            decrypt(&key(), "***?iv=AAECAwQFBgcICQoLDA0ODw=="),
            Err(CryptoError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let payload = encrypt(&key(), "a longer message than one block").unwrap();
        let other = SharedSecret::new([8u8; 32]);
        // Wrong key yields garbage padding or garbage bytes; never the plaintext.
        if let Ok(text) = decrypt(&other, &payload) {
            assert_ne!(text, "a longer message than one block");
        }
    }
}
