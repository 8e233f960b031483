// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! NIP-44 v2 payload encryption.
//!
//! `payload = base64(0x02 || nonce[32] || chacha20(padded) || hmac[32])`, where
//! the ChaCha20 key/nonce and the HMAC key are expanded from a per-message
//! nonce under the HKDF conversation key.

#![forbid(unsafe_code)]

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::SharedSecret;
use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

pub const VERSION: u8 = 2;
pub const MIN_PLAINTEXT_SIZE: usize = 1;
pub const MAX_PLAINTEXT_SIZE: usize = 65535;
pub const MIN_PAYLOAD_SIZE: usize = 132;
pub const MAX_PAYLOAD_SIZE: usize = 87472;

const SALT: &[u8] = b"nip44-v2";
const NONCE_SIZE: usize = 32;
const MAC_SIZE: usize = 32;
const MIN_DECODED_SIZE: usize = 99;
const MAX_DECODED_SIZE: usize = 65603;

pub struct ConversationKey(Zeroizing<[u8; 32]>);

impl ConversationKey {
    pub fn derive(shared: &SharedSecret) -> Self {
        let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), shared.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&prk);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

struct MessageKeys {
    chacha_key: Zeroizing<[u8; 32]>,
    chacha_nonce: [u8; 12],
    hmac_key: Zeroizing<[u8; 32]>,
}

fn message_keys(
    conversation_key: &ConversationKey,
    nonce: &[u8; NONCE_SIZE],
) -> Result<MessageKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::from_prk(conversation_key.as_bytes())
        .map_err(|_| CryptoError::invalid_key("conversation key length"))?;
    let mut okm = Zeroizing::new([0u8; 76]);
    hk.expand(nonce, &mut okm[..])
        .map_err(|_| CryptoError::invalid_length("message key expansion"))?;

    let mut chacha_key = Zeroizing::new([0u8; 32]);
    let mut chacha_nonce = [0u8; 12];
    let mut hmac_key = Zeroizing::new([0u8; 32]);
    chacha_key.copy_from_slice(&okm[0..32]);
    chacha_nonce.copy_from_slice(&okm[32..44]);
    hmac_key.copy_from_slice(&okm[44..76]);

    Ok(MessageKeys {
        chacha_key,
        chacha_nonce,
        hmac_key,
    })
}

/// Padded size (without the 2-byte length prefix) for a plaintext of `len` bytes.
pub fn calc_padded_len(len: usize) -> usize {
    if len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (len - 1).leading_zeros());
    let chunk = if next_power <= 256 {
        32
    } else {
        next_power / 8
    };
    chunk * ((len - 1) / chunk + 1)
}

fn pad(plaintext: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let bytes = plaintext.as_bytes();
    let len = bytes.len();
    if !(MIN_PLAINTEXT_SIZE..=MAX_PLAINTEXT_SIZE).contains(&len) {
        return Err(CryptoError::invalid_length(format!(
            "plaintext must be {MIN_PLAINTEXT_SIZE}..={MAX_PLAINTEXT_SIZE} bytes, got {len}"
        )));
    }

    let mut padded = Zeroizing::new(vec![0u8; 2 + calc_padded_len(len)]);
    padded[..2].copy_from_slice(&(len as u16).to_be_bytes());
    padded[2..2 + len].copy_from_slice(bytes);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<String, CryptoError> {
    if padded.len() < 2 {
        return Err(CryptoError::InvalidPadding);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT_SIZE
        || padded.len() < 2 + len
        || padded.len() != 2 + calc_padded_len(len)
    {
        return Err(CryptoError::InvalidPadding);
    }
    String::from_utf8(padded[2..2 + len].to_vec())
        .map_err(|_| CryptoError::decryption("plaintext is not valid UTF-8"))
}

/// HMAC-SHA256 over `aad || message`; `aad` is always the 32-byte nonce.
fn hmac_aad(key: &[u8; 32], message: &[u8], aad: &[u8]) -> Result<HmacSha256, CryptoError> {
    if aad.len() != NONCE_SIZE {
        return Err(CryptoError::invalid_length("AAD must be 32 bytes"));
    }
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| CryptoError::invalid_key("HMAC key length"))?;
    mac.update(aad);
    mac.update(message);
    Ok(mac)
}

fn apply_chacha(keys: &MessageKeys, buf: &mut [u8]) -> Result<(), CryptoError> {
    let mut cipher = ChaCha20::new_from_slices(&keys.chacha_key[..], &keys.chacha_nonce)
        .map_err(|_| CryptoError::invalid_key("ChaCha20 key or nonce length"))?;
    cipher.apply_keystream(buf);
    Ok(())
}

fn seal(
    conversation_key: &ConversationKey,
    nonce: &[u8; NONCE_SIZE],
    padded: &[u8],
) -> Result<String, CryptoError> {
    let keys = message_keys(conversation_key, nonce)?;
    let mut ciphertext = padded.to_vec();
    apply_chacha(&keys, &mut ciphertext)?;
    let mac = hmac_aad(&keys.hmac_key, &ciphertext, nonce)?.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len() + MAC_SIZE);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&mac);
    Ok(STANDARD.encode(payload))
}

/// Encrypt with a fresh random nonce.
pub fn encrypt(shared: &SharedSecret, plaintext: &str) -> Result<String, CryptoError> {
    let nonce: [u8; NONCE_SIZE] = rand::rng().random();
    encrypt_with_nonce(shared, plaintext, &nonce)
}

pub fn encrypt_with_nonce(
    shared: &SharedSecret,
    plaintext: &str,
    nonce: &[u8; NONCE_SIZE],
) -> Result<String, CryptoError> {
    let conversation_key = ConversationKey::derive(shared);
    let padded = pad(plaintext)?;
    seal(&conversation_key, nonce, &padded)
}

struct DecodedPayload {
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
    mac: [u8; MAC_SIZE],
}

fn decode_payload(payload: &str) -> Result<DecodedPayload, CryptoError> {
    if payload.is_empty() || payload.starts_with('#') {
        return Err(CryptoError::UnknownVersion(
            "unsupported payload encoding".into(),
        ));
    }
    let plen = payload.len();
    if !(MIN_PAYLOAD_SIZE..=MAX_PAYLOAD_SIZE).contains(&plen) {
        return Err(CryptoError::invalid_length(format!(
            "payload size {plen} outside {MIN_PAYLOAD_SIZE}..={MAX_PAYLOAD_SIZE}"
        )));
    }

    let data = STANDARD
        .decode(payload)
        .map_err(|e| CryptoError::InvalidBase64(e.to_string()))?;
    let dlen = data.len();
    if !(MIN_DECODED_SIZE..=MAX_DECODED_SIZE).contains(&dlen) {
        return Err(CryptoError::invalid_length(format!(
            "decoded size {dlen} outside {MIN_DECODED_SIZE}..={MAX_DECODED_SIZE}"
        )));
    }
    if data[0] != VERSION {
        return Err(CryptoError::UnknownVersion(format!("version {}", data[0])));
    }

    let mut nonce = [0u8; NONCE_SIZE];
    let mut mac = [0u8; MAC_SIZE];
    nonce.copy_from_slice(&data[1..1 + NONCE_SIZE]);
    mac.copy_from_slice(&data[dlen - MAC_SIZE..]);
    Ok(DecodedPayload {
        nonce,
        ciphertext: data[1 + NONCE_SIZE..dlen - MAC_SIZE].to_vec(),
        mac,
    })
}

pub fn decrypt(shared: &SharedSecret, payload: &str) -> Result<String, CryptoError> {
    let conversation_key = ConversationKey::derive(shared);
    let decoded = decode_payload(payload)?;
    let keys = message_keys(&conversation_key, &decoded.nonce)?;

    hmac_aad(&keys.hmac_key, &decoded.ciphertext, &decoded.nonce)?
        .verify_slice(&decoded.mac)
        .map_err(|_| CryptoError::InvalidMac)?;

    let mut padded = Zeroizing::new(decoded.ciphertext);
    apply_chacha(&keys, &mut padded)?;
    unpad(&padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> SharedSecret {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        SharedSecret::new(bytes)
    }

    #[test]
    fn test_padded_len_buckets() {
        let cases = [
            (1, 32),
            (16, 32),
            (32, 32),
            (33, 64),
            (37, 64),
            (45, 64),
            (49, 64),
            (64, 64),
            (65, 96),
            (100, 128),
            (111, 128),
            (200, 224),
            (250, 256),
            (320, 320),
            (383, 384),
            (384, 384),
            (400, 448),
            (500, 512),
            (512, 512),
            (515, 640),
            (700, 768),
            (800, 896),
            (900, 1024),
            (1020, 1024),
            (65535, 65536),
        ];
        for (len, expected) in cases {
            assert_eq!(calc_padded_len(len), expected, "len {len}");
        }
    }

    #[test]
    fn test_conversation_key_vector() {
        let key = ConversationKey::derive(&shared());
        assert_eq!(
            hex::encode(key.as_bytes()),
            "aa074b05a4ee41826f811b32593af97b58a78f906af69b7ea0732b31f652570c"
        );
    }

    #[test]
    fn test_encrypt_known_vector() {
        let nonce = [0xab; 32];
        let payload = encrypt_with_nonce(&shared(), "hello nostr", &nonce).unwrap();
        assert_eq!(
            payload,
            "Aqurq6urq6urq6urq6urq6urq6urq6urq6urq6urq6urRwL/EHOuBhRWYq+YyUoVNIHlq7sAwEPOFjBY5tK6Oz3OE6ExpCcjJIhef1Cu45HS5A0PvXQPr83qWRBodncGus7W"
        );
        assert_eq!(decrypt(&shared(), &payload).unwrap(), "hello nostr");
    }

    #[test]
    fn test_roundtrip_boundary_lengths() {
        for len in [1usize, 32, 33, 65535] {
            let plaintext = "a".repeat(len);
            let payload = encrypt(&shared(), &plaintext).unwrap();
            assert_eq!(decrypt(&shared(), &payload).unwrap(), plaintext, "len {len}");
        }
    }

    #[test]
    fn test_roundtrip_multibyte() {
        let plaintext = "ünïcødé 🔑 payload";
        let payload = encrypt(&shared(), plaintext).unwrap();
        assert_eq!(decrypt(&shared(), &payload).unwrap(), plaintext);
    }

    #[test]
    fn test_plaintext_length_limits() {
        assert!(matches!(
            encrypt(&shared(), ""),
            Err(CryptoError::InvalidLength(_))
        ));
        assert!(matches!(
            encrypt(&shared(), &"a".repeat(65536)),
            Err(CryptoError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_flipped_mac_rejected() {
        let payload = encrypt(&shared(), "attack at dawn").unwrap();
        let mut data = STANDARD.decode(&payload).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        let tampered = STANDARD.encode(data);
        assert_eq!(decrypt(&shared(), &tampered), Err(CryptoError::InvalidMac));
    }

    #[test]
    fn test_flipped_ciphertext_rejected() {
        let payload = encrypt(&shared(), "attack at dawn").unwrap();
        let mut data = STANDARD.decode(&payload).unwrap();
        data[40] ^= 0x80;
        let tampered = STANDARD.encode(data);
        assert_eq!(decrypt(&shared(), &tampered), Err(CryptoError::InvalidMac));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let payload = encrypt(&shared(), "secret").unwrap();
        let other = SharedSecret::new([9u8; 32]);
        assert_eq!(decrypt(&other, &payload), Err(CryptoError::InvalidMac));
    }

    #[test]
    fn test_payload_size_checked_before_decoding() {
        // Not valid base64 either way, so a length error proves ordering.
        let short = "!".repeat(MIN_PAYLOAD_SIZE - 1);
        let long = "!".repeat(MAX_PAYLOAD_SIZE + 1);
        assert!(matches!(
            decrypt(&shared(), &short),
            Err(CryptoError::InvalidLength(_))
        ));
        assert!(matches!(
            decrypt(&shared(), &long),
            Err(CryptoError::InvalidLength(_))
        ));

        let in_range = "!".repeat(MIN_PAYLOAD_SIZE);
        assert!(matches!(
            decrypt(&shared(), &in_range),
            Err(CryptoError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_future_version_marker_rejected() {
        let payload = format!("#{}", "A".repeat(200));
        assert!(matches!(
            decrypt(&shared(), &payload),
            Err(CryptoError::UnknownVersion(_))
        ));
        assert!(matches!(
            decrypt(&shared(), ""),
            Err(CryptoError::UnknownVersion(_))
        ));
    }

    #[test]
    fn test_wrong_version_byte_rejected() {
        let payload = encrypt(&shared(), "hi").unwrap();
        let mut data = STANDARD.decode(&payload).unwrap();
        data[0] = 1;
        let tampered = STANDARD.encode(data);
        assert!(matches!(
            decrypt(&shared(), &tampered),
            Err(CryptoError::UnknownVersion(_))
        ));
    }

    #[test]
    fn test_inconsistent_padding_rejected() {
        let conversation_key = ConversationKey::derive(&shared());
        let nonce = [7u8; 32];

        // Declares 40 bytes but only carries a 32-byte bucket.
        let mut padded = vec![0u8; 2 + 32];
        padded[..2].copy_from_slice(&40u16.to_be_bytes());
        let payload = seal(&conversation_key, &nonce, &padded).unwrap();
        assert_eq!(decrypt(&shared(), &payload), Err(CryptoError::InvalidPadding));

        // Zero length prefix.
        let padded = vec![0u8; 2 + 32];
        let payload = seal(&conversation_key, &nonce, &padded).unwrap();
        assert_eq!(decrypt(&shared(), &payload), Err(CryptoError::InvalidPadding));

        // Bucket larger than the declared length requires.
        let mut padded = vec![0u8; 2 + 64];
        padded[..2].copy_from_slice(&5u16.to_be_bytes());
        let payload = seal(&conversation_key, &nonce, &padded).unwrap();
        assert_eq!(decrypt(&shared(), &payload), Err(CryptoError::InvalidPadding));
    }

    #[test]
    fn test_aad_must_be_32_bytes() {
        let key = [1u8; 32];
        assert!(hmac_aad(&key, b"msg", &[0u8; 16]).is_err());
        assert!(hmac_aad(&key, b"msg", &[0u8; 32]).is_ok());
    }
}
