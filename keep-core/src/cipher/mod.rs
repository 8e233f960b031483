// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Payload ciphers for capability requests.
//!
//! Both codecs are keyed by the x-coordinate of an ECDH point obtained from
//! the signing capability; neither ever sees the agent's share.

#![forbid(unsafe_code)]

pub mod nip04;
pub mod nip44;

use zeroize::Zeroizing;

use crate::error::CryptoError;

/// The 32-byte x-coordinate of an ECDH shared point.
#[derive(Clone)]
pub struct SharedSecret(Zeroizing<[u8; 32]>);

impl SharedSecret {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Accepts either the bare x-coordinate or a 33-byte compressed point.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let x = match bytes.len() {
            32 => bytes,
            33 if bytes[0] == 0x02 || bytes[0] == 0x03 => &bytes[1..],
            n => {
                return Err(CryptoError::invalid_key(format!(
                    "shared secret must be 32 or 33 bytes, got {n}"
                )))
            }
        };
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(x);
        Ok(Self(out))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            hex::decode(hex_str.trim())
                .map_err(|e| CryptoError::invalid_key(format!("shared secret hex: {e}")))?,
        );
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}
