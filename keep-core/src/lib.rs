// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Keep Core - shared building blocks for the Keep signer agent
//!
//! This crate provides:
//! - The error taxonomy shared by the bridge and the NIP-46 backend
//! - NIP-44 v2 and NIP-04 payload ciphers keyed by an ECDH shared secret
//! - Relay URL validation and normalization

#![forbid(unsafe_code)]

pub mod cipher;
pub mod error;
pub mod relay;

pub use cipher::SharedSecret;
pub use error::{CryptoError, KeepError, Result};
