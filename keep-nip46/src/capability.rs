// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

//! Seams to the collaborators the agent drives but does not implement.

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::RelayReply;

/// What the threshold signer hands back for one event id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureResult {
    pub id: String,
    pub pubkey: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub pubkey: String,
    pub status: String,
}

/// The signing node holding the share. Failures are plain reasons; the
/// agent never retries them.
#[async_trait]
pub trait SigningCapability: Send + Sync {
    fn group_pubkey(&self) -> PublicKey;

    /// Signs a 32-byte event id given as hex.
    async fn sign(&self, event_id: &str) -> std::result::Result<SignatureResult, String>;

    /// Hex of the shared point's x-coordinate, or of the compressed point.
    async fn ecdh(&self, peer: &PublicKey) -> std::result::Result<String, String>;

    async fn supported_methods(&self) -> Vec<String>;

    async fn peers(&self) -> Vec<PeerInfo>;
}

/// Outbound half of the relay transport.
#[async_trait]
pub trait RelayLink: Send + Sync {
    async fn reply(&self, request_id: &str, counterpart: &PublicKey, reply: RelayReply)
        -> Result<()>;
}
