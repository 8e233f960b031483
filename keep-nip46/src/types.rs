// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

pub const METHOD_CONNECT: &str = "connect";
pub const METHOD_GET_PUBLIC_KEY: &str = "get_public_key";
pub const METHOD_SIGN_EVENT: &str = "sign_event";
pub const METHOD_NIP04_ENCRYPT: &str = "nip04_encrypt";
pub const METHOD_NIP04_DECRYPT: &str = "nip04_decrypt";
pub const METHOD_NIP44_ENCRYPT: &str = "nip44_encrypt";
pub const METHOD_NIP44_DECRYPT: &str = "nip44_decrypt";

/// The policy-gated methods a signing capability normally offers.
pub const CAPABILITY_METHODS: [&str; 6] = [
    METHOD_GET_PUBLIC_KEY,
    METHOD_SIGN_EVENT,
    METHOD_NIP04_ENCRYPT,
    METHOD_NIP04_DECRYPT,
    METHOD_NIP44_ENCRYPT,
    METHOD_NIP44_DECRYPT,
];

/// An inbound request from a remote counterpart, alive until answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRequest {
    pub id: String,
    pub method: String,
    pub params: Vec<String>,
    pub counterpart: PublicKey,
}

impl CapabilityRequest {
    pub fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        params: Vec<String>,
        counterpart: PublicKey,
    ) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
            counterpart,
        }
    }

    /// First 8 hex chars of the counterpart key, for logs.
    pub fn app_id(&self) -> String {
        self.counterpart.to_hex()[..8].to_string()
    }
}

/// The payload of a reply to a counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayReply {
    Result(String),
    Error(String),
}

impl RelayReply {
    pub fn is_ok(&self) -> bool {
        matches!(self, RelayReply::Result(_))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Nip46Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct Nip46Response {
    pub id: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Nip46Response {
    pub fn from_reply(id: &str, reply: RelayReply) -> Self {
        match reply {
            RelayReply::Result(result) => Self {
                id: id.to_string(),
                result: Some(result),
                error: None,
            },
            RelayReply::Error(error) => Self {
                id: id.to_string(),
                result: None,
                error: Some(error),
            },
        }
    }
}

/// The unsigned event a counterpart asks us to sign.
#[derive(Debug, Clone, Deserialize)]
pub struct PartialEvent {
    pub kind: u16,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub created_at: i64,
}
