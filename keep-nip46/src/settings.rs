// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use keep_bridge::StoreRecord;
use keep_core::relay::{normalize_relay_url, validate_relay_url, MAX_RELAYS};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Stands in for the share in every copy of the settings that leaves the
/// backend.
pub const REDACTED_SHARE: &str = "<redacted>";

/// User settings for the signing node, persisted under `settings`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub group: Option<String>,
    pub share: Option<String>,
    pub peers: Vec<String>,
    pub relays: Vec<String>,
}

impl std::fmt::Debug for AgentSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSettings")
            .field("group", &self.group)
            .field("share", &self.share.as_ref().map(|_| REDACTED_SHARE))
            .field("peers", &self.peers)
            .field("relays", &self.relays)
            .finish()
    }
}

impl StoreRecord for AgentSettings {
    const STORE_KEY: &'static str = "settings";

    fn defaults() -> Self {
        Self::default()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.relays.len() > MAX_RELAYS {
            return Err(format!("at most {MAX_RELAYS} relays allowed"));
        }
        for relay in &self.relays {
            validate_relay_url(relay).map_err(|e| format!("relay {relay}: {e}"))?;
        }
        if self.share.as_deref() == Some(REDACTED_SHARE) {
            return Err("share is a redaction placeholder".into());
        }
        for peer in &self.peers {
            let bytes = hex::decode(peer).map_err(|_| format!("peer {peer} is not hex"))?;
            if bytes.len() != 32 && bytes.len() != 33 {
                return Err(format!("peer {peer} is not a public key"));
            }
        }
        Ok(())
    }
}

impl AgentSettings {
    /// The share is present, so a signing node can be built.
    pub fn is_configured(&self) -> bool {
        self.group.is_some() && self.share.is_some()
    }

    /// Settings as they may be shown outside the backend.
    pub fn redacted(&self) -> Self {
        Self {
            share: self.share.as_ref().map(|_| REDACTED_SHARE.to_string()),
            ..self.clone()
        }
    }
}

/// Store middleware: a redacted share sent back by the UI means "unchanged".
pub fn keep_redacted_share(
    previous: &AgentSettings,
    mut next: AgentSettings,
) -> Result<AgentSettings> {
    if next.share.as_deref() == Some(REDACTED_SHARE) {
        next.share = previous.share.clone();
    }
    Ok(next)
}

/// Store middleware: canonical, de-duplicated relay URLs.
pub fn normalize_relays(
    _previous: &AgentSettings,
    mut next: AgentSettings,
) -> Result<AgentSettings> {
    let mut relays: Vec<String> = Vec::with_capacity(next.relays.len());
    for relay in next.relays.drain(..) {
        let relay = normalize_relay_url(&relay);
        if !relay.is_empty() && !relays.contains(&relay) {
            relays.push(relay);
        }
    }
    next.relays = relays;
    Ok(next)
}

/// What a settings change means for the running signing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeReset {
    None,
    Reconnect,
    Rebuild,
}

/// A new share needs a fresh node; a topology change with the same share
/// only needs a reconnect.
pub fn reset_decision(previous: &AgentSettings, next: &AgentSettings) -> NodeReset {
    if previous.share != next.share {
        return NodeReset::Rebuild;
    }
    if previous.group != next.group
        || previous.peers != next.peers
        || previous.relays != next.relays
    {
        return NodeReset::Reconnect;
    }
    NodeReset::None
}
