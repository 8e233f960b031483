// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use keep_core::error::KeepError;
use keep_core::relay::{normalize_relay_url, validate_relay_url, MAX_RELAYS};
use nostr_sdk::prelude::*;
use tracing::{debug, warn};

use crate::error::Result;
use crate::policy::PermissionPolicy;
use crate::session::SessionProfile;
use crate::types::{CAPABILITY_METHODS, METHOD_SIGN_EVENT};

pub const INVITE_SCHEME: &str = "nostrconnect://";

const MAX_SECRET_LENGTH: usize = 256;
const MAX_PROFILE_FIELD_LENGTH: usize = 512;

/// A parsed `nostrconnect://` connection invite.
#[derive(Debug, Clone, PartialEq)]
pub struct InviteToken {
    pub client_pubkey: PublicKey,
    pub relays: Vec<String>,
    pub secret: Option<String>,
    pub policy: PermissionPolicy,
    pub profile: SessionProfile,
}

impl InviteToken {
    pub fn new(client_pubkey: PublicKey, relays: Vec<String>) -> Self {
        Self {
            client_pubkey,
            relays,
            secret: None,
            policy: PermissionPolicy::default(),
            profile: SessionProfile::default(),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_policy(mut self, policy: PermissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if !uri.starts_with(INVITE_SCHEME) {
            return Err(KeepError::InvalidInput(
                "invite must start with nostrconnect://".into(),
            ));
        }

        let url = ::url::Url::parse(uri)
            .map_err(|e| KeepError::InvalidInput(format!("invalid invite URL: {e}")))?;

        let pubkey_hex = url
            .host_str()
            .ok_or_else(|| KeepError::InvalidInput("missing client pubkey".into()))?;
        let client_pubkey = PublicKey::from_hex(pubkey_hex)
            .map_err(|e| KeepError::InvalidInput(format!("invalid client pubkey: {e}")))?;

        let mut relays: Vec<String> = Vec::new();
        let mut secret = None;
        let mut policy = PermissionPolicy::default();
        let mut profile = SessionProfile::default();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "relay" => match validate_relay_url(&value) {
                    Ok(()) => {
                        let relay = normalize_relay_url(&value);
                        if !relays.contains(&relay) && relays.len() < MAX_RELAYS {
                            relays.push(relay);
                        }
                    }
                    Err(reason) => warn!(%reason, "dropping invalid invite relay"),
                },
                "secret" => {
                    if value.len() > MAX_SECRET_LENGTH {
                        return Err(KeepError::InvalidInput("invite secret too long".into()));
                    }
                    secret = Some(value.into_owned());
                }
                "perms" => policy = parse_perms(&value),
                "name" => profile.name = bounded(&value),
                "url" => profile.url = bounded(&value),
                "image" => profile.image = bounded(&value),
                other => debug!(param = other, "ignoring unknown invite parameter"),
            }
        }

        if relays.is_empty() {
            return Err(KeepError::InvalidInput("invite has no valid relay".into()));
        }

        Ok(Self {
            client_pubkey,
            relays,
            secret,
            policy,
            profile,
        })
    }

    pub fn to_uri(&self) -> String {
        let mut uri = format!("{INVITE_SCHEME}{}", self.client_pubkey.to_hex());
        let mut sep = '?';
        let mut push = |key: &str, value: &str| {
            uri.push(sep);
            uri.push_str(key);
            uri.push('=');
            uri.push_str(&urlencoding::encode(value));
            sep = '&';
        };

        for relay in &self.relays {
            push("relay", relay);
        }
        if let Some(secret) = &self.secret {
            push("secret", secret);
        }
        let perms = format_perms(&self.policy);
        if !perms.is_empty() {
            push("perms", &perms);
        }
        if let Some(name) = &self.profile.name {
            push("name", name);
        }
        if let Some(url) = &self.profile.url {
            push("url", url);
        }
        if let Some(image) = &self.profile.image {
            push("image", image);
        }
        uri
    }
}

fn bounded(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.len() > MAX_PROFILE_FIELD_LENGTH {
        return None;
    }
    Some(value.to_string())
}

/// `method` grants the method, `sign_event:<kind>` grants one kind.
pub fn parse_perms(perms: &str) -> PermissionPolicy {
    let mut policy = PermissionPolicy::default();
    for part in perms.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once(':') {
            Some((METHOD_SIGN_EVENT, kind)) => match kind.trim().parse::<u16>() {
                Ok(kind) => {
                    policy.kinds.insert(kind, true);
                }
                Err(_) => debug!(perm = part, "ignoring malformed kind permission"),
            },
            Some(_) => debug!(perm = part, "ignoring unknown permission"),
            None if CAPABILITY_METHODS.contains(&part) => {
                policy.methods.insert(part.to_string(), true);
            }
            None => debug!(perm = part, "ignoring unknown permission"),
        }
    }
    policy
}

fn format_perms(policy: &PermissionPolicy) -> String {
    let methods = policy
        .methods
        .iter()
        .filter(|(_, allowed)| **allowed)
        .map(|(m, _)| m.clone());
    let kinds = policy
        .kinds
        .iter()
        .filter(|(_, allowed)| **allowed)
        .map(|(k, _)| format!("{METHOD_SIGN_EVENT}:{k}"));
    methods.chain(kinds).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pubkey() -> PublicKey {
        Keys::generate().public_key()
    }

    #[test]
    fn test_parse_full_invite() {
        let pk = pubkey();
        let uri = format!(
            "nostrconnect://{}?relay=wss%3A%2F%2Frelay.damus.io&relay=wss://nos.lol/&secret=s3cret&perms=nip44_encrypt,sign_event:1,sign_event:7&name=My%20App&url=https%3A%2F%2Fapp.example",
            pk.to_hex()
        );
        let invite = InviteToken::parse(&uri).unwrap();

        assert_eq!(invite.client_pubkey, pk);
        assert_eq!(invite.relays, vec!["wss://relay.damus.io", "wss://nos.lol"]);
        assert_eq!(invite.secret.as_deref(), Some("s3cret"));
        assert_eq!(invite.policy.methods.get("nip44_encrypt"), Some(&true));
        assert_eq!(invite.policy.kinds.get(&1), Some(&true));
        assert_eq!(invite.policy.kinds.get(&7), Some(&true));
        assert!(!invite.policy.methods.contains_key("sign_event"));
        assert_eq!(invite.profile.name.as_deref(), Some("My App"));
        assert_eq!(invite.profile.url.as_deref(), Some("https://app.example"));
    }

    #[test]
    fn test_invalid_relays_dropped() {
        let uri = format!(
            "nostrconnect://{}?relay=ws://insecure.example&relay=wss://localhost&relay=wss://relay.damus.io",
            pubkey().to_hex()
        );
        let invite = InviteToken::parse(&uri).unwrap();
        assert_eq!(invite.relays, vec!["wss://relay.damus.io"]);
    }

    #[test]
    fn test_invite_without_valid_relay_rejected() {
        let uri = format!(
            "nostrconnect://{}?relay=ws://insecure.example&secret=x",
            pubkey().to_hex()
        );
        assert!(matches!(
            InviteToken::parse(&uri),
            Err(KeepError::InvalidInput(_))
        ));
        let uri = format!("nostrconnect://{}", pubkey().to_hex());
        assert!(InviteToken::parse(&uri).is_err());
    }

    #[test]
    fn test_bad_scheme_and_pubkey_rejected() {
        assert!(InviteToken::parse("bunker://abc?relay=wss://relay.damus.io").is_err());
        assert!(InviteToken::parse("nostrconnect://nothex?relay=wss://relay.damus.io").is_err());
    }

    #[test]
    fn test_parse_perms_ignores_unknown() {
        let policy = parse_perms("get_public_key, sign_event:abc, switch_relays, foo:1,,");
        assert_eq!(policy.methods.len(), 1);
        assert!(policy.kinds.is_empty());
    }

    #[test]
    fn test_to_uri_roundtrip() {
        let invite = InviteToken::new(pubkey(), vec!["wss://relay.damus.io".into()])
            .with_secret("pass&word=special chars+more")
            .with_policy(PermissionPolicy::default().allow_method("get_public_key").allow_kind(1));

        let uri = invite.to_uri();
        assert!(!uri.contains("pass&word"));
        let parsed = InviteToken::parse(&uri).unwrap();
        assert_eq!(parsed, invite);
    }
}
