// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use url::{Host, Url};

/// Maximum number of relays kept in settings or accepted from an invite.
pub const MAX_RELAYS: usize = 10;

/// Maximum length of a relay URL.
pub const MAX_RELAY_URL_LENGTH: usize = 256;

/// Validate a relay URL.
///
/// Accepts `wss://` URLs pointing to a public host.
pub fn validate_relay_url(url: &str) -> Result<(), String> {
    if url.len() > MAX_RELAY_URL_LENGTH {
        return Err("URL too long".into());
    }
    if !url.starts_with("wss://") {
        return Err("Must use wss:// protocol".into());
    }

    let parsed = Url::parse(url).map_err(|e| format!("Invalid URL: {e}"))?;
    if parsed.port() == Some(0) {
        return Err("Invalid port".into());
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err("Credentials not allowed".into());
    }

    match parsed.host() {
        None => Err("Missing host".into()),
        Some(host) if is_internal_host(&host) => Err("Internal addresses not allowed".into()),
        Some(_) => Ok(()),
    }
}

/// Canonical form used for de-duplication: lowercase host, no trailing slash.
pub fn normalize_relay_url(url: &str) -> String {
    let trimmed = url.trim();
    match Url::parse(trimmed) {
        Ok(parsed) => parsed.as_str().trim_end_matches('/').to_string(),
        Err(_) => trimmed.trim_end_matches('/').to_string(),
    }
}

fn is_internal_host(host: &Host<&str>) -> bool {
    match host {
        Host::Ipv4(ip) => {
            ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
        }
        Host::Ipv6(ip) => ip.is_loopback() || ip.is_unspecified(),
        Host::Domain(domain) => {
            let domain = domain.to_lowercase();
            domain == "localhost" || domain.ends_with(".local") || domain.ends_with(".localhost")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_relay_url() {
        assert!(validate_relay_url("wss://relay.damus.io").is_ok());
        assert!(validate_relay_url("wss://relay.example.com:7777/path").is_ok());

        assert!(validate_relay_url("ws://relay.damus.io").is_err());
        assert!(validate_relay_url("https://relay.damus.io").is_err());
        assert!(validate_relay_url("wss://").is_err());
        assert!(validate_relay_url("wss://localhost").is_err());
        assert!(validate_relay_url("wss://127.0.0.1:8080").is_err());
        assert!(validate_relay_url("wss://192.168.1.10").is_err());
        assert!(validate_relay_url("wss://172.20.0.1").is_err());
        assert!(validate_relay_url("wss://[::1]").is_err());
        assert!(validate_relay_url("wss://relay.local").is_err());
        assert!(validate_relay_url("wss://user:pw@relay.damus.io").is_err());

        let long = format!("wss://{}.com", "a".repeat(MAX_RELAY_URL_LENGTH));
        assert!(validate_relay_url(&long).is_err());
    }

    #[test]
    fn test_public_172_allowed() {
        assert!(validate_relay_url("wss://172.15.0.1").is_ok());
        assert!(validate_relay_url("wss://172.32.0.1").is_ok());
    }

    #[test]
    fn test_normalize_relay_url() {
        assert_eq!(
            normalize_relay_url(" wss://Relay.Damus.IO/ "),
            "wss://relay.damus.io"
        );
        assert_eq!(normalize_relay_url("wss://nos.lol"), "wss://nos.lol");
        assert_eq!(
            normalize_relay_url("wss://relay.example.com/inbox/"),
            "wss://relay.example.com/inbox"
        );
    }
}
