// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tracing::{debug, error, info, warn};

use keep_core::error::{CryptoError, KeepError};
use keep_core::relay::validate_relay_url;

use crate::agent::AgentState;
use crate::capability::RelayLink;
use crate::error::Result;
use crate::types::{CapabilityRequest, Nip46Request, Nip46Response, RelayReply};

const MAX_REQUEST_ID_LENGTH: usize = 64;
const MAX_NIP46_PARAMS: usize = 10;

/// Relay transport for capability requests: kind 24133 events, NIP-44
/// encrypted to the transport key.
pub struct NostrRelayLink {
    keys: Keys,
    relay_urls: Vec<String>,
    client: Client,
    max_request_size: usize,
    running: AtomicBool,
}

impl NostrRelayLink {
    pub async fn new(keys: Keys, relay_urls: &[String], max_request_size: usize) -> Result<Self> {
        if relay_urls.is_empty() {
            return Err(KeepError::InvalidInput("at least one relay required".into()));
        }
        for relay in relay_urls {
            validate_relay_url(relay)
                .map_err(|e| KeepError::InvalidInput(format!("relay {relay}: {e}")))?;
        }

        let client = Client::new(keys.clone());
        for relay in relay_urls {
            client
                .add_relay(relay)
                .await
                .map_err(|e| KeepError::InvalidInput(format!("relay {relay}: {e}")))?;
        }

        Ok(Self {
            keys,
            relay_urls: relay_urls.to_vec(),
            client,
            max_request_size,
            running: AtomicBool::new(false),
        })
    }

    /// The key counterparts address their requests to.
    pub fn pubkey(&self) -> PublicKey {
        self.keys.public_key()
    }

    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(relays = self.relay_urls.len(), "connecting to relays");
        self.client.connect().await;

        let filter = Filter::new()
            .kind(Kind::NostrConnect)
            .pubkey(self.keys.public_key());
        if let Err(e) = self.client.subscribe(filter, None).await {
            self.running.store(false, Ordering::SeqCst);
            error!(error = %e, "subscription failed");
            return Err(KeepError::TransportUnavailable);
        }

        let pubkey = self.keys.public_key().to_hex();
        debug!(pubkey, "listening for NIP-46 requests");
        Ok(())
    }

    /// Feeds every inbound request to `agent` until the agent closes or the
    /// relay pool shuts down, then disconnects.
    pub async fn run(&self, agent: Arc<AgentState>) -> Result<()> {
        self.start().await?;

        let keys = self.keys.clone();
        let max_request_size = self.max_request_size;

        let result = self
            .client
            .handle_notifications(|notification| {
                let keys = keys.clone();
                let agent = agent.clone();

                async move {
                    if let RelayPoolNotification::Event { event, .. } = notification {
                        if event.kind == Kind::NostrConnect {
                            match decode_event(&keys, &event, max_request_size) {
                                Ok(request) => {
                                    let agent = agent.clone();
                                    tokio::spawn(async move {
                                        agent.handle_capability_request(request).await;
                                    });
                                }
                                Err(e) => warn!(error = %e, "dropping NIP-46 event"),
                            }
                        }
                    }
                    Ok(agent.is_closed())
                }
            })
            .await;

        self.stop().await;
        result.map_err(|e| {
            error!(error = %e, "notification handler failed");
            KeepError::TransportUnavailable
        })
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.client.disconnect().await;
    }
}

#[async_trait]
impl RelayLink for NostrRelayLink {
    async fn reply(
        &self,
        request_id: &str,
        counterpart: &PublicKey,
        reply: RelayReply,
    ) -> Result<()> {
        let response = Nip46Response::from_reply(request_id, reply);
        let response_json = serde_json::to_string(&response)?;

        let encrypted = nip44::encrypt(
            self.keys.secret_key(),
            counterpart,
            &response_json,
            nip44::Version::V2,
        )
        .map_err(|e| CryptoError::encryption(e.to_string()))?;

        let response_event = EventBuilder::new(Kind::NostrConnect, encrypted)
            .tag(Tag::public_key(*counterpart))
            .sign_with_keys(&self.keys)
            .map_err(|e| CryptoError::encryption(format!("sign response: {e}")))?;

        self.client.send_event(&response_event).await.map_err(|e| {
            error!(error = %e, "failed to send response");
            KeepError::TransportUnavailable
        })?;
        Ok(())
    }
}

fn decode_event(keys: &Keys, event: &Event, max_size: usize) -> Result<CapabilityRequest> {
    if event.content.len() > max_size * 2 {
        return Err(KeepError::InvalidInput("NIP-46 event too large".into()));
    }
    let decrypted = nip44::decrypt(keys.secret_key(), &event.pubkey, &event.content)
        .map_err(|e| CryptoError::decryption(e.to_string()))?;
    parse_request(&decrypted, event.pubkey, max_size)
}

/// Validates a decrypted `{id, method, params}` body.
pub(crate) fn parse_request(
    decrypted: &str,
    counterpart: PublicKey,
    max_size: usize,
) -> Result<CapabilityRequest> {
    if decrypted.len() > max_size {
        return Err(KeepError::InvalidInput("NIP-46 request too large".into()));
    }

    let request: Nip46Request = serde_json::from_str(decrypted)
        .map_err(|e| KeepError::protocol(format!("NIP-46 request: {e}")))?;

    if request.id.is_empty()
        || request.id.len() > MAX_REQUEST_ID_LENGTH
        || !request
            .id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    {
        return Err(KeepError::InvalidInput("invalid request ID".into()));
    }

    if request.params.len() > MAX_NIP46_PARAMS {
        return Err(KeepError::InvalidInput("too many request params".into()));
    }

    let app_id = &counterpart.to_hex()[..8];
    debug!(method = %request.method, app_id, "NIP-46 request");

    Ok(CapabilityRequest::new(
        request.id,
        request.method,
        request.params,
        counterpart,
    ))
}
