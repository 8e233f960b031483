// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keep_bridge::{Envelope, Link, MemoryStore, MessageBus};
use nostr_sdk::prelude::*;
use nostr_sdk::secp256k1::Message;
use parking_lot::Mutex;
use serde_json::json;

use keep_nip46::agent::PolicyAddParams;
use keep_nip46::types::{CAPABILITY_METHODS, METHOD_CONNECT, METHOD_SIGN_EVENT};
use keep_nip46::{
    Accept, AgentConfig, AgentState, CapabilityRequest, InviteToken, NodeEvent, NodeReset,
    PeerInfo, PermissionPolicy, RelayLink, RelayReply, SessionStatus, SignatureResult,
    SignerClient, SigningCapability, Verdict,
};

struct TestSigner {
    keys: Keys,
}

#[async_trait]
impl SigningCapability for TestSigner {
    fn group_pubkey(&self) -> PublicKey {
        self.keys.public_key()
    }

    async fn sign(&self, event_id: &str) -> Result<SignatureResult, String> {
        let digest: [u8; 32] = hex::decode(event_id)
            .map_err(|e| e.to_string())?
            .try_into()
            .map_err(|_| "bad id".to_string())?;
        let sig = self.keys.sign_schnorr(&Message::from_digest(digest));
        Ok(SignatureResult {
            id: event_id.to_string(),
            pubkey: self.keys.public_key().to_hex(),
            signature: sig.to_string(),
        })
    }

    async fn ecdh(&self, _peer: &PublicKey) -> Result<String, String> {
        Err("not available".into())
    }

    async fn supported_methods(&self) -> Vec<String> {
        CAPABILITY_METHODS.iter().map(|m| m.to_string()).collect()
    }

    async fn peers(&self) -> Vec<PeerInfo> {
        vec![PeerInfo {
            pubkey: "02".to_string() + &"ab".repeat(32),
            status: "online".into(),
        }]
    }
}

#[derive(Default)]
struct RecordingRelay {
    replies: Mutex<Vec<(String, RelayReply)>>,
}

#[async_trait]
impl RelayLink for RecordingRelay {
    async fn reply(
        &self,
        request_id: &str,
        _counterpart: &PublicKey,
        reply: RelayReply,
    ) -> keep_nip46::Result<()> {
        self.replies.lock().push((request_id.to_string(), reply));
        Ok(())
    }
}

impl RecordingRelay {
    fn reply_for(&self, id: &str) -> Option<RelayReply> {
        self.replies
            .lock()
            .iter()
            .find(|(rid, _)| rid == id)
            .map(|(_, r)| r.clone())
    }
}

struct Setup {
    agent: Arc<AgentState>,
    client: SignerClient,
    relay: Arc<RecordingRelay>,
    signer: PublicKey,
}

async fn setup() -> Setup {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("keep_nip46=debug")
        .with_test_writer()
        .try_init();

    let config = AgentConfig::default().with_request_timeout(Duration::from_secs(2));
    let (ui_link, backend_link) = Link::pair();
    let relay = Arc::new(RecordingRelay::default());
    let signer = Arc::new(TestSigner {
        keys: Keys::generate(),
    });
    let signer_pk = signer.group_pubkey();

    let agent = AgentState::start(
        backend_link,
        Arc::new(MemoryStore::new()),
        signer,
        relay.clone(),
        config.clone(),
    )
    .await
    .unwrap();
    let client = SignerClient::new(MessageBus::spawn(ui_link, config.bus.clone()));

    Setup {
        agent,
        client,
        relay,
        signer: signer_pk,
    }
}

fn sign_request(id: &str, app: PublicKey, kind: u16) -> CapabilityRequest {
    CapabilityRequest::new(
        id,
        METHOD_SIGN_EVENT,
        vec![format!(
            r#"{{"kind":{kind},"content":"hello","tags":[],"created_at":1700000000}}"#
        )],
        app,
    )
}

#[tokio::test]
async fn test_settings_roundtrip_over_bus() {
    let s = setup().await;

    let settings = s.client.fetch_settings().await.unwrap();
    assert!(settings.relays.is_empty());
    assert!(!settings.is_configured());

    let mut node = s.agent.subscribe_node();
    let mut partial = serde_json::Map::new();
    partial.insert("relays".into(), json!(["wss://Relay.Damus.io/"]));
    partial.insert("share".into(), json!("bfshare1secret"));
    let updated = s.client.update_settings(partial).await.unwrap();
    assert_eq!(updated.relays, vec!["wss://relay.damus.io"]);
    assert_eq!(updated.share.as_deref(), Some("<redacted>"));
    assert_eq!(
        node.recv().await.unwrap(),
        NodeEvent::Reset(NodeReset::Rebuild)
    );

    let mut bad = serde_json::Map::new();
    bad.insert("relays".into(), json!(["http://nope"]));
    assert!(s.client.update_settings(bad).await.is_err());

    let reset = s.client.reset_settings().await.unwrap();
    assert!(reset.relays.is_empty());
    assert!(reset.share.is_none());
}

#[tokio::test]
async fn test_invite_connect_sign_revoke() {
    let s = setup().await;
    let app = Keys::generate().public_key();
    let invite = InviteToken::new(app, vec!["wss://relay.damus.io".into()])
        .with_secret("s3cret")
        .with_policy(PermissionPolicy::default().allow_kind(1));

    let session = s.client.register_session(&invite.to_uri()).await.unwrap();
    assert_eq!(session.status, SessionStatus::Pending);
    assert_eq!(s.client.list_sessions().await.unwrap().pending.len(), 1);

    let wrong = CapabilityRequest::new(
        "c0",
        METHOD_CONNECT,
        vec![s.signer.to_hex(), "guess".into()],
        app,
    );
    assert!(matches!(
        s.agent.handle_capability_request(wrong).await,
        Verdict::Deny(_)
    ));

    let connect = CapabilityRequest::new(
        "c1",
        METHOD_CONNECT,
        vec![s.signer.to_hex(), "s3cret".into()],
        app,
    );
    assert_eq!(s.agent.handle_capability_request(connect).await, Verdict::Allow);
    assert_eq!(
        s.relay.reply_for("c1"),
        Some(RelayReply::Result("ack".into()))
    );
    let list = s.client.list_sessions().await.unwrap();
    assert_eq!(list.active.len(), 1);
    assert!(list.pending.is_empty());

    let verdict = s
        .agent
        .handle_capability_request(sign_request("s1", app, 1))
        .await;
    assert_eq!(verdict, Verdict::Allow);
    let Some(RelayReply::Result(json)) = s.relay.reply_for("s1") else {
        panic!("expected signed event");
    };
    let event = Event::from_json(&json).unwrap();
    assert!(event.verify().is_ok());
    assert_eq!(event.pubkey, s.signer);

    let log = s.client.fetch_log(10, Some(&app)).await.unwrap();
    assert!(log.iter().any(|e| e.success && e.event_kind == Some(1)));

    let revoked = s.client.revoke_session(&app).await.unwrap();
    assert_eq!(revoked.status, SessionStatus::Revoked);

    let verdict = s
        .agent
        .handle_capability_request(sign_request("s2", app, 1))
        .await;
    assert!(matches!(verdict, Verdict::Deny(_)));
    assert!(matches!(s.relay.reply_for("s2"), Some(RelayReply::Error(_))));
}

#[tokio::test]
async fn test_prompt_resolved_from_ui() {
    let s = setup().await;
    let app = Keys::generate().public_key();
    let invite = InviteToken::new(app, vec!["wss://nos.lol".into()]);
    s.client.register_session(&invite.to_uri()).await.unwrap();
    let connect = CapabilityRequest::new("c1", METHOD_CONNECT, vec![], app);
    assert_eq!(s.agent.handle_capability_request(connect).await, Verdict::Allow);

    let mut prompts_feed = s.client.events("prompt");
    assert_eq!(
        s.agent
            .handle_capability_request(sign_request("s1", app, 7))
            .await,
        Verdict::Prompt
    );
    assert!(s.relay.reply_for("s1").is_none());

    let envelope = tokio::time::timeout(Duration::from_secs(1), prompts_feed.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(envelope, Envelope::Event(_)));

    let prompts = s.client.list_prompts().await.unwrap();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].event_kind, Some(7));

    s.client
        .resolve_prompt(
            &prompts[0].id,
            true,
            Some(PermissionPolicy::default().allow_kind(7)),
        )
        .await
        .unwrap();
    assert!(matches!(
        s.relay.reply_for("s1"),
        Some(RelayReply::Result(_))
    ));
    assert!(s.client.list_prompts().await.unwrap().is_empty());

    // the remembered decision applies to the next request
    assert_eq!(
        s.agent
            .handle_capability_request(sign_request("s2", app, 7))
            .await,
        Verdict::Allow
    );
    assert!(s.client.resolve_prompt(&prompts[0].id, true, None).await.is_err());
}

#[tokio::test]
async fn test_unknown_topic_and_peers() {
    let s = setup().await;
    let err = s
        .client
        .bus()
        .send_request("settings", "settings.explode", None)
        .await;
    assert!(err.is_err());

    let peers = s.client.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].status, "online");
}

#[tokio::test]
async fn test_shutdown_emits_closed_and_denies() {
    let s = setup().await;
    let mut node_feed = s.client.node_events();
    let mut node = s.agent.subscribe_node();

    s.agent.shutdown().await;
    assert_eq!(node.recv().await.unwrap(), NodeEvent::Closed);
    let envelope = tokio::time::timeout(Duration::from_secs(1), node_feed.recv())
        .await
        .unwrap()
        .unwrap();
    let Envelope::Event(event) = envelope else {
        panic!("expected node event");
    };
    assert_eq!(event.payload, json!({"type": "closed"}));

    assert!(s.agent.is_closed());
    let app = Keys::generate().public_key();
    assert!(matches!(
        s.agent
            .handle_capability_request(sign_request("s1", app, 1))
            .await,
        Verdict::Deny(_)
    ));
    assert_eq!(
        s.relay.reply_for("s1"),
        Some(RelayReply::Error("Signer unavailable".into()))
    );
    assert_eq!(s.relay.replies.lock().len(), 1);
}

#[tokio::test]
async fn test_fetched_settings_written_back_keep_share() {
    let s = setup().await;
    let mut partial = serde_json::Map::new();
    partial.insert("share".into(), json!("bfshare1secret"));
    partial.insert("group".into(), json!("bfgroup1abc"));
    s.client.update_settings(partial).await.unwrap();

    let mut node = s.agent.subscribe_node();
    let fetched = s.client.fetch_settings().await.unwrap();
    assert_eq!(fetched.share.as_deref(), Some("<redacted>"));

    let serde_json::Value::Object(mut edited) = serde_json::to_value(&fetched).unwrap() else {
        panic!("settings encode as an object");
    };
    edited.insert("relays".into(), json!(["wss://nos.lol"]));
    let updated = s.client.update_settings(edited).await.unwrap();
    assert_eq!(updated.relays, vec!["wss://nos.lol"]);

    let stored = s.agent.settings().unwrap();
    assert_eq!(stored.share.as_deref(), Some("bfshare1secret"));
    assert_eq!(
        node.recv().await.unwrap(),
        NodeEvent::Reset(NodeReset::Reconnect)
    );

    let unchanged = serde_json::to_value(&s.client.fetch_settings().await.unwrap()).unwrap();
    let serde_json::Value::Object(unchanged) = unchanged else {
        panic!("settings encode as an object");
    };
    s.client.update_settings(unchanged).await.unwrap();
    assert_eq!(
        s.agent.settings().unwrap().share.as_deref(),
        Some("bfshare1secret")
    );
    assert!(node.try_recv().is_err());
}

#[tokio::test]
async fn test_revoke_settles_queued_prompts() {
    let s = setup().await;
    let app = Keys::generate().public_key();
    let invite = InviteToken::new(app, vec!["wss://nos.lol".into()]);
    s.client.register_session(&invite.to_uri()).await.unwrap();

    assert_eq!(
        s.agent
            .handle_capability_request(sign_request("s1", app, 7))
            .await,
        Verdict::Prompt
    );
    assert_eq!(s.client.list_prompts().await.unwrap().len(), 1);

    s.client.revoke_session(&app).await.unwrap();

    assert!(s.client.list_prompts().await.unwrap().is_empty());
    let replies: Vec<RelayReply> = s
        .relay
        .replies
        .lock()
        .iter()
        .filter(|(id, _)| id == "s1")
        .map(|(_, r)| r.clone())
        .collect();
    assert_eq!(replies, vec![RelayReply::Error("Permission denied".into())]);
}

#[tokio::test]
async fn test_policy_check_over_bus() {
    let s = setup().await;
    let mut allow = PolicyAddParams {
        host: "example.com".into(),
        policy_type: "sign_event".into(),
        accept: Accept::Allow,
        conditions: None,
    };
    s.client.add_policy(allow.clone()).await.unwrap();
    assert_eq!(
        s.client
            .check_policy("example.com", "sign_event", Some(1))
            .await
            .unwrap(),
        Some(true)
    );
    assert_eq!(
        s.client
            .check_policy("other.example", "sign_event", Some(1))
            .await
            .unwrap(),
        None
    );

    allow.accept = Accept::Deny;
    s.client.add_policy(allow).await.unwrap();
    assert_eq!(
        s.client
            .check_policy("example.com", "sign_event", None)
            .await
            .unwrap(),
        Some(false)
    );
}
