// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Keep NIP-46 - the signing-authorization backend of the Keep signer agent
//!
//! This crate provides:
//! - Sessions for remote counterparts (pending, active, revoked) created from
//!   `nostrconnect://` invites
//! - A per-session permission policy and a host/type rule table
//! - The request arbiter that answers every capability request exactly once
//! - `AgentState`, the backend's topic router, and `SignerClient` for the UI
//! - A nostr-sdk relay transport

#![forbid(unsafe_code)]

pub mod agent;
pub mod audit;
pub mod capability;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod host_policy;
pub mod invite;
pub mod policy;
pub mod server;
pub mod session;
pub mod settings;
pub mod types;

pub use agent::{AgentState, BackendTopic, NodeEvent};
pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use capability::{PeerInfo, RelayLink, SignatureResult, SigningCapability};
pub use client::SignerClient;
pub use config::AgentConfig;
pub use error::Result;
pub use event::{EventTemplate, SignedEvent};
pub use handler::{ArbiterEvent, PromptView, RequestArbiter, Resolution};
pub use host_policy::{Accept, HostPolicyRow, HostPolicyTable};
pub use invite::InviteToken;
pub use policy::{PermissionPolicy, PolicyDelta, Verdict};
pub use server::NostrRelayLink;
pub use session::{Session, SessionEvent, SessionList, SessionManager, SessionPatch, SessionStatus};
pub use settings::{AgentSettings, NodeReset};
pub use types::{CapabilityRequest, RelayReply};
