// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Keep Bridge - the channel between the Keep UI and the signer backend
//!
//! This crate provides:
//! - The `request` / `response` / `event` envelope wire format
//! - A message bus with a correlation table, deadlines and topic subscriptions
//! - A versioned durable store trait and a typed, change-broadcasting store
//!   controller with default reconciliation and update middleware

#![forbid(unsafe_code)]

pub mod bus;
pub mod envelope;
pub mod link;
pub mod store;

pub use bus::{BusConfig, MessageBus, RequestHandler, Subscription};
pub use envelope::{Envelope, EnvelopeKind, EventPayload, Filter, RequestPayload, ResponsePayload};
pub use link::{Link, LinkControl, LinkSender, LinkState};
pub use store::{DurableStore, MemoryStore, Middleware, StoreController, StoreMap, StoreRecord};
