// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use keep_core::{KeepError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, Filter, RequestPayload, ResponsePayload};
use crate::link::{Link, LinkSender, LinkState};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    pub request_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl BusConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Answers requests arriving from the other side of the link.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, domain: &str, topic: &str, params: Option<Value>) -> Result<Value>;
}

type PendingCall = oneshot::Sender<Result<Value>>;

struct Subscriber {
    id: u64,
    filter: Filter,
    tx: mpsc::UnboundedSender<Envelope>,
}

struct BusInner {
    sender: RwLock<Option<LinkSender>>,
    config: BusConfig,
    pending: Mutex<HashMap<String, PendingCall>>,
    subscribers: RwLock<Vec<Subscriber>>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    next_subscriber: AtomicU64,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl BusInner {
    fn sender(&self) -> Result<LinkSender> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KeepError::TransportUnavailable);
        }
        self.sender
            .read()
            .clone()
            .ok_or(KeepError::TransportUnavailable)
    }

    fn transmit(&self, envelope: &Envelope) -> Result<()> {
        let json = envelope.to_json()?;
        self.sender()?.send(json)
    }

    fn dispatch(&self, envelope: &Envelope) {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.iter() {
                if sub.filter.matches(envelope) && sub.tx.send(envelope.clone()).is_err() {
                    dead.push(sub.id);
                }
            }
        }
        if !dead.is_empty() {
            self.subscribers.write().retain(|s| !dead.contains(&s.id));
        }
    }

    fn remove_subscriber(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sender.write().take();
        let pending: Vec<PendingCall> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        info!(failed_calls = pending.len(), "Message bus closed");
        for tx in pending {
            let _ = tx.send(Err(KeepError::TransportUnavailable));
        }
    }

    fn handle_incoming(self: &Arc<Self>, raw: &str) {
        let envelope = match Envelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping unparsable message");
                return;
            }
        };

        match envelope {
            Envelope::Response(response) => self.resolve(response),
            other => {
                self.dispatch(&other);
                if let Envelope::Request(request) = other {
                    self.answer(request);
                }
            }
        }
    }

    fn resolve(&self, response: ResponsePayload) {
        // Removing before resolving keeps resolution at-most-once.
        let call = self.pending.lock().remove(&response.id);
        match call {
            Some(tx) => {
                let _ = tx.send(response.into_result());
            }
            None => debug!(id = %response.id, "Dropping response for unknown request id"),
        }
    }

    fn answer(self: &Arc<Self>, request: RequestPayload) {
        let handler = self.handler.read().clone();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let RequestPayload {
                id,
                domain,
                topic,
                params,
            } = request;
            let response = match handler {
                None => {
                    debug!(%domain, %topic, "No request handler installed");
                    ResponsePayload::failure(id, "no handler for request")
                }
                Some(handler) => match handler.handle(&domain, &topic, params).await {
                    Ok(result) => ResponsePayload::success(id, result),
                    Err(e) => {
                        debug!(%domain, %topic, error = %e, "Request failed");
                        ResponsePayload::failure(id, e.to_string())
                    }
                },
            };
            if let Err(e) = inner.transmit(&Envelope::Response(response)) {
                debug!(error = %e, "Could not deliver response");
            }
        });
    }
}

/// One endpoint of the UI/backend message protocol.
///
/// Cloning is cheap; all clones share the correlation table, subscribers and
/// link. Dropping the last clone releases the link.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Takes ownership of `link` and starts its reader task.
    pub fn spawn(link: Link, config: BusConfig) -> Self {
        let (sender, receiver) = link.into_parts();
        let state = sender.state_receiver();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(BusInner {
            sender: RwLock::new(Some(sender)),
            config,
            pending: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            handler: RwLock::new(None),
            next_subscriber: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            shutdown: shutdown_tx,
        });
        tokio::spawn(run_reader(
            Arc::downgrade(&inner),
            receiver,
            state,
            shutdown_rx,
        ));
        Self { inner }
    }

    /// Sends a request and waits for the correlated response.
    ///
    /// Waits for the link to become ready; the whole round trip, including
    /// that wait, is bounded by the configured request timeout.
    pub async fn send_request(
        &self,
        domain: &str,
        topic: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        let sender = self.inner.sender()?;
        let envelope = Envelope::request(domain, topic, params);
        let id = envelope.id().to_string();
        let json = envelope.to_json()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.contains_key(&id) {
                return Err(KeepError::protocol("duplicate request id"));
            }
            pending.insert(id.clone(), tx);
        }

        let round_trip = async {
            sender.wait_ready().await?;
            sender.send(json)?;
            rx.await.map_err(|_| KeepError::TransportUnavailable)?
        };

        match tokio::time::timeout(self.inner.config.request_timeout(), round_trip).await {
            Ok(result) => {
                if result.is_err() {
                    self.inner.pending.lock().remove(&id);
                }
                result
            }
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                warn!(%domain, %topic, request_id = %id, "Request timed out");
                Err(KeepError::Timeout(format!("{domain}/{topic}")))
            }
        }
    }

    /// Delivers an event to local subscribers and to the other side.
    pub fn publish_event(&self, domain: &str, topic: &str, payload: Value) {
        let envelope = Envelope::event(domain, topic, payload);
        self.inner.dispatch(&envelope);
        if let Err(e) = self.inner.transmit(&envelope) {
            debug!(%domain, %topic, error = %e, "Event not sent to remote side");
        }
    }

    pub fn subscribe(&self, filter: Filter) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .write()
            .push(Subscriber { id, filter, tx });
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Installs the handler for inbound requests, replacing any previous one.
    pub fn serve(&self, handler: Arc<dyn RequestHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    pub fn clear_handler(&self) {
        self.inner.handler.write().take();
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    pub fn state(&self) -> LinkState {
        match self.inner.sender() {
            Ok(sender) => sender.state(),
            Err(_) => LinkState::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Releases the link and fails every outstanding call.
    pub fn close(&self) {
        self.inner.mark_closed();
        let _ = self.inner.shutdown.send(true);
    }
}

async fn run_reader(
    inner: Weak<BusInner>,
    mut receiver: mpsc::UnboundedReceiver<String>,
    mut state: watch::Receiver<LinkState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut state_live = true;
    loop {
        tokio::select! {
            message = receiver.recv() => {
                let Some(raw) = message else {
                    debug!("Link peer went away");
                    break;
                };
                let Some(inner) = inner.upgrade() else { return };
                inner.handle_incoming(&raw);
            }
            changed = state.changed(), if state_live => {
                if changed.is_err() {
                    state_live = false;
                } else if *state.borrow() == LinkState::Closed {
                    debug!("Link closed");
                    break;
                }
            }
            _ = shutdown.changed() => return,
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.mark_closed();
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Envelope>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove_subscriber(self.id);
        }
    }
}
