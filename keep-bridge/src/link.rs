// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use keep_core::{KeepError, Result};
use tokio::sync::{mpsc, watch};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Ready,
    /// Terminal. A closed link never becomes ready again.
    Closed,
}

/// Outbound half of a [`Link`].
#[derive(Clone, Debug)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<String>,
    state: watch::Receiver<LinkState>,
}

impl LinkSender {
    pub fn state(&self) -> LinkState {
        if self.tx.is_closed() {
            return LinkState::Closed;
        }
        *self.state.borrow()
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Resolves once the link is ready; fails if it closes first.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state = self.state.clone();
        loop {
            if self.tx.is_closed() {
                return Err(KeepError::TransportUnavailable);
            }
            match *state.borrow_and_update() {
                LinkState::Ready => return Ok(()),
                LinkState::Closed => return Err(KeepError::TransportUnavailable),
                LinkState::Connecting => {}
            }
            state
                .changed()
                .await
                .map_err(|_| KeepError::TransportUnavailable)?;
        }
    }

    pub fn send(&self, message: String) -> Result<()> {
        if *self.state.borrow() == LinkState::Closed {
            return Err(KeepError::TransportUnavailable);
        }
        self.tx
            .send(message)
            .map_err(|_| KeepError::TransportUnavailable)
    }
}

/// A bidirectional string channel to the other process, plus its connection
/// state.
#[derive(Debug)]
pub struct Link {
    sender: LinkSender,
    receiver: mpsc::UnboundedReceiver<String>,
}

impl Link {
    pub fn new(
        tx: mpsc::UnboundedSender<String>,
        rx: mpsc::UnboundedReceiver<String>,
        state: watch::Receiver<LinkState>,
    ) -> Self {
        Self {
            sender: LinkSender { tx, state },
            receiver: rx,
        }
    }

    /// Two connected in-process endpoints, already ready.
    pub fn pair() -> (Link, Link) {
        let (a, b, _control) = Self::pair_with_control(LinkState::Ready);
        (a, b)
    }

    /// Two connected endpoints sharing a state the caller drives.
    pub fn pair_with_control(initial: LinkState) -> (Link, Link, LinkControl) {
        let (state_tx, state_rx) = watch::channel(initial);
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Link::new(a_tx, a_rx, state_rx.clone()),
            Link::new(b_tx, b_rx, state_rx),
            LinkControl { state: state_tx },
        )
    }

    pub fn sender(&self) -> &LinkSender {
        &self.sender
    }

    pub fn send(&self, message: String) -> Result<()> {
        self.sender.send(message)
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    pub fn into_parts(self) -> (LinkSender, mpsc::UnboundedReceiver<String>) {
        (self.sender, self.receiver)
    }
}

/// Drives the connection state of links built with
/// [`Link::pair_with_control`].
#[derive(Debug)]
pub struct LinkControl {
    state: watch::Sender<LinkState>,
}

impl LinkControl {
    pub fn set_ready(&self) {
        self.state.send_if_modified(|s| {
            if *s == LinkState::Connecting {
                *s = LinkState::Ready;
                true
            } else {
                false
            }
        });
    }

    pub fn close(&self) {
        self.state.send_replace(LinkState::Closed);
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }
}
