// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subscription Registry and Fan-out Dispatcher
//!
//! Tracks one live notification channel per connected device so freshly
//! persisted messages and prekey replenishment signals reach any recipient
//! with an open event stream.
//!
//! The registry maps device ids to bounded channels. Delivery is always
//! non-blocking: a full channel drops the notification, because the durable
//! mailbox is the source of truth and a slow client recovers by re-fetching.
//!
//! The dispatcher is a single task multiplexing three channels: new
//! subscriptions, closing subscriptions, and prekey replenishment signals
//! from the lookup path. The message write path does not go through the
//! dispatcher; it pushes to recipient channels directly via the registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::metrics::RelayMetrics;
use crate::prekeys::{PrekeyStore, RESTOCK};
use crate::protocol::{NeedsOneTimeKey, OutgoingMessage};

/// Capacity of each subscriber's notification channel.
pub const CHANNEL_CAPACITY: usize = 10;

/// A notification queued for one device's event stream.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A message addressed to the device.
    Message(OutgoingMessage),
    /// The device's one-time key pool ran low.
    PrekeyLow(NeedsOneTimeKey),
}

/// A device joining the event stream, carrying its notification channel.
#[derive(Debug)]
pub struct Subscription {
    pub device_id: String,
    pub sender: mpsc::Sender<Notification>,
}

/// Thread-safe registry of subscribed devices.
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<String, mpsc::Sender<Notification>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        SubscriberRegistry {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a device's channel. A second subscription for the same
    /// device supersedes the first; the displaced channel's reader shuts
    /// down when its own request context cancels.
    pub fn insert(&self, device_id: &str, sender: mpsc::Sender<Notification>) {
        let mut subscribers = self.subscribers.write().unwrap();
        subscribers.insert(device_id.to_string(), sender);
    }

    /// Removes a device's channel. Idempotent.
    pub fn remove(&self, device_id: &str) {
        let mut subscribers = self.subscribers.write().unwrap();
        subscribers.remove(device_id);
    }

    /// Posts a notification to a subscribed device. Returns false if the
    /// device is offline or its channel is full.
    pub fn try_notify(&self, device_id: &str, notification: Notification) -> bool {
        // Copy the sender out first; the map lock is never held across a send.
        let sender = {
            let subscribers = self.subscribers.read().unwrap();
            subscribers.get(device_id).cloned()
        };
        match sender {
            Some(tx) => tx.try_send(notification).is_ok(),
            None => false,
        }
    }

    /// Returns the number of currently subscribed devices.
    pub fn subscriber_count(&self) -> usize {
        let subscribers = self.subscribers.read().unwrap();
        subscribers.len()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles for posting into the dispatcher from HTTP handlers.
#[derive(Clone)]
pub struct DispatcherHandle {
    new_clients: mpsc::Sender<Subscription>,
    closing_clients: mpsc::Sender<String>,
    notifier: mpsc::Sender<NeedsOneTimeKey>,
}

impl DispatcherHandle {
    /// Hands a joining device to the dispatcher, waiting until the
    /// registration is taken up.
    pub async fn subscribe(&self, subscription: Subscription) {
        let _ = self.new_clients.send(subscription).await;
    }

    /// Sender used by event streams to report their own shutdown.
    pub fn closing_sender(&self) -> mpsc::Sender<String> {
        self.closing_clients.clone()
    }

    /// Routes a replenishment signal through the dispatcher to its target.
    pub async fn notify_prekey_low(&self, needs: NeedsOneTimeKey) {
        let _ = self.notifier.send(needs).await;
    }
}

/// The single fan-out actor.
pub struct Dispatcher {
    registry: Arc<SubscriberRegistry>,
    prekeys: Arc<PrekeyStore>,
    metrics: RelayMetrics,
    new_clients: mpsc::Receiver<Subscription>,
    closing_clients: mpsc::Receiver<String>,
    notifier: mpsc::Receiver<NeedsOneTimeKey>,
}

/// Creates the dispatcher and its handle. The rendezvous channels have
/// capacity 1: a sender observes its hand-off before proceeding.
pub fn dispatcher(
    registry: Arc<SubscriberRegistry>,
    prekeys: Arc<PrekeyStore>,
    metrics: RelayMetrics,
) -> (Dispatcher, DispatcherHandle) {
    let (new_tx, new_rx) = mpsc::channel(1);
    let (closing_tx, closing_rx) = mpsc::channel(1);
    let (notifier_tx, notifier_rx) = mpsc::channel(1);

    (
        Dispatcher {
            registry,
            prekeys,
            metrics,
            new_clients: new_rx,
            closing_clients: closing_rx,
            notifier: notifier_rx,
        },
        DispatcherHandle {
            new_clients: new_tx,
            closing_clients: closing_tx,
            notifier: notifier_tx,
        },
    )
}

impl Dispatcher {
    /// Runs until every handle is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(subscription) = self.new_clients.recv() => self.on_join(subscription),
                Some(device_id) = self.closing_clients.recv() => self.on_leave(&device_id),
                Some(needs) = self.notifier.recv() => self.on_prekey_low(needs),
                else => break,
            }
        }
    }

    fn on_join(&self, subscription: Subscription) {
        self.registry
            .insert(&subscription.device_id, subscription.sender.clone());

        // A joiner with a depleted key pool hears about it before anything
        // else arrives on its stream.
        match self.prekeys.is_low(&subscription.device_id) {
            Ok(true) => {
                let _ = subscription.sender.try_send(Notification::PrekeyLow(NeedsOneTimeKey {
                    device_id: subscription.device_id.clone(),
                    needs: RESTOCK,
                }));
            }
            Ok(false) => {}
            Err(e) => warn!(device_id = %subscription.device_id, "prekey probe failed: {e}"),
        }

        self.metrics.streams_total.inc();
        let count = self.registry.subscriber_count();
        self.metrics.streams_active.set(count as i64);
        info!("client added, {count} subscribed");
    }

    fn on_leave(&self, device_id: &str) {
        self.registry.remove(device_id);
        let count = self.registry.subscriber_count();
        self.metrics.streams_active.set(count as i64);
        info!("client removed, {count} subscribed");
    }

    fn on_prekey_low(&self, needs: NeedsOneTimeKey) {
        let device_id = needs.device_id.clone();
        self.registry
            .try_notify(&device_id, Notification::PrekeyLow(needs));
    }
}
