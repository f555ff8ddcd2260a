// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Courier Relay Server
//!
//! A device-to-device message relay:
//! - Sequenced per-device mailboxes over an embedded ordered KV store
//! - Live fan-out to server-sent event streams
//! - One-time key storage with low-water replenishment signals

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use courier_relay::config::RelayConfig;
use courier_relay::http::{create_router, AppState};
use courier_relay::mailbox::Mailbox;
use courier_relay::metrics::RelayMetrics;
use courier_relay::prekeys::PrekeyStore;
use courier_relay::registry::{dispatcher, SubscriberRegistry};
use courier_relay::store::{create_store, OrderedStore};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("courier_relay=info".parse().unwrap()),
        )
        .init();

    // Load configuration
    let config = RelayConfig::from_env();

    info!("Starting Courier Relay Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Listen: {}", config.listen_addr);
    info!("Storage backend: {:?}", config.storage_backend);

    // Open the store; everything durable lives in this one keyspace.
    let store: Arc<dyn OrderedStore> =
        match create_store(config.storage_backend, Some(&config.data_dir)) {
            Ok(store) => Arc::from(store),
            Err(e) => {
                error!("Failed to open store in {:?}: {}", config.data_dir, e);
                std::process::exit(1);
            }
        };

    // The mailbox recovers its sequence counter from the store on open.
    let mailbox = match Mailbox::open(store.clone()) {
        Ok(mailbox) => Arc::new(mailbox),
        Err(e) => {
            error!("Failed to recover mailbox state: {}", e);
            std::process::exit(1);
        }
    };

    let prekeys = Arc::new(PrekeyStore::new(store));
    let registry = Arc::new(SubscriberRegistry::new());
    let metrics = RelayMetrics::new();

    // One dispatcher task mediates subscriptions and out-of-band events.
    let (dispatcher, handle) = dispatcher(registry.clone(), prekeys.clone(), metrics.clone());
    tokio::spawn(dispatcher.run());

    let router = create_router(AppState {
        mailbox,
        prekeys,
        registry,
        dispatcher: handle,
        metrics,
    });

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", config.listen_addr, e);
            std::process::exit(1);
        }
    };

    info!("HTTP server listening on {}", config.listen_addr);

    if let Err(e) = axum::serve(listener, router).await {
        error!("HTTP server error: {}", e);
        std::process::exit(1);
    }
}
