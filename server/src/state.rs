//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::delivery::DeliveryQueue;
use crate::events::EventRouter;
use crate::registry::SessionRegistry;
use crate::session::SessionSettings;
use crate::store::Stores;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Live device sessions.
    pub registry: SessionRegistry,
    /// External collaborators: accounts, devices, rules, message log.
    pub stores: Stores,
    /// Inbound event handling (logging, matching, fan-out).
    pub events: EventRouter,
    /// Durable webhook delivery.
    pub queue: DeliveryQueue,
    /// Timing and limits applied to every device session.
    pub session: SessionSettings,
}

impl AppState {
    /// Wire the registry, event router and delivery queue together.
    pub fn new(config: Config, stores: Stores, queue: DeliveryQueue) -> Self {
        let session = config.session_settings();
        let registry = SessionRegistry::new(config.session.send_buffer);
        let events = EventRouter::new(stores.clone(), queue.clone());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            stores,
            events,
            queue,
            session,
        }
    }
}
