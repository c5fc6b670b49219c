//! Pub/sub listener applying invalidations to local tiers.
//!
//! One background task per registry owns a dedicated subscriber connection.
//! Channels are added while it runs; after a connection failure it reconnects
//! with exponential backoff and resubscribes every channel.
//!
//! ## Example Flow
//!
//! ```text
//! Instance 1: cache.put("42", v)
//!   ↓ remote write, then PUBLISH users {"cacheName":"users","key":"42","kind":"Evict"}
//! Instance 2: listener receives message → evict_local("42") on every "users" variant
//! Instance 3: listener receives message → evict_local("42") on every "users" variant
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tiercache_store::{ChannelMessage, DynStore, StoreError, Subscriber};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::layered::LayeredCache;
use crate::message::{InvalidationKind, InvalidationMessage};
use crate::metrics;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300); // 5 minutes max

/// Registered caches: name → settings fingerprint → cache.
pub(crate) type CacheTable = DashMap<String, DashMap<String, Arc<LayeredCache>>>;

/// Apply `message` to the local tier of every cache registered under its name.
///
/// Returns the number of caches touched. The remote tier is never modified.
pub(crate) async fn apply_invalidation(table: &CacheTable, message: &InvalidationMessage) -> usize {
    let caches: Vec<Arc<LayeredCache>> = table
        .get(&message.cache_name)
        .map(|variants| variants.iter().map(|entry| entry.value().clone()).collect())
        .unwrap_or_default();

    match (message.kind, &message.key) {
        (InvalidationKind::Evict, Some(key)) => {
            for cache in &caches {
                cache.evict_local(key).await;
            }
        }
        (InvalidationKind::Evict, None) => {
            tracing::warn!(cache = %message.cache_name, "evict invalidation without key, ignoring");
            return 0;
        }
        (InvalidationKind::Clear, _) => {
            for cache in &caches {
                cache.clear_local();
            }
        }
    }

    tracing::debug!(
        cache = %message.cache_name,
        key = ?message.key,
        kind = message.kind.as_str(),
        caches = caches.len(),
        "applied cache invalidation"
    );
    metrics::record_invalidation(&message.cache_name, message.kind.as_str());
    caches.len()
}

/// Control side of the listener task, owned by the registry.
pub(crate) struct ListenerHandle {
    commands: mpsc::UnboundedSender<String>,
    active: Arc<DashSet<String>>,
    changed: Arc<Notify>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerHandle {
    /// Spawn the listener task. Must be called within a Tokio runtime.
    pub(crate) fn spawn(store: DynStore, table: Arc<CacheTable>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let active = Arc::new(DashSet::new());
        let changed = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let listener = InvalidationListener {
            store,
            table,
            commands: receiver,
            channels: BTreeSet::new(),
            active: active.clone(),
            changed: changed.clone(),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(listener.run());

        Self {
            commands,
            active,
            changed,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Ask the listener to subscribe to `channel`.
    pub(crate) fn subscribe(&self, channel: &str) {
        if self.commands.send(channel.to_string()).is_err() {
            tracing::warn!(channel = %channel, "invalidation listener stopped, cannot subscribe");
        }
    }

    /// Whether `channel` is subscribed on the current connection.
    pub(crate) fn is_listening(&self, channel: &str) -> bool {
        self.active.contains(channel)
    }

    /// Wait until `channel` is subscribed, up to `timeout`.
    pub(crate) async fn wait_listening(&self, channel: &str, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let changed = self.changed.notified();
                if self.active.contains(channel) {
                    return;
                }
                changed.await;
            }
        })
        .await
        .is_ok()
    }

    /// Stop the listener and wait for its task to end.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "invalidation listener task failed");
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct InvalidationListener {
    store: DynStore,
    table: Arc<CacheTable>,
    commands: mpsc::UnboundedReceiver<String>,
    /// Every channel requested so far, resubscribed after a reconnect.
    channels: BTreeSet<String>,
    /// Channels subscribed on the live connection.
    active: Arc<DashSet<String>>,
    changed: Arc<Notify>,
    shutdown: CancellationToken,
}

impl InvalidationListener {
    async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.session(&mut backoff).await {
                Ok(()) => {
                    tracing::debug!("invalidation listener stopped");
                    return;
                }
                Err(e) => {
                    self.active.clear();
                    tracing::error!(
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Cache invalidation listener error, reconnecting..."
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    // Exponential backoff with max limit
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// One connection's lifetime. `Ok(())` means the listener should stop.
    async fn session(&mut self, backoff: &mut Duration) -> Result<(), StoreError> {
        let mut subscriber = self.store.subscriber().await?;
        for channel in &self.channels {
            subscriber.subscribe(channel).await?;
            self.active.insert(channel.clone());
        }
        if !self.channels.is_empty() {
            tracing::info!(channels = self.channels.len(), "Resubscribed to invalidation channels");
            self.changed.notify_waiters();
        }
        *backoff = INITIAL_BACKOFF;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                command = self.commands.recv() => match command {
                    Some(channel) => self.add_channel(subscriber.as_mut(), channel).await?,
                    // Registry dropped.
                    None => return Ok(()),
                },
                message = subscriber.next_message() => match message? {
                    Some(message) => self.dispatch(message).await,
                    None => return Err(StoreError::Closed),
                },
            }
        }
    }

    async fn add_channel(
        &mut self,
        subscriber: &mut dyn Subscriber,
        channel: String,
    ) -> Result<(), StoreError> {
        if !self.channels.insert(channel.clone()) {
            return Ok(());
        }
        subscriber.subscribe(&channel).await?;
        tracing::info!(channel = %channel, "Subscribed to invalidation channel");
        self.active.insert(channel);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn dispatch(&self, message: ChannelMessage) {
        match InvalidationMessage::from_bytes(&message.payload) {
            Ok(invalidation) => {
                if invalidation.cache_name != message.channel {
                    tracing::debug!(
                        channel = %message.channel,
                        cache = %invalidation.cache_name,
                        "invalidation cache name differs from channel"
                    );
                }
                apply_invalidation(&self.table, &invalidation).await;
            }
            Err(e) => {
                tracing::warn!(channel = %message.channel, error = %e, "failed to parse invalidation message payload");
            }
        }
    }
}
