//! Channel entry and subscription types
//!
//! This module defines the per-channel state stored in the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

/// Identifier of one viewer connection
pub type SubscriberId = u64;

/// A viewer's handle on a channel
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub channel: String,
    /// Encoded chunks, in encoder order. Closed when the registry drops the viewer.
    pub rx: mpsc::Receiver<Bytes>,
}

/// Result of fanning one chunk out to a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Viewers the chunk was queued for
    pub delivered: usize,
    /// Viewers removed because their queue was full or closed
    pub dropped: usize,
}

/// Entry for a single channel in the registry
#[derive(Debug, Default)]
pub struct ChannelEntry {
    /// Queue senders of the current viewers
    subscribers: RwLock<HashMap<SubscriberId, mpsc::Sender<Bytes>>>,

    /// Mirror of `subscribers.len()`, readable without the lock
    subscriber_count: AtomicUsize,
}

impl ChannelEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Acquire)
    }

    pub(super) async fn insert(&self, id: SubscriberId, tx: mpsc::Sender<Bytes>) -> usize {
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(id, tx);
        self.subscriber_count
            .store(subscribers.len(), Ordering::Release);
        subscribers.len()
    }

    pub(super) async fn remove(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let removed = subscribers.remove(&id).is_some();
        self.subscriber_count
            .store(subscribers.len(), Ordering::Release);
        removed
    }

    /// Queue `chunk` for every current viewer, dropping the ones that fail.
    pub(super) async fn send(&self, channel: &str, chunk: Bytes) -> BroadcastOutcome {
        let mut failed = Vec::new();
        let mut outcome = BroadcastOutcome::default();

        {
            let subscribers = self.subscribers.read().await;
            for (&id, tx) in subscribers.iter() {
                match tx.try_send(chunk.clone()) {
                    Ok(()) => outcome.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            channel = %channel,
                            subscriber = id,
                            "Viewer too slow, dropping"
                        );
                        failed.push(id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!(channel = %channel, subscriber = id, "Viewer gone");
                        failed.push(id);
                    }
                }
            }
        }

        for id in failed {
            if self.remove(id).await {
                outcome.dropped += 1;
            }
        }
        outcome
    }
}
