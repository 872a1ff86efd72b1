//! Subscriber registry implementation
//!
//! The central registry that tracks which viewers watch which channel and
//! routes encoded chunks to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::entry::{BroadcastOutcome, ChannelEntry, Subscription, SubscriberId};
use crate::error::{Error, Result};

/// Central registry of channels and their viewers
///
/// The channel table is fixed at construction, so lookups need no lock.
/// Each channel guards its own viewer map; "has any viewer" reads an atomic.
pub struct SubscriberRegistry {
    channels: HashMap<String, ChannelEntry>,

    /// Queue length per viewer
    buffer: usize,

    next_subscriber_id: AtomicU64,
}

impl SubscriberRegistry {
    /// Create a registry for the given channels, with `buffer` chunks of
    /// queue per viewer
    pub fn new<I, S>(channels: I, buffer: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels
                .into_iter()
                .map(|name| (name.into(), ChannelEntry::new()))
                .collect(),
            buffer: buffer.max(1),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Whether `channel` is in the channel table
    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Names of all channels, in no particular order
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Whether anyone is watching `channel`. Unknown channels have no viewers.
    pub fn has_subscribers(&self, channel: &str) -> bool {
        self.subscriber_count(channel) > 0
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, ChannelEntry::subscriber_count)
    }

    /// Total viewers across all channels
    pub fn total_subscribers(&self) -> usize {
        self.channels.values().map(ChannelEntry::subscriber_count).sum()
    }

    /// Add a viewer to `channel`
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let entry = self
            .channels
            .get(channel)
            .ok_or_else(|| Error::UnknownChannel(channel.to_string()))?;

        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let count = entry.insert(id, tx).await;

        tracing::info!(
            channel = %channel,
            subscriber = id,
            subscribers = count,
            "Subscriber added"
        );

        Ok(Subscription {
            id,
            channel: channel.to_string(),
            rx,
        })
    }

    /// Remove a viewer. Removing one that is already gone is a no-op.
    pub async fn unsubscribe(&self, channel: &str, id: SubscriberId) {
        if let Some(entry) = self.channels.get(channel) {
            if entry.remove(id).await {
                tracing::debug!(
                    channel = %channel,
                    subscriber = id,
                    subscribers = entry.subscriber_count(),
                    "Subscriber removed"
                );
            }
        }
    }

    /// Queue a chunk for every viewer of `channel`
    pub async fn broadcast(&self, channel: &str, chunk: Bytes) -> BroadcastOutcome {
        match self.channels.get(channel) {
            Some(entry) => entry.send(channel, chunk).await,
            None => BroadcastOutcome::default(),
        }
    }
}
