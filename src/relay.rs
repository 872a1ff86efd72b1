//! Broadcast relay
//!
//! One task per channel drains the channel's encoder output and fans each
//! chunk out to the channel's viewers, in the order the encoder produced it.
//! The task ends once the encoder has exited and its output is exhausted.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::encoder::EncoderOutput;
use crate::registry::SubscriberRegistry;
use crate::stats::RelayStats;

/// Default read size per encoder read
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Pause after an empty read while the encoder is still running
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Forwards one channel's encoded output to its viewers
pub struct BroadcastRelay<O> {
    channel: String,
    output: O,
    registry: Arc<SubscriberRegistry>,
    chunk_size: usize,
}

impl<O: EncoderOutput> BroadcastRelay<O> {
    pub fn new(channel: impl Into<String>, output: O, registry: Arc<SubscriberRegistry>) -> Self {
        Self {
            channel: channel.into(),
            output,
            registry,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set the maximum bytes taken from the encoder per read
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Run the relay on its own task
    pub fn spawn(self) -> JoinHandle<RelayStats> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> RelayStats {
        let mut stats = RelayStats::new(self.channel.clone());
        tracing::debug!(channel = %self.channel, "Relay started");

        loop {
            match self.output.read(self.chunk_size).await {
                Ok(chunk) if !chunk.is_empty() => {
                    stats.chunks += 1;
                    stats.bytes += chunk.len() as u64;

                    let outcome = self.registry.broadcast(&self.channel, chunk).await;
                    stats.deliveries += outcome.delivered as u64;
                    stats.dropped_subscribers += outcome.dropped as u64;
                }
                Ok(_) => {
                    // Empty means no data yet unless the encoder is gone
                    if self.output.has_exited() {
                        break;
                    }
                    tokio::time::sleep(IDLE_POLL).await;
                }
                Err(e) => {
                    tracing::warn!(channel = %self.channel, error = %e, "Relay stopped on read error");
                    break;
                }
            }
        }

        tracing::info!(
            channel = %self.channel,
            chunks = stats.chunks,
            bytes = stats.bytes,
            dropped_subscribers = stats.dropped_subscribers,
            "Relay finished"
        );
        stats
    }
}
