//! Subscriber registry for channel fan-out
//!
//! The registry holds the fixed channel table (one channel per camera plus
//! `birdseye`) and, per channel, the set of connected viewers. Each viewer
//! owns the receiving end of a bounded queue; the channel's relay pushes
//! encoded chunks into every queue.
//!
//! # Architecture
//!
//! ```text
//!                       Arc<SubscriberRegistry>
//!                   ┌──────────────────────────────┐
//!                   │ channels: HashMap<Name,      │
//!                   │   ChannelEntry {             │
//!                   │     subscribers: id -> tx,   │
//!                   │     subscriber_count,        │
//!                   │   }                          │
//!                   │ >                            │
//!                   └──────────────┬───────────────┘
//!                                  │
//!        ┌─────────────────────────┼──────────────────────────┐
//!        │                         │                          │
//!        ▼                         ▼                          ▼
//!   [Coordinator]             [Relay task]              [Connection]
//!   has_subscribers()         broadcast(chunk)          subscribe() -> rx
//!   (atomic, no lock)               └──► tx.try_send ──► rx.recv() ──► WebSocket
//! ```
//!
//! A viewer whose queue is full or closed is removed on the spot; the other
//! viewers of the channel are unaffected.

pub mod entry;
pub mod store;

pub use entry::{BroadcastOutcome, ChannelEntry, Subscription, SubscriberId};
pub use store::SubscriberRegistry;
