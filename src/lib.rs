//! Live camera output
//!
//! Serves decoded camera frames to live viewers over WebSocket: one stream
//! per camera plus a `birdseye` stream that composites the recently active
//! cameras into a single canvas.
//!
//! ```text
//!  capture ─► frame buffers (shm) ─┐
//!          ─► metadata queue ──────┴► Coordinator ─► encoder (ffmpeg) ─► Relay ─► viewers
//!                                         └────► Compositor ─► birdseye encoder ─► Relay ─► viewers
//! ```
//!
//! Encoding only happens for channels somebody is watching.
//!
//! # Example
//!
//! ```no_run
//! use liveview::config::OutputConfig;
//! use tokio::sync::{mpsc, watch};
//!
//! # async fn example() -> liveview::Result<()> {
//! let config = OutputConfig::load("liveview.toml")?;
//! let (queue_tx, queue_rx) = mpsc::channel(config.queue.capacity);
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//! // Hand queue_tx to the capture side, shutdown_tx to the signal handler
//! # let _ = (queue_tx, shutdown_tx);
//! liveview::output::run(config, queue_rx, shutdown_rx).await
//! # }
//! ```

pub mod birdseye;
pub mod config;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod output;
pub mod registry;
pub mod relay;
pub mod server;
pub mod stats;

pub use error::{Error, Result};
pub use output::FrameMetadata;
