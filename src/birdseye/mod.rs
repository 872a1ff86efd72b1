//! Birdseye composite view
//!
//! Multiplexes the recently active cameras into one canvas that is encoded
//! and served as its own channel.
//!
//! ```text
//!   camera frame ──► Compositor::update ──► activity record
//!                                       ├─► Layout (bucket rule, placement)
//!                                       └─► Canvas (scaled blit per cell)
//! ```

pub mod canvas;
pub mod compositor;
pub mod layout;

pub use canvas::Canvas;
pub use compositor::Compositor;
pub use layout::{bucket, Layout, Rect};

/// Name of the synthetic composite channel
pub const BIRDSEYE_CHANNEL: &str = "birdseye";
