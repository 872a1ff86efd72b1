//! Raw frame buffers
//!
//! The capture pipeline writes each decoded frame into a named buffer and then
//! queues its metadata. This module names those buffers, describes their
//! layout and attaches to them without taking ownership.
//!
//! # Lifecycle
//!
//! ```text
//!   producer                     coordinator
//!   create(id) ── write ──►  queue  ──► get(id) ── use ──► delete(id)
//! ```
//!
//! Each id is attached at most once and released exactly once. Releasing an
//! id that is not attached is an error, so lifecycle bugs show up in tests
//! instead of leaking buffers.

pub mod store;

use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;

use crate::error::{Error, Result};

pub use store::ShmFrameStore;

/// Identifier of one produced frame: camera name plus frame timestamp
///
/// The buffer name is the camera followed by the frame time in its shortest
/// round-trip form, always with a fractional part (`front1700000000.0`),
/// matching how the producer names its shared buffers. Equality and hashing
/// use that name.
#[derive(Debug, Clone)]
pub struct FrameId {
    camera: String,
    frame_time: f64,
    name: String,
}

impl FrameId {
    pub fn new(camera: impl Into<String>, frame_time: f64) -> Self {
        let camera = camera.into();
        let name = format!("{}{:?}", camera, frame_time);
        Self {
            camera,
            frame_time,
            name,
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn frame_time(&self) -> f64 {
        self.frame_time
    }

    /// Name of the backing buffer
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for FrameId {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for FrameId {}

impl Hash for FrameId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Dimensions of a planar YUV 4:2:0 frame
///
/// Layout is a full-resolution luma plane followed by two quarter-size
/// chroma planes (U then V), `width * height * 3 / 2` bytes in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
}

impl FrameShape {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn chroma_width(&self) -> u32 {
        self.width / 2
    }

    pub fn chroma_height(&self) -> u32 {
        self.height / 2
    }

    pub fn chroma_len(&self) -> usize {
        self.chroma_width() as usize * self.chroma_height() as usize
    }

    /// Total size in bytes
    pub fn len(&self) -> usize {
        self.luma_len() + 2 * self.chroma_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An attached view of a raw frame
///
/// Cheap to clone: the pixel data is reference counted, so handing the view
/// to an encoder or the compositor does not copy it.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    shape: FrameShape,
    data: Bytes,
}

impl FrameBuffer {
    /// Wrap bytes laid out as `shape`. Extra trailing bytes are ignored.
    pub fn new(id: &FrameId, shape: FrameShape, data: Bytes) -> Result<Self> {
        if data.len() < shape.len() {
            return Err(Error::ShapeMismatch {
                id: id.clone(),
                expected: shape.len(),
                actual: data.len(),
            });
        }
        Ok(Self {
            shape,
            data: data.slice(..shape.len()),
        })
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Whole frame, all three planes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn luma(&self) -> &[u8] {
        &self.data[..self.shape.luma_len()]
    }

    pub fn chroma_u(&self) -> &[u8] {
        let start = self.shape.luma_len();
        &self.data[start..start + self.shape.chroma_len()]
    }

    pub fn chroma_v(&self) -> &[u8] {
        let start = self.shape.luma_len() + self.shape.chroma_len();
        &self.data[start..start + self.shape.chroma_len()]
    }
}

/// Named-buffer registry the coordinator attaches frames through
pub trait FrameStore {
    /// Attach to the buffer named by `id` and view it as `shape`.
    ///
    /// Fails with [`Error::NotFound`] when the buffer does not exist.
    fn get(&mut self, id: &FrameId, shape: FrameShape) -> Result<FrameBuffer>;

    /// Release the view of `id` and destroy the backing buffer.
    ///
    /// Fails with [`Error::NotFoundOnDelete`] when `id` is not attached.
    fn delete(&mut self, id: &FrameId) -> Result<()>;
}
