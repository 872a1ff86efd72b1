//! Shared-memory frame store
//!
//! Frames live as named files under a shared-memory root (`/dev/shm` on
//! Linux, where POSIX shared memory objects appear as files). Attaching maps
//! the file read-only; the mapping is wrapped in `Bytes` so views can be
//! passed around without copying and stay valid after the name is unlinked.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use memmap2::{Mmap, MmapMut};

use super::{FrameBuffer, FrameId, FrameShape, FrameStore};
use crate::error::{Error, Result};

/// Default shared-memory root
pub const DEFAULT_SHM_ROOT: &str = "/dev/shm";

/// Frame store backed by memory-mapped files under a shared-memory root
pub struct ShmFrameStore {
    root: PathBuf,
    attached: HashMap<FrameId, FrameBuffer>,
}

impl ShmFrameStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            attached: HashMap::new(),
        }
    }

    /// Number of frames currently attached
    pub fn attached_count(&self) -> usize {
        self.attached.len()
    }

    pub fn is_attached(&self, id: &FrameId) -> bool {
        self.attached.contains_key(id)
    }

    /// Producer side: create the named buffer sized for `shape`.
    ///
    /// Returns a writable mapping the producer fills before queueing the
    /// frame's metadata.
    pub fn create(&self, id: &FrameId, shape: FrameShape) -> Result<MmapMut> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path_for(id))?;
        file.set_len(shape.len() as u64)?;

        // SAFETY: the file was just created at the requested size and is only
        // written through this mapping until its metadata is queued.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(map)
    }

    fn path_for(&self, id: &FrameId) -> PathBuf {
        self.root.join(id.name())
    }

    fn attach(&self, id: &FrameId, shape: FrameShape) -> Result<FrameBuffer> {
        let file = match File::open(self.path_for(id)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len() as usize;
        if len < shape.len() {
            return Err(Error::ShapeMismatch {
                id: id.clone(),
                expected: shape.len(),
                actual: len,
            });
        }

        // SAFETY: the producer finishes writing a frame before queueing its
        // id and never touches it afterwards, so the mapped bytes are stable.
        let map = unsafe { Mmap::map(&file)? };
        FrameBuffer::new(id, shape, Bytes::from_owner(map))
    }
}

impl Default for ShmFrameStore {
    fn default() -> Self {
        Self::new(DEFAULT_SHM_ROOT)
    }
}

impl FrameStore for ShmFrameStore {
    fn get(&mut self, id: &FrameId, shape: FrameShape) -> Result<FrameBuffer> {
        if let Some(buffer) = self.attached.get(id) {
            return Ok(buffer.clone());
        }

        let buffer = self.attach(id, shape)?;
        self.attached.insert(id.clone(), buffer.clone());
        Ok(buffer)
    }

    fn delete(&mut self, id: &FrameId) -> Result<()> {
        if self.attached.remove(id).is_none() {
            return Err(Error::NotFoundOnDelete(id.clone()));
        }

        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            // Already unlinked by someone else; our view is released either way
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(frame = %id, "Frame buffer already unlinked");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
