//! Birdseye grid layout
//!
//! The grid is sized from the number of active cameras: `ceil(sqrt(n))`
//! columns by `round(sqrt(n))` rows. It is only rebuilt when the rounded
//! square root (the bucket) changes, which keeps cameras from jumping around
//! as activity comes and goes. The price is that some counts get fewer cells
//! than cameras: going from one to two active cameras stays in bucket 1, so
//! the grid remains 1x1 and the second camera waits for a free cell.

use std::collections::BTreeSet;

use crate::frame::FrameShape;

/// Coarse grouping of a camera count used to decide on rebuilds
pub fn bucket(count: usize) -> usize {
    (count as f64).sqrt().round() as usize
}

/// Pixel rectangle of one cell on the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Grid of cells, each empty or showing one camera
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    columns: usize,
    rows: usize,
    cells: Vec<Option<String>>,
}

impl Layout {
    /// Empty grid sized for `active` cameras
    pub fn for_count(active: usize) -> Self {
        let root = (active as f64).sqrt();
        let columns = root.ceil() as usize;
        let rows = root.round() as usize;
        Self {
            columns,
            rows,
            cells: vec![None; columns * rows],
        }
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[Option<String>] {
        &self.cells
    }

    /// Cell index showing `camera`
    pub fn position(&self, camera: &str) -> Option<usize> {
        self.cells
            .iter()
            .position(|cell| cell.as_deref() == Some(camera))
    }

    /// Whether `active` cameras fall into a different bucket than this grid
    pub fn needs_rebuild(&self, active: usize) -> bool {
        bucket(active) != bucket(self.cells.len())
    }

    /// Empty every cell whose camera is not in `active`. Returns the freed cells.
    pub fn evict_inactive(&mut self, active: &BTreeSet<String>) -> Vec<usize> {
        let mut freed = Vec::new();
        for (index, cell) in self.cells.iter_mut().enumerate() {
            if cell.as_ref().is_some_and(|camera| !active.contains(camera)) {
                *cell = None;
                freed.push(index);
            }
        }
        freed
    }

    /// Put each unplaced camera of `active` into the first empty cell, in
    /// ascending name order. Cameras left over when the grid is full stay
    /// unplaced. Returns the filled cells.
    pub fn place(&mut self, active: &BTreeSet<String>) -> Vec<usize> {
        let mut filled = Vec::new();
        for camera in active {
            if self.position(camera).is_some() {
                continue;
            }
            let Some(index) = self.cells.iter().position(Option::is_none) else {
                break;
            };
            self.cells[index] = Some(camera.clone());
            filled.push(index);
        }
        filled
    }

    /// Where cell `index` lands on a canvas of `canvas` size.
    ///
    /// Cells are `width / columns` by `height / rows`, rounded down to even
    /// sizes so chroma planes line up.
    pub fn cell_rect(&self, index: usize, canvas: FrameShape) -> Option<Rect> {
        if index >= self.cells.len() {
            return None;
        }
        let width = (canvas.width / self.columns as u32) & !1;
        let height = (canvas.height / self.rows as u32) & !1;
        let column = (index % self.columns) as u32;
        let row = (index / self.columns) as u32;
        Some(Rect {
            x: column * width,
            y: row * height,
            width,
            height,
        })
    }
}
