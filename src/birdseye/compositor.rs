//! Activity tracking and composition
//!
//! A camera counts as active while its last frame with objects is younger
//! than the activity window. The compositor keeps the most recent frame of
//! each active camera so that every occupied cell can be redrawn after the
//! layout changes.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::canvas::Canvas;
use super::layout::Layout;
use crate::frame::{FrameBuffer, FrameShape};

/// Default activity window
pub const DEFAULT_ACTIVITY_WINDOW: Duration = Duration::from_secs(30);

/// Builds the birdseye composite from per-camera frames
pub struct Compositor {
    template: Canvas,
    canvas: Canvas,
    layout: Layout,
    activity_window: f64,

    /// Frame time of each camera's last frame with objects
    activity: HashMap<String, f64>,

    /// Most recent frame of each active camera
    latest: HashMap<String, FrameBuffer>,
}

impl Compositor {
    pub fn new(shape: FrameShape, activity_window: Duration) -> Self {
        let template = Canvas::blank(shape);
        Self {
            canvas: template.clone(),
            template,
            layout: Layout::default(),
            activity_window: activity_window.as_secs_f64(),
            activity: HashMap::new(),
            latest: HashMap::new(),
        }
    }

    /// The composite frame, ready for the encoder
    pub fn frame(&self) -> &[u8] {
        self.canvas.as_bytes()
    }

    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Cameras whose last object was seen within the window before `now`
    pub fn active_cameras(&self, now: f64) -> BTreeSet<String> {
        self.activity
            .iter()
            .filter(|&(_, &seen)| now - seen < self.activity_window)
            .map(|(camera, _)| camera.clone())
            .collect()
    }

    /// Feed one camera frame, evaluated at the current wall-clock time.
    ///
    /// Returns whether the composite should be sent to the encoder.
    pub fn update(
        &mut self,
        camera: &str,
        object_count: usize,
        motion_count: usize,
        frame_time: f64,
        frame: &FrameBuffer,
    ) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        self.update_at(now, camera, object_count, motion_count, frame_time, frame)
    }

    /// Feed one camera frame, evaluated at `now` (seconds, same clock as
    /// `frame_time`).
    ///
    /// Motion alone does not make a camera active; only objects do.
    pub fn update_at(
        &mut self,
        now: f64,
        camera: &str,
        object_count: usize,
        _motion_count: usize,
        frame_time: f64,
        frame: &FrameBuffer,
    ) -> bool {
        if object_count > 0 {
            self.activity.insert(camera.to_string(), frame_time);
        }

        let active = self.active_cameras(now);
        self.latest.retain(|name, _| active.contains(name));
        if active.contains(camera) {
            self.latest.insert(camera.to_string(), frame.clone());
        }

        if active.is_empty() && self.layout.is_empty() {
            return false;
        }

        let mut changed = false;
        if self.layout.needs_rebuild(active.len()) {
            self.layout = Layout::for_count(active.len());
            self.canvas.reset_from(&self.template);
            changed = true;
            tracing::debug!(
                columns = self.layout.columns(),
                rows = self.layout.rows(),
                active = active.len(),
                "Birdseye layout rebuilt"
            );
        }

        let shape = self.canvas.shape();
        for index in self.layout.evict_inactive(&active) {
            if let Some(rect) = self.layout.cell_rect(index, shape) {
                self.canvas.fill_blank(rect);
            }
            changed = true;
        }
        if !self.layout.place(&active).is_empty() {
            changed = true;
        }

        if changed {
            self.redraw_all();
        } else if let Some(index) = self.layout.position(camera) {
            self.draw_cell(index, camera);
        }

        true
    }

    fn redraw_all(&mut self) {
        let placed: Vec<(usize, String)> = self
            .layout
            .cells()
            .iter()
            .enumerate()
            .filter_map(|(index, cell)| cell.clone().map(|camera| (index, camera)))
            .collect();
        for (index, camera) in placed {
            self.draw_cell(index, &camera);
        }
    }

    fn draw_cell(&mut self, index: usize, camera: &str) {
        let (Some(frame), Some(rect)) = (
            self.latest.get(camera),
            self.layout.cell_rect(index, self.canvas.shape()),
        ) else {
            return;
        };
        self.canvas.blit_scaled(frame, rect);
    }
}
