//! Composite canvas
//!
//! A YUV 4:2:0 frame the birdseye view is painted on. Camera frames are
//! scaled plane by plane into their cell's rectangle.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};

use super::layout::Rect;
use crate::frame::{FrameBuffer, FrameShape};

/// Luma of the blank canvas (video black)
pub const BLANK_LUMA: u8 = 16;

/// Chroma of the blank canvas (no color)
pub const BLANK_CHROMA: u8 = 128;

const SCALE_FILTER: FilterType = FilterType::Triangle;

/// Planar YUV 4:2:0 canvas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canvas {
    shape: FrameShape,
    data: Vec<u8>,
}

impl Canvas {
    /// The blank template: black luma, neutral chroma
    pub fn blank(shape: FrameShape) -> Self {
        let mut data = vec![BLANK_CHROMA; shape.len()];
        data[..shape.luma_len()].fill(BLANK_LUMA);
        Self { shape, data }
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Overwrite the whole canvas with `template`
    pub fn reset_from(&mut self, template: &Canvas) {
        self.data.copy_from_slice(&template.data);
    }

    /// Luma value at a pixel
    pub fn luma_at(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.shape.width as usize + x as usize]
    }

    /// Chroma (U, V) values covering a pixel
    pub fn chroma_at(&self, x: u32, y: u32) -> (u8, u8) {
        let offset = (y / 2) as usize * self.shape.chroma_width() as usize + (x / 2) as usize;
        let (_, u, v) = self.planes();
        (u[offset], v[offset])
    }

    /// Paint a cell blank
    pub fn fill_blank(&mut self, rect: Rect) {
        let chroma = chroma_rect(rect);
        let luma_width = self.shape.width;
        let chroma_width = self.shape.chroma_width();
        let (y, u, v) = self.planes_mut();

        fill_plane(y, luma_width, rect, BLANK_LUMA);
        fill_plane(u, chroma_width, chroma, BLANK_CHROMA);
        fill_plane(v, chroma_width, chroma, BLANK_CHROMA);
    }

    /// Scale `frame` to fill `rect` (stretching, no letterbox) and paint it
    pub fn blit_scaled(&mut self, frame: &FrameBuffer, rect: Rect) {
        let source = frame.shape();
        let chroma = chroma_rect(rect);
        let luma_width = self.shape.width;
        let chroma_width = self.shape.chroma_width();
        let (y, u, v) = self.planes_mut();

        scale_into(frame.luma(), source.width, source.height, y, luma_width, rect);
        scale_into(
            frame.chroma_u(),
            source.chroma_width(),
            source.chroma_height(),
            u,
            chroma_width,
            chroma,
        );
        scale_into(
            frame.chroma_v(),
            source.chroma_width(),
            source.chroma_height(),
            v,
            chroma_width,
            chroma,
        );
    }

    fn planes(&self) -> (&[u8], &[u8], &[u8]) {
        let (y, chroma) = self.data.split_at(self.shape.luma_len());
        let (u, v) = chroma.split_at(self.shape.chroma_len());
        (y, u, v)
    }

    fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let (y, chroma) = self.data.split_at_mut(self.shape.luma_len());
        let (u, v) = chroma.split_at_mut(self.shape.chroma_len());
        (y, u, v)
    }
}

fn chroma_rect(rect: Rect) -> Rect {
    Rect {
        x: rect.x / 2,
        y: rect.y / 2,
        width: rect.width / 2,
        height: rect.height / 2,
    }
}

fn fill_plane(plane: &mut [u8], stride: u32, rect: Rect, value: u8) {
    for row in rect.y..rect.y + rect.height {
        let start = row as usize * stride as usize + rect.x as usize;
        plane[start..start + rect.width as usize].fill(value);
    }
}

fn scale_into(src: &[u8], src_width: u32, src_height: u32, dst: &mut [u8], stride: u32, rect: Rect) {
    if rect.width == 0 || rect.height == 0 {
        return;
    }
    let Some(view) = ImageBuffer::<Luma<u8>, &[u8]>::from_raw(src_width, src_height, src) else {
        return;
    };

    let scaled = if (src_width, src_height) == (rect.width, rect.height) {
        None
    } else {
        Some(imageops::resize(&view, rect.width, rect.height, SCALE_FILTER))
    };
    let pixels: &[u8] = match &scaled {
        Some(image) => image.as_raw(),
        None => src,
    };

    let width = rect.width as usize;
    for (row, line) in pixels.chunks_exact(width).take(rect.height as usize).enumerate() {
        let start = (rect.y as usize + row) * stride as usize + rect.x as usize;
        dst[start..start + width].copy_from_slice(line);
    }
}
