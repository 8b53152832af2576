//! Preview frames and luma views.

use bytes::Bytes;
use std::borrow::Cow;

use crate::geometry::{Rect, Size};

/// One preview frame as delivered by the camera driver.
///
/// Only the luma plane is used. The buffer is shared, not copied, between the
/// driver callback and the decode task that consumes it.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

impl FrameBuffer {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32) -> Self {
        FrameBuffer {
            data: data.into(),
            width,
            height,
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Whether the buffer holds at least `width * height` luma bytes.
    pub fn is_complete(&self) -> bool {
        self.data.len() as u64 >= self.size().area()
    }

    /// The luma plane laid out as the declared size describes it.
    ///
    /// Drivers deliver sensor rows, which are always landscape. When the
    /// declared size is portrait (`width < height`) the bytes are reindexed
    /// with [`rotate_portrait`]; landscape frames are borrowed as they are.
    pub fn upright_luma(&self) -> Cow<'_, [u8]> {
        if self.width < self.height {
            Cow::Owned(rotate_portrait(&self.data, self.width, self.height))
        } else {
            Cow::Borrowed(&self.data[..])
        }
    }
}

/// Turn a landscape sensor buffer (`height` bytes per row, `width` rows)
/// into a portrait buffer of `width` bytes per row by a quarter turn.
///
/// For every `x` in `[0, width)` and `y` in `[0, height)`:
/// `rotated[y * width + width - 1 - x] = source[y + x * height]`.
pub fn rotate_portrait(source: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut rotated = vec![0u8; w * h];
    for x in 0..w {
        for y in 0..h {
            rotated[y * w + w - 1 - x] = source[y + x * h];
        }
    }
    rotated
}

/// A rectangular window onto a luma buffer.
#[derive(Debug, Clone, Copy)]
pub struct LumaRegion<'a> {
    data: &'a [u8],
    data_width: usize,
    left: usize,
    top: usize,
    width: usize,
    height: usize,
}

impl<'a> LumaRegion<'a> {
    /// Window `data` (laid out `size.width` bytes per row) to `rect`.
    ///
    /// The rect is clipped to the buffer. Returns `None` when the clipped
    /// window is empty or the buffer is shorter than `size` implies.
    pub fn crop(data: &'a [u8], size: Size, rect: Rect) -> Option<Self> {
        if (data.len() as u64) < size.area() {
            return None;
        }
        let rect = rect.intersect(size);
        if rect.is_empty() {
            return None;
        }
        Some(LumaRegion {
            data,
            data_width: size.width as usize,
            left: rect.left as usize,
            top: rect.top as usize,
            width: rect.width() as usize,
            height: rect.height() as usize,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Luma at `(x, y)` relative to the window's top-left corner.
    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.data[(self.top + y) * self.data_width + self.left + x]
    }

    pub fn row(&self, y: usize) -> &'a [u8] {
        let start = (self.top + y) * self.data_width + self.left;
        &self.data[start..start + self.width]
    }

    /// Copy the window out into a tightly packed buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.width * self.height);
        for y in 0..self.height {
            out.extend_from_slice(self.row(y));
        }
        out
    }
}
