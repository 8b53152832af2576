//! Scan-area geometry.
//!
//! The framing rect is the on-screen box the user aligns a code with. The
//! preview framing rect is the same box mapped into the camera's preview
//! buffer, which is what frames get cropped to before decoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape of the scan area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerType {
    /// Centered square, for 2D codes.
    #[default]
    Qr,
    /// Wide, short rectangle for 1D bar codes.
    Linear,
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Size { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_portrait(&self) -> bool {
        self.width < self.height
    }

    /// The same size with the long edge first.
    pub fn landscape(&self) -> Size {
        if self.is_portrait() {
            Size::new(self.height, self.width)
        } else {
            *self
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Axis-aligned rectangle, right and bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Rect {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Clip to `[0, bounds.width) x [0, bounds.height)`.
    pub fn intersect(&self, bounds: Size) -> Rect {
        Rect {
            left: self.left.min(bounds.width),
            top: self.top.min(bounds.height),
            right: self.right.min(bounds.width),
            bottom: self.bottom.min(bounds.height),
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rect({}, {} - {}, {})",
            self.left, self.top, self.right, self.bottom
        )
    }
}

/// Compute the on-screen framing rect, centered on the screen.
///
/// QR: a square with side `min(w, h) / 2`. Linear: width `2w / 3`, height a
/// quarter of the width.
pub fn compute_screen_rect(screen: Option<Size>, scanner_type: ScannerType) -> Option<Rect> {
    let screen = screen?;
    let (width, height) = match scanner_type {
        ScannerType::Qr => {
            let side = screen.width.min(screen.height) / 2;
            (side, side)
        }
        ScannerType::Linear => {
            let width = screen.width * 2 / 3;
            (width, width / 4)
        }
    };
    let left = (screen.width - width) / 2;
    let top = screen.height.saturating_sub(height) / 2;
    Some(Rect::new(left, top, left + width, top + height))
}

/// Map a screen rect into preview-buffer coordinates, scaling each axis
/// independently by `preview / screen`.
pub fn compute_preview_rect(
    screen_rect: Rect,
    preview: Option<Size>,
    screen: Option<Size>,
) -> Option<Rect> {
    let preview = preview?;
    let screen = screen?;
    if screen.width == 0 || screen.height == 0 {
        return None;
    }
    let scale = |edge: u32, to: u32, from: u32| (edge as u64 * to as u64 / from as u64) as u32;
    Some(Rect {
        left: scale(screen_rect.left, preview.width, screen.width),
        right: scale(screen_rect.right, preview.width, screen.width),
        top: scale(screen_rect.top, preview.height, screen.height),
        bottom: scale(screen_rect.bottom, preview.height, screen.height),
    })
}

const MIN_PREVIEW_PIXELS: u64 = 480 * 320;
const MAX_ASPECT_DISTORTION: f64 = 0.15;

/// Choose a driver preview size for a screen.
///
/// An exact match of the landscape screen size wins. Otherwise the largest
/// supported size of at least 480x320 whose aspect ratio is within 15% of the
/// screen's. Falls back to `fallback`, the driver's current size.
pub fn best_preview_size(supported: &[Size], screen: Size, fallback: Option<Size>) -> Option<Size> {
    let screen = screen.landscape();
    if screen.height == 0 {
        return fallback;
    }
    let screen_aspect = screen.width as f64 / screen.height as f64;

    let mut best: Option<Size> = None;
    for candidate in supported {
        if candidate.area() < MIN_PREVIEW_PIXELS {
            continue;
        }
        let landscape = candidate.landscape();
        if landscape == screen {
            tracing::debug!("Found preview size exactly matching screen: {}", candidate);
            return Some(*candidate);
        }
        let aspect = landscape.width as f64 / landscape.height as f64;
        if (aspect - screen_aspect).abs() > MAX_ASPECT_DISTORTION {
            continue;
        }
        if best.map_or(true, |b| candidate.area() > b.area()) {
            best = Some(*candidate);
        }
    }

    best.or(fallback)
}

/// Cached framing geometry.
///
/// Both rects are computed on first access and cached until an input
/// changes. Changing the scanner type clears both caches.
#[derive(Debug, Clone, Default)]
pub struct FramingGeometry {
    scanner_type: ScannerType,
    screen_resolution: Option<Size>,
    preview_size: Option<Size>,
    screen_rect: Option<Rect>,
    preview_rect: Option<Rect>,
}

impl FramingGeometry {
    pub fn new(scanner_type: ScannerType) -> Self {
        FramingGeometry {
            scanner_type,
            ..Default::default()
        }
    }

    pub fn scanner_type(&self) -> ScannerType {
        self.scanner_type
    }

    pub fn screen_resolution(&self) -> Option<Size> {
        self.screen_resolution
    }

    pub fn preview_size(&self) -> Option<Size> {
        self.preview_size
    }

    pub fn set_scanner_type(&mut self, scanner_type: ScannerType) {
        self.scanner_type = scanner_type;
        self.invalidate();
    }

    pub fn set_screen_resolution(&mut self, screen: Size) {
        self.screen_resolution = Some(screen);
        self.invalidate();
    }

    pub fn set_preview_size(&mut self, preview: Option<Size>) {
        if self.preview_size != preview {
            self.preview_size = preview;
            self.preview_rect = None;
        }
    }

    /// Drop both cached rects.
    pub fn invalidate(&mut self) {
        self.screen_rect = None;
        self.preview_rect = None;
    }

    pub fn screen_rect(&mut self) -> Option<Rect> {
        if self.screen_rect.is_none() {
            self.screen_rect = compute_screen_rect(self.screen_resolution, self.scanner_type);
            if let Some(rect) = self.screen_rect {
                tracing::debug!("Framing rect: {}", rect);
            }
        }
        self.screen_rect
    }

    pub fn preview_rect(&mut self) -> Option<Rect> {
        if self.preview_rect.is_none() {
            let screen_rect = self.screen_rect()?;
            self.preview_rect =
                compute_preview_rect(screen_rect, self.preview_size, self.screen_resolution);
            if let Some(rect) = self.preview_rect {
                tracing::debug!(
                    "Framing rect in preview: {} (preview {:?}, screen {:?})",
                    rect,
                    self.preview_size,
                    self.screen_resolution
                );
            }
        }
        self.preview_rect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHONE: Size = Size::new(1080, 1920);

    #[test]
    fn qr_rect_is_centered_square() {
        let rect = compute_screen_rect(Some(PHONE), ScannerType::Qr).unwrap();
        assert_eq!(rect, Rect::new(270, 690, 810, 1230));
        assert_eq!(rect.width(), 540);
        assert_eq!(rect.height(), 540);
    }

    #[test]
    fn linear_rect_is_wide() {
        let rect = compute_screen_rect(Some(PHONE), ScannerType::Linear).unwrap();
        assert_eq!(rect.width(), 720);
        assert_eq!(rect.height(), 180);
        assert_eq!(rect.left, (1080 - 720) / 2);
        assert_eq!(rect.top, (1920 - 180) / 2);
    }

    #[test]
    fn unknown_inputs_give_no_rect() {
        assert!(compute_screen_rect(None, ScannerType::Qr).is_none());
        let rect = Rect::new(0, 0, 10, 10);
        assert!(compute_preview_rect(rect, None, Some(PHONE)).is_none());
        assert!(compute_preview_rect(rect, Some(PHONE), None).is_none());

        let mut geometry = FramingGeometry::new(ScannerType::Qr);
        assert!(geometry.screen_rect().is_none());
        geometry.set_screen_resolution(PHONE);
        assert!(geometry.screen_rect().is_some());
        assert!(geometry.preview_rect().is_none());
    }

    #[test]
    fn preview_rect_scales_each_axis() {
        let screen_rect = Rect::new(270, 690, 810, 1230);
        let rect = compute_preview_rect(screen_rect, Some(Size::new(720, 1280)), Some(PHONE))
            .unwrap();
        assert_eq!(rect, Rect::new(180, 460, 540, 820));
    }

    #[test]
    fn preview_rect_is_idempotent() {
        let mut geometry = FramingGeometry::new(ScannerType::Qr);
        geometry.set_screen_resolution(PHONE);
        geometry.set_preview_size(Some(Size::new(720, 1280)));
        let first = geometry.preview_rect();
        let second = geometry.preview_rect();
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn switching_scanner_type_recomputes_both_rects() {
        let mut geometry = FramingGeometry::new(ScannerType::Qr);
        geometry.set_screen_resolution(PHONE);
        geometry.set_preview_size(Some(Size::new(720, 1280)));
        let qr_screen = geometry.screen_rect().unwrap();
        let qr_preview = geometry.preview_rect().unwrap();

        geometry.set_scanner_type(ScannerType::Linear);
        assert!(geometry.screen_rect.is_none());
        assert!(geometry.preview_rect.is_none());

        let linear_screen = geometry.screen_rect().unwrap();
        let linear_preview = geometry.preview_rect().unwrap();
        assert_ne!(qr_screen, linear_screen);
        assert_ne!(qr_preview, linear_preview);
        assert_eq!(linear_screen.width(), 720);
        assert_eq!(linear_screen.height(), 180);
    }

    #[test]
    fn new_preview_size_only_drops_preview_rect() {
        let mut geometry = FramingGeometry::new(ScannerType::Qr);
        geometry.set_screen_resolution(PHONE);
        geometry.set_preview_size(Some(Size::new(720, 1280)));
        let screen = geometry.screen_rect();
        let before = geometry.preview_rect();
        geometry.set_preview_size(Some(Size::new(1080, 1920)));
        assert_eq!(geometry.screen_rect, screen);
        assert_ne!(geometry.preview_rect(), before);
    }

    #[test]
    fn intersect_clips_to_bounds() {
        let rect = Rect::new(10, 10, 200, 200).intersect(Size::new(100, 50));
        assert_eq!(rect, Rect::new(10, 10, 100, 50));
        assert!(Rect::new(120, 0, 200, 10).intersect(Size::new(100, 50)).is_empty());
    }

    #[test]
    fn best_preview_size_prefers_exact_match() {
        let supported = [
            Size::new(640, 480),
            Size::new(1920, 1080),
            Size::new(1280, 720),
        ];
        let best = best_preview_size(&supported, Size::new(1080, 1920), None);
        assert_eq!(best, Some(Size::new(1920, 1080)));
    }

    #[test]
    fn best_preview_size_takes_largest_close_aspect() {
        let supported = [
            Size::new(320, 240),
            Size::new(1280, 720),
            Size::new(1600, 1200),
            Size::new(960, 540),
        ];
        let best = best_preview_size(&supported, Size::new(1080, 1920), None);
        assert_eq!(best, Some(Size::new(1280, 720)));
    }

    #[test]
    fn best_preview_size_falls_back() {
        let supported = [Size::new(176, 144)];
        let fallback = Some(Size::new(640, 480));
        assert_eq!(
            best_preview_size(&supported, Size::new(1080, 1920), fallback),
            fallback
        );
    }
}
