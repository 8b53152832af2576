//! In-process camera driver for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::camera::{
    CameraDriver, CameraFacing, CameraHandle, CameraInfo, CameraParameters, FocusMode,
    FrameCallback, SurfaceTarget,
};
use crate::error::DriverError;
use crate::frame::FrameBuffer;
use crate::geometry::Size;

/// Produces the luma bytes of the n-th delivered frame, or `None` to leave
/// the request unanswered.
pub type FrameSource = Arc<dyn Fn(u64) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectMode {
    Never,
    FirstAttempt,
    Always,
}

pub struct MockDriver {
    fail_open: bool,
    reject: RejectMode,
    source: Option<FrameSource>,
    frame_delay: Duration,
    focus_delay: Duration,
    opened: Mutex<Vec<i32>>,
    handles: Mutex<Vec<Arc<MockHandle>>>,
}

impl MockDriver {
    fn build(
        fail_open: bool,
        reject: RejectMode,
        source: Option<FrameSource>,
        frame_delay: Duration,
        focus_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(MockDriver {
            fail_open,
            reject,
            source,
            frame_delay,
            focus_delay,
            opened: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn new() -> Arc<Self> {
        Self::build(false, RejectMode::Never, None, Duration::ZERO, Duration::ZERO)
    }

    pub fn failing() -> Arc<Self> {
        Self::build(true, RejectMode::Never, None, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_reject(reject: RejectMode) -> Arc<Self> {
        Self::build(false, reject, None, Duration::ZERO, Duration::ZERO)
    }

    /// A driver whose auto-focus passes each take `delay`.
    pub fn with_slow_focus(delay: Duration) -> Arc<Self> {
        Self::build(false, RejectMode::Never, None, Duration::ZERO, delay)
    }

    /// A driver whose handles answer one-shot requests from `source`, each
    /// after `delay`.
    pub fn with_frames<F>(source: F, delay: Duration) -> Arc<Self>
    where
        F: Fn(u64) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        Self::build(
            false,
            RejectMode::Never,
            Some(Arc::new(source)),
            delay,
            Duration::ZERO,
        )
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn last_opened_id(&self) -> Option<i32> {
        self.opened.lock().unwrap().last().copied()
    }

    /// The most recently opened handle.
    pub fn handle(&self) -> Arc<MockHandle> {
        self.handles
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no camera opened")
    }

    /// One-shot requests over every handle this driver opened.
    pub fn request_count(&self) -> usize {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .map(|h| h.request_count())
            .sum()
    }
}

impl CameraDriver for MockDriver {
    fn open(&self, camera_id: i32) -> Option<Arc<dyn CameraHandle>> {
        self.opened.lock().unwrap().push(camera_id);
        if self.fail_open {
            return None;
        }
        let handle = MockHandle::spawn(
            self.reject,
            self.source.clone(),
            self.frame_delay,
            self.focus_delay,
        );
        self.handles.lock().unwrap().push(handle.clone());
        Some(handle as Arc<dyn CameraHandle>)
    }

    fn camera_info(&self, camera_id: i32) -> Option<CameraInfo> {
        Some(match camera_id {
            1 => CameraInfo {
                facing: CameraFacing::Front,
                orientation: 270,
            },
            _ => CameraInfo {
                facing: CameraFacing::Back,
                orientation: 90,
            },
        })
    }
}

#[derive(Default)]
struct Pending {
    callback: Option<FrameCallback>,
    released: bool,
}

struct Shared {
    calls: Mutex<Vec<&'static str>>,
    params: Mutex<CameraParameters>,
    pending: Mutex<Pending>,
    wake: Condvar,
    set_parameters_calls: AtomicUsize,
    requests: AtomicUsize,
    releases: AtomicUsize,
}

impl Shared {
    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

pub struct MockHandle {
    shared: Arc<Shared>,
    reject: RejectMode,
    focus_delay: Duration,
}

impl MockHandle {
    fn spawn(
        reject: RejectMode,
        source: Option<FrameSource>,
        delay: Duration,
        focus_delay: Duration,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            calls: Mutex::new(Vec::new()),
            params: Mutex::new(CameraParameters {
                preview_size: Some(Size::new(640, 480)),
                supported_preview_sizes: vec![
                    Size::new(320, 240),
                    Size::new(640, 480),
                    Size::new(1280, 720),
                ],
                focus_mode: FocusMode::Fixed,
                supported_focus_modes: vec![
                    FocusMode::Fixed,
                    FocusMode::Auto,
                    FocusMode::ContinuousPicture,
                ],
                torch: false,
                extra: Default::default(),
            }),
            pending: Mutex::new(Pending::default()),
            wake: Condvar::new(),
            set_parameters_calls: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        });
        if let Some(source) = source {
            let shared = shared.clone();
            thread::spawn(move || deliver_frames(shared, source, delay));
        }
        Arc::new(MockHandle {
            shared,
            reject,
            focus_delay,
        })
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn current_parameters(&self) -> CameraParameters {
        self.shared.params.lock().unwrap().clone()
    }

    pub fn set_parameters_calls(&self) -> usize {
        self.shared.set_parameters_calls.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.shared.releases.load(Ordering::SeqCst)
    }
}

/// Driver thread: answers the pending request with the next source frame.
fn deliver_frames(shared: Arc<Shared>, source: FrameSource, delay: Duration) {
    let mut seq = 0u64;
    loop {
        let callback = {
            let mut pending = shared.pending.lock().unwrap();
            while pending.callback.is_none() && !pending.released {
                pending = shared.wake.wait(pending).unwrap();
            }
            if pending.released {
                return;
            }
            pending.callback.take()
        };
        let Some(callback) = callback else { continue };

        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let size = shared
            .params
            .lock()
            .unwrap()
            .preview_size
            .unwrap_or(Size::new(640, 480));
        if let Some(data) = source(seq) {
            callback(FrameBuffer::new(data, size.width, size.height));
        }
        seq += 1;
    }
}

impl CameraHandle for MockHandle {
    fn set_preview_target(&self, _surface: &SurfaceTarget) -> Result<(), DriverError> {
        self.shared.record("set_preview_target");
        Ok(())
    }

    fn set_display_orientation(&self, _degrees: u32) {
        self.shared.record("set_display_orientation");
    }

    fn parameters(&self) -> Option<CameraParameters> {
        Some(self.current_parameters())
    }

    fn set_parameters(&self, params: &CameraParameters) -> Result<(), DriverError> {
        self.shared.record("set_parameters");
        let attempt = self.shared.set_parameters_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let rejected = match self.reject {
            RejectMode::Never => false,
            RejectMode::FirstAttempt => attempt == 1,
            RejectMode::Always => true,
        };
        if rejected {
            return Err(DriverError::ParametersRejected(format!("attempt {}", attempt)));
        }
        *self.shared.params.lock().unwrap() = params.clone();
        Ok(())
    }

    fn start_preview(&self) -> Result<(), DriverError> {
        self.shared.record("start_preview");
        Ok(())
    }

    fn stop_preview(&self) {
        self.shared.record("stop_preview");
    }

    fn auto_focus(&self) {
        self.shared.record("auto_focus");
        if !self.focus_delay.is_zero() {
            thread::sleep(self.focus_delay);
        }
        self.shared.record("auto_focus_done");
    }

    fn cancel_auto_focus(&self) {
        self.shared.record("cancel_auto_focus");
    }

    fn request_one_shot_frame(&self, callback: FrameCallback) {
        self.shared.requests.fetch_add(1, Ordering::SeqCst);
        self.shared.pending.lock().unwrap().callback = Some(callback);
        self.shared.wake.notify_all();
    }

    fn release(&self) {
        self.shared.record("release");
        self.shared.releases.fetch_add(1, Ordering::SeqCst);
        let mut pending = self.shared.pending.lock().unwrap();
        pending.released = true;
        pending.callback = None;
        self.shared.wake.notify_all();
    }
}

/// A white `frame_size` luma frame with a QR code for `text` in the middle,
/// rendered at most `max_side` pixels wide.
pub fn qr_frame(text: &str, frame_size: Size, max_side: u32) -> (Vec<u8>, Size) {
    let code = qrcode::QrCode::new(text.as_bytes()).expect("text fits in a QR code");
    let image = code
        .render::<image::Luma<u8>>()
        .quiet_zone(true)
        .max_dimensions(max_side, max_side)
        .build();

    let (fw, fh) = (frame_size.width, frame_size.height);
    assert!(image.width() <= fw && image.height() <= fh, "code larger than frame");
    let left = (fw - image.width()) / 2;
    let top = (fh - image.height()) / 2;

    let mut data = vec![255u8; (fw * fh) as usize];
    for (x, y, pixel) in image.enumerate_pixels() {
        data[((top + y) * fw + left + x) as usize] = pixel.0[0];
    }
    (data, frame_size)
}

/// Left-hand odd-parity EAN digit patterns, seven modules each.
const EAN_L: [u32; 10] = [
    0b0001101, 0b0011001, 0b0010011, 0b0111101, 0b0100011, 0b0110001, 0b0101111, 0b0111011,
    0b0110111, 0b0001011,
];

/// Even-parity positions among the six left digits, keyed by the first digit.
const EAN_PARITY: [u32; 10] = [
    0b000000, 0b001011, 0b001101, 0b001110, 0b010011, 0b011001, 0b011100, 0b010101, 0b010110,
    0b011010,
];

fn push_modules(out: &mut Vec<bool>, pattern: u32, width: u32) {
    for i in (0..width).rev() {
        out.push((pattern >> i) & 1 == 1);
    }
}

fn reverse7(pattern: u32) -> u32 {
    (0..7).fold(0, |acc, i| acc | ((pattern >> i) & 1) << (6 - i))
}

/// Bar modules (true is dark) of an EAN-13 symbol, guards included.
fn ean13_modules(code: &str) -> Vec<bool> {
    let digits: Vec<usize> = code.bytes().map(|b| (b - b'0') as usize).collect();
    assert_eq!(digits.len(), 13, "EAN-13 needs 13 digits");

    let mut modules = Vec::with_capacity(95);
    push_modules(&mut modules, 0b101, 3);
    for (i, &digit) in digits[1..7].iter().enumerate() {
        let even = (EAN_PARITY[digits[0]] >> (5 - i)) & 1 == 1;
        let pattern = if even {
            reverse7(!EAN_L[digit] & 0x7f)
        } else {
            EAN_L[digit]
        };
        push_modules(&mut modules, pattern, 7);
    }
    push_modules(&mut modules, 0b01010, 5);
    for &digit in &digits[7..] {
        push_modules(&mut modules, !EAN_L[digit] & 0x7f, 7);
    }
    push_modules(&mut modules, 0b101, 3);
    modules
}

/// A white `frame_size` luma frame with full-height EAN-13 bars for `code`
/// centered in it, `module_px` pixels per module.
pub fn ean13_frame(code: &str, frame_size: Size, module_px: u32) -> Vec<u8> {
    let modules = ean13_modules(code);
    let (fw, fh) = (frame_size.width, frame_size.height);
    let symbol_width = modules.len() as u32 * module_px;
    assert!(symbol_width <= fw, "symbol wider than frame");
    let left = (fw - symbol_width) / 2;

    let mut row = vec![255u8; fw as usize];
    for (i, &dark) in modules.iter().enumerate() {
        if dark {
            let start = (left + i as u32 * module_px) as usize;
            row[start..start + module_px as usize].fill(0);
        }
    }
    row.repeat(fh as usize)
}
