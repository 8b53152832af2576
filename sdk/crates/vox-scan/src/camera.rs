//! Camera resource.
//!
//! Wraps a camera driver handle and expects to be the only one talking to
//! it. Control calls come from the host thread while frames and auto-focus
//! run on other threads, so every mutating operation goes through one lock.
//! Decode tasks read the preview crop through a lock-free snapshot instead.

use arc_swap::ArcSwapOption;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ScanConfig;
use crate::error::{DriverError, Result, ScanError};
use crate::frame::{FrameBuffer, LumaRegion};
use crate::geometry::{best_preview_size, FramingGeometry, Rect, ScannerType, Size};

/// Single-delivery frame callback. The driver drops it after one call.
pub type FrameCallback = Box<dyn FnOnce(FrameBuffer) + Send + 'static>;

/// Which way a camera faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFacing {
    Back,
    Front,
}

/// Static facts about a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraInfo {
    pub facing: CameraFacing,
    /// Clockwise rotation of the sensor image relative to the device's
    /// natural orientation, in degrees.
    pub orientation: u32,
}

/// Host surface the driver draws preview frames into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceTarget {
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusMode {
    Auto,
    ContinuousPicture,
    Macro,
    Fixed,
}

impl FocusMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FocusMode::Auto => "auto",
            FocusMode::ContinuousPicture => "continuous-picture",
            FocusMode::Macro => "macro",
            FocusMode::Fixed => "fixed",
        }
    }
}

impl FromStr for FocusMode {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(FocusMode::Auto),
            "continuous-picture" => Ok(FocusMode::ContinuousPicture),
            "macro" => Ok(FocusMode::Macro),
            "fixed" => Ok(FocusMode::Fixed),
            _ => Err(()),
        }
    }
}

/// Capture parameters as exchanged with the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraParameters {
    pub preview_size: Option<Size>,
    pub supported_preview_sizes: Vec<Size>,
    pub focus_mode: FocusMode,
    pub supported_focus_modes: Vec<FocusMode>,
    pub torch: bool,
    /// Driver-specific keys this crate does not interpret.
    pub extra: BTreeMap<String, String>,
}

impl Default for CameraParameters {
    fn default() -> Self {
        CameraParameters {
            preview_size: None,
            supported_preview_sizes: Vec::new(),
            focus_mode: FocusMode::Fixed,
            supported_focus_modes: vec![FocusMode::Fixed],
            torch: false,
            extra: BTreeMap::new(),
        }
    }
}

const KEY_PREVIEW_SIZE: &str = "preview-size";
const KEY_PREVIEW_SIZES: &str = "preview-size-values";
const KEY_FOCUS_MODE: &str = "focus-mode";
const KEY_FOCUS_MODES: &str = "focus-mode-values";
const KEY_FLASH_MODE: &str = "flash-mode";

fn parse_size(s: &str) -> Option<Size> {
    let (w, h) = s.split_once('x')?;
    Some(Size::new(w.trim().parse().ok()?, h.trim().parse().ok()?))
}

impl CameraParameters {
    /// Serialize to the driver's `key=value;key=value` form.
    pub fn flatten(&self) -> String {
        let mut pairs: Vec<String> = Vec::new();
        if let Some(size) = self.preview_size {
            pairs.push(format!("{}={}", KEY_PREVIEW_SIZE, size));
        }
        if !self.supported_preview_sizes.is_empty() {
            let sizes: Vec<String> = self
                .supported_preview_sizes
                .iter()
                .map(ToString::to_string)
                .collect();
            pairs.push(format!("{}={}", KEY_PREVIEW_SIZES, sizes.join(",")));
        }
        pairs.push(format!("{}={}", KEY_FOCUS_MODE, self.focus_mode.as_str()));
        let modes: Vec<&str> = self
            .supported_focus_modes
            .iter()
            .map(|m| m.as_str())
            .collect();
        pairs.push(format!("{}={}", KEY_FOCUS_MODES, modes.join(",")));
        pairs.push(format!(
            "{}={}",
            KEY_FLASH_MODE,
            if self.torch { "torch" } else { "off" }
        ));
        for (key, value) in &self.extra {
            pairs.push(format!("{}={}", key, value));
        }
        pairs.join(";")
    }

    /// Parse the form produced by [`CameraParameters::flatten`].
    ///
    /// Unknown keys land in `extra`; malformed values are skipped.
    pub fn unflatten(flat: &str) -> Self {
        let mut params = CameraParameters::default();
        for pair in flat.split(';').filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                KEY_PREVIEW_SIZE => params.preview_size = parse_size(value),
                KEY_PREVIEW_SIZES => {
                    params.supported_preview_sizes = value.split(',').filter_map(parse_size).collect()
                }
                KEY_FOCUS_MODE => {
                    if let Ok(mode) = value.parse() {
                        params.focus_mode = mode;
                    }
                }
                KEY_FOCUS_MODES => {
                    params.supported_focus_modes =
                        value.split(',').filter_map(|m| m.parse().ok()).collect()
                }
                KEY_FLASH_MODE => params.torch = value == "torch",
                _ => {
                    params.extra.insert(key.to_string(), value.to_string());
                }
            }
        }
        params
    }
}

/// Opens cameras.
pub trait CameraDriver: Send + Sync {
    /// Open a camera. A negative id asks for the default camera. `None`
    /// means the driver could not produce a handle.
    fn open(&self, camera_id: i32) -> Option<Arc<dyn CameraHandle>>;

    fn camera_info(&self, _camera_id: i32) -> Option<CameraInfo> {
        None
    }
}

/// An open camera.
///
/// Implementations must be callable from any thread. One-shot callbacks may
/// be invoked on a driver-owned thread.
pub trait CameraHandle: Send + Sync {
    fn set_preview_target(&self, surface: &SurfaceTarget) -> std::result::Result<(), DriverError>;
    fn set_display_orientation(&self, degrees: u32);
    fn parameters(&self) -> Option<CameraParameters>;
    fn set_parameters(&self, params: &CameraParameters) -> std::result::Result<(), DriverError>;
    fn start_preview(&self) -> std::result::Result<(), DriverError>;
    fn stop_preview(&self);
    /// Run one auto-focus pass.
    fn auto_focus(&self);
    fn cancel_auto_focus(&self);
    /// Deliver the next preview frame to `callback`, once. A newer request
    /// replaces an older one that has not fired yet.
    fn request_one_shot_frame(&self, callback: FrameCallback);
    fn release(&self);
}

/// Rotation to apply to the preview so it shows upright on the display.
///
/// `sensor` is the camera's mounting orientation and `display_rotation` the
/// display's rotation from its natural orientation, both in degrees. Front
/// cameras are mirrored, which is compensated for.
pub fn display_orientation(facing: CameraFacing, sensor: u32, display_rotation: u32) -> u32 {
    let sensor = sensor % 360;
    let degrees = display_rotation % 360;
    match facing {
        CameraFacing::Front => (360 - (sensor + degrees) % 360) % 360,
        CameraFacing::Back => (sensor + 360 - degrees) % 360,
    }
}

/// Periodic auto-focus on a background thread.
///
/// Stopping waits for a pass in progress to finish, so once `stop` returns
/// the handle sees no further focus calls from this cycle.
struct AutoFocus {
    stop_tx: mpsc::Sender<()>,
    handle: Arc<dyn CameraHandle>,
    thread: Option<JoinHandle<()>>,
}

impl AutoFocus {
    fn start(handle: Arc<dyn CameraHandle>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let camera = handle.clone();
        let spawned = thread::Builder::new()
            .name("vox-scan-autofocus".into())
            .spawn(move || loop {
                if !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
                    break;
                }
                camera.auto_focus();
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            });
        let thread = match spawned {
            Ok(thread) => Some(thread),
            Err(e) => {
                tracing::warn!("Could not start auto-focus thread: {}", e);
                None
            }
        };
        AutoFocus {
            stop_tx,
            handle,
            thread,
        }
    }

    fn stop(mut self) {
        let _ = self.stop_tx.send(());
        self.handle.cancel_auto_focus();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Auto-focus thread panicked");
            }
        }
    }
}

struct CameraState {
    handle: Option<Arc<dyn CameraHandle>>,
    initialized: bool,
    previewing: bool,
    display_orientation: u32,
    requested_camera_id: i32,
    autofocus_interval: Duration,
    auto_focus: Option<AutoFocus>,
    /// Preview size in sensor orientation, chosen on first open.
    camera_preview_size: Option<Size>,
    geometry: FramingGeometry,
}

/// The session's camera.
pub struct CameraResource {
    driver: Arc<dyn CameraDriver>,
    state: Mutex<CameraState>,
    preview_crop: ArcSwapOption<Rect>,
}

impl CameraResource {
    pub fn new(driver: Arc<dyn CameraDriver>, config: &ScanConfig) -> Self {
        CameraResource {
            driver,
            state: Mutex::new(CameraState {
                handle: None,
                initialized: false,
                previewing: false,
                display_orientation: config.display_orientation,
                requested_camera_id: config.camera_id,
                autofocus_interval: config.autofocus_interval(),
                auto_focus: None,
                camera_preview_size: None,
                geometry: FramingGeometry::new(config.scanner_type),
            }),
            preview_crop: ArcSwapOption::empty(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CameraState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recompute the preview crop and publish it to decode tasks.
    fn publish_geometry(&self, state: &mut CameraState) {
        let rect = if state.handle.is_some() {
            state.geometry.preview_rect()
        } else {
            None
        };
        self.preview_crop.store(rect.map(Arc::new));
    }

    /// Open the camera and configure it for a `width` x `height` view.
    ///
    /// Does nothing when the camera is already open. Fails only when the
    /// driver cannot produce a handle; rejected parameters are worked around.
    pub fn open(&self, surface: &SurfaceTarget, width: u32, height: u32) -> Result<()> {
        let mut state = self.lock();
        if state.handle.is_some() {
            return Ok(());
        }

        let camera_id = state.requested_camera_id;
        let Some(handle) = self.driver.open(camera_id) else {
            tracing::warn!("Camera {} failed to open", camera_id);
            return Err(ScanError::CameraOpen { camera_id });
        };
        tracing::info!("Opened camera {}", camera_id);

        if let Err(e) = handle.set_preview_target(surface) {
            tracing::warn!("Could not attach preview surface {:?}: {}", surface, e);
        }
        handle.set_display_orientation(state.display_orientation);

        if !state.initialized {
            state.initialized = true;
            let screen = Size::new(width, height);
            let current = handle.parameters().unwrap_or_default();
            state.camera_preview_size =
                best_preview_size(&current.supported_preview_sizes, screen, current.preview_size);
            state.geometry.set_screen_resolution(screen);
            tracing::debug!(
                "Screen resolution {}, camera preview size {:?}",
                screen,
                state.camera_preview_size
            );
        }

        configure(handle.as_ref(), state.camera_preview_size);

        let preview = handle
            .parameters()
            .and_then(|p| p.preview_size)
            .or(state.camera_preview_size);
        let screen_is_portrait = state
            .geometry
            .screen_resolution()
            .map_or(false, |s| s.is_portrait());
        let on_screen = preview.map(|p| {
            if screen_is_portrait != p.is_portrait() {
                Size::new(p.height, p.width)
            } else {
                p
            }
        });

        state.handle = Some(handle);
        state.geometry.invalidate();
        state.geometry.set_preview_size(on_screen);
        self.publish_geometry(&mut state);
        Ok(())
    }

    /// Release the camera if it is open.
    pub fn close(&self) {
        let mut state = self.lock();
        if let Some(auto_focus) = state.auto_focus.take() {
            auto_focus.stop();
        }
        if let Some(handle) = state.handle.take() {
            if state.previewing {
                handle.stop_preview();
            }
            handle.release();
            tracing::info!("Camera released");
        }
        state.previewing = false;
        self.preview_crop.store(None);
    }

    /// Start drawing preview frames and the auto-focus cycle.
    pub fn start_preview(&self) {
        let mut state = self.lock();
        let Some(handle) = state.handle.clone() else {
            return;
        };
        if state.previewing {
            return;
        }
        if let Err(e) = handle.start_preview() {
            tracing::warn!("Camera refused to start preview: {}", e);
            return;
        }
        state.previewing = true;
        state.auto_focus = Some(AutoFocus::start(handle, state.autofocus_interval));
        tracing::debug!("Preview started");
    }

    /// Stop drawing preview frames.
    pub fn stop_preview(&self) {
        let mut state = self.lock();
        if let Some(auto_focus) = state.auto_focus.take() {
            auto_focus.stop();
        }
        if let Some(handle) = &state.handle {
            if state.previewing {
                handle.stop_preview();
                tracing::debug!("Preview stopped");
            }
        }
        state.previewing = false;
    }

    /// Switch the torch. Auto-focus is paused around the change so a focus
    /// pass does not race the flash state.
    pub fn set_torch(&self, enabled: bool) {
        let mut state = self.lock();
        let Some(handle) = state.handle.clone() else {
            return;
        };
        let Some(mut params) = handle.parameters() else {
            return;
        };
        if params.torch == enabled {
            return;
        }

        let was_focusing = match state.auto_focus.take() {
            Some(auto_focus) => {
                auto_focus.stop();
                true
            }
            None => false,
        };

        params.torch = enabled;
        match handle.set_parameters(&params) {
            Ok(()) => tracing::info!("Torch {}", if enabled { "on" } else { "off" }),
            Err(e) => tracing::warn!("Camera rejected torch change: {}", e),
        }

        if was_focusing {
            state.auto_focus = Some(AutoFocus::start(handle, state.autofocus_interval));
        }
    }

    pub fn torch_enabled(&self) -> bool {
        let state = self.lock();
        state
            .handle
            .as_ref()
            .and_then(|h| h.parameters())
            .map_or(false, |p| p.torch)
    }

    /// Ask the driver for the next preview frame.
    ///
    /// The frame handed to `callback` is labelled with the preview size as
    /// oriented on screen. Returns `false`, dropping `callback` unfired, when
    /// the camera is not open.
    pub fn request_one_shot_frame(&self, callback: FrameCallback) -> bool {
        let state = self.lock();
        let Some(handle) = &state.handle else {
            return false;
        };
        let on_screen = state.geometry.preview_size();
        handle.request_one_shot_frame(Box::new(move |frame| {
            callback(label_on_screen(frame, on_screen))
        }));
        true
    }

    /// The current preview crop, readable without taking the camera lock.
    pub fn preview_crop(&self) -> Option<Rect> {
        self.preview_crop.load_full().map(|rect| *rect)
    }

    /// Window a frame's luma plane to the preview framing rect.
    pub fn build_cropped_luminance<'a>(
        &self,
        buffer: &'a [u8],
        width: u32,
        height: u32,
    ) -> Option<LumaRegion<'a>> {
        let rect = self.preview_crop()?;
        LumaRegion::crop(buffer, Size::new(width, height), rect)
    }

    pub fn set_display_orientation(&self, degrees: u32) {
        let mut state = self.lock();
        state.display_orientation = degrees;
        if let Some(handle) = &state.handle {
            handle.set_display_orientation(degrees);
        }
    }

    pub fn display_orientation(&self) -> u32 {
        self.lock().display_orientation
    }

    /// Pick the camera for the next open. Negative means no preference.
    pub fn set_preview_camera_id(&self, camera_id: i32) {
        self.lock().requested_camera_id = camera_id;
    }

    pub fn preview_camera_id(&self) -> i32 {
        self.lock().requested_camera_id
    }

    pub fn camera_info(&self) -> Option<CameraInfo> {
        let camera_id = self.preview_camera_id();
        let id = if camera_id < 0 { 0 } else { camera_id };
        self.driver.camera_info(id)
    }

    pub fn set_autofocus_interval(&self, interval: Duration) {
        let mut state = self.lock();
        state.autofocus_interval = interval;
        if let Some(auto_focus) = state.auto_focus.take() {
            auto_focus.stop();
            if let Some(handle) = state.handle.clone() {
                state.auto_focus = Some(AutoFocus::start(handle, interval));
            }
        }
    }

    /// Run an auto-focus pass now.
    pub fn force_auto_focus(&self) {
        let state = self.lock();
        if let Some(handle) = &state.handle {
            if state.previewing {
                handle.auto_focus();
            }
        }
    }

    /// Change the scan-area shape. Both framing rects are recomputed.
    pub fn switch_scanner_type(&self, scanner_type: ScannerType) {
        let mut state = self.lock();
        state.geometry.set_scanner_type(scanner_type);
        self.publish_geometry(&mut state);
        tracing::debug!("Scanner type switched to {:?}", scanner_type);
    }

    pub fn scanner_type(&self) -> ScannerType {
        self.lock().geometry.scanner_type()
    }

    /// The on-screen framing rect, once the camera has been opened.
    pub fn framing_rect(&self) -> Option<Rect> {
        let mut state = self.lock();
        state.handle.as_ref()?;
        state.geometry.screen_rect()
    }

    pub fn framing_rect_in_preview(&self) -> Option<Rect> {
        let mut state = self.lock();
        state.handle.as_ref()?;
        state.geometry.preview_rect()
    }

    /// Preview size in screen orientation.
    pub fn preview_size(&self) -> Option<Size> {
        self.lock().geometry.preview_size()
    }

    pub fn is_open(&self) -> bool {
        self.lock().handle.is_some()
    }

    pub fn is_previewing(&self) -> bool {
        self.lock().previewing
    }
}

impl Drop for CameraResource {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for CameraResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CameraResource")
            .field("open", &state.handle.is_some())
            .field("previewing", &state.previewing)
            .field("camera_id", &state.requested_camera_id)
            .field("scanner_type", &state.geometry.scanner_type())
            .finish()
    }
}

/// Drivers report sensor dimensions. Frames of the same area as the
/// on-screen preview take its orientation.
fn label_on_screen(frame: FrameBuffer, on_screen: Option<Size>) -> FrameBuffer {
    match on_screen {
        Some(size) if size.area() == frame.size().area() => FrameBuffer {
            width: size.width,
            height: size.height,
            ..frame
        },
        _ => frame,
    }
}

/// Apply the desired parameters, falling back to the saved snapshot plus
/// safe-mode parameters when the driver rejects them.
fn configure(handle: &dyn CameraHandle, preview: Option<Size>) {
    let saved = handle.parameters().map(|p| p.flatten());
    let Err(e) = apply_desired(handle, preview, false) else {
        return;
    };
    tracing::warn!(
        "Camera rejected parameters ({}), setting only minimal safe-mode parameters",
        e
    );
    let Some(saved) = saved else {
        return;
    };
    tracing::info!("Resetting to saved camera params: {}", saved);
    let restored = CameraParameters::unflatten(&saved);
    let retry = handle
        .set_parameters(&restored)
        .and_then(|()| apply_desired(handle, preview, true));
    if let Err(e) = retry {
        tracing::warn!(
            "Camera rejected even safe-mode parameters ({}), no configuration",
            e
        );
    }
}

fn apply_desired(
    handle: &dyn CameraHandle,
    preview: Option<Size>,
    safe_mode: bool,
) -> std::result::Result<(), DriverError> {
    let mut params = handle
        .parameters()
        .ok_or_else(|| DriverError::Failure("no parameters available".into()))?;
    if let Some(size) = preview {
        params.preview_size = Some(size);
    }
    if !safe_mode {
        let preferred = [
            FocusMode::Auto,
            FocusMode::ContinuousPicture,
            FocusMode::Macro,
        ];
        if let Some(mode) = preferred
            .into_iter()
            .find(|m| params.supported_focus_modes.contains(m))
        {
            params.focus_mode = mode;
        }
    }
    handle.set_parameters(&params)
}
