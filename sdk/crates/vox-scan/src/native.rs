//! Camera driver over nokhwa's native capture backends.
//!
//! nokhwa cameras are not `Send`, so each open camera lives on its own
//! thread and the handle talks to it over a command channel.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use nokhwa::pixel_format::LumaFormat;
use nokhwa::utils::{
    ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;

use crate::camera::{
    CameraDriver, CameraFacing, CameraHandle, CameraInfo, CameraParameters, FocusMode,
    FrameCallback, SurfaceTarget,
};
use crate::error::DriverError;
use crate::frame::FrameBuffer;
use crate::geometry::Size;

/// Opens webcams through nokhwa. Camera ids index the system's camera list.
#[derive(Debug, Default, Clone, Copy)]
pub struct NokhwaDriver;

impl NokhwaDriver {
    pub fn new() -> Self {
        NokhwaDriver
    }
}

impl CameraDriver for NokhwaDriver {
    fn open(&self, camera_id: i32) -> Option<Arc<dyn CameraHandle>> {
        let index = camera_id.max(0) as u32;
        let (ready_tx, ready_rx) = mpsc::channel();
        let (cmd_tx, cmd_rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name(format!("vox-scan-camera-{}", index))
            .spawn(move || {
                let format =
                    RequestedFormat::new::<LumaFormat>(RequestedFormatType::AbsoluteHighestResolution);
                match Camera::new(CameraIndex::Index(index), format) {
                    Ok(camera) => {
                        let _ = ready_tx.send(true);
                        run_camera(camera, cmd_rx);
                    }
                    Err(e) => {
                        tracing::warn!("Nokhwa could not open camera {}: {}", index, e);
                        let _ = ready_tx.send(false);
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Could not start camera thread: {}", e);
            return None;
        }

        match ready_rx.recv() {
            Ok(true) => Some(Arc::new(NokhwaHandle { commands: cmd_tx })),
            _ => None,
        }
    }

    fn camera_info(&self, camera_id: i32) -> Option<CameraInfo> {
        let cameras = match nokhwa::query(ApiBackend::Auto) {
            Ok(cameras) => cameras,
            Err(e) => {
                tracing::debug!("Camera query failed: {}", e);
                return None;
            }
        };
        let index = usize::try_from(camera_id.max(0)).ok()?;
        cameras.get(index)?;
        // Desktop backends report neither facing nor mounting angle.
        Some(CameraInfo {
            facing: CameraFacing::Back,
            orientation: 0,
        })
    }
}

enum Command {
    Parameters(Sender<Option<CameraParameters>>),
    SetParameters(CameraParameters, Sender<Result<(), DriverError>>),
    StartPreview(Sender<Result<(), DriverError>>),
    StopPreview,
    OneShot(FrameCallback),
    Release,
}

struct NokhwaHandle {
    commands: Sender<Command>,
}

impl NokhwaHandle {
    fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    fn ask<T>(&self, make: impl FnOnce(Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = mpsc::channel();
        if !self.send(make(tx)) {
            return None;
        }
        rx.recv().ok()
    }
}

fn closed() -> DriverError {
    DriverError::Failure("camera thread has exited".into())
}

impl CameraHandle for NokhwaHandle {
    fn set_preview_target(&self, surface: &SurfaceTarget) -> Result<(), DriverError> {
        tracing::trace!("Preview surface {} managed by host", surface.id);
        Ok(())
    }

    fn set_display_orientation(&self, degrees: u32) {
        tracing::trace!("Display orientation {} ignored by desktop capture", degrees);
    }

    fn parameters(&self) -> Option<CameraParameters> {
        self.ask(Command::Parameters).flatten()
    }

    fn set_parameters(&self, params: &CameraParameters) -> Result<(), DriverError> {
        let params = params.clone();
        self.ask(|tx| Command::SetParameters(params, tx))
            .unwrap_or_else(|| Err(closed()))
    }

    fn start_preview(&self) -> Result<(), DriverError> {
        self.ask(Command::StartPreview)
            .unwrap_or_else(|| Err(closed()))
    }

    fn stop_preview(&self) {
        self.send(Command::StopPreview);
    }

    fn auto_focus(&self) {}

    fn cancel_auto_focus(&self) {}

    fn request_one_shot_frame(&self, callback: FrameCallback) {
        self.send(Command::OneShot(callback));
    }

    fn release(&self) {
        self.send(Command::Release);
    }
}

impl Drop for NokhwaHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Release);
    }
}

fn read_parameters(camera: &mut Camera) -> CameraParameters {
    let current = camera.resolution();
    let mut sizes: Vec<Size> = Vec::new();
    match camera.compatible_camera_formats() {
        Ok(formats) => {
            for format in formats {
                let res = format.resolution();
                let size = Size::new(res.width(), res.height());
                if !sizes.contains(&size) {
                    sizes.push(size);
                }
            }
        }
        Err(e) => tracing::debug!("Camera formats unavailable: {}", e),
    }
    CameraParameters {
        preview_size: Some(Size::new(current.width(), current.height())),
        supported_preview_sizes: sizes,
        focus_mode: FocusMode::Fixed,
        supported_focus_modes: vec![FocusMode::Fixed],
        torch: false,
        extra: Default::default(),
    }
}

fn apply_parameters(camera: &mut Camera, params: &CameraParameters) -> Result<(), DriverError> {
    if params.torch {
        return Err(DriverError::ParametersRejected(
            "torch is not supported by this camera".into(),
        ));
    }
    if let Some(size) = params.preview_size {
        let current = camera.resolution();
        if current.width() != size.width || current.height() != size.height {
            camera
                .set_resolution(Resolution::new(size.width, size.height))
                .map_err(|e| DriverError::ParametersRejected(e.to_string()))?;
        }
    }
    Ok(())
}

fn capture(camera: &mut Camera) -> Result<FrameBuffer, DriverError> {
    let frame = camera
        .frame()
        .map_err(|e| DriverError::Failure(e.to_string()))?;
    let image = frame
        .decode_image::<LumaFormat>()
        .map_err(|e| DriverError::Failure(e.to_string()))?;
    let (width, height) = (image.width(), image.height());
    Ok(FrameBuffer::new(image.into_raw(), width, height))
}

/// Camera thread: owns the nokhwa camera until released.
fn run_camera(mut camera: Camera, commands: Receiver<Command>) {
    let mut streaming = false;
    while let Ok(command) = commands.recv() {
        match command {
            Command::Parameters(reply) => {
                let _ = reply.send(Some(read_parameters(&mut camera)));
            }
            Command::SetParameters(params, reply) => {
                let _ = reply.send(apply_parameters(&mut camera, &params));
            }
            Command::StartPreview(reply) => {
                let result = if streaming {
                    Ok(())
                } else {
                    camera
                        .open_stream()
                        .map_err(|e| DriverError::Failure(e.to_string()))
                };
                streaming = result.is_ok();
                let _ = reply.send(result);
            }
            Command::StopPreview => {
                if streaming {
                    if let Err(e) = camera.stop_stream() {
                        tracing::debug!("Stop_stream failed: {}", e);
                    }
                    streaming = false;
                }
            }
            Command::OneShot(callback) => {
                if !streaming {
                    tracing::trace!("Frame requested while not streaming");
                    continue;
                }
                match capture(&mut camera) {
                    Ok(frame) => callback(frame),
                    Err(e) => tracing::debug!("Frame capture failed: {}", e),
                }
            }
            Command::Release => break,
        }
    }
    if streaming {
        let _ = camera.stop_stream();
    }
    tracing::debug!("Camera thread exiting");
}
