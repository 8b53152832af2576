//! Scan session: the host-facing orchestrator.
//!
//! A session opens the camera, runs one decode pipeline on a background
//! tokio runtime and hands the first decoded symbol to the host. It ends
//! either when that happens or when the host stops it, whichever comes
//! first; the loser of that race has no effect.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::camera::{display_orientation, CameraDriver, CameraResource, SurfaceTarget};
use crate::config::ScanConfig;
use crate::decoder::{DecoderFactory, DecoderPool};
use crate::error::Result;
use crate::geometry::{Rect, ScannerType, Size};
use crate::pipeline::{DecodePipeline, PipelineConfig, PipelineHandle, PipelineStats};

pub use crate::pipeline::ScanCallback;

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A symbol was decoded and handed to the host.
    Delivered,
    /// The host stopped the session.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Previewing,
    Stopped(StopReason),
}

impl SessionState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, SessionState::Stopped(_))
    }
}

fn lock_state(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scan, from camera open to a single decoded result.
pub struct ScanSession {
    config: ScanConfig,
    camera: Arc<CameraResource>,
    decoders: DecoderPool,
    surface: SurfaceTarget,
    view: Size,
    state: Arc<Mutex<SessionState>>,
    callback: Option<ScanCallback>,
    pipeline: Option<PipelineHandle>,
    runtime_thread: Option<JoinHandle<()>>,
}

impl ScanSession {
    /// Create a session drawing into `surface`, a view of size `view`.
    ///
    /// `callback` receives the decoded text, at most once.
    pub fn new<F>(
        driver: Arc<dyn CameraDriver>,
        decoders: Arc<dyn DecoderFactory>,
        config: ScanConfig,
        surface: SurfaceTarget,
        view: Size,
        callback: F,
    ) -> Self
    where
        F: FnOnce(String) + Send + 'static,
    {
        let camera = Arc::new(CameraResource::new(driver, &config));
        let decoders = DecoderPool::new(decoders, config.formats.clone());
        ScanSession {
            config,
            camera,
            decoders,
            surface,
            view,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            callback: Some(Box::new(callback)),
            pipeline: None,
            runtime_thread: None,
        }
    }

    /// Open the camera, start the preview and begin decoding.
    ///
    /// Only acts in `Idle`. On error the session stays `Idle` and may be
    /// started again.
    pub fn start(&mut self) -> Result<()> {
        let current = self.state();
        if current != SessionState::Idle {
            tracing::debug!("Start ignored in state {:?}", current);
            return Ok(());
        }
        self.config.validate()?;

        self.camera
            .open(&self.surface, self.view.width, self.view.height)?;
        self.camera.start_preview();

        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(self.config.pool_capacity)
            .thread_name("vox-scan-decode")
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                self.release_camera();
                return Err(e.into());
            }
        };

        let Some(callback) = self.callback.take() else {
            tracing::warn!("Scan session has no callback left");
            self.release_camera();
            return Ok(());
        };
        let state = self.state.clone();
        let camera = self.camera.clone();
        let on_success: ScanCallback = Box::new(move |text| {
            {
                let mut state = lock_state(&state);
                if *state != SessionState::Previewing {
                    tracing::debug!("Decoded result dropped in state {:?}", *state);
                    return;
                }
                *state = SessionState::Stopped(StopReason::Delivered);
            }
            callback(text);
            camera.stop_preview();
            camera.close();
        });

        let pipeline = DecodePipeline::new(
            self.camera.clone(),
            self.decoders.clone(),
            PipelineConfig::from(&self.config),
            on_success,
        );
        self.pipeline = Some(pipeline.handle());
        *lock_state(&self.state) = SessionState::Previewing;

        let spawned = std::thread::Builder::new()
            .name("vox-scan-runtime".into())
            .spawn(move || {
                runtime.block_on(pipeline.run());
            });
        match spawned {
            Ok(handle) => {
                self.runtime_thread = Some(handle);
                tracing::info!("Scan session started ({:?})", self.camera.scanner_type());
                Ok(())
            }
            Err(e) => {
                *lock_state(&self.state) = SessionState::Stopped(StopReason::Aborted);
                self.release_camera();
                Err(e.into())
            }
        }
    }

    /// Stop the session. Safe to call at any time and more than once.
    ///
    /// Pending decodes are abandoned; the callback will not fire after this
    /// returns.
    pub fn stop(&mut self) {
        {
            let mut state = lock_state(&self.state);
            if state.is_stopped() {
                return;
            }
            *state = SessionState::Stopped(StopReason::Aborted);
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.stop();
        }
        self.release_camera();
        tracing::info!("Scan session stopped");
    }

    /// Wait for the pipeline thread to exit. Returns at once if it never
    /// started.
    pub fn join(&mut self) {
        if let Some(handle) = self.runtime_thread.take() {
            if handle.join().is_err() {
                tracing::warn!("Scan runtime thread panicked");
            }
        }
    }

    fn release_camera(&self) {
        self.camera.stop_preview();
        self.camera.close();
    }

    pub fn state(&self) -> SessionState {
        *lock_state(&self.state)
    }

    pub fn set_torch(&self, enabled: bool) {
        self.camera.set_torch(enabled);
    }

    pub fn torch_enabled(&self) -> bool {
        self.camera.torch_enabled()
    }

    pub fn switch_scanner_type(&mut self, scanner_type: ScannerType) {
        self.config.scanner_type = scanner_type;
        self.camera.switch_scanner_type(scanner_type);
    }

    /// Choose the camera used by the next start.
    pub fn set_preview_camera_id(&mut self, camera_id: i32) {
        self.config.camera_id = camera_id;
        self.camera.set_preview_camera_id(camera_id);
    }

    /// Change the auto-focus period. A running cycle restarts with it.
    pub fn set_autofocus_interval(&mut self, interval: Duration) {
        self.config.autofocus_interval_ms = interval.as_millis().try_into().unwrap_or(u64::MAX);
        self.camera.set_autofocus_interval(interval);
    }

    /// Focus now instead of waiting for the next cycle. Only while previewing.
    pub fn force_auto_focus(&self) {
        self.camera.force_auto_focus();
    }

    /// Tell the session how far the display is rotated from its natural
    /// orientation, in degrees.
    pub fn set_display_rotation(&self, degrees: u32) {
        let orientation = match self.camera.camera_info() {
            Some(info) => display_orientation(info.facing, info.orientation, degrees),
            None => degrees % 360,
        };
        tracing::debug!(
            "Display rotated {} degrees, preview orientation {}",
            degrees,
            orientation
        );
        self.camera.set_display_orientation(orientation);
    }

    /// The on-screen scan area, for drawing an overlay.
    pub fn framing_rect(&self) -> Option<Rect> {
        self.camera.framing_rect()
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline
            .as_ref()
            .map(PipelineHandle::stats)
            .unwrap_or_default()
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.stop();
    }
}
