//! Python bindings.

use pyo3::prelude::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::camera::SurfaceTarget;
use crate::config::ScanConfig;
use crate::decoder::{DecodeFormats, MultiFormatDecoder};
use crate::error::ScanError;
use crate::geometry::{ScannerType, Size};
use crate::native::NokhwaDriver;
use crate::session::{ScanSession, SessionState, StopReason};

fn runtime_error(message: impl Into<String>) -> PyErr {
    PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(message.into())
}

impl From<ScanError> for PyErr {
    fn from(e: ScanError) -> Self {
        runtime_error(e.to_string())
    }
}

fn parse_scanner_type(kind: &str) -> PyResult<ScannerType> {
    match kind {
        "qr" => Ok(ScannerType::Qr),
        "linear" | "bar" => Ok(ScannerType::Linear),
        other => Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(format!(
            "unknown scanner type {:?}, expected \"qr\" or \"linear\"",
            other
        ))),
    }
}

/// Barcode and QR scanner over the system camera.
///
/// Runs a background decode runtime. `callback(text)` is called once, from
/// a background thread, with the first decoded symbol.
#[pyclass]
struct VoxScanner {
    session: Mutex<ScanSession>,
}

impl VoxScanner {
    fn session(&self) -> MutexGuard<'_, ScanSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[pymethods]
impl VoxScanner {
    #[new]
    #[pyo3(signature = (callback, width, height, camera_id=-1, scanner_type="qr", qr_only=false))]
    fn new(
        callback: Py<PyAny>,
        width: u32,
        height: u32,
        camera_id: i32,
        scanner_type: &str,
        qr_only: bool,
    ) -> PyResult<Self> {
        let config = ScanConfig {
            scanner_type: parse_scanner_type(scanner_type)?,
            camera_id,
            formats: if qr_only {
                DecodeFormats::qr_only()
            } else {
                DecodeFormats::all()
            },
            ..Default::default()
        };
        let on_result = move |text: String| {
            Python::attach(|py| {
                if let Err(e) = callback.call1(py, (text,)) {
                    e.print(py);
                }
            });
        };
        let session = ScanSession::new(
            Arc::new(NokhwaDriver::new()),
            MultiFormatDecoder::factory(),
            config,
            SurfaceTarget::default(),
            Size::new(width, height),
            on_result,
        );
        Ok(VoxScanner {
            session: Mutex::new(session),
        })
    }

    /// Open the camera and start scanning.
    fn start(&self) -> PyResult<()> {
        self.session().start()?;
        Ok(())
    }

    /// Stop scanning and release the camera.
    fn stop(&self) -> PyResult<()> {
        self.session().stop();
        Ok(())
    }

    /// Turn the torch on or off, if the camera has one.
    fn set_torch(&self, enabled: bool) -> PyResult<()> {
        self.session().set_torch(enabled);
        Ok(())
    }

    /// Switch between the square QR scan area ("qr") and the wide bar code
    /// area ("linear").
    fn switch_scanner_type(&self, scanner_type: &str) -> PyResult<()> {
        let scanner_type = parse_scanner_type(scanner_type)?;
        self.session().switch_scanner_type(scanner_type);
        Ok(())
    }

    /// Choose the camera for the next start. -1 picks the default camera.
    fn set_preview_camera_id(&self, camera_id: i32) -> PyResult<()> {
        self.session().set_preview_camera_id(camera_id);
        Ok(())
    }

    /// Set the auto-focus period in milliseconds.
    fn set_autofocus_interval(&self, interval_ms: u64) -> PyResult<()> {
        if interval_ms == 0 {
            return Err(runtime_error("auto-focus interval must be positive"));
        }
        self.session()
            .set_autofocus_interval(Duration::from_millis(interval_ms));
        Ok(())
    }

    /// Run an auto-focus pass now, if the preview is running.
    fn force_auto_focus(&self) -> PyResult<()> {
        self.session().force_auto_focus();
        Ok(())
    }

    fn set_display_rotation(&self, degrees: u32) -> PyResult<()> {
        if degrees % 90 != 0 {
            return Err(runtime_error(format!(
                "display rotation must be a multiple of 90, got {}",
                degrees
            )));
        }
        self.session().set_display_rotation(degrees);
        Ok(())
    }

    /// "idle", "previewing", "delivered" or "aborted".
    #[getter]
    fn state(&self) -> &'static str {
        match self.session().state() {
            SessionState::Idle => "idle",
            SessionState::Previewing => "previewing",
            SessionState::Stopped(StopReason::Delivered) => "delivered",
            SessionState::Stopped(StopReason::Aborted) => "aborted",
        }
    }

    #[getter]
    fn is_torch_enabled(&self) -> bool {
        self.session().torch_enabled()
    }

    /// The on-screen scan area as (left, top, right, bottom), once the
    /// camera is open.
    #[getter]
    fn framing_rect(&self) -> Option<(u32, u32, u32, u32)> {
        self.session()
            .framing_rect()
            .map(|r| (r.left, r.top, r.right, r.bottom))
    }
}

/// Python module definition.
#[pymodule]
fn vox_scan(m: &Bound<'_, PyModule>) -> PyResult<()> {
    crate::logging::init();
    m.add_class::<VoxScanner>()?;
    Ok(())
}
