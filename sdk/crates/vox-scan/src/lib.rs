//! Camera barcode and QR scanning.
//!
//! A [`ScanSession`] opens a camera through a [`CameraDriver`], samples
//! preview frames one at a time and decodes them on a bounded pool of
//! workers until a symbol is found. The first result is handed to the host
//! exactly once; stopping the session at any point abandons pending work.
//!
//! The symbol decoding itself is pluggable through [`Decoder`]. The bundled
//! [`MultiFormatDecoder`] reads QR codes with `rqrr` and 1D codes with
//! `zedbar`. With the `native-camera` feature a webcam
//! driver over `nokhwa` is available, and the `python` feature builds the
//! `vox_scan` extension module.

pub mod camera;
pub mod config;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod logging;
pub mod pipeline;
pub mod session;

#[cfg(feature = "native-camera")]
pub mod native;
#[cfg(feature = "python")]
mod python;

#[cfg(test)]
mod mock;

pub use camera::{
    CameraDriver, CameraFacing, CameraHandle, CameraInfo, CameraParameters, CameraResource,
    FrameCallback, SurfaceTarget,
};
pub use config::ScanConfig;
pub use decoder::{
    DecodeFormats, Decoder, DecoderFactory, MultiFormatDecoder, RqrrDecoder, SymbolFormat,
    ZedbarDecoder,
};
pub use error::{DriverError, Result, ScanError};
pub use frame::{FrameBuffer, LumaRegion};
pub use geometry::{Rect, ScannerType, Size};
pub use pipeline::PipelineStats;
pub use session::{ScanCallback, ScanSession, SessionState, StopReason};
