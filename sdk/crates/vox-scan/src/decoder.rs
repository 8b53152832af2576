//! Decoder contract and the bundled decoders.
//!
//! The symbol decoding itself is done by a [`Decoder`] implementation. The
//! pipeline only hands it cropped luma windows and resets it after every
//! attempt.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use zedbar::config::{Codabar, Code128, Code39, Code93, Ean13, Ean8, Upca, Upce, I25};
use zedbar::{DecoderConfig, Image, Scanner};

use crate::frame::LumaRegion;

/// Symbol formats a decoder can be asked to look for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolFormat {
    QrCode,
    DataMatrix,
    Ean13,
    Ean8,
    UpcA,
    UpcE,
    Code39,
    Code93,
    Code128,
    Itf,
    Codabar,
}

/// Groups of formats, as hosts usually select them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatFamily {
    /// 2D codes.
    Qr,
    /// Retail product codes (EAN/UPC).
    Product,
    /// Industrial 1D codes.
    Industrial,
}

impl SymbolFormat {
    pub const ALL: [SymbolFormat; 11] = [
        SymbolFormat::QrCode,
        SymbolFormat::DataMatrix,
        SymbolFormat::Ean13,
        SymbolFormat::Ean8,
        SymbolFormat::UpcA,
        SymbolFormat::UpcE,
        SymbolFormat::Code39,
        SymbolFormat::Code93,
        SymbolFormat::Code128,
        SymbolFormat::Itf,
        SymbolFormat::Codabar,
    ];

    pub fn family(self) -> FormatFamily {
        match self {
            SymbolFormat::QrCode | SymbolFormat::DataMatrix => FormatFamily::Qr,
            SymbolFormat::Ean13 | SymbolFormat::Ean8 | SymbolFormat::UpcA | SymbolFormat::UpcE => {
                FormatFamily::Product
            }
            SymbolFormat::Code39
            | SymbolFormat::Code93
            | SymbolFormat::Code128
            | SymbolFormat::Itf
            | SymbolFormat::Codabar => FormatFamily::Industrial,
        }
    }
}

impl fmt::Display for SymbolFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SymbolFormat::QrCode => "QR-Code",
            SymbolFormat::DataMatrix => "DataMatrix",
            SymbolFormat::Ean13 => "EAN-13",
            SymbolFormat::Ean8 => "EAN-8",
            SymbolFormat::UpcA => "UPC-A",
            SymbolFormat::UpcE => "UPC-E",
            SymbolFormat::Code39 => "CODE-39",
            SymbolFormat::Code93 => "CODE-93",
            SymbolFormat::Code128 => "CODE-128",
            SymbolFormat::Itf => "ITF",
            SymbolFormat::Codabar => "Codabar",
        })
    }
}

/// The set of formats a decoder is enabled for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecodeFormats(BTreeSet<SymbolFormat>);

impl Default for DecodeFormats {
    fn default() -> Self {
        Self::all()
    }
}

impl DecodeFormats {
    pub fn all() -> Self {
        DecodeFormats(SymbolFormat::ALL.into_iter().collect())
    }

    pub fn none() -> Self {
        DecodeFormats(BTreeSet::new())
    }

    pub fn qr_only() -> Self {
        Self::family(FormatFamily::Qr)
    }

    pub fn family(family: FormatFamily) -> Self {
        DecodeFormats(
            SymbolFormat::ALL
                .into_iter()
                .filter(|f| f.family() == family)
                .collect(),
        )
    }

    pub fn with(mut self, format: SymbolFormat) -> Self {
        self.0.insert(format);
        self
    }

    pub fn without(mut self, format: SymbolFormat) -> Self {
        self.0.remove(&format);
        self
    }

    pub fn contains(&self, format: SymbolFormat) -> bool {
        self.0.contains(&format)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = SymbolFormat> + '_ {
        self.0.iter().copied()
    }
}

/// A stateful symbol decoder.
pub trait Decoder: Send {
    /// Try to decode one symbol from the window. `None` means no match.
    fn decode(&mut self, luma: &LumaRegion<'_>) -> Option<String>;

    /// Clear any state carried over from the previous attempt.
    fn reset(&mut self);
}

/// Builds decoders for a format set.
pub trait DecoderFactory: Send + Sync {
    fn create(&self, formats: &DecodeFormats) -> Box<dyn Decoder>;
}

impl<F> DecoderFactory for F
where
    F: Fn(&DecodeFormats) -> Box<dyn Decoder> + Send + Sync,
{
    fn create(&self, formats: &DecodeFormats) -> Box<dyn Decoder> {
        self(formats)
    }
}

/// Reusable decoders shared by the decode workers.
///
/// A worker checks a decoder out for one attempt. The decoder is reset and
/// returned afterwards, so no state leaks from one frame to the next.
#[derive(Clone)]
pub struct DecoderPool {
    factory: Arc<dyn DecoderFactory>,
    formats: DecodeFormats,
    idle: Arc<Mutex<Vec<Box<dyn Decoder>>>>,
}

impl DecoderPool {
    pub fn new(factory: Arc<dyn DecoderFactory>, formats: DecodeFormats) -> Self {
        DecoderPool {
            factory,
            formats,
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run one decode attempt, resetting the decoder afterwards.
    pub fn decode(&self, luma: &LumaRegion<'_>) -> Option<String> {
        let popped = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut decoder = popped.unwrap_or_else(|| self.factory.create(&self.formats));

        let result = decoder.decode(luma);
        decoder.reset();

        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(decoder);
        result.filter(|text| !text.is_empty())
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// QR decoder backed by `rqrr`.
///
/// Only QR codes are supported. When the enabled formats exclude QR, every
/// attempt reports no match.
pub struct RqrrDecoder {
    enabled: bool,
}

impl RqrrDecoder {
    pub fn new(formats: &DecodeFormats) -> Self {
        let enabled = formats.contains(SymbolFormat::QrCode);
        if !enabled {
            tracing::warn!("QR decoding disabled by format set {:?}", formats);
        }
        RqrrDecoder { enabled }
    }

    /// Factory for [`DecoderPool`].
    pub fn factory() -> Arc<dyn DecoderFactory> {
        Arc::new(|formats: &DecodeFormats| -> Box<dyn Decoder> {
            Box::new(RqrrDecoder::new(formats))
        })
    }
}

impl Decoder for RqrrDecoder {
    fn decode(&mut self, luma: &LumaRegion<'_>) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let mut prepared =
            rqrr::PreparedImage::prepare_from_greyscale(luma.width(), luma.height(), |x, y| {
                luma.pixel(x, y)
            });
        for grid in prepared.detect_grids() {
            match grid.decode() {
                Ok((_meta, content)) if !content.is_empty() => return Some(content),
                Ok(_) => {}
                Err(e) => tracing::trace!("QR grid failed to decode: {:?}", e),
            }
        }
        None
    }

    fn reset(&mut self) {}
}

/// 1D decoder backed by `zedbar`, for the product and industrial families.
///
/// QR and DataMatrix are left to other decoders.
pub struct ZedbarDecoder {
    config: Option<DecoderConfig>,
}

impl ZedbarDecoder {
    pub fn new(formats: &DecodeFormats) -> Self {
        let mut config = DecoderConfig::new().disable_all();
        let mut enabled = 0;
        for format in formats.iter() {
            config = match format {
                SymbolFormat::Ean13 => config.enable(Ean13),
                SymbolFormat::Ean8 => config.enable(Ean8),
                SymbolFormat::UpcA => config.enable(Upca),
                SymbolFormat::UpcE => config.enable(Upce),
                SymbolFormat::Code39 => config.enable(Code39),
                SymbolFormat::Code93 => config.enable(Code93),
                SymbolFormat::Code128 => config.enable(Code128),
                SymbolFormat::Itf => config.enable(I25),
                SymbolFormat::Codabar => config.enable(Codabar),
                SymbolFormat::QrCode | SymbolFormat::DataMatrix => continue,
            };
            enabled += 1;
        }
        ZedbarDecoder {
            config: (enabled > 0).then_some(config),
        }
    }

    pub fn factory() -> Arc<dyn DecoderFactory> {
        Arc::new(|formats: &DecodeFormats| -> Box<dyn Decoder> {
            Box::new(ZedbarDecoder::new(formats))
        })
    }
}

impl Decoder for ZedbarDecoder {
    fn decode(&mut self, luma: &LumaRegion<'_>) -> Option<String> {
        let config = self.config.as_ref()?;
        let data = luma.to_vec();
        let mut image = match Image::from_gray(&data, luma.width() as u32, luma.height() as u32) {
            Ok(image) => image,
            Err(e) => {
                tracing::trace!("Luma window rejected by zedbar: {:?}", e);
                return None;
            }
        };
        // The scanner is not Send, so each attempt builds its own.
        let mut scanner = Scanner::with_config(config.clone());
        let symbols = scanner.scan(&mut image);
        let text = symbols
            .iter()
            .map(|symbol| {
                String::from_utf8_lossy(symbol.data())
                    .trim_end_matches('\0')
                    .to_string()
            })
            .find(|text| !text.is_empty());
        text
    }

    fn reset(&mut self) {}
}

/// The default decoder: QR through `rqrr`, then 1D codes through `zedbar`.
///
/// Only the decoders the format set needs are built.
pub struct MultiFormatDecoder {
    decoders: Vec<Box<dyn Decoder>>,
}

impl MultiFormatDecoder {
    pub fn new(formats: &DecodeFormats) -> Self {
        let mut decoders: Vec<Box<dyn Decoder>> = Vec::new();
        if formats.contains(SymbolFormat::QrCode) {
            decoders.push(Box::new(RqrrDecoder::new(formats)));
        }
        if formats
            .iter()
            .any(|f| f.family() != FormatFamily::Qr)
        {
            decoders.push(Box::new(ZedbarDecoder::new(formats)));
        }
        if decoders.is_empty() {
            tracing::warn!("No bundled decoder handles format set {:?}", formats);
        }
        MultiFormatDecoder { decoders }
    }

    pub fn factory() -> Arc<dyn DecoderFactory> {
        Arc::new(|formats: &DecodeFormats| -> Box<dyn Decoder> {
            Box::new(MultiFormatDecoder::new(formats))
        })
    }
}

impl Decoder for MultiFormatDecoder {
    fn decode(&mut self, luma: &LumaRegion<'_>) -> Option<String> {
        self.decoders.iter_mut().find_map(|d| d.decode(luma))
    }

    fn reset(&mut self) {
        for decoder in &mut self.decoders {
            decoder.reset();
        }
    }
}
