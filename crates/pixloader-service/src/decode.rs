//! Decoding of encoded image bytes into bitmaps, and post-processing of those.

use std::borrow::Cow;
use std::fmt;
use std::io::Cursor;
use std::sync::{Arc, Mutex, PoisonError};

use image::imageops::FilterType;
use image::{ImageReader, Rgba, RgbaImage};

use crate::source::ByteSource;
use crate::types::TargetSize;

struct BitmapInner {
    width: u32,
    height: u32,
    pixels: Mutex<Option<RgbaImage>>,
}

/// A handle to decoded RGBA pixels.
///
/// Clones share the same pixels. Once [`recycle`](Self::recycle) is called on any handle, the
/// pixels are released for all of them.
#[derive(Clone)]
pub struct Bitmap {
    inner: Arc<BitmapInner>,
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("recycled", &self.is_recycled())
            .finish()
    }
}

impl Bitmap {
    pub fn new(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            inner: Arc::new(BitmapInner {
                width,
                height,
                pixels: Mutex::new(Some(image)),
            }),
        }
    }

    /// A bitmap filled with a single color.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self::new(RgbaImage::from_pixel(width, height, Rgba(rgba)))
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    /// The size of the decoded pixels in bytes.
    pub fn byte_size(&self) -> u64 {
        u64::from(self.inner.width) * u64::from(self.inner.height) * 4
    }

    /// Releases the pixels of this bitmap.
    pub fn recycle(&self) {
        self.pixels().take();
    }

    pub fn is_recycled(&self) -> bool {
        self.pixels().is_none()
    }

    /// Whether both handles refer to the same bitmap.
    pub fn ptr_eq(&self, other: &Bitmap) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs `f` on the pixels, unless the bitmap was recycled.
    pub fn with_pixels<R>(&self, f: impl FnOnce(&RgbaImage) -> R) -> Option<R> {
        self.pixels().as_ref().map(f)
    }

    fn pixels(&self) -> std::sync::MutexGuard<'_, Option<RgbaImage>> {
        self.inner
            .pixels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Turns encoded image bytes into a [`Bitmap`].
pub trait Decoder: fmt::Debug + Send + Sync {
    /// Decodes `source`, scaling towards `target`.
    ///
    /// Returns `None` on any error.
    fn decode(&self, source: &ByteSource, target: TargetSize) -> Option<Bitmap>;
}

/// A transformation applied to freshly decoded bitmaps.
pub trait PostProcessor: fmt::Debug + Send + Sync {
    /// Processes `bitmap`.
    ///
    /// Returning a clone of the input handle keeps the input. Returning a different bitmap
    /// makes the input obsolete, and it is recycled right away.
    fn process(&self, bitmap: &Bitmap) -> Bitmap;

    /// Distinguishes the output of this processor in request keys.
    fn variant(&self) -> Cow<'_, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }
}

/// The default [`Decoder`], based on the `image` crate.
///
/// Images are downsampled by the largest power of two that keeps them at least as large as
/// the target size.
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterDecoder;

impl Decoder for RasterDecoder {
    fn decode(&self, source: &ByteSource, target: TargetSize) -> Option<Bitmap> {
        let bytes = match source.read() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    %source,
                    "Failed to read image source"
                );
                return None;
            }
        };

        let decoded = ImageReader::new(Cursor::new(&bytes[..]))
            .with_guessed_format()
            .map_err(image::ImageError::IoError)
            .and_then(|reader| reader.decode());
        let image = match decoded {
            Ok(image) => image,
            Err(e) => {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    %source,
                    "Failed to decode image"
                );
                return None;
            }
        };

        let (width, height) = (image.width(), image.height());
        let factor = sample_factor(width, height, target);
        let image = if factor > 1 {
            tracing::trace!(width, height, factor, "Downsampling image");
            image.resize_exact(width / factor, height / factor, FilterType::Triangle)
        } else {
            image
        };

        Some(Bitmap::new(image.into_rgba8()))
    }
}

/// The largest power of two `factor` so that the image divided by it still covers `target`.
fn sample_factor(width: u32, height: u32, target: TargetSize) -> u32 {
    if target == TargetSize::UNBOUNDED {
        return 1;
    }
    let fits = |factor: u32| {
        let (w, h) = (width / factor, height / factor);
        w > 0 && h > 0 && w >= target.width && h >= target.height
    };

    let mut factor = 1;
    while factor < (1 << 16) && fits(factor * 2) {
        factor *= 2;
    }
    factor
}

/// Decodes byte sources and applies the optional post-processor.
#[derive(Debug, Clone)]
pub struct DecodeStage {
    decoder: Arc<dyn Decoder>,
}

impl DecodeStage {
    pub fn new(decoder: Arc<dyn Decoder>) -> Self {
        Self { decoder }
    }

    /// Decodes `source` and runs `processor` on the result.
    ///
    /// A missing or already recycled bitmap is reported as `None`. If the processor replaces
    /// the bitmap, the original is recycled before this returns.
    pub fn run(
        &self,
        source: &ByteSource,
        target: TargetSize,
        processor: Option<&dyn PostProcessor>,
    ) -> Option<Bitmap> {
        let bitmap = self
            .decoder
            .decode(source, target)
            .filter(|bitmap| !bitmap.is_recycled())?;

        let Some(processor) = processor else {
            return Some(bitmap);
        };

        let processed = processor.process(&bitmap);
        if !processed.ptr_eq(&bitmap) {
            bitmap.recycle();
        }
        Some(processed)
    }
}
