use std::{io::Cursor, time::SystemTime};

use bytes::Bytes;
use image::{
    codecs::{bmp::BmpEncoder, jpeg::JpegEncoder},
    ColorType, ImageError, RgbImage,
};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("cannot encode frame to {format}: {source}")]
pub(crate) struct EncodeError {
    format: &'static str,
    #[source]
    source: ImageError,
}

/// Target format for [`Frame::encode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Encoding {
    /// Lossless still image, used for snapshots.
    Bmp,
    /// Lossy image, used for each streamed frame.
    Jpeg { quality: u8 },
}

impl Encoding {
    fn name(self) -> &'static str {
        match self {
            Self::Bmp => "bmp",
            Self::Jpeg { .. } => "jpeg",
        }
    }
}

/// A raw capture and the moment it was taken.
#[derive(Clone, Debug)]
pub(crate) struct Frame {
    image: RgbImage,
    captured_at: SystemTime,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: SystemTime) -> Self {
        Self { image, captured_at }
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn encode(&self, encoding: Encoding) -> Result<EncodedImage, EncodeError> {
        let (width, height) = self.image.dimensions();
        let mut buf = Cursor::new(Vec::with_capacity(self.image.as_raw().len() / 4));

        let result = match encoding {
            Encoding::Bmp => BmpEncoder::new(&mut buf).encode(
                self.image.as_raw(),
                width,
                height,
                ColorType::Rgb8,
            ),
            Encoding::Jpeg { quality } => JpegEncoder::new_with_quality(&mut buf, quality)
                .encode(self.image.as_raw(), width, height, ColorType::Rgb8),
        };

        result
            .map(|_| EncodedImage(Bytes::from(buf.into_inner())))
            .map_err(|source| EncodeError {
                format: encoding.name(),
                source,
            })
    }
}

/// Opaque encoded image bytes.
#[derive(Clone, Debug)]
pub(crate) struct EncodedImage(Bytes);

impl EncodedImage {
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl AsRef<[u8]> for EncodedImage {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}
