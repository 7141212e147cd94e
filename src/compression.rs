use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::dtype::{DataType, IntSize, NBytes};
use crate::error::ChunkError;
use crate::SampleShape;

#[cfg(feature = "gzip")]
use std::io::{Read, Write};

#[cfg(feature = "gzip")]
use flate2::read::GzDecoder;
#[cfg(feature = "gzip")]
use flate2::write::GzEncoder;
#[cfg(feature = "gzip")]
use flate2::Compression as GzCompression;

/// Whether a codec works on opaque bytes or on decoded image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    Byte,
    Image,
}

/// Codec applied to a sample or to a whole chunk data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[cfg(feature = "gzip")]
    Gzip,
    #[cfg(feature = "lz4")]
    Lz4,
    #[cfg(feature = "png")]
    Png,
    #[cfg(feature = "png")]
    Jpeg,
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            #[cfg(feature = "gzip")]
            Self::Gzip => "gzip",
            #[cfg(feature = "lz4")]
            Self::Lz4 => "lz4",
            #[cfg(feature = "png")]
            Self::Png => "png",
            #[cfg(feature = "png")]
            Self::Jpeg => "jpeg",
        };
        f.write_str(s)
    }
}

impl Compression {
    pub fn compression_type(&self) -> CompressionType {
        match self {
            #[cfg(feature = "gzip")]
            Self::Gzip => CompressionType::Byte,
            #[cfg(feature = "lz4")]
            Self::Lz4 => CompressionType::Byte,
            #[cfg(feature = "png")]
            Self::Png | Self::Jpeg => CompressionType::Image,
        }
    }

    pub fn is_byte(&self) -> bool {
        self.compression_type() == CompressionType::Byte
    }

    pub fn is_image(&self) -> bool {
        self.compression_type() == CompressionType::Image
    }

    /// Compresses an opaque byte buffer. Byte codecs only.
    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, ChunkError> {
        match self {
            #[cfg(feature = "gzip")]
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::default(), GzCompression::default());
                encoder
                    .write_all(raw)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| ChunkError::codec(*self, e.to_string()))
            }
            #[cfg(feature = "lz4")]
            Self::Lz4 => Ok(lz4_flex::compress_prepend_size(raw)),
            _ => Err(ChunkError::codec(*self, "not a byte codec")),
        }
    }

    /// Decompresses an opaque byte buffer. Byte codecs only.
    pub fn decompress(&self, encoded: &[u8]) -> Result<Vec<u8>, ChunkError> {
        match self {
            #[cfg(feature = "gzip")]
            Self::Gzip => {
                let mut decoder = GzDecoder::new(encoded);
                let mut out = Vec::default();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| ChunkError::codec(*self, e.to_string()))?;
                Ok(out)
            }
            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::decompress_size_prepended(encoded)
                .map_err(|e| ChunkError::codec(*self, e.to_string())),
            _ => Err(ChunkError::codec(*self, "not a byte codec")),
        }
    }
}

/// A decoded image: row-major pixel bytes plus shape and element type.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub bytes: Vec<u8>,
    pub shape: SampleShape,
    pub dtype: DataType,
}

#[cfg(feature = "png")]
fn image_format(codec: Compression) -> Result<image::ImageFormat, ChunkError> {
    match codec {
        Compression::Png => Ok(image::ImageFormat::Png),
        Compression::Jpeg => Ok(image::ImageFormat::Jpeg),
        _ => Err(ChunkError::codec(codec, "not an image codec")),
    }
}

/// Decodes an encoded image blob into raw pixels.
pub fn decode_image(codec: Compression, encoded: &[u8]) -> Result<DecodedImage, ChunkError> {
    #[cfg(feature = "png")]
    {
        return decode_image_impl(codec, encoded);
    }
    #[cfg(not(feature = "png"))]
    {
        let _ = encoded;
        Err(ChunkError::codec(codec, "image codec support not enabled"))
    }
}

/// Encodes raw 8-bit pixels with shape `(H, W)` or `(H, W, C)` into an image
/// blob.
pub fn encode_image(
    codec: Compression,
    raw: &[u8],
    shape: &SampleShape,
    dtype: DataType,
) -> Result<Vec<u8>, ChunkError> {
    #[cfg(feature = "png")]
    {
        return encode_image_impl(codec, raw, shape, dtype);
    }
    #[cfg(not(feature = "png"))]
    {
        let _ = (raw, shape, dtype);
        Err(ChunkError::codec(codec, "image codec support not enabled"))
    }
}

#[cfg(feature = "png")]
fn decode_image_impl(codec: Compression, encoded: &[u8]) -> Result<DecodedImage, ChunkError> {
    use image::DynamicImage;
    use smallvec::smallvec;

    let format = image_format(codec)?;
    let img = image::load_from_memory_with_format(encoded, format)
        .map_err(|e| ChunkError::codec(codec, e.to_string()))?;
    let (w, h) = (img.width() as u64, img.height() as u64);
    let u8_dtype = DataType::UInt(IntSize::b8);
    let u16_dtype = DataType::UInt(IntSize::b16);
    let out = match img {
        DynamicImage::ImageLuma8(b) => DecodedImage {
            bytes: b.into_raw(),
            shape: smallvec![h, w],
            dtype: u8_dtype,
        },
        DynamicImage::ImageLumaA8(b) => DecodedImage {
            bytes: b.into_raw(),
            shape: smallvec![h, w, 2],
            dtype: u8_dtype,
        },
        DynamicImage::ImageRgb8(b) => DecodedImage {
            bytes: b.into_raw(),
            shape: smallvec![h, w, 3],
            dtype: u8_dtype,
        },
        DynamicImage::ImageRgba8(b) => DecodedImage {
            bytes: b.into_raw(),
            shape: smallvec![h, w, 4],
            dtype: u8_dtype,
        },
        DynamicImage::ImageLuma16(b) => {
            let mut bytes = Vec::with_capacity(b.len() * 2);
            for px in b.into_raw() {
                bytes.extend_from_slice(&px.to_le_bytes());
            }
            DecodedImage {
                bytes,
                shape: smallvec![h, w],
                dtype: u16_dtype,
            }
        }
        other => {
            let b = other.into_rgb8();
            DecodedImage {
                bytes: b.into_raw(),
                shape: smallvec![h, w, 3],
                dtype: u8_dtype,
            }
        }
    };
    Ok(out)
}

#[cfg(feature = "png")]
fn encode_image_impl(
    codec: Compression,
    raw: &[u8],
    shape: &SampleShape,
    dtype: DataType,
) -> Result<Vec<u8>, ChunkError> {
    use image::ColorType;
    use std::io::Cursor;

    if dtype != DataType::UInt(IntSize::b8) {
        return Err(ChunkError::codec(
            codec,
            format!("image codecs require uint8 pixels, got {dtype}"),
        ));
    }
    let (h, w, channels) = match shape.as_slice() {
        [h, w] => (*h, *w, 1),
        [h, w, c] => (*h, *w, *c),
        _ => {
            return Err(ChunkError::codec(
                codec,
                format!("image shape must be 2-D or 3-D, got {shape:?}"),
            ))
        }
    };
    let color = match channels {
        1 => ColorType::L8,
        2 => ColorType::La8,
        3 => ColorType::Rgb8,
        4 => ColorType::Rgba8,
        c => {
            return Err(ChunkError::codec(
                codec,
                format!("unsupported channel count {c}"),
            ))
        }
    };
    if raw.len() as u64 != h * w * channels * dtype.nbytes() as u64 {
        return Err(ChunkError::codec(codec, "pixel buffer does not match shape"));
    }
    let format = image_format(codec)?;
    let mut out = Cursor::new(Vec::default());
    image::write_buffer_with_format(
        &mut out,
        raw,
        w as u32,
        h as u32,
        color,
        image::ImageOutputFormat::from(format),
    )
        .map_err(|e| ChunkError::codec(codec, e.to_string()))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "gzip")]
    #[test]
    fn gzip_roundtrip() {
        let raw: Vec<u8> = (0..=255).cycle().take(4096).collect();
        let enc = Compression::Gzip.compress(&raw).unwrap();
        assert_ne!(enc, raw);
        let dec = Compression::Gzip.decompress(&enc).unwrap();
        assert_eq!(dec, raw);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn gzip_rejects_garbage() {
        assert!(Compression::Gzip.decompress(b"not gzip at all").is_err());
    }

    #[cfg(feature = "png")]
    #[test]
    fn png_roundtrip() {
        use smallvec::smallvec;

        let shape: SampleShape = smallvec![4, 6, 3];
        let raw: Vec<u8> = (0..4 * 6 * 3).map(|i| (i * 3) as u8).collect();
        let dtype = DataType::UInt(IntSize::b8);
        let enc = encode_image(Compression::Png, &raw, &shape, dtype).unwrap();
        let dec = decode_image(Compression::Png, &enc).unwrap();
        assert_eq!(dec.shape, shape);
        assert_eq!(dec.dtype, dtype);
        assert_eq!(dec.bytes, raw);
    }

    #[cfg(feature = "png")]
    #[test]
    fn image_codec_is_not_byte_codec() {
        assert!(Compression::Png.compress(b"raw").is_err());
        assert!(Compression::Png.is_image());
    }
}
