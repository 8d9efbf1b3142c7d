//! Product image encoding for the record store
//!
//! Crops are compressed (PNG or JPEG) and stored as standard base64 text.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::StoreError;

/// Compression applied to product crops before storing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum ImageEncoding {
    /// Lossless, decodes back to the exact crop
    #[default]
    Png,
    /// Lossy with the given quality (1 - 100)
    Jpeg { quality: u8 },
}

impl ImageEncoding {
    /// Compress an image into a byte buffer
    pub fn encode(&self, image: &RgbImage) -> Result<Vec<u8>, StoreError> {
        let mut bytes = Vec::new();
        match self {
            ImageEncoding::Png => image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?,
            ImageEncoding::Jpeg { quality } => {
                JpegEncoder::new_with_quality(&mut bytes, (*quality).clamp(1, 100)).encode_image(image)?
            }
        }
        Ok(bytes)
    }

    /// Compress and base64-encode an image for the `product_image` column
    pub fn encode_base64(&self, image: &RgbImage) -> Result<String, StoreError> {
        Ok(STANDARD.encode(self.encode(image)?))
    }
}

/// Raw compressed bytes of a stored image
pub fn decode_base64(payload: &str) -> Result<Vec<u8>, StoreError> {
    Ok(STANDARD.decode(payload.trim())?)
}

/// Decode a stored image back into RGB pixels
pub fn decode_base64_image(payload: &str) -> Result<RgbImage, StoreError> {
    let bytes = decode_base64(payload)?;
    Ok(image::load_from_memory(&bytes)?.to_rgb8())
}

/// Detect the compressed format of stored bytes
pub fn sniff_extension(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => "png",
        Ok(ImageFormat::Jpeg) => "jpg",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient() -> RgbImage {
        RgbImage::from_fn(17, 9, |x, y| Rgb([(x * 15) as u8, (y * 28) as u8, 200]))
    }

    #[test]
    fn test_png_is_lossless() {
        let image = gradient();
        let payload = ImageEncoding::Png.encode_base64(&image).unwrap();
        assert_eq!(decode_base64_image(&payload).unwrap(), image);
    }

    #[test]
    fn test_jpeg_keeps_dimensions() {
        let image = gradient();
        let payload = ImageEncoding::Jpeg { quality: 90 }.encode_base64(&image).unwrap();
        let bytes = decode_base64(&payload).unwrap();
        assert_eq!(sniff_extension(&bytes), "jpg");
        assert_eq!(decode_base64_image(&payload).unwrap().dimensions(), (17, 9));
    }

    #[test]
    fn test_invalid_payload() {
        assert!(matches!(decode_base64_image("not base64!"), Err(StoreError::Base64(_))));
        let garbage = STANDARD.encode(b"definitely not an image");
        assert!(matches!(decode_base64_image(&garbage), Err(StoreError::Image(_))));
    }

    #[test]
    fn test_encoding_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            encoding: ImageEncoding,
        }
        let png: Wrapper = toml::from_str("encoding = { format = \"png\" }").unwrap();
        assert_eq!(png.encoding, ImageEncoding::Png);
        let jpeg: Wrapper = toml::from_str("encoding = { format = \"jpeg\", quality = 80 }").unwrap();
        assert_eq!(jpeg.encoding, ImageEncoding::Jpeg { quality: 80 });
    }
}
