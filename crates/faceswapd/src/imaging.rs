//! Image fetch, decode and encode.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("image is {bytes} bytes, above the {limit}-byte limit")]
    TooLarge { bytes: u64, limit: u64 },
    #[error("image is empty")]
    Empty,
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("could not encode image: {0}")]
    Encode(String),
}

/// Supplies raw image bytes for a request URL.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ImageError>;
}

/// Fetches `http(s)://` URLs with a timeout and `file://` URLs from disk,
/// enforcing a size limit on both.
pub struct HttpImageFetcher {
    timeout: Duration,
    max_bytes: u64,
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Self {
        Self {
            timeout,
            max_bytes,
            client: OnceLock::new(),
        }
    }

    fn client(&self, url: &str) -> Result<&reqwest::blocking::Client, ImageError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| fetch_err(url, e))?;
        Ok(self.client.get_or_init(|| client))
    }

    fn fetch_file(&self, url: &str, path: &Path) -> Result<Vec<u8>, ImageError> {
        let len = std::fs::metadata(path).map_err(|e| fetch_err(url, e))?.len();
        if len > self.max_bytes {
            return Err(ImageError::TooLarge { bytes: len, limit: self.max_bytes });
        }
        std::fs::read(path).map_err(|e| fetch_err(url, e))
    }

    fn fetch_http(&self, url: &str) -> Result<Vec<u8>, ImageError> {
        let response = self
            .client(url)?
            .get(url)
            .send()
            .map_err(|e| fetch_err(url, e))?;
        if !response.status().is_success() {
            return Err(fetch_err(url, format!("HTTP {}", response.status())));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(ImageError::TooLarge { bytes: len, limit: self.max_bytes });
            }
        }

        let mut body = Vec::new();
        response
            .take(self.max_bytes + 1)
            .read_to_end(&mut body)
            .map_err(|e| fetch_err(url, e))?;
        if body.len() as u64 > self.max_bytes {
            return Err(ImageError::TooLarge {
                bytes: body.len() as u64,
                limit: self.max_bytes,
            });
        }
        Ok(body)
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ImageError> {
        let bytes = match url.strip_prefix("file://") {
            Some(path) => self.fetch_file(url, Path::new(path))?,
            None if url.starts_with("http://") || url.starts_with("https://") => self.fetch_http(url)?,
            None => return Err(fetch_err(url, "unsupported URL scheme")),
        };
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        tracing::debug!(url, bytes = bytes.len(), "image fetched");
        Ok(bytes)
    }
}

fn fetch_err(url: &str, e: impl std::fmt::Display) -> ImageError {
    ImageError::Fetch {
        url: url.to_string(),
        message: e.to_string(),
    }
}

/// A decoded request image. Alpha, when the input had it, is kept apart so
/// inference sees RGB while the output can restore the input's pixel format.
pub struct DecodedImage {
    pub rgb: RgbImage,
    pub alpha: Option<GrayImage>,
}

impl DecodedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        self.rgb.dimensions()
    }
}

/// Decode `bytes`, downscaling so the longest side is at most `max_dimension`
/// (0 disables downscaling).
pub fn decode(bytes: &[u8], max_dimension: u32) -> Result<DecodedImage, ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::Empty);
    }
    let mut img = image::load_from_memory(bytes).map_err(|e| ImageError::Decode(e.to_string()))?;
    let (w, h) = (img.width(), img.height());
    if w == 0 || h == 0 {
        return Err(ImageError::Decode(format!("degenerate dimensions {w}x{h}")));
    }

    if max_dimension > 0 && w.max(h) > max_dimension {
        img = img.resize(max_dimension, max_dimension, FilterType::Lanczos3);
        tracing::debug!(from = ?(w, h), to = ?(img.width(), img.height()), "downscaled input");
    }

    let alpha = if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        let (w, h) = rgba.dimensions();
        Some(GrayImage::from_fn(w, h, |x, y| image::Luma([rgba.get_pixel(x, y)[3]])))
    } else {
        None
    };

    Ok(DecodedImage { rgb: img.to_rgb8(), alpha })
}

/// Encode as PNG, re-attaching `alpha` when present.
pub fn encode_png(rgb: &RgbImage, alpha: Option<&GrayImage>) -> Result<Vec<u8>, ImageError> {
    let dynamic = match alpha {
        Some(a) if a.dimensions() == rgb.dimensions() => {
            let (w, h) = rgb.dimensions();
            DynamicImage::ImageRgba8(RgbaImage::from_fn(w, h, |x, y| {
                let [r, g, b] = rgb.get_pixel(x, y).0;
                image::Rgba([r, g, b, a.get_pixel(x, y)[0]])
            }))
        }
        _ => DynamicImage::ImageRgb8(rgb.clone()),
    };

    let mut buf = Vec::new();
    dynamic
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| ImageError::Encode(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(w: u32, h: u32, alpha: bool) -> Vec<u8> {
        let img = if alpha {
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, image::Rgba([10, 20, 30, 128])))
        } else {
            DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, image::Rgb([10, 20, 30])))
        };
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn test_decode_rgb() {
        let decoded = decode(&png(64, 48, false), 1024).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
        assert!(decoded.alpha.is_none());
        assert_eq!(decoded.rgb.get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[test]
    fn test_decode_keeps_alpha() {
        let decoded = decode(&png(8, 8, true), 1024).unwrap();
        assert_eq!(decoded.alpha.as_ref().unwrap().get_pixel(3, 3)[0], 128);
    }

    #[test]
    fn test_decode_downscales_longest_side() {
        let decoded = decode(&png(400, 200, false), 100).unwrap();
        assert_eq!(decoded.dimensions(), (100, 50));
    }

    #[test]
    fn test_decode_zero_limit_keeps_size() {
        let decoded = decode(&png(400, 200, false), 0).unwrap();
        assert_eq!(decoded.dimensions(), (400, 200));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode(b"not an image", 1024), Err(ImageError::Decode(_))));
        assert!(matches!(decode(b"", 1024), Err(ImageError::Empty)));
    }

    #[test]
    fn test_encode_round_trip_preserves_format() {
        let decoded = decode(&png(16, 12, true), 1024).unwrap();
        let encoded = encode_png(&decoded.rgb, decoded.alpha.as_ref()).unwrap();
        let back = image::load_from_memory(&encoded).unwrap();
        assert_eq!((back.width(), back.height()), (16, 12));
        assert!(back.color().has_alpha());

        let plain = encode_png(&decoded.rgb, None).unwrap();
        assert!(!image::load_from_memory(&plain).unwrap().color().has_alpha());
    }

    #[test]
    fn test_file_fetch_enforces_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.png");
        std::fs::write(&path, png(32, 32, false)).unwrap();
        let url = format!("file://{}", path.display());

        let fetcher = HttpImageFetcher::new(Duration::from_secs(1), 10 * 1024 * 1024);
        assert!(!fetcher.fetch(&url).unwrap().is_empty());

        let tiny = HttpImageFetcher::new(Duration::from_secs(1), 16);
        assert!(matches!(tiny.fetch(&url), Err(ImageError::TooLarge { limit: 16, .. })));
    }

    #[test]
    fn test_unsupported_scheme() {
        let fetcher = HttpImageFetcher::new(Duration::from_secs(1), 1024);
        assert!(matches!(fetcher.fetch("ftp://example.com/a.png"), Err(ImageError::Fetch { .. })));
    }
}
