//! MJPEG streaming of the camera and threshold feeds.
//!
//! Frames are broadcast to every connected HTTP client over
//! `multipart/x-mixed-replace`; slow clients skip frames instead of
//! buffering them.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use ndarray::{Array2, Array3};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

const BOUNDARY: &str = "pipitrek_frame";

/// Fan-out channel for one JPEG feed.
pub struct MjpegBroadcaster {
    tx: broadcast::Sender<Bytes>,
}

impl MjpegBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a frame to all subscribers; returns the receiver count.
    pub fn publish(&self, jpeg: Bytes) -> usize {
        self.tx.send(jpeg).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Build the streaming HTTP response for one new subscriber.
    pub fn subscribe_response(&self) -> Response {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|result| match result {
            Ok(jpeg) => {
                let head = format!(
                    "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                    jpeg.len()
                );
                let mut part = Vec::with_capacity(head.len() + jpeg.len() + 2);
                part.extend_from_slice(head.as_bytes());
                part.extend_from_slice(&jpeg);
                part.extend_from_slice(b"\r\n");
                Some(Ok::<_, std::convert::Infallible>(Bytes::from(part)))
            }
            // A lagged receiver just skips to the next frame.
            Err(_) => None,
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
            )
            .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .body(Body::from_stream(stream))
            .expect("mjpeg response build")
    }
}

impl Default for MjpegBroadcaster {
    fn default() -> Self {
        Self::new(4)
    }
}

/// JPEG-encode a grayscale plane.
pub fn encode_gray_jpeg(data: &Array2<u8>, quality: u8) -> Option<Bytes> {
    let (h, w) = data.dim();
    let pixels: Vec<u8> = data.iter().copied().collect();
    let img = image::GrayImage::from_raw(w as u32, h as u32, pixels)?;
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(&img).ok()?;
    Some(Bytes::from(out))
}

/// JPEG-encode a BGR plane.
pub fn encode_bgr_jpeg(data: &Array3<u8>, quality: u8) -> Option<Bytes> {
    let (h, w, _) = data.dim();
    let mut pixels = Vec::with_capacity(h * w * 3);
    for y in 0..h {
        for x in 0..w {
            pixels.push(data[[y, x, 2]]);
            pixels.push(data[[y, x, 1]]);
            pixels.push(data[[y, x, 0]]);
        }
    }
    let img = image::RgbImage::from_raw(w as u32, h as u32, pixels)?;
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(&img).ok()?;
    Some(Bytes::from(out))
}

/// PNG-encode a BGR plane (for the inline preview image).
pub fn encode_bgr_png(data: &Array3<u8>) -> Option<Vec<u8>> {
    let (h, w, _) = data.dim();
    let mut pixels = Vec::with_capacity(h * w * 3);
    for y in 0..h {
        for x in 0..w {
            pixels.push(data[[y, x, 2]]);
            pixels.push(data[[y, x, 1]]);
            pixels.push(data[[y, x, 0]]);
        }
    }
    let img = image::RgbImage::from_raw(w as u32, h as u32, pixels)?;
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).ok()?;
    Some(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let feed = MjpegBroadcaster::new(4);
        assert_eq!(feed.publish(Bytes::from_static(b"x")), 0);
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn gray_jpeg_has_jpeg_magic() {
        let jpeg = encode_gray_jpeg(&arr2(&[[0u8, 128], [255, 64]]), 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn bgr_jpeg_has_jpeg_magic() {
        let data = Array3::<u8>::from_elem((2, 2, 3), 127);
        let jpeg = encode_bgr_jpeg(&data, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn bgr_png_has_png_magic() {
        let data = Array3::<u8>::from_elem((2, 2, 3), 127);
        let png = encode_bgr_png(&data).unwrap();
        assert_eq!(&png[..4], &[0x89, b'P', b'N', b'G']);
    }
}
