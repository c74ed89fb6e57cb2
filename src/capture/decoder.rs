use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use super::frame::PixelFormat;
use crate::error::TransformError;

const STAGE: &str = "decode";

/// Decoded RGB24 image
pub struct Rgb {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub fn decode_frame(
    data: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<Rgb, TransformError> {
    if data.is_empty() {
        return Err(TransformError::encode(STAGE, "empty buffer"));
    }
    match format {
        PixelFormat::Mjpeg => decode_jpeg(data),
        PixelFormat::Rgb24 => {
            check_len(data, width, height, 3)?;
            Ok(Rgb {
                pixels: data.to_vec(),
                width,
                height,
            })
        }
        PixelFormat::Bgr24 => {
            check_len(data, width, height, 3)?;
            let pixels = data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect();
            Ok(Rgb {
                pixels,
                width,
                height,
            })
        }
        PixelFormat::Yuyv4 => {
            check_len(data, width, height, 2)?;
            Ok(Rgb {
                pixels: yuyv_to_rgb(data),
                width,
                height,
            })
        }
        PixelFormat::H264 => Err(TransformError::encode(
            STAGE,
            "H.264 frames cannot be decoded in-process",
        )),
    }
}

fn decode_jpeg(data: &[u8]) -> Result<Rgb, TransformError> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| TransformError::encode(STAGE, e))?;
    let info = decoder
        .info()
        .ok_or_else(|| TransformError::encode(STAGE, "missing JPEG header"))?;

    let pixels = match info.pixel_format {
        JpegPixelFormat::RGB24 => pixels,
        JpegPixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        other => {
            return Err(TransformError::encode(
                STAGE,
                format!("unsupported JPEG pixel format {other:?}"),
            ))
        }
    };
    Ok(Rgb {
        pixels,
        width: u32::from(info.width),
        height: u32::from(info.height),
    })
}

fn check_len(data: &[u8], width: u32, height: u32, bpp: u32) -> Result<(), TransformError> {
    let expected = (width * height * bpp) as usize;
    if data.len() != expected {
        return Err(TransformError::encode(
            STAGE,
            format!("expected {expected} bytes for {width}x{height}, got {}", data.len()),
        ));
    }
    Ok(())
}

/// BT.601 limited-range YUYV (4:2:2) to packed RGB24.
fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    rgb
}

fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}
