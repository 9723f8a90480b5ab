use std::io::Cursor;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage};

/// Scale a frame onto the target canvas and encode it as a lossy JPEG.
pub fn encode_frame(frame: &DynamicImage, width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let canvas = if frame.width() == width && frame.height() == height {
        frame.to_rgb8()
    } else {
        frame
            .resize_exact(width, height, FilterType::Triangle)
            .to_rgb8()
    };

    let mut bytes = Cursor::new(Vec::with_capacity((width * height / 8) as usize));
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
        encoder
            .encode_image(&canvas)
            .context("failed to encode frame as JPEG")?;
    }
    Ok(bytes.into_inner())
}

pub fn to_data_url(jpeg: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg))
}
