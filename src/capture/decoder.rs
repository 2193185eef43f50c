use std::borrow::Cow;

use image::ImageFormat;

use super::frame::{Frame, PixelFormat};
use crate::error::Result;

/// Converts a frame into a tightly packed 8-bit luminance plane of
/// `width * height` bytes.
pub fn luma_plane(frame: &Frame) -> Result<Cow<'_, [u8]>> {
    let meta = &frame.meta;
    let (width, height, stride) = (
        meta.width as usize,
        meta.height as usize,
        meta.stride as usize,
    );
    let data = &frame.data[..];

    match meta.format {
        PixelFormat::Gray8 if stride == width => {
            Ok(Cow::Borrowed(&data[..data.len().min(width * height)]))
        }
        PixelFormat::Gray8 => Ok(Cow::Owned(
            rows(data, stride, height)
                .flat_map(|row| row[..width.min(row.len())].iter().copied())
                .collect(),
        )),
        PixelFormat::Rgb24 => Ok(Cow::Owned(
            rows(data, stride.max(width * 3), height)
                .flat_map(|row| {
                    row.chunks_exact(3).take(width).map(|px| {
                        ((px[0] as u16 * 77 + px[1] as u16 * 150 + px[2] as u16 * 29) >> 8) as u8
                    })
                })
                .collect(),
        )),
        PixelFormat::Yuyv4 => Ok(Cow::Owned(
            rows(data, stride.max(width * 2), height)
                .flat_map(|row| row.iter().step_by(2).take(width).copied())
                .collect(),
        )),
        PixelFormat::Mjpeg => {
            let decoded = image::load_from_memory_with_format(data, ImageFormat::Jpeg)?;
            Ok(Cow::Owned(decoded.to_luma8().into_raw()))
        }
    }
}

fn rows(data: &[u8], stride: usize, height: usize) -> impl Iterator<Item = &[u8]> {
    data.chunks(stride.max(1)).take(height)
}
