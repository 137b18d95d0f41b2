use crate::core::caption::CaptionError;
use crate::core::decode::decode_dynamic_image;
use image::RgbImage;
use std::path::Path;

pub const SIZE: u32 = 224;

pub struct PreprocessOutput {
    /// Planar `[1, 3, 224, 224]` layout, R plane then G then B, each value
    /// normalized to [-1, 1].
    pub nchw: Vec<f32>,
    pub source_width: u32,
    pub source_height: u32,
}

pub fn preprocess_image(path: &Path) -> Result<PreprocessOutput, CaptionError> {
    let img = decode_dynamic_image(path).map_err(|e| CaptionError::UnreadableImage {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    Ok(PreprocessOutput {
        nchw: resize_normalize(&rgb),
        source_width: w,
        source_height: h,
    })
}

/// Nearest-neighbor resize to 224x224 plus signed-unit normalization.
///
/// Destination pixel (x, y) samples source (x*w/224, y*h/224) with integer
/// truncation. The sampling formula is part of the model contract, so the
/// loop is explicit rather than going through `imageops::resize`.
pub fn resize_normalize(rgb: &RgbImage) -> Vec<f32> {
    let (w, h) = rgb.dimensions();
    let size = SIZE as usize;
    let plane = size * size;
    let mut nchw = vec![0.0f32; 3 * plane];
    for y in 0..SIZE {
        let sy = (y as u64 * h as u64 / SIZE as u64) as u32;
        for x in 0..SIZE {
            let sx = (x as u64 * w as u64 / SIZE as u64) as u32;
            let p = rgb.get_pixel(sx, sy).0;
            let idx = (y as usize) * size + (x as usize);
            nchw[idx] = normalize_byte(p[0]);
            nchw[plane + idx] = normalize_byte(p[1]);
            nchw[2 * plane + idx] = normalize_byte(p[2]);
        }
    }
    nchw
}

#[inline]
fn normalize_byte(v: u8) -> f32 {
    (v as f32 / 255.0 - 0.5) / 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn coordinate_image(w: u32, h: u32) -> RgbImage {
        // Encode the source coordinates into the channels so sampling is
        // checkable after the resize.
        RgbImage::from_fn(w, h, |x, y| Rgb([x as u8, y as u8, 0]))
    }

    #[test]
    fn nearest_neighbor_sampling_formula() {
        let (w, h) = (10u32, 7u32);
        let rgb = coordinate_image(w, h);
        let nchw = resize_normalize(&rgb);
        let plane = (SIZE * SIZE) as usize;
        for &(x, y) in &[(0u32, 0u32), (1, 1), (100, 50), (223, 223), (57, 199)] {
            let sx = (x as u64 * w as u64 / SIZE as u64) as u8;
            let sy = (y as u64 * h as u64 / SIZE as u64) as u8;
            let idx = (y * SIZE + x) as usize;
            let r = nchw[idx];
            let g = nchw[plane + idx];
            assert_eq!(r, (sx as f32 / 255.0 - 0.5) / 0.5);
            assert_eq!(g, (sy as f32 / 255.0 - 0.5) / 0.5);
        }
    }

    #[test]
    fn upscale_from_degenerate_image_succeeds() {
        let rgb = RgbImage::from_pixel(1, 1, Rgb([200, 10, 30]));
        let nchw = resize_normalize(&rgb);
        let plane = (SIZE * SIZE) as usize;
        assert_eq!(nchw.len(), 3 * plane);
        // Every destination pixel maps back to the single source pixel.
        assert!(nchw[..plane]
            .iter()
            .all(|v| *v == (200.0 / 255.0 - 0.5) / 0.5));
    }

    #[test]
    fn mid_gray_normalizes_near_zero() {
        let rgb = RgbImage::from_pixel(4, 4, Rgb([128, 128, 128]));
        let nchw = resize_normalize(&rgb);
        for v in &nchw {
            assert!((v - 0.003_921_6).abs() < 1e-4);
        }
    }

    #[test]
    fn output_is_planar_channel_first() {
        let rgb = RgbImage::from_pixel(2, 2, Rgb([255, 0, 128]));
        let nchw = resize_normalize(&rgb);
        let plane = (SIZE * SIZE) as usize;
        assert_eq!(nchw[0], 1.0);
        assert_eq!(nchw[plane], -1.0);
        assert!((nchw[2 * plane] - 0.003_921_6).abs() < 1e-4);
    }

    #[test]
    fn unreadable_image_is_a_distinct_error() {
        let err = preprocess_image(Path::new("/nonexistent/photo.jpg")).unwrap_err();
        assert!(matches!(err, CaptionError::UnreadableImage { .. }));
    }
}
