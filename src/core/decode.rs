use anyhow::{anyhow, Result};
use image::DynamicImage;
use std::path::Path;

#[cfg(target_os = "macos")]
use std::process::Command;
#[cfg(target_os = "macos")]
use tempfile::Builder;

/// Opens an image file, routing formats the `image` crate cannot handle
/// (HEIC, some DNG) through platform converters.
pub fn decode_dynamic_image(path: &Path) -> Result<DynamicImage> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "heic" => decode_heic(path),
        "dng" => decode_dng(path),
        _ => Ok(image::open(path)?),
    }
}

#[cfg(target_os = "macos")]
fn sips_to_jpeg(path: &Path) -> Result<DynamicImage> {
    let tmp = Builder::new().suffix(".jpg").tempfile()?;
    let out_path = tmp.path().to_owned();
    let input = path
        .to_str()
        .ok_or_else(|| anyhow!("non-UTF8 path: {}", path.display()))?;
    let status = Command::new("sips")
        .args(["-s", "format", "jpeg", input, "--out"])
        .arg(&out_path)
        .status()?;
    if !status.success() {
        return Err(anyhow!("sips failed to convert {}", path.display()));
    }
    Ok(image::open(&out_path)?)
}

fn decode_heic(path: &Path) -> Result<DynamicImage> {
    #[cfg(target_os = "macos")]
    {
        sips_to_jpeg(path)
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = path;
        Err(anyhow!("HEIC decoding not supported on this platform"))
    }
}

fn decode_dng(path: &Path) -> Result<DynamicImage> {
    // The image crate handles some DNGs through its tiff decoder; try that
    // before falling back to a platform converter.
    match image::open(path) {
        Ok(img) => Ok(img),
        Err(err) => {
            #[cfg(target_os = "macos")]
            {
                let _ = err;
                sips_to_jpeg(path)
            }
            #[cfg(not(target_os = "macos"))]
            {
                Err(anyhow!("DNG decoding failed: {err}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_an_error() {
        assert!(decode_dynamic_image(Path::new("/nonexistent/photo.jpg")).is_err());
    }

    #[test]
    fn decodes_a_written_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("px.png");
        image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();
        let img = decode_dynamic_image(&path).unwrap();
        assert_eq!(img.to_rgb8().dimensions(), (2, 2));
    }
}
