use std::path::Path;

use image::{DynamicImage, GenericImageView, ImageBuffer, Rgba};
use image::imageops::{self, FilterType};

use api::error::{ApiError, ErrorCode};

/// reads the EXIF orientation tag (1-8) from a file's header; defaults to 1
/// (no transform) when the file carries no readable EXIF block, which is the
/// common case for png/webp/gif source images
pub fn read_exif_orientation(path: &Path) -> u32 {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return 1,
    };
    let mut reader = std::io::BufReader::new(file);
    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(exif) => exif,
        Err(_) => return 1,
    };
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .unwrap_or(1)
}

/// applies an EXIF orientation value (1-8) to `img`, undoing the camera's
/// recorded rotation/mirroring so downstream rendering sees upright pixels
pub fn apply_exif_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// composites `img` into a `target_w`x`target_h` canvas: a cover-scaled,
/// heavily blurred copy of `img` fills the background, and a contain-scaled
/// sharp copy of `img` is centered on top. used by thumbnails, album covers,
/// and video mosaic tiles so that non-matching aspect ratios never show bare
/// letterbox bars.
pub fn blur_fit_composite(img: &DynamicImage, target_w: u32, target_h: u32) -> DynamicImage {
    let (src_w, src_h) = img.dimensions();
    if src_w == 0 || src_h == 0 {
        return DynamicImage::ImageRgba8(ImageBuffer::from_pixel(
            target_w,
            target_h,
            Rgba([0, 0, 0, 255]),
        ));
    }

    let background = cover_scale(img, target_w, target_h);
    let sigma = (target_w.max(target_h) as f32 / BLUR_SIGMA_DIVISOR).max(MIN_BLUR_SIGMA);
    let mut canvas = imageops::blur(&background, sigma);
    darken(&mut canvas, BACKGROUND_BRIGHTNESS);

    let foreground = contain_scale(img, target_w, target_h);
    let (fg_w, fg_h) = foreground.dimensions();
    let x = ((target_w.saturating_sub(fg_w)) / 2) as i64;
    let y = ((target_h.saturating_sub(fg_h)) / 2) as i64;
    imageops::overlay(&mut canvas, &foreground, x, y);

    DynamicImage::ImageRgba8(canvas)
}

const BLUR_SIGMA_DIVISOR: f32 = 18.0;
const MIN_BLUR_SIGMA: f32 = 2.0;
const BACKGROUND_BRIGHTNESS: f32 = 0.92;

/// scales the RGB channels of `img` by `factor`, leaving alpha untouched --
/// dims the blurred background a touch so the sharp foreground reads as the
/// focal point rather than blending into it.
fn darken(img: &mut image::RgbaImage, factor: f32) {
    for pixel in img.pixels_mut() {
        for channel in pixel.0.iter_mut().take(3) {
            *channel = (*channel as f32 * factor).round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn cover_scale(img: &DynamicImage, target_w: u32, target_h: u32) -> image::RgbaImage {
    let (src_w, src_h) = img.dimensions();
    let scale = (target_w as f64 / src_w as f64).max(target_h as f64 / src_h as f64);
    let resized_w = ((src_w as f64 * scale).round() as u32).max(1);
    let resized_h = ((src_h as f64 * scale).round() as u32).max(1);
    let resized = img.resize_exact(resized_w, resized_h, FilterType::Triangle);

    let crop_x = (resized_w.saturating_sub(target_w)) / 2;
    let crop_y = (resized_h.saturating_sub(target_h)) / 2;
    resized
        .crop_imm(
            crop_x,
            crop_y,
            target_w.min(resized_w),
            target_h.min(resized_h),
        )
        .to_rgba8()
}

fn contain_scale(img: &DynamicImage, target_w: u32, target_h: u32) -> image::RgbaImage {
    img.resize(target_w, target_h, FilterType::Lanczos3).to_rgba8()
}

/// encodes `img` as JPEG at `quality` (1-100); progressive/optimized coding
/// is not exposed by the pure-Rust encoder, so this controls only the
/// quantization quality knob
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ApiError> {
    let mut buf = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    let rgb = img.to_rgb8();
    encoder
        .encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|err| {
            ApiError::new(ErrorCode::ThumbnailFailed, format!("jpeg encode failed: {err}"))
        })?;
    Ok(buf)
}

/// decodes the image at `path`, applying its EXIF orientation
pub fn decode_oriented(path: &Path) -> Result<DynamicImage, ApiError> {
    let orientation = read_exif_orientation(path);
    let img = image::open(path)
        .map_err(|err| ApiError::new(ErrorCode::ThumbnailFailed, format!("decode failed: {err}")))?;
    Ok(apply_exif_orientation(img, orientation))
}

/// full single-image derivative pipeline: decode + orient, blur-fit
/// composite to `size`x`size`, encode JPEG at `quality`. shared by
/// thumbnails, album cover quadrants, and video mosaic quadrants so none of
/// them need the `image` crate in their own dependency table.
pub fn render_blur_fit_jpeg(path: &Path, size: u32, quality: u8) -> Result<Vec<u8>, ApiError> {
    let img = decode_oriented(path)?;
    let composed = blur_fit_composite(&img, size, size);
    encode_jpeg(&composed, quality)
}

/// renders a 2x2 blur-fit mosaic from four source images, one per quadrant
/// in reading order (top-left, top-right, bottom-left, bottom-right)
pub fn render_mosaic_jpeg(paths: &[&Path; 4], size: u32, quality: u8) -> Result<Vec<u8>, ApiError> {
    let half = size / 2;
    let mut canvas = ImageBuffer::from_pixel(size, size, Rgba([0, 0, 0, 255]));
    let offsets = [(0, 0), (half, 0), (0, half), (half, half)];

    for (path, (x, y)) in paths.iter().zip(offsets.iter()) {
        let img = decode_oriented(path)?;
        let quadrant = blur_fit_composite(&img, half, half);
        imageops::overlay(&mut canvas, &quadrant.to_rgba8(), *x as i64, *y as i64);
    }

    encode_jpeg(&DynamicImage::ImageRgba8(canvas), quality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    #[test]
    fn blur_fit_composite_produces_requested_dimensions() {
        let src = DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 90, Rgba([200, 10, 10, 255])));
        let out = blur_fit_composite(&src, 120, 120);
        assert_eq!(out.dimensions(), (120, 120));
    }

    #[test]
    fn encode_jpeg_produces_nonempty_bytes() {
        let src = DynamicImage::ImageRgba8(RgbaImage::from_pixel(16, 16, Rgba([1, 2, 3, 255])));
        let bytes = encode_jpeg(&src, 85).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
