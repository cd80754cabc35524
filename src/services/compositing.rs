// Alpha compositing for background replacement
//
// All images are straight (non-premultiplied) RGBA8. Every operation returns a
// new buffer; inputs are never modified.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgba, RgbaImage};

use crate::core::errors::CompositingError;
use crate::core::types::{FitMode, Position, ReplaceOptions};

pub const DEFAULT_SHADOW_OPACITY: f32 = 0.35;
pub const DEFAULT_SHADOW_BLUR: u32 = 8;

/// Single-channel alpha of `image`
pub fn extract_alpha(image: &RgbaImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| Luma([image.get_pixel(x, y)[3]]))
}

fn blur_mask(mask: &GrayImage, radius: u32) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    imageops::blur(mask, radius as f32)
}

/// Soften the cutout edge by blurring only its alpha channel.
///
/// `radius == 0` returns an exact copy.
pub fn feather(cutout: &RgbaImage, radius: u32) -> RgbaImage {
    if radius == 0 {
        return cutout.clone();
    }

    let alpha = blur_mask(&extract_alpha(cutout), radius);
    let mut out = cutout.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        pixel[3] = alpha.get_pixel(x, y)[0];
    }
    out
}

/// Uniform shadow layer plus the blurred mask it is drawn through
#[derive(Debug, Clone)]
pub struct ShadowLayer {
    pub layer: RgbaImage,
    pub mask: GrayImage,
}

impl ShadowLayer {
    /// Draw the layer over `base` wherever the mask lets it through
    pub fn composite_onto(&self, base: &mut RgbaImage) {
        for (x, y, dst) in base.enumerate_pixels_mut() {
            let src = self.layer.get_pixel(x, y);
            let mask = self.mask.get_pixel(x, y)[0] as f32 / 255.0;
            let alpha = src[3] as f32 / 255.0 * mask;
            blend_over(dst, src, alpha);
        }
    }
}

/// Build a drop shadow for `cutout`: a black `width × height` layer of constant
/// `opacity`, masked by the cutout alpha blurred by `blur_radius`
pub fn synthesize_shadow(
    cutout: &RgbaImage,
    width: u32,
    height: u32,
    opacity: f32,
    blur_radius: u32,
) -> Result<ShadowLayer, CompositingError> {
    if width == 0 || height == 0 {
        return Err(CompositingError::InvalidDimensions { width, height });
    }
    if !(0.0..=1.0).contains(&opacity) {
        return Err(CompositingError::InvalidOpacity(opacity));
    }

    let mut alpha = extract_alpha(cutout);
    if alpha.dimensions() != (width, height) {
        alpha = imageops::resize(&alpha, width, height, FilterType::Triangle);
    }
    let mask = blur_mask(&alpha, blur_radius);

    let layer_alpha = (opacity * 255.0).round() as u8;
    let layer = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, layer_alpha]));

    Ok(ShadowLayer { layer, mask })
}

/// Straight-alpha "over": `src` with coverage `src_alpha` (0..=1) onto `dst`
pub(crate) fn blend_over(dst: &mut Rgba<u8>, src: &Rgba<u8>, src_alpha: f32) {
    if src_alpha <= 0.0 {
        return;
    }
    let dst_alpha = dst[3] as f32 / 255.0;
    let out_alpha = src_alpha + dst_alpha * (1.0 - src_alpha);
    if out_alpha <= f32::EPSILON {
        *dst = Rgba([0, 0, 0, 0]);
        return;
    }

    for c in 0..3 {
        let value = (src[c] as f32 * src_alpha + dst[c] as f32 * dst_alpha * (1.0 - src_alpha)) / out_alpha;
        dst[c] = value.round().clamp(0.0, 255.0) as u8;
    }
    dst[3] = (out_alpha * 255.0).round().clamp(0.0, 255.0) as u8;
}

/// Draw `top` over `base` using `top`'s own alpha
pub fn overlay_over(base: &mut RgbaImage, top: &RgbaImage) {
    for (x, y, dst) in base.enumerate_pixels_mut() {
        if x < top.width() && y < top.height() {
            let src = top.get_pixel(x, y);
            blend_over(dst, src, src[3] as f32 / 255.0);
        }
    }
}

/// Scale brightness and saturation; 1.0 leaves a factor unchanged.
///
/// Saturation moves each channel away from (or toward) the pixel's Rec. 601
/// luma. Alpha is untouched.
pub fn modulate(image: &RgbaImage, brightness: f32, saturation: f32) -> RgbaImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        let [r, g, b] = [pixel[0], pixel[1], pixel[2]].map(|c| c as f32 * brightness);
        let luma = 0.299 * r + 0.587 * g + 0.114 * b;
        for (channel, value) in pixel.0.iter_mut().zip([r, g, b]) {
            *channel = (luma + (value - luma) * saturation).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Resize `background` to exactly `width × height` following `fit`, anchored at `position`
pub fn fit_background(
    background: &RgbaImage,
    width: u32,
    height: u32,
    fit: FitMode,
    position: Position,
) -> Result<RgbaImage, CompositingError> {
    if width == 0 || height == 0 {
        return Err(CompositingError::InvalidDimensions { width, height });
    }
    let (bw, bh) = background.dimensions();
    if bw == 0 || bh == 0 {
        return Err(CompositingError::InvalidDimensions { width: bw, height: bh });
    }

    let sx = width as f64 / bw as f64;
    let sy = height as f64 / bh as f64;

    let fitted = match fit {
        FitMode::Fill => imageops::resize(background, width, height, FilterType::Lanczos3),
        FitMode::Cover | FitMode::Outside => {
            let scale = sx.max(sy);
            let sw = ((bw as f64 * scale).round() as u32).max(width);
            let sh = ((bh as f64 * scale).round() as u32).max(height);
            let scaled = imageops::resize(background, sw, sh, FilterType::Lanczos3);
            let (ox, oy) = position.offset(sw - width, sh - height);
            imageops::crop_imm(&scaled, ox, oy, width, height).to_image()
        }
        FitMode::Contain | FitMode::Inside => {
            let scale = sx.min(sy);
            let sw = ((bw as f64 * scale).round() as u32).clamp(1, width);
            let sh = ((bh as f64 * scale).round() as u32).clamp(1, height);
            let scaled = imageops::resize(background, sw, sh, FilterType::Lanczos3);
            let mut canvas = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]));
            let (ox, oy) = position.offset(width - sw, height - sh);
            imageops::replace(&mut canvas, &scaled, ox as i64, oy as i64);
            canvas
        }
    };

    Ok(fitted)
}

/// Background replacement: fitted background, optional shadow, feathered cutout on top
#[derive(Debug, Clone)]
pub struct AlphaCompositor {
    pub shadow_opacity: f32,
    pub shadow_blur: u32,
}

impl Default for AlphaCompositor {
    fn default() -> Self {
        Self {
            shadow_opacity: DEFAULT_SHADOW_OPACITY,
            shadow_blur: DEFAULT_SHADOW_BLUR,
        }
    }
}

impl AlphaCompositor {
    pub fn compose(
        &self,
        background: &RgbaImage,
        cutout: &RgbaImage,
        width: u32,
        height: u32,
        options: &ReplaceOptions,
    ) -> Result<RgbaImage, CompositingError> {
        let mut canvas = fit_background(background, width, height, options.fit, options.position)?;

        let resized;
        let cutout = if cutout.dimensions() == (width, height) {
            cutout
        } else {
            resized = imageops::resize(cutout, width, height, FilterType::Lanczos3);
            &resized
        };
        let feathered = feather(cutout, options.feather_px);

        if options.add_shadow {
            let shadow = synthesize_shadow(&feathered, width, height, self.shadow_opacity, self.shadow_blur)?;
            shadow.composite_onto(&mut canvas);
        }
        overlay_over(&mut canvas, &feathered);

        Ok(canvas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transparent canvas with an opaque red square
    fn square_cutout(size: u32, from: u32, to: u32) -> RgbaImage {
        RgbaImage::from_fn(size, size, |x, y| {
            if (from..to).contains(&x) && (from..to).contains(&y) {
                Rgba([200, 30, 30, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        })
    }

    fn close(pixel: &Rgba<u8>, expected: [u8; 4], tolerance: u8) -> bool {
        pixel.0.iter().zip(expected).all(|(a, b)| a.abs_diff(b) <= tolerance)
    }

    #[test]
    fn test_modulate_lifts_tone() {
        let image = RgbaImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgba([100, 100, 100, 255])
            } else {
                Rgba([200, 100, 50, 128])
            }
        });
        let lifted = modulate(&image, 1.03, 1.05);

        // grey only gets brighter
        assert_eq!(lifted.get_pixel(0, 0).0, [103, 103, 103, 255]);
        // colour spreads away from its luma, alpha kept
        let colour = lifted.get_pixel(1, 0);
        assert!(colour[0] > 206 && colour[2] < 51, "{:?}", colour);
        assert_eq!(colour[3], 128);

        assert_eq!(modulate(&image, 1.0, 1.0), image);
        let white = RgbaImage::from_pixel(1, 1, Rgba([250, 250, 250, 255]));
        assert_eq!(modulate(&white, 1.2, 1.0).get_pixel(0, 0).0, [255, 255, 255, 255]);
    }

    fn split_background() -> RgbaImage {
        // 1000x500: left half red, right half blue
        RgbaImage::from_fn(1000, 500, |x, _| {
            if x < 500 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 255])
            }
        })
    }

    #[test]
    fn test_feather_zero_is_identity() {
        let cutout = square_cutout(64, 16, 48);
        let out = feather(&cutout, 0);
        assert_eq!(out.as_raw(), cutout.as_raw());
    }

    #[test]
    fn test_feather_only_touches_alpha() {
        let cutout = square_cutout(64, 16, 48);
        let out = feather(&cutout, 3);

        for (a, b) in cutout.pixels().zip(out.pixels()) {
            assert_eq!(a.0[..3], b.0[..3]);
        }
        // edge softened, centre still solid
        assert!(out.get_pixel(16, 32)[3] < 255);
        assert!(out.get_pixel(14, 32)[3] > 0);
        assert!(out.get_pixel(32, 32)[3] >= 250);
    }

    #[test]
    fn test_shadow_layer() {
        let cutout = square_cutout(40, 10, 30);
        let shadow = synthesize_shadow(&cutout, 40, 40, 0.35, 4).unwrap();
        assert_eq!(shadow.layer.dimensions(), (40, 40));
        assert_eq!(shadow.mask.dimensions(), (40, 40));
        assert!(shadow.layer.pixels().all(|p| p.0 == [0, 0, 0, 89]));
        assert!(shadow.mask.get_pixel(8, 20)[0] > 0);
        assert_eq!(shadow.mask.get_pixel(0, 0)[0], 0);

        assert!(matches!(
            synthesize_shadow(&cutout, 40, 40, 1.5, 4),
            Err(CompositingError::InvalidOpacity(_))
        ));
    }

    #[test]
    fn test_cover_crops_at_position() {
        let bg = split_background();
        let left = fit_background(&bg, 500, 500, FitMode::Cover, Position::Left).unwrap();
        let right = fit_background(&bg, 500, 500, FitMode::Cover, Position::Right).unwrap();
        let centre = fit_background(&bg, 500, 500, FitMode::Cover, Position::Centre).unwrap();

        assert_eq!(left.dimensions(), (500, 500));
        assert_eq!(left.get_pixel(250, 250).0, [255, 0, 0, 255]);
        assert_eq!(right.get_pixel(250, 250).0, [0, 0, 255, 255]);
        assert_eq!(centre.get_pixel(10, 250).0, [255, 0, 0, 255]);
        assert_eq!(centre.get_pixel(490, 250).0, [0, 0, 255, 255]);
    }

    #[test]
    fn test_contain_letterboxes() {
        let bg = split_background();
        let out = fit_background(&bg, 500, 500, FitMode::Contain, Position::Centre).unwrap();
        assert_eq!(out.dimensions(), (500, 500));
        // 500x250 image centred vertically, black bars above and below
        assert_eq!(out.get_pixel(250, 10).0, [0, 0, 0, 255]);
        assert_eq!(out.get_pixel(250, 490).0, [0, 0, 0, 255]);
        assert_eq!(out.get_pixel(20, 250).0, [255, 0, 0, 255]);

        let top = fit_background(&bg, 500, 500, FitMode::Inside, Position::Top).unwrap();
        assert_eq!(top.get_pixel(20, 10).0, [255, 0, 0, 255]);
        assert_eq!(top.get_pixel(20, 490).0, [0, 0, 0, 255]);
    }

    #[test]
    fn test_fill_and_bad_dimensions() {
        let bg = split_background();
        let out = fit_background(&bg, 300, 700, FitMode::Fill, Position::Centre).unwrap();
        assert_eq!(out.dimensions(), (300, 700));
        assert!(fit_background(&bg, 0, 10, FitMode::Fill, Position::Centre).is_err());
    }

    #[test]
    fn test_replacement_end_to_end() {
        let cutout = square_cutout(500, 150, 350);
        let background = RgbaImage::from_pixel(1000, 1000, Rgba([255, 255, 255, 255]));
        let options = ReplaceOptions {
            fit: FitMode::Cover,
            position: Position::Centre,
            feather_px: 2,
            add_shadow: true,
            ..ReplaceOptions::default()
        };

        let out = AlphaCompositor::default()
            .compose(&background, &cutout, 500, 500, &options)
            .unwrap();

        assert_eq!(out.dimensions(), (500, 500));
        assert!(out.pixels().all(|p| p[3] == 255));
        // solid foreground survives
        assert!(close(out.get_pixel(250, 250), [200, 30, 30, 255], 3));
        // blurred gray shadow just outside the cutout edge
        let halo = out.get_pixel(142, 250);
        assert_eq!(halo[0], halo[1]);
        assert_eq!(halo[1], halo[2]);
        assert!(halo[0] < 250 && halo[0] > 150, "halo = {:?}", halo);
        // far corner untouched
        assert_eq!(out.get_pixel(2, 2).0, [255, 255, 255, 255]);
    }

    #[test]
    fn test_mismatched_cutout_is_resized() {
        let cutout = square_cutout(250, 75, 175);
        let background = RgbaImage::from_pixel(100, 100, Rgba([0, 128, 0, 255]));
        let out = AlphaCompositor::default()
            .compose(&background, &cutout, 500, 500, &ReplaceOptions::default())
            .unwrap();
        assert_eq!(out.dimensions(), (500, 500));
        assert!(close(out.get_pixel(250, 250), [200, 30, 30, 255], 3));
        assert!(close(out.get_pixel(5, 5), [0, 128, 0, 255], 1));
    }
}
