//! Image decoding and normalization into model-ready tensors.
//!
//! Pipeline: sniff format -> decode -> force RGB -> contain-fit resize ->
//! centre on a black square canvas -> scale to [0,1] -> add batch axis.
//! Every intermediate pixel buffer is counted by the normalizer's
//! [`ResourceTracker`] and dropped before `normalize` returns.

use image::imageops::FilterType;
use image::{GenericImageView, Rgb, RgbImage};
use ndarray::{Array4, Axis};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Result, SentinelError};
use crate::model_runtime::TensorLayout;
use crate::request_cleanup::ResourceTracker;

pub const DEFAULT_TARGET_SIZE: u32 = 640;

const PADDING: Rgb<u8> = Rgb([0, 0, 0]);

/// A (1, size, size, 3) tensor with every value in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage {
    data: Array4<f32>,
}

impl NormalizedImage {
    /// Black image of the given side length. Used as the warmup input.
    pub fn zeros(size: u32) -> Self {
        let side = size as usize;
        Self {
            data: Array4::zeros((1, side, side, 3)),
        }
    }

    pub fn from_array(data: Array4<f32>) -> Result<Self> {
        let shape = data.shape();
        if shape[0] != 1 || shape[3] != 3 || shape[1] != shape[2] {
            return Err(SentinelError::DecodeError(format!(
                "tensor shape {:?} is not (1, S, S, 3)",
                shape
            )));
        }
        if data.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(SentinelError::DecodeError(
                "tensor values must lie in [0, 1]".to_string(),
            ));
        }
        Ok(Self { data })
    }

    /// Side length of the square image.
    pub fn size(&self) -> u32 {
        self.data.shape()[1] as u32
    }

    /// Always `[1, size, size, 3]`.
    pub fn shape(&self) -> [usize; 4] {
        let s = self.data.shape();
        [s[0], s[1], s[2], s[3]]
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    /// Shape of this image when laid out for a model.
    pub fn shape_in(&self, layout: TensorLayout) -> [usize; 4] {
        let [n, h, w, c] = self.shape();
        match layout {
            TensorLayout::Nhwc => [n, h, w, c],
            TensorLayout::Nchw => [n, c, h, w],
        }
    }

    /// Contiguous copy of the pixel data in the requested layout.
    pub fn to_layout_vec(&self, layout: TensorLayout) -> Vec<f32> {
        match layout {
            TensorLayout::Nhwc => self.data.iter().copied().collect(),
            TensorLayout::Nchw => self
                .data
                .view()
                .permuted_axes([0, 3, 1, 2])
                .iter()
                .copied()
                .collect(),
        }
    }

    /// Mean of one colour channel, handy for sanity checks.
    pub fn channel_mean(&self, channel: usize) -> f32 {
        self.data
            .index_axis(Axis(3), channel)
            .mean()
            .unwrap_or(0.0)
    }
}

/// Decodes raw bytes and fits them into a fixed square tensor.
#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    target_size: u32,
    tracker: ResourceTracker,
}

impl ImageNormalizer {
    pub fn new(target_size: u32, tracker: ResourceTracker) -> Self {
        Self {
            target_size,
            tracker,
        }
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    pub fn normalize(&self, bytes: &[u8]) -> Result<NormalizedImage> {
        self.normalize_to(bytes, self.target_size)
    }

    pub fn normalize_to(&self, bytes: &[u8], target_size: u32) -> Result<NormalizedImage> {
        if target_size == 0 {
            return Err(SentinelError::Config("target size must be positive".into()));
        }
        if bytes.is_empty() {
            return Err(SentinelError::DecodeError("empty image buffer".into()));
        }

        let format = image::guess_format(bytes).map_err(|_| {
            SentinelError::UnsupportedFormat("content is not a recognised image".into())
        })?;

        let decoded = self.tracker.track(
            "decoded image",
            image::load_from_memory_with_format(bytes, format)?,
        );
        let (orig_w, orig_h) = (decoded.width(), decoded.height());
        if orig_w == 0 || orig_h == 0 {
            return Err(SentinelError::DecodeError("image has no pixels".into()));
        }

        // Drops alpha and expands grayscale.
        let rgb = self.tracker.track("rgb image", decoded.to_rgb8());
        drop(decoded);

        let (content_w, content_h) = compute_fit_dimensions(orig_w, orig_h, target_size);
        let resized = self.tracker.track(
            "resized image",
            image::imageops::resize(&*rgb, content_w, content_h, FilterType::Triangle),
        );
        drop(rgb);

        let mut canvas = RgbImage::from_pixel(target_size, target_size, PADDING);
        let offset_x = (target_size - content_w) / 2;
        let offset_y = (target_size - content_h) / 2;
        image::imageops::overlay(&mut canvas, &*resized, offset_x as i64, offset_y as i64);
        drop(resized);
        let canvas = self.tracker.track("padded canvas", canvas);

        let scaled: Vec<f32> = canvas
            .as_raw()
            .par_iter()
            .map(|&v| v as f32 / 255.0)
            .collect();
        drop(canvas);

        let side = target_size as usize;
        let data = Array4::from_shape_vec((1, side, side, 3), scaled)
            .map_err(|e| SentinelError::DecodeError(format!("tensor assembly failed: {e}")))?;

        debug!(
            original = format!("{orig_w}x{orig_h}"),
            content = format!("{content_w}x{content_h}"),
            output = format!("{target_size}x{target_size}"),
            "image normalized"
        );

        Ok(NormalizedImage { data })
    }
}

/// Largest (width, height) that fits inside `target` x `target` keeping the
/// aspect ratio. Scales up as well as down.
pub fn compute_fit_dimensions(width: u32, height: u32, target: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (1, 1);
    }

    let scale = (target as f64 / width as f64).min(target as f64 / height as f64);
    let new_w = ((width as f64 * scale).round() as u32).clamp(1, target);
    let new_h = ((height as f64 * scale).round() as u32).clamp(1, target);
    (new_w, new_h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma, Rgba, RgbaImage};
    use proptest::prelude::*;
    use std::io::Cursor;

    fn encode(img: DynamicImage) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, ImageOutputFormat::Png).unwrap();
        cursor.into_inner()
    }

    fn solid_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        encode(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            Rgb(color),
        )))
    }

    fn normalizer(size: u32) -> (ImageNormalizer, ResourceTracker) {
        let tracker = ResourceTracker::new();
        (ImageNormalizer::new(size, tracker.clone()), tracker)
    }

    #[test]
    fn test_fit_dimensions_landscape_and_portrait() {
        assert_eq!(compute_fit_dimensions(1280, 640, 640), (640, 320));
        assert_eq!(compute_fit_dimensions(300, 600, 640), (320, 640));
        assert_eq!(compute_fit_dimensions(224, 224, 640), (640, 640));
        assert_eq!(compute_fit_dimensions(0, 10, 640), (1, 1));
    }

    #[test]
    fn test_square_image_fills_canvas() {
        let (n, tracker) = normalizer(64);
        let image = n.normalize(&solid_png(224, 224, [255, 255, 255])).unwrap();
        assert_eq!(image.shape(), [1, 64, 64, 3]);
        assert!(image.data().iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn test_wide_image_is_padded_with_black() {
        let (n, _) = normalizer(40);
        let image = n.normalize(&solid_png(80, 40, [255, 0, 0])).unwrap();
        let data = image.data();
        // 80x40 fits as 40x20, centred vertically: rows 0..10 and 30..40 are padding.
        assert_eq!(data[[0, 0, 20, 0]], 0.0);
        assert!((data[[0, 20, 20, 0]] - 1.0).abs() < 1e-6);
        assert_eq!(data[[0, 20, 20, 1]], 0.0);
        assert_eq!(data[[0, 39, 0, 0]], 0.0);
    }

    #[test]
    fn test_alpha_is_dropped_and_grayscale_expanded() {
        let (n, _) = normalizer(16);
        let rgba = encode(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            16,
            16,
            Rgba([0, 255, 0, 10]),
        )));
        let image = n.normalize(&rgba).unwrap();
        assert_eq!(image.shape(), [1, 16, 16, 3]);
        assert!((image.channel_mean(1) - 1.0).abs() < 1e-6);

        let gray = encode(DynamicImage::ImageLuma8(GrayImage::from_pixel(
            16,
            16,
            Luma([51]),
        )));
        let image = n.normalize(&gray).unwrap();
        for channel in 0..3 {
            assert!((image.channel_mean(channel) - 0.2).abs() < 1e-6);
        }
    }

    #[test]
    fn test_non_image_content_is_unsupported() {
        let (n, tracker) = normalizer(16);
        let err = n.normalize(b"%PDF-1.7 definitely not a picture").unwrap_err();
        assert_eq!(err.kind(), "UnsupportedFormat");
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn test_truncated_image_is_decode_error() {
        let (n, tracker) = normalizer(16);
        let mut bytes = solid_png(32, 32, [1, 2, 3]);
        bytes.truncate(40);
        let err = n.normalize(&bytes).unwrap_err();
        assert_eq!(err.kind(), "DecodeError");
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn test_empty_buffer_is_decode_error() {
        let (n, _) = normalizer(16);
        assert_eq!(n.normalize(&[]).unwrap_err().kind(), "DecodeError");
    }

    #[test]
    fn test_nchw_layout_conversion() {
        let (n, _) = normalizer(2);
        let image = n.normalize(&solid_png(2, 2, [255, 0, 0])).unwrap();
        assert_eq!(image.shape_in(TensorLayout::Nchw), [1, 3, 2, 2]);
        let chw = image.to_layout_vec(TensorLayout::Nchw);
        assert_eq!(&chw[0..4], &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(&chw[4..12], &[0.0; 8]);
        let hwc = image.to_layout_vec(TensorLayout::Nhwc);
        assert_eq!(&hwc[0..3], &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_from_array_validates_shape_and_range() {
        assert!(NormalizedImage::from_array(Array4::zeros((1, 4, 4, 3))).is_ok());
        assert!(NormalizedImage::from_array(Array4::zeros((1, 4, 5, 3))).is_err());
        assert!(NormalizedImage::from_array(Array4::from_elem((1, 2, 2, 3), 1.5)).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_normalized_shape_and_range(
            width in 1u32..120,
            height in 1u32..120,
            target in 1u32..48,
            r in any::<u8>(),
            g in any::<u8>(),
            b in any::<u8>(),
        ) {
            let (n, tracker) = normalizer(target);
            let image = n.normalize(&solid_png(width, height, [r, g, b])).unwrap();
            prop_assert_eq!(image.shape(), [1, target as usize, target as usize, 3]);
            prop_assert!(image.data().iter().all(|v| (0.0..=1.0).contains(v)));
            prop_assert_eq!(tracker.live(), 0);
        }
    }
}
