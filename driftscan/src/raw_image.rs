//! A single 2-D image layer with masked-pixel awareness.
//!
//! [`RawImage`] wraps an ndarray `Array2<f32>` using matrix indexing
//! `[row, col] = [y, x]` with `(height, width)` dimensions, the convention
//! used throughout this workspace. Pixels carrying the [`NO_DATA`] sentinel
//! are invalid (masked or missing) and are excluded from every aggregate
//! unless an operation documents otherwise.
//!
//! # Coordinate System
//!
//! Pixel `(x, y)` is centred at the real-valued coordinate `(x, y)`:
//! interpolation at integer coordinates returns the pixel value exactly, and
//! [`RawImage::interpolated_add`] at integer coordinates deposits all of the
//! flux into a single pixel. Sub-pixel positions split bilinearly among the
//! four nearest pixels.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};
use crate::psf::Psf;
use crate::{pixel_has_data, NO_DATA};

/// Central image moments of a stamp, used for morphological filtering.
///
/// `m00` is the raw flux sum; the first and second moments are taken about
/// the geometric centre of the image and normalized by `m00` when it is
/// non-zero. Invalid pixels contribute zero weight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMoments {
    pub m00: f32,
    pub m01: f32,
    pub m10: f32,
    pub m11: f32,
    pub m02: f32,
    pub m20: f32,
}

/// A 2-D grid of single-precision pixels with a `NO_DATA` sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    pixels: Array2<f32>,
}

impl RawImage {
    /// Create a zero-filled image of the given size.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            pixels: Array2::zeros((height, width)),
        }
    }

    /// Wrap an existing pixel array.
    pub fn from_array(pixels: Array2<f32>) -> Self {
        Self { pixels }
    }

    /// Image width (number of columns).
    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    /// Image height (number of rows).
    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }

    /// Total pixel count.
    pub fn npixels(&self) -> usize {
        self.pixels.len()
    }

    /// Whether `(x, y)` lies inside `[0, W) x [0, H)`.
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.width() && (y as usize) < self.height()
    }

    /// Pixel value at `(x, y)`, or `NO_DATA` when out of bounds.
    pub fn get_pixel(&self, x: i64, y: i64) -> f32 {
        if self.contains(x, y) {
            self.pixels[[y as usize, x as usize]]
        } else {
            NO_DATA
        }
    }

    /// Whether the pixel at `(x, y)` is in bounds and carries valid data.
    pub fn pixel_has_data(&self, x: i64, y: i64) -> bool {
        pixel_has_data(self.get_pixel(x, y))
    }

    /// Set the pixel at `(x, y)`. Out-of-bounds writes are ignored.
    pub fn set_pixel(&mut self, x: i64, y: i64, value: f32) {
        if self.contains(x, y) {
            self.pixels[[y as usize, x as usize]] = value;
        }
    }

    /// Set every pixel to `value`.
    pub fn set_all(&mut self, value: f32) {
        self.pixels.fill(value);
    }

    /// Borrow the underlying pixel array.
    pub fn pixels(&self) -> &Array2<f32> {
        &self.pixels
    }

    /// Mutably borrow the underlying pixel array.
    pub fn pixels_mut(&mut self) -> &mut Array2<f32> {
        &mut self.pixels
    }

    /// Bilinear interpolation at a real-valued position.
    ///
    /// Returns `NO_DATA` when any of the four contributing pixels is out of
    /// bounds or invalid.
    pub fn get_pixel_interp(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let dx = x - x0;
        let dy = y - y0;
        let (ix, iy) = (x0 as i64, y0 as i64);

        let mut value = 0.0;
        for (xx, yy, weight) in [
            (ix, iy, (1.0 - dx) * (1.0 - dy)),
            (ix + 1, iy, dx * (1.0 - dy)),
            (ix, iy + 1, (1.0 - dx) * dy),
            (ix + 1, iy + 1, dx * dy),
        ] {
            if weight > 0.0 {
                let pixel = self.get_pixel(xx, yy);
                if !pixel_has_data(pixel) {
                    return NO_DATA;
                }
                value += weight * pixel;
            }
        }
        value
    }

    /// Bilinearly distribute `value` over the four pixels nearest `(x, y)`.
    ///
    /// Contributions falling outside the image or onto invalid pixels are
    /// dropped.
    pub fn interpolated_add(&mut self, x: f32, y: f32, value: f32) {
        let x0 = x.floor();
        let y0 = y.floor();
        let dx = x - x0;
        let dy = y - y0;
        let (ix, iy) = (x0 as i64, y0 as i64);

        for (xx, yy, weight) in [
            (ix, iy, (1.0 - dx) * (1.0 - dy)),
            (ix + 1, iy, dx * (1.0 - dy)),
            (ix, iy + 1, (1.0 - dx) * dy),
            (ix + 1, iy + 1, dx * dy),
        ] {
            if weight > 0.0 && self.pixel_has_data(xx, yy) {
                let current = self.get_pixel(xx, yy);
                self.set_pixel(xx, yy, current + weight * value);
            }
        }
    }

    /// Extract a `(2r+1) x (2r+1)` cutout centred on `round(x), round(y)`.
    ///
    /// Samples falling outside the image become `NO_DATA` when
    /// `keep_no_data` is set and 0.0 otherwise. In-image invalid pixels are
    /// treated the same way.
    pub fn create_stamp(&self, x: f32, y: f32, radius: usize, keep_no_data: bool) -> RawImage {
        let dim = 2 * radius + 1;
        let cx = x.round() as i64;
        let cy = y.round() as i64;

        let mut stamp = Array2::zeros((dim, dim));
        for i in 0..dim {
            for j in 0..dim {
                let px = cx - radius as i64 + j as i64;
                let py = cy - radius as i64 + i as i64;
                let pixel = self.get_pixel(px, py);
                stamp[[i, j]] = if pixel_has_data(pixel) {
                    pixel
                } else if keep_no_data {
                    NO_DATA
                } else {
                    0.0
                };
            }
        }
        RawImage::from_array(stamp)
    }

    /// Locate the brightest valid pixel, returning `(x, y)`.
    ///
    /// Equal-valued peaks are resolved by squared distance from the image
    /// centre: the farthest wins when `furthest_from_center` is set, the
    /// nearest otherwise. Remaining equidistant ties resolve to the smallest
    /// `(y, x)` in row-major order. An image with no valid pixels reports
    /// `(0, 0)`.
    pub fn find_peak(&self, furthest_from_center: bool) -> (usize, usize) {
        let cx = (self.width() / 2) as f32;
        let cy = (self.height() / 2) as f32;

        let mut best: Option<(usize, usize, f32, f32)> = None;
        for ((row, col), &value) in self.pixels.indexed_iter() {
            if !pixel_has_data(value) {
                continue;
            }
            let dist = (col as f32 - cx).powi(2) + (row as f32 - cy).powi(2);
            let replace = match best {
                None => true,
                Some((_, _, best_value, best_dist)) => {
                    value > best_value
                        || (value == best_value
                            && if furthest_from_center {
                                dist > best_dist
                            } else {
                                dist < best_dist
                            })
                }
            };
            if replace {
                best = Some((col, row, value, dist));
            }
        }

        match best {
            Some((x, y, _, _)) => (x, y),
            None => (0, 0),
        }
    }

    /// Central image moments about the geometric centre.
    ///
    /// Invalid pixels contribute zero. First and second moments are
    /// normalized by `m00` when the total is non-zero.
    pub fn find_central_moments(&self) -> ImageMoments {
        let cx = (self.width() / 2) as f32;
        let cy = (self.height() / 2) as f32;

        let mut moments = ImageMoments::default();
        for ((row, col), &value) in self.pixels.indexed_iter() {
            if !pixel_has_data(value) {
                continue;
            }
            let dx = col as f32 - cx;
            let dy = row as f32 - cy;
            moments.m00 += value;
            moments.m10 += dx * value;
            moments.m01 += dy * value;
            moments.m11 += dx * dy * value;
            moments.m20 += dx * dx * value;
            moments.m02 += dy * dy * value;
        }

        if moments.m00 != 0.0 {
            moments.m10 /= moments.m00;
            moments.m01 /= moments.m00;
            moments.m11 /= moments.m00;
            moments.m20 /= moments.m00;
            moments.m02 /= moments.m00;
        }
        moments
    }

    /// Convolve in place with the given kernel.
    ///
    /// Invalid input pixels are excluded from both the sum and the kernel
    /// weight; the result is rescaled by `kernel_sum / used_weight` so that
    /// a fully-covered footprint reproduces plain convolution and partial
    /// footprints (edges, masked neighbours) stay flux-consistent. An
    /// invalid centre pixel, or a footprint with no usable weight, yields
    /// `NO_DATA`.
    pub fn convolve(&mut self, psf: &Psf) {
        let width = self.width() as i64;
        let height = self.height() as i64;
        let radius = psf.get_radius() as i64;
        let kernel_sum = psf.get_sum();

        let mut output = Array2::zeros((self.height(), self.width()));
        for y in 0..height {
            for x in 0..width {
                let center = self.pixels[[y as usize, x as usize]];
                if !pixel_has_data(center) {
                    output[[y as usize, x as usize]] = NO_DATA;
                    continue;
                }

                let mut sum = 0.0;
                let mut used_weight = 0.0;
                for dy in -radius..=radius {
                    for dx in -radius..=radius {
                        let px = x + dx;
                        let py = y + dy;
                        if px < 0 || py < 0 || px >= width || py >= height {
                            continue;
                        }
                        let pixel = self.pixels[[py as usize, px as usize]];
                        if !pixel_has_data(pixel) {
                            continue;
                        }
                        let k = psf.get_value((dy + radius) as usize, (dx + radius) as usize);
                        sum += k * pixel;
                        used_weight += k;
                    }
                }

                output[[y as usize, x as usize]] = if used_weight > 0.0 {
                    sum * (kernel_sum / used_weight)
                } else {
                    NO_DATA
                };
            }
        }
        self.pixels = output;
    }

    /// Minimum and maximum over valid pixels.
    ///
    /// Returns `(NO_DATA, NO_DATA)` when the image has no valid pixels.
    pub fn compute_bounds(&self) -> (f32, f32) {
        let mut bounds: Option<(f32, f32)> = None;
        for &value in self.pixels.iter() {
            if !pixel_has_data(value) {
                continue;
            }
            bounds = Some(match bounds {
                None => (value, value),
                Some((lo, hi)) => (lo.min(value), hi.max(value)),
            });
        }
        bounds.unwrap_or((NO_DATA, NO_DATA))
    }
}

fn check_same_dims(images: &[RawImage]) -> Result<(usize, usize)> {
    let first = images.first().ok_or_else(|| {
        SearchError::InvalidArgument("cannot coadd an empty list of images".to_string())
    })?;
    let dims = (first.height(), first.width());
    for img in images {
        if (img.height(), img.width()) != dims {
            return Err(SearchError::DimensionMismatch {
                expected: dims,
                actual: (img.height(), img.width()),
            });
        }
    }
    Ok(dims)
}

/// Per-pixel median across a set of same-sized images.
///
/// Invalid samples are skipped; the median of an even count is the mean of
/// the two middle order statistics. A pixel with no valid samples becomes
/// 0.0.
pub fn create_median_image(images: &[RawImage]) -> Result<RawImage> {
    let (height, width) = check_same_dims(images)?;

    let mut result = Array2::zeros((height, width));
    let mut samples = Vec::with_capacity(images.len());
    for y in 0..height {
        for x in 0..width {
            samples.clear();
            for img in images {
                let value = img.pixels[[y, x]];
                if pixel_has_data(value) {
                    samples.push(value);
                }
            }
            if samples.is_empty() {
                continue;
            }
            samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = samples.len() / 2;
            result[[y, x]] = if samples.len() % 2 == 0 {
                0.5 * (samples[mid - 1] + samples[mid])
            } else {
                samples[mid]
            };
        }
    }
    Ok(RawImage::from_array(result))
}

/// Per-pixel mean across a set of same-sized images, skipping invalid
/// samples. A pixel with no valid samples becomes 0.0.
pub fn create_mean_image(images: &[RawImage]) -> Result<RawImage> {
    let (height, width) = check_same_dims(images)?;

    let mut result = Array2::zeros((height, width));
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0;
            let mut count = 0usize;
            for img in images {
                let value = img.pixels[[y, x]];
                if pixel_has_data(value) {
                    sum += value;
                    count += 1;
                }
            }
            if count > 0 {
                result[[y, x]] = sum / count as f32;
            }
        }
    }
    Ok(RawImage::from_array(result))
}

/// Per-pixel sum across a set of same-sized images, counting invalid
/// samples as 0.0.
pub fn create_summed_image(images: &[RawImage]) -> Result<RawImage> {
    let (height, width) = check_same_dims(images)?;

    let mut result = Array2::zeros((height, width));
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0;
            for img in images {
                let value = img.pixels[[y, x]];
                if pixel_has_data(value) {
                    sum += value;
                }
            }
            result[[y, x]] = sum;
        }
    }
    Ok(RawImage::from_array(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ramp_image(width: usize, height: usize) -> RawImage {
        RawImage::from_array(Array2::from_shape_fn((height, width), |(y, x)| {
            (y * width + x) as f32
        }))
    }

    #[test]
    fn test_get_pixel_bounds() {
        let img = ramp_image(4, 3);
        assert_eq!(img.get_pixel(0, 0), 0.0);
        assert_eq!(img.get_pixel(3, 2), 11.0);
        assert_eq!(img.get_pixel(-1, 0), NO_DATA);
        assert_eq!(img.get_pixel(4, 0), NO_DATA);
        assert_eq!(img.get_pixel(0, 3), NO_DATA);
        assert!(!img.contains(0, -1));
        assert!(img.contains(3, 2));
    }

    #[test]
    fn test_interp_at_integer_is_exact() {
        let img = ramp_image(4, 4);
        assert_eq!(img.get_pixel_interp(2.0, 1.0), 6.0);
    }

    #[test]
    fn test_interp_midpoint() {
        let img = ramp_image(4, 4);
        // Halfway between pixels (1,1)=5 and (2,1)=6.
        assert!((img.get_pixel_interp(1.5, 1.0) - 5.5).abs() < 1e-6);
        // Center of a 2x2 block: mean of 5, 6, 9, 10.
        assert!((img.get_pixel_interp(1.5, 1.5) - 7.5).abs() < 1e-6);
    }

    #[test]
    fn test_interp_no_data_neighbor() {
        let mut img = ramp_image(4, 4);
        img.set_pixel(2, 1, NO_DATA);
        assert_eq!(img.get_pixel_interp(1.5, 1.0), NO_DATA);
        // Pixels not adjacent to the hole still interpolate.
        assert!((img.get_pixel_interp(0.5, 3.0) - 12.5).abs() < 1e-6);
    }

    #[test]
    fn test_interpolated_add_integer_center() {
        let mut img = RawImage::new(5, 5);
        img.interpolated_add(2.0, 3.0, 10.0);
        assert_eq!(img.get_pixel(2, 3), 10.0);
        assert_eq!(img.get_pixel(3, 3), 0.0);
    }

    #[test]
    fn test_interpolated_add_split() {
        let mut img = RawImage::new(5, 5);
        img.interpolated_add(2.5, 3.0, 10.0);
        assert!((img.get_pixel(2, 3) - 5.0).abs() < 1e-6);
        assert!((img.get_pixel(3, 3) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_create_stamp_interior() {
        let img = ramp_image(6, 6);
        let stamp = img.create_stamp(2.0, 3.0, 1, true);
        assert_eq!(stamp.width(), 3);
        assert_eq!(stamp.height(), 3);
        assert_eq!(stamp.get_pixel(1, 1), img.get_pixel(2, 3));
        assert_eq!(stamp.get_pixel(0, 0), img.get_pixel(1, 2));
    }

    #[test]
    fn test_create_stamp_edge_fill() {
        let img = ramp_image(6, 6);
        let kept = img.create_stamp(0.0, 0.0, 1, true);
        assert_eq!(kept.get_pixel(0, 0), NO_DATA);
        assert_eq!(kept.get_pixel(1, 1), 0.0);

        let zeroed = img.create_stamp(0.0, 0.0, 1, false);
        assert_eq!(zeroed.get_pixel(0, 0), 0.0);
    }

    #[test]
    fn test_find_peak_simple() {
        let mut img = RawImage::new(7, 7);
        img.set_pixel(5, 2, 8.0);
        img.set_pixel(1, 1, 3.0);
        assert_eq!(img.find_peak(false), (5, 2));
        assert_eq!(img.find_peak(true), (5, 2));
    }

    #[test]
    fn test_find_peak_tie_break() {
        let mut img = RawImage::new(7, 7);
        // Two equal peaks: one adjacent to the center, one in a corner.
        img.set_pixel(3, 2, 8.0);
        img.set_pixel(6, 6, 8.0);
        assert_eq!(img.find_peak(false), (3, 2));
        assert_eq!(img.find_peak(true), (6, 6));
    }

    #[test]
    fn test_find_peak_ignores_no_data() {
        let mut img = RawImage::new(5, 5);
        img.set_all(NO_DATA);
        img.set_pixel(1, 4, -3.0);
        assert_eq!(img.find_peak(false), (1, 4));
    }

    #[test]
    fn test_central_moments_point_source() {
        let mut img = RawImage::new(5, 5);
        img.set_pixel(2, 2, 10.0);
        let m = img.find_central_moments();
        assert_eq!(m.m00, 10.0);
        assert_eq!(m.m01, 0.0);
        assert_eq!(m.m10, 0.0);
        assert_eq!(m.m02, 0.0);
        assert_eq!(m.m20, 0.0);
    }

    #[test]
    fn test_central_moments_offset_source() {
        let mut img = RawImage::new(5, 5);
        img.set_pixel(3, 2, 10.0);
        let m = img.find_central_moments();
        assert_eq!(m.m00, 10.0);
        assert!((m.m10 - 1.0).abs() < 1e-6);
        assert_eq!(m.m01, 0.0);
        assert!((m.m20 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_convolve_conserves_flux() {
        let mut img = RawImage::new(15, 15);
        img.set_pixel(7, 7, 100.0);
        let before: f32 = img.pixels().iter().sum();

        let psf = Psf::from_gaussian(1.0).unwrap();
        img.convolve(&psf);
        let after: f32 = img.pixels().iter().sum();
        assert!((before - after).abs() < 1e-3);
    }

    #[test]
    fn test_convolve_preserves_no_data() {
        let mut img = RawImage::new(7, 7);
        img.set_all(1.0);
        img.set_pixel(3, 3, NO_DATA);

        let psf = Psf::from_gaussian(0.5).unwrap();
        img.convolve(&psf);
        assert_eq!(img.get_pixel(3, 3), NO_DATA);
        // Neighbours renormalize around the hole and stay near 1.0.
        assert!((img.get_pixel(2, 3) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_compute_bounds_skips_no_data() {
        let mut img = RawImage::new(3, 3);
        img.set_all(NO_DATA);
        img.set_pixel(0, 0, -5.0);
        img.set_pixel(2, 2, 15.0);
        assert_eq!(img.compute_bounds(), (-5.0, 15.0));
    }

    #[test]
    fn test_compute_bounds_empty() {
        let mut img = RawImage::new(2, 2);
        img.set_all(NO_DATA);
        assert_eq!(img.compute_bounds(), (NO_DATA, NO_DATA));
    }

    #[test]
    fn test_median_mean_sum_images() {
        let a = RawImage::from_array(array![[1.0, NO_DATA], [3.0, 4.0]]);
        let b = RawImage::from_array(array![[3.0, NO_DATA], [5.0, 6.0]]);
        let c = RawImage::from_array(array![[8.0, 2.0], [7.0, NO_DATA]]);
        let images = vec![a, b, c];

        let median = create_median_image(&images).unwrap();
        assert_eq!(median.get_pixel(0, 0), 3.0);
        assert_eq!(median.get_pixel(1, 0), 2.0);
        assert_eq!(median.get_pixel(0, 1), 5.0);
        assert_eq!(median.get_pixel(1, 1), 5.0);

        let mean = create_mean_image(&images).unwrap();
        assert!((mean.get_pixel(0, 0) - 4.0).abs() < 1e-6);
        assert_eq!(mean.get_pixel(1, 0), 2.0);
        assert!((mean.get_pixel(1, 1) - 5.0).abs() < 1e-6);

        let sum = create_summed_image(&images).unwrap();
        assert_eq!(sum.get_pixel(0, 0), 12.0);
        assert_eq!(sum.get_pixel(1, 0), 2.0);
        assert_eq!(sum.get_pixel(1, 1), 10.0);
    }

    #[test]
    fn test_coadd_rejects_bad_input() {
        assert!(create_mean_image(&[]).is_err());
        let images = vec![RawImage::new(2, 2), RawImage::new(3, 2)];
        assert!(create_median_image(&images).is_err());
    }
}
