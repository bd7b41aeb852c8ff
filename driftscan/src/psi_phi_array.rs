//! Packed psi/phi storage for the trajectory-sampling hot loop.
//!
//! The grid search reads one (psi, phi) pair per image per candidate, so
//! the pairs for all images live in a single contiguous buffer in
//! image-major, row-major order:
//!
//! ```text
//! entry(t, y, x) = t * width * height + y * width + x
//! ```
//!
//! with the two values of each entry interleaved (`psi` then `phi`). The
//! same layout is what an accelerator kernel would map, so the buffer can
//! be handed over without repacking.
//!
//! Values are stored as `f32`, or quantized to one or two bytes per value
//! with per-image scale parameters. Quantization reserves the encoded
//! value 0 for [`NO_DATA`](crate::NO_DATA); real values occupy
//! `[1, 2^bits - 1]`, so the per-image minimum stays distinguishable from
//! the sentinel and the round-trip error is bounded by one scale step.

use crate::error::{Result, SearchError};
use crate::raw_image::RawImage;
use crate::{pixel_has_data, NO_DATA};

/// One decoded (psi, phi) sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsiPhi {
    pub psi: f32,
    pub phi: f32,
}

/// Per-image quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleParams {
    pub min_val: f32,
    pub max_val: f32,
    pub scale: f32,
}

#[derive(Debug, Clone)]
enum PsiPhiStore {
    Float(Vec<f32>),
    U16(Vec<u16>),
    U8(Vec<u8>),
}

/// The packed, optionally quantized psi/phi buffer plus per-image times.
#[derive(Debug, Clone)]
pub struct PsiPhiArray {
    num_bytes: usize,
    num_times: usize,
    width: usize,
    height: usize,
    psi_params: Vec<ScaleParams>,
    phi_params: Vec<ScaleParams>,
    zeroed_times: Vec<f64>,
    store: PsiPhiStore,
}

/// Compute per-image (min, max, scale) for quantized encoding.
///
/// The value range is widened to at least 1e-6 so the scale never
/// degenerates. With `num_bytes` of 1 or 2 the scale maps the range onto
/// `2^bits - 1` steps; any other byte width means unencoded floats and a
/// scale of 1.
pub fn compute_scale_params(images: &[RawImage], num_bytes: usize) -> Vec<ScaleParams> {
    images
        .iter()
        .map(|img| {
            let (min_val, max_val) = img.compute_bounds();
            let width = (max_val - min_val).max(1e-6);
            let scale = match num_bytes {
                1 | 2 => width / ((1u32 << (8 * num_bytes)) - 1) as f32,
                _ => 1.0,
            };
            ScaleParams {
                min_val,
                max_val,
                scale,
            }
        })
        .collect()
}

/// Quantize one value. `NO_DATA` maps to 0; everything else lands in
/// `[1, max_value]`.
pub fn encode_uint_scalar(value: f32, params: &ScaleParams, max_value: u32) -> u32 {
    if !pixel_has_data(value) {
        return 0;
    }
    let step = ((value - params.min_val) / params.scale).round() + 1.0;
    (step.max(1.0) as u32).min(max_value)
}

/// Invert [`encode_uint_scalar`]; an encoded 0 decodes to `NO_DATA`.
pub fn decode_uint_scalar(encoded: u32, params: &ScaleParams) -> f32 {
    if encoded == 0 {
        NO_DATA
    } else {
        params.min_val + (encoded - 1) as f32 * params.scale
    }
}

impl PsiPhiArray {
    /// Pack per-image psi and phi planes into one buffer.
    ///
    /// # Arguments
    /// * `num_bytes` - 1 or 2 for quantized storage, anything else for f32
    /// * `psi_images` / `phi_images` - same-length lists of same-sized planes
    /// * `zeroed_times` - per-image times relative to the first exposure
    pub fn from_images(
        num_bytes: usize,
        psi_images: &[RawImage],
        phi_images: &[RawImage],
        zeroed_times: Vec<f64>,
    ) -> Result<Self> {
        if psi_images.len() != phi_images.len() || psi_images.len() != zeroed_times.len() {
            return Err(SearchError::InvalidArgument(format!(
                "psi/phi/time counts disagree: {} / {} / {}",
                psi_images.len(),
                phi_images.len(),
                zeroed_times.len()
            )));
        }
        if psi_images.is_empty() {
            return Err(SearchError::InvalidArgument(
                "cannot build a psi/phi array from zero images".to_string(),
            ));
        }

        let width = psi_images[0].width();
        let height = psi_images[0].height();
        for img in psi_images.iter().chain(phi_images.iter()) {
            if (img.height(), img.width()) != (height, width) {
                return Err(SearchError::DimensionMismatch {
                    expected: (height, width),
                    actual: (img.height(), img.width()),
                });
            }
        }

        let num_bytes = match num_bytes {
            1 | 2 => num_bytes,
            _ => 4,
        };
        let psi_params = compute_scale_params(psi_images, num_bytes);
        let phi_params = compute_scale_params(phi_images, num_bytes);

        let num_times = psi_images.len();
        let num_entries = 2 * num_times * width * height;

        let mut array = Self {
            num_bytes,
            num_times,
            width,
            height,
            psi_params,
            phi_params,
            zeroed_times,
            store: PsiPhiStore::Float(Vec::new()),
        };

        array.store = match num_bytes {
            1 => PsiPhiStore::U8(array.pack_quantized(psi_images, phi_images, num_entries)),
            2 => PsiPhiStore::U16(array.pack_quantized(psi_images, phi_images, num_entries)),
            _ => {
                let mut data = Vec::with_capacity(num_entries);
                for t in 0..num_times {
                    for y in 0..height as i64 {
                        for x in 0..width as i64 {
                            data.push(psi_images[t].get_pixel(x, y));
                            data.push(phi_images[t].get_pixel(x, y));
                        }
                    }
                }
                PsiPhiStore::Float(data)
            }
        };
        Ok(array)
    }

    fn pack_quantized<T: TryFrom<u32> + Default + Copy>(
        &self,
        psi_images: &[RawImage],
        phi_images: &[RawImage],
        num_entries: usize,
    ) -> Vec<T> {
        let max_value = (1u32 << (8 * self.num_bytes)) - 1;
        let mut data = Vec::with_capacity(num_entries);
        for t in 0..self.num_times {
            for y in 0..self.height as i64 {
                for x in 0..self.width as i64 {
                    let psi = encode_uint_scalar(
                        psi_images[t].get_pixel(x, y),
                        &self.psi_params[t],
                        max_value,
                    );
                    let phi = encode_uint_scalar(
                        phi_images[t].get_pixel(x, y),
                        &self.phi_params[t],
                        max_value,
                    );
                    data.push(T::try_from(psi).unwrap_or_default());
                    data.push(T::try_from(phi).unwrap_or_default());
                }
            }
        }
        data
    }

    /// Decoded (psi, phi) at image `time`, pixel `(x, y)`.
    ///
    /// Out-of-bounds reads return a pair of `NO_DATA`.
    pub fn read_psi_phi(&self, time: usize, x: i64, y: i64) -> PsiPhi {
        if time >= self.num_times
            || x < 0
            || y < 0
            || x as usize >= self.width
            || y as usize >= self.height
        {
            return PsiPhi {
                psi: NO_DATA,
                phi: NO_DATA,
            };
        }

        let index = 2 * (time * self.pixels_per_image() + y as usize * self.width + x as usize);
        match &self.store {
            PsiPhiStore::Float(data) => PsiPhi {
                psi: data[index],
                phi: data[index + 1],
            },
            PsiPhiStore::U16(data) => PsiPhi {
                psi: decode_uint_scalar(data[index] as u32, &self.psi_params[time]),
                phi: decode_uint_scalar(data[index + 1] as u32, &self.phi_params[time]),
            },
            PsiPhiStore::U8(data) => PsiPhi {
                psi: decode_uint_scalar(data[index] as u32, &self.psi_params[time]),
                phi: decode_uint_scalar(data[index + 1] as u32, &self.phi_params[time]),
            },
        }
    }

    /// Zeroed time of image `time`.
    pub fn read_time(&self, time: usize) -> f64 {
        self.zeroed_times[time]
    }

    pub fn zeroed_times(&self) -> &[f64] {
        &self.zeroed_times
    }

    /// Bytes per stored value (4 when unencoded).
    pub fn block_size(&self) -> usize {
        self.num_bytes
    }

    pub fn num_times(&self) -> usize {
        self.num_times
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels_per_image(&self) -> usize {
        self.width * self.height
    }

    /// Stored values across all images: two per pixel per image.
    pub fn num_entries(&self) -> usize {
        2 * self.num_times * self.pixels_per_image()
    }

    /// Total buffer size in bytes.
    pub fn total_array_size(&self) -> usize {
        self.num_entries() * self.block_size()
    }

    pub fn psi_params(&self, time: usize) -> &ScaleParams {
        &self.psi_params[time]
    }

    pub fn phi_params(&self, time: usize) -> &ScaleParams {
        &self.phi_params[time]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn ramp(width: usize, height: usize, offset: f32) -> RawImage {
        RawImage::from_array(Array2::from_shape_fn((height, width), |(y, x)| {
            offset + (y * width + x) as f32
        }))
    }

    fn flat(width: usize, height: usize, value: f32) -> RawImage {
        RawImage::from_array(Array2::from_elem((height, width), value))
    }

    fn build(num_bytes: usize) -> PsiPhiArray {
        let psi = vec![ramp(4, 5, 0.0), ramp(4, 5, 20.0)];
        let phi = vec![flat(4, 5, 0.1), flat(4, 5, 0.2)];
        PsiPhiArray::from_images(num_bytes, &psi, &phi, vec![0.0, 1.0]).unwrap()
    }

    #[test]
    fn test_meta_data() {
        for (num_bytes, block) in [(4, 4), (2, 2), (1, 1), (7, 4)] {
            let arr = build(num_bytes);
            assert_eq!(arr.block_size(), block);
            assert_eq!(arr.num_times(), 2);
            assert_eq!(arr.width(), 4);
            assert_eq!(arr.height(), 5);
            assert_eq!(arr.pixels_per_image(), 20);
            assert_eq!(arr.num_entries(), 80);
            assert_eq!(arr.total_array_size(), 80 * block);
        }
    }

    #[test]
    fn test_scale_params() {
        let images = vec![ramp(4, 5, 0.0), ramp(4, 5, 20.0)];
        let float_params = compute_scale_params(&images, 4);
        assert_eq!(float_params[0].min_val, 0.0);
        assert_eq!(float_params[0].max_val, 19.0);
        assert_eq!(float_params[0].scale, 1.0);

        let u8_params = compute_scale_params(&images, 1);
        assert!((u8_params[0].scale - 19.0 / 255.0).abs() < 1e-6);
        let u16_params = compute_scale_params(&images, 2);
        assert!((u16_params[1].scale - 19.0 / 65535.0).abs() < 1e-6);
    }

    #[test]
    fn test_scale_width_never_zero() {
        let images = vec![flat(3, 3, 7.0)];
        let params = compute_scale_params(&images, 2);
        assert!(params[0].scale > 0.0);
    }

    #[test]
    fn test_encode_decode_scalar() {
        let params = ScaleParams {
            min_val: 0.0,
            max_val: 10.0,
            scale: 0.1,
        };
        assert_eq!(encode_uint_scalar(0.0, &params, 65535), 1);
        assert_eq!(encode_uint_scalar(0.1, &params, 65535), 2);
        assert_eq!(encode_uint_scalar(1.0, &params, 65535), 11);
        assert_eq!(encode_uint_scalar(NO_DATA, &params, 65535), 0);
        // Clipping at both ends.
        assert_eq!(encode_uint_scalar(-100.0, &params, 65535), 1);
        assert_eq!(encode_uint_scalar(1e9, &params, 255), 255);

        assert_eq!(decode_uint_scalar(0, &params), NO_DATA);
        assert!((decode_uint_scalar(1, &params) - 0.0).abs() < 1e-6);
        assert!((decode_uint_scalar(11, &params) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_read_float_store() {
        let arr = build(4);
        for t in 0..2 {
            for y in 0..5 {
                for x in 0..4 {
                    let value = arr.read_psi_phi(t, x as i64, y as i64);
                    let expected_psi = (t * 20 + y * 4 + x) as f32;
                    assert_eq!(value.psi, expected_psi);
                    assert!((value.phi - 0.1 * (t + 1) as f32).abs() < 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_quantized_round_trip_error_bound() {
        for num_bytes in [1usize, 2] {
            let arr = build(num_bytes);
            for t in 0..2 {
                let tolerance = arr.psi_params(t).scale * 1.01;
                for y in 0..5 {
                    for x in 0..4 {
                        let value = arr.read_psi_phi(t, x as i64, y as i64);
                        let expected_psi = (t * 20 + y * 4 + x) as f32;
                        assert!(
                            (value.psi - expected_psi).abs() <= tolerance,
                            "psi {} vs {expected_psi} at t={t} x={x} y={y}",
                            value.psi
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_no_data_round_trips() {
        let mut psi = ramp(4, 4, 0.0);
        psi.set_pixel(2, 2, NO_DATA);
        let phi = flat(4, 4, 0.5);
        for num_bytes in [1usize, 2, 4] {
            let arr =
                PsiPhiArray::from_images(num_bytes, &[psi.clone()], &[phi.clone()], vec![0.0])
                    .unwrap();
            assert_eq!(arr.read_psi_phi(0, 2, 2).psi, NO_DATA);
            assert!(pixel_has_data(arr.read_psi_phi(0, 1, 2).psi));
        }
    }

    #[test]
    fn test_out_of_bounds_reads() {
        let arr = build(4);
        assert_eq!(arr.read_psi_phi(0, -1, 0).psi, NO_DATA);
        assert_eq!(arr.read_psi_phi(0, 0, 5).phi, NO_DATA);
        assert_eq!(arr.read_psi_phi(2, 0, 0).psi, NO_DATA);
    }

    #[test]
    fn test_mismatched_inputs_rejected() {
        let psi = vec![ramp(4, 4, 0.0)];
        let phi = vec![flat(4, 4, 1.0), flat(4, 4, 1.0)];
        assert!(PsiPhiArray::from_images(4, &psi, &phi, vec![0.0]).is_err());

        let phi_bad = vec![flat(5, 4, 1.0)];
        assert!(PsiPhiArray::from_images(4, &psi, &phi_bad, vec![0.0]).is_err());
    }

    #[test]
    fn test_times() {
        let arr = build(2);
        assert_eq!(arr.read_time(0), 0.0);
        assert_eq!(arr.read_time(1), 1.0);
        assert_eq!(arr.zeroed_times(), &[0.0, 1.0]);
    }
}
