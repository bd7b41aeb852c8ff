//! Point-spread-function kernels.
//!
//! A [`Psf`] is a square, odd-sided convolution kernel describing how a point
//! source spreads over neighbouring pixels in a single exposure. Kernels are
//! normalized to unit sum so that convolution conserves flux; the squared
//! kernel (used for variance propagation) is deliberately left unnormalized.

use ndarray::Array2;

use crate::error::{Result, SearchError};

/// Normalization tolerance: after [`Psf::normalize`] the kernel sums to
/// 1.0 within this bound.
pub const PSF_SUM_TOLERANCE: f32 = 1e-6;

/// A square, odd-sided PSF kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct Psf {
    kernel: Array2<f32>,
    radius: usize,
}

impl Psf {
    /// Build a PSF from an explicit kernel.
    ///
    /// The kernel must be square with an odd side length. The values are
    /// normalized to unit sum.
    ///
    /// # Arguments
    /// * `kernel` - Square kernel values, `(2r+1, 2r+1)`
    pub fn new(kernel: Array2<f32>) -> Result<Self> {
        let (rows, cols) = kernel.dim();
        if rows != cols {
            return Err(SearchError::InvalidArgument(format!(
                "PSF kernel must be square, got {rows}x{cols}"
            )));
        }
        if rows % 2 == 0 || rows == 0 {
            return Err(SearchError::InvalidArgument(format!(
                "PSF kernel side must be odd, got {rows}"
            )));
        }

        let mut psf = Self {
            radius: rows / 2,
            kernel,
        };
        psf.normalize();
        Ok(psf)
    }

    /// Build a Gaussian PSF with the given standard deviation in pixels.
    ///
    /// The kernel radius is `ceil(3 sigma)`, wide enough that the truncated
    /// tails carry a negligible fraction of the flux. The kernel is
    /// normalized to unit sum.
    pub fn from_gaussian(sigma: f32) -> Result<Self> {
        if sigma <= 0.0 || !sigma.is_finite() {
            return Err(SearchError::InvalidArgument(format!(
                "PSF sigma must be positive, got {sigma}"
            )));
        }

        let radius = (3.0 * sigma).ceil().max(1.0) as usize;
        let dim = 2 * radius + 1;
        let mut kernel = Array2::zeros((dim, dim));
        for i in 0..dim {
            for j in 0..dim {
                let dy = i as f32 - radius as f32;
                let dx = j as f32 - radius as f32;
                kernel[[i, j]] = (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            }
        }

        Self::new(kernel)
    }

    /// Rescale the kernel so its elements sum to 1.
    pub fn normalize(&mut self) {
        let sum = self.get_sum();
        if sum > 0.0 {
            self.kernel.mapv_inplace(|v| v / sum);
        }
    }

    /// Sum of all kernel elements.
    pub fn get_sum(&self) -> f32 {
        self.kernel.iter().sum()
    }

    /// Side length of the kernel (`2r+1`).
    pub fn get_dim(&self) -> usize {
        self.kernel.nrows()
    }

    /// Kernel radius `r`.
    pub fn get_radius(&self) -> usize {
        self.radius
    }

    /// Kernel value at `(row, col)`.
    pub fn get_value(&self, row: usize, col: usize) -> f32 {
        self.kernel[[row, col]]
    }

    /// Raw kernel values.
    pub fn kernel(&self) -> &Array2<f32> {
        &self.kernel
    }

    /// Element-wise squared kernel.
    ///
    /// Used to propagate per-pixel variance through convolution. The result
    /// is not re-normalized: its sum is the effective noise-reduction factor
    /// of the matched filter.
    pub fn squared(&self) -> Psf {
        Psf {
            kernel: self.kernel.mapv(|v| v * v),
            radius: self.radius,
        }
    }
}
