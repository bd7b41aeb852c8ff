//! A single exposure: science, variance, and mask layers plus metadata.
//!
//! The three layers share one pixel grid. The mask layer stores integer bit
//! flags as floats; a pixel is clear when its mask value is exactly zero.
//! Masking operations write the [`NO_DATA`](crate::NO_DATA) sentinel into
//! the science layer, which every downstream aggregate already knows to
//! skip.

use crate::error::{Result, SearchError};
use crate::psf::Psf;
use crate::raw_image::RawImage;
use crate::{pixel_has_data, NO_DATA};

/// One exposure of the input stack.
#[derive(Debug, Clone)]
pub struct LayeredImage {
    science: RawImage,
    variance: RawImage,
    mask: RawImage,
    obstime: f64,
    psf: Psf,
}

impl LayeredImage {
    /// Assemble an exposure from its three layers.
    ///
    /// # Arguments
    /// * `science` - Calibrated flux values
    /// * `variance` - Per-pixel noise variance
    /// * `mask` - Integer bit flags stored as floats, 0 = clear
    /// * `psf` - The exposure's point-spread function
    /// * `obstime` - Observation time (MJD)
    ///
    /// Fails when the layers disagree on dimensions.
    pub fn new(
        science: RawImage,
        variance: RawImage,
        mask: RawImage,
        psf: Psf,
        obstime: f64,
    ) -> Result<Self> {
        let dims = (science.height(), science.width());
        for layer in [&variance, &mask] {
            if (layer.height(), layer.width()) != dims {
                return Err(SearchError::DimensionMismatch {
                    expected: dims,
                    actual: (layer.height(), layer.width()),
                });
            }
        }
        Ok(Self {
            science,
            variance,
            mask,
            obstime,
            psf,
        })
    }

    pub fn width(&self) -> usize {
        self.science.width()
    }

    pub fn height(&self) -> usize {
        self.science.height()
    }

    pub fn npixels(&self) -> usize {
        self.science.npixels()
    }

    pub fn get_obstime(&self) -> f64 {
        self.obstime
    }

    pub fn set_obstime(&mut self, obstime: f64) {
        self.obstime = obstime;
    }

    pub fn get_psf(&self) -> &Psf {
        &self.psf
    }

    pub fn set_psf(&mut self, psf: Psf) {
        self.psf = psf;
    }

    pub fn get_science(&self) -> &RawImage {
        &self.science
    }

    pub fn get_science_mut(&mut self) -> &mut RawImage {
        &mut self.science
    }

    pub fn get_variance(&self) -> &RawImage {
        &self.variance
    }

    pub fn get_variance_mut(&mut self) -> &mut RawImage {
        &mut self.variance
    }

    pub fn get_mask(&self) -> &RawImage {
        &self.mask
    }

    pub fn get_mask_mut(&mut self) -> &mut RawImage {
        &mut self.mask
    }

    /// Replace the mask layer. Fails on a dimension mismatch.
    pub fn set_mask(&mut self, mask: RawImage) -> Result<()> {
        if (mask.height(), mask.width()) != (self.height(), self.width()) {
            return Err(SearchError::DimensionMismatch {
                expected: (self.height(), self.width()),
                actual: (mask.height(), mask.width()),
            });
        }
        self.mask = mask;
        Ok(())
    }

    /// Convolve the science layer with the PSF and the variance layer with
    /// the squared PSF, in place.
    ///
    /// The squared kernel is the correct propagation for white-noise
    /// variance. Call this before generating psi or phi images.
    pub fn convolve_psf(&mut self) {
        let squared = self.psf.squared();
        self.science.convolve(&self.psf);
        self.variance.convolve(&squared);
    }

    /// Mask science pixels whose mask value intersects `flags`.
    ///
    /// A pixel whose full mask value appears in `exceptions` is left alone
    /// even when it intersects the flags.
    pub fn apply_mask_flags(&mut self, flags: u32, exceptions: &[u32]) {
        for y in 0..self.height() as i64 {
            for x in 0..self.width() as i64 {
                let mask_value = self.mask.get_pixel(x, y) as u32;
                if mask_value & flags != 0 && !exceptions.contains(&mask_value) {
                    self.science.set_pixel(x, y, NO_DATA);
                }
            }
        }
    }

    /// Mask science pixels at or above `threshold`.
    pub fn apply_mask_threshold(&mut self, threshold: f32) {
        for y in 0..self.height() as i64 {
            for x in 0..self.width() as i64 {
                let value = self.science.get_pixel(x, y);
                if pixel_has_data(value) && value >= threshold {
                    self.science.set_pixel(x, y, NO_DATA);
                }
            }
        }
    }

    /// Mask science pixels flagged in an externally-built mask image
    /// (non-zero = masked).
    pub fn apply_global_mask(&mut self, global_mask: &RawImage) -> Result<()> {
        if (global_mask.height(), global_mask.width()) != (self.height(), self.width()) {
            return Err(SearchError::DimensionMismatch {
                expected: (self.height(), self.width()),
                actual: (global_mask.height(), global_mask.width()),
            });
        }
        for y in 0..self.height() as i64 {
            for x in 0..self.width() as i64 {
                if global_mask.get_pixel(x, y) != 0.0 {
                    self.science.set_pixel(x, y, NO_DATA);
                }
            }
        }
        Ok(())
    }

    /// Dilate the mask by `steps` iterations of 4-neighbour growth.
    ///
    /// Newly-masked pixels receive the value 1.
    pub fn grow_mask(&mut self, steps: usize) {
        let width = self.width() as i64;
        let height = self.height() as i64;
        for _ in 0..steps {
            let mut grown = Vec::new();
            for y in 0..height {
                for x in 0..width {
                    if self.mask.get_pixel(x, y) != 0.0 {
                        continue;
                    }
                    let touches_masked = [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)]
                        .iter()
                        .any(|&(nx, ny)| {
                            self.mask.contains(nx, ny) && self.mask.get_pixel(nx, ny) != 0.0
                        });
                    if touches_masked {
                        grown.push((x, y));
                    }
                }
            }
            for (x, y) in grown {
                self.mask.set_pixel(x, y, 1.0);
            }
        }
    }

    /// Build the psi (matched-filter numerator) image: science / variance
    /// where the mask is clear and the variance is positive, `NO_DATA`
    /// elsewhere.
    ///
    /// Meaningful only after [`convolve_psf`](Self::convolve_psf).
    pub fn generate_psi_image(&self) -> RawImage {
        self.generate_ratio_image(|science, variance| science / variance)
    }

    /// Build the phi (matched-filter normalization) image: 1 / variance
    /// where the mask is clear and the variance is positive, `NO_DATA`
    /// elsewhere.
    ///
    /// Meaningful only after [`convolve_psf`](Self::convolve_psf).
    pub fn generate_phi_image(&self) -> RawImage {
        self.generate_ratio_image(|_, variance| 1.0 / variance)
    }

    fn generate_ratio_image(&self, op: impl Fn(f32, f32) -> f32) -> RawImage {
        let mut result = RawImage::new(self.width(), self.height());
        for y in 0..self.height() as i64 {
            for x in 0..self.width() as i64 {
                let science = self.science.get_pixel(x, y);
                let variance = self.variance.get_pixel(x, y);
                let clear = self.mask.get_pixel(x, y) == 0.0;
                let value = if clear
                    && pixel_has_data(science)
                    && pixel_has_data(variance)
                    && variance > 0.0
                {
                    op(science, variance)
                } else {
                    NO_DATA
                };
                result.set_pixel(x, y, value);
            }
        }
        result
    }
}
