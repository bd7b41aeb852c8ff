//! An ordered stack of exposures sharing a common pixel grid.

use tracing::info;

use crate::error::{Result, SearchError};
use crate::layered_image::LayeredImage;
use crate::raw_image::RawImage;

/// The time-ordered input to a search: exposures of the same sky region on
/// a shared pixel grid.
///
/// The stack carries a device-residency marker. While the pixel data is
/// marked as resident on the accelerator the stack must stay immutable, so
/// reordering operations are rejected.
#[derive(Debug, Clone, Default)]
pub struct ImageStack {
    images: Vec<LayeredImage>,
    on_gpu: bool,
}

impl ImageStack {
    /// Build a stack from a list of exposures.
    ///
    /// Fails when the exposures disagree on dimensions.
    pub fn new(images: Vec<LayeredImage>) -> Result<Self> {
        let mut stack = Self {
            images: Vec::with_capacity(images.len()),
            on_gpu: false,
        };
        for img in images {
            stack.append_image(img)?;
        }
        Ok(stack)
    }

    /// Append one exposure, enforcing the shared pixel grid.
    pub fn append_image(&mut self, img: LayeredImage) -> Result<()> {
        if let Some(first) = self.images.first() {
            if (img.height(), img.width()) != (first.height(), first.width()) {
                return Err(SearchError::DimensionMismatch {
                    expected: (first.height(), first.width()),
                    actual: (img.height(), img.width()),
                });
            }
        }
        self.images.push(img);
        Ok(())
    }

    pub fn img_count(&self) -> usize {
        self.images.len()
    }

    pub fn width(&self) -> usize {
        self.images.first().map_or(0, |img| img.width())
    }

    pub fn height(&self) -> usize {
        self.images.first().map_or(0, |img| img.height())
    }

    pub fn num_pixels(&self) -> usize {
        self.width() * self.height()
    }

    pub fn get_images(&self) -> &[LayeredImage] {
        &self.images
    }

    pub fn get_single_image(&self, index: usize) -> Result<&LayeredImage> {
        self.images
            .get(index)
            .ok_or(SearchError::IndexOutOfBounds {
                index,
                size: self.images.len(),
            })
    }

    pub fn get_single_image_mut(&mut self, index: usize) -> Result<&mut LayeredImage> {
        let size = self.images.len();
        self.images
            .get_mut(index)
            .ok_or(SearchError::IndexOutOfBounds { index, size })
    }

    /// Observation time of exposure `index`.
    pub fn get_obstime(&self, index: usize) -> Result<f64> {
        Ok(self.get_single_image(index)?.get_obstime())
    }

    /// Observation time of exposure `index` relative to the first exposure.
    ///
    /// Negative when the stack is not sorted by time.
    pub fn get_zeroed_time(&self, index: usize) -> Result<f64> {
        let obstime = self.get_single_image(index)?.get_obstime();
        Ok(obstime - self.images[0].get_obstime())
    }

    /// All zeroed times in stack order.
    pub fn build_zeroed_times(&self) -> Vec<f64> {
        match self.images.first() {
            None => Vec::new(),
            Some(first) => {
                let t0 = first.get_obstime();
                self.images
                    .iter()
                    .map(|img| img.get_obstime() - t0)
                    .collect()
            }
        }
    }

    /// Convolve every exposure with its own PSF (science) and squared PSF
    /// (variance).
    pub fn convolve_psf(&mut self) {
        for img in &mut self.images {
            img.convolve_psf();
        }
    }

    /// Synthesize a binary mask marking pixels flagged in at least
    /// `threshold` exposures.
    ///
    /// An exposure counts for a pixel when its mask value intersects
    /// `flags`. Output pixels are 1.0 at or above the threshold and 0.0
    /// below it.
    pub fn make_global_mask(&self, flags: u32, threshold: usize) -> RawImage {
        let width = self.width();
        let height = self.height();
        let mut counts = vec![0usize; width * height];

        for img in &self.images {
            for y in 0..height {
                for x in 0..width {
                    let mask_value = img.get_mask().get_pixel(x as i64, y as i64) as u32;
                    if mask_value & flags != 0 {
                        counts[y * width + x] += 1;
                    }
                }
            }
        }

        let mut global_mask = RawImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                if counts[y * width + x] >= threshold {
                    global_mask.set_pixel(x as i64, y as i64, 1.0);
                }
            }
        }
        global_mask
    }

    /// Synthesize the global mask and mask the flagged pixels out of every
    /// exposure's science layer.
    pub fn apply_global_mask(&mut self, flags: u32, threshold: usize) -> Result<()> {
        let global_mask = self.make_global_mask(flags, threshold);
        for img in &mut self.images {
            img.apply_global_mask(&global_mask)?;
        }
        Ok(())
    }

    /// Apply per-exposure flag masking to every exposure.
    pub fn apply_mask_flags(&mut self, flags: u32, exceptions: &[u32]) {
        for img in &mut self.images {
            img.apply_mask_flags(flags, exceptions);
        }
    }

    /// Apply brightness-threshold masking to every exposure.
    pub fn apply_mask_threshold(&mut self, threshold: f32) {
        for img in &mut self.images {
            img.apply_mask_threshold(threshold);
        }
    }

    /// Dilate every exposure's mask by `steps` 4-neighbour iterations.
    pub fn grow_mask(&mut self, steps: usize) {
        for img in &mut self.images {
            img.grow_mask(steps);
        }
    }

    /// Reorder the exposures by ascending observation time.
    ///
    /// Rejected while the pixel data is resident on the accelerator.
    pub fn sort_by_time(&mut self) -> Result<()> {
        if self.on_gpu {
            return Err(SearchError::DataOnGpu);
        }
        info!(count = self.images.len(), "sorting image stack by obstime");
        self.images.sort_by(|a, b| {
            a.get_obstime()
                .partial_cmp(&b.get_obstime())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(())
    }

    /// Whether the pixel data is marked as resident on the accelerator.
    pub fn on_gpu(&self) -> bool {
        self.on_gpu
    }

    /// Mark the pixel data as resident on the accelerator. Idempotent.
    pub fn move_to_gpu(&mut self) {
        self.on_gpu = true;
    }

    /// Mark the pixel data as resident on the host. Idempotent.
    pub fn move_to_cpu(&mut self) {
        self.on_gpu = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psf::Psf;
    use ndarray::Array2;

    fn make_image(width: usize, height: usize, obstime: f64) -> LayeredImage {
        LayeredImage::new(
            RawImage::from_array(Array2::from_elem((height, width), 1.0)),
            RawImage::from_array(Array2::from_elem((height, width), 1.0)),
            RawImage::new(width, height),
            Psf::from_gaussian(0.5).unwrap(),
            obstime,
        )
        .unwrap()
    }

    fn make_stack(times: &[f64]) -> ImageStack {
        ImageStack::new(times.iter().map(|&t| make_image(6, 5, t)).collect()).unwrap()
    }

    #[test]
    fn test_append_mismatched_fails() {
        let mut stack = make_stack(&[0.0]);
        assert!(stack.append_image(make_image(7, 5, 1.0)).is_err());
        assert_eq!(stack.img_count(), 1);
    }

    #[test]
    fn test_zeroed_times() {
        let stack = make_stack(&[10.0, 10.5, 12.0]);
        assert_eq!(stack.get_zeroed_time(0).unwrap(), 0.0);
        assert_eq!(stack.get_zeroed_time(1).unwrap(), 0.5);
        assert_eq!(stack.get_zeroed_time(2).unwrap(), 2.0);
        assert_eq!(stack.build_zeroed_times(), vec![0.0, 0.5, 2.0]);
    }

    #[test]
    fn test_zeroed_times_unsorted_can_be_negative() {
        let stack = make_stack(&[10.0, 9.5]);
        assert_eq!(stack.get_zeroed_time(1).unwrap(), -0.5);
    }

    #[test]
    fn test_sort_by_time() {
        let mut stack = make_stack(&[12.0, 10.0, 11.0]);
        stack.sort_by_time().unwrap();
        assert_eq!(stack.get_obstime(0).unwrap(), 10.0);
        assert_eq!(stack.get_obstime(2).unwrap(), 12.0);
    }

    #[test]
    fn test_sort_rejected_on_gpu() {
        let mut stack = make_stack(&[1.0, 0.0]);
        stack.move_to_gpu();
        assert_eq!(stack.sort_by_time(), Err(SearchError::DataOnGpu));
        stack.move_to_cpu();
        assert!(stack.sort_by_time().is_ok());
    }

    #[test]
    fn test_global_mask_threshold() {
        let mut stack = make_stack(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        // Flag column x=2 in four of five images.
        for i in 0..4 {
            let img = stack.get_single_image_mut(i).unwrap();
            for y in 0..5 {
                img.get_mask_mut().set_pixel(2, y, 1.0);
            }
        }

        let mask = stack.make_global_mask(1, 3);
        for y in 0..5 {
            for x in 0..6 {
                let expected = if x == 2 { 1.0 } else { 0.0 };
                assert_eq!(mask.get_pixel(x as i64, y as i64), expected);
            }
        }

        // Idempotence: identical parameters give identical output.
        let again = stack.make_global_mask(1, 3);
        assert_eq!(mask, again);
    }

    #[test]
    fn test_global_mask_respects_flag_bits() {
        let mut stack = make_stack(&[0.0, 1.0]);
        stack
            .get_single_image_mut(0)
            .unwrap()
            .get_mask_mut()
            .set_pixel(1, 1, 2.0);
        stack
            .get_single_image_mut(1)
            .unwrap()
            .get_mask_mut()
            .set_pixel(1, 1, 2.0);

        // Flag bit 1 does not intersect mask value 2.
        let mask = stack.make_global_mask(1, 1);
        assert_eq!(mask.get_pixel(1, 1), 0.0);
        let mask = stack.make_global_mask(2, 1);
        assert_eq!(mask.get_pixel(1, 1), 1.0);
    }

    #[test]
    fn test_apply_global_mask_hits_science() {
        let mut stack = make_stack(&[0.0, 1.0]);
        for i in 0..2 {
            stack
                .get_single_image_mut(i)
                .unwrap()
                .get_mask_mut()
                .set_pixel(3, 2, 1.0);
        }
        stack.apply_global_mask(1, 2).unwrap();
        for i in 0..2 {
            let science = stack.get_single_image(i).unwrap().get_science();
            assert_eq!(science.get_pixel(3, 2), crate::NO_DATA);
            assert_eq!(science.get_pixel(0, 0), 1.0);
        }
    }

    #[test]
    fn test_index_errors() {
        let stack = make_stack(&[0.0]);
        assert!(matches!(
            stack.get_obstime(3),
            Err(SearchError::IndexOutOfBounds { index: 3, size: 1 })
        ));
    }
}
