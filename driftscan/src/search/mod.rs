//! The trajectory grid search.
//!
//! [`StackSearch`] evaluates every combination of start pixel, angle, and
//! velocity against the packed psi/phi buffer, retains a bounded top-K per
//! start pixel, and exposes the flattened, totally-ordered result list.
//! The inner loop touches `num_images x num_pixels x num_trajectories`
//! samples, so all per-sample state lives in the contiguous
//! [`PsiPhiArray`] and the per-pixel work is dispatched row-parallel with
//! rayon. An accelerator build would run the identical contract in a
//! single kernel over the same buffer.

pub mod sigma_g;

use rayon::prelude::*;
use tracing::info;

use crate::error::{Result, SearchError};
use crate::image_stack::ImageStack;
use crate::psi_phi_array::PsiPhiArray;
use crate::trajectory::{compare_by_likelihood, Trajectory};
use crate::trajectory_list::TrajectoryList;
use crate::{pixel_has_data, RESULTS_PER_PIXEL};

use sigma_g::SigmaGClipping;

/// Tuning knobs shared by every candidate evaluation.
#[derive(Debug, Clone, Copy)]
pub struct SearchParameters {
    /// Minimum number of valid samples for a candidate to be retained.
    pub min_observations: usize,
    /// Minimum likelihood for a candidate to be retained.
    pub min_lh: f32,
    /// Whether sigma-G clipping runs inside the evaluation loop.
    pub do_sigmag_filter: bool,
    /// Sigma-G percentile/coefficient parameters.
    pub sigmag: SigmaGClipping,
    /// Bytes per stored psi/phi value: 1, 2, or 4 (unencoded).
    pub encode_num_bytes: usize,
    /// Start-pixel bounds, `[x_start_min, x_start_max)`.
    pub x_start_min: usize,
    pub x_start_max: usize,
    /// Start-pixel bounds, `[y_start_min, y_start_max)`.
    pub y_start_min: usize,
    pub y_start_max: usize,
}

/// The grid-search driver bound to one image stack.
pub struct StackSearch {
    stack: ImageStack,
    params: SearchParameters,
    psi_phi: Option<PsiPhiArray>,
    results: Option<TrajectoryList>,
}

impl StackSearch {
    /// Bind a search to an image stack, defaulting the start bounds to the
    /// full frame and the thresholds to accept everything.
    pub fn new(stack: ImageStack) -> Self {
        let params = SearchParameters {
            min_observations: 0,
            min_lh: 0.0,
            do_sigmag_filter: false,
            sigmag: SigmaGClipping::default(),
            encode_num_bytes: 4,
            x_start_min: 0,
            x_start_max: stack.width(),
            y_start_min: 0,
            y_start_max: stack.height(),
        };
        Self {
            stack,
            params,
            psi_phi: None,
            results: None,
        }
    }

    pub fn num_images(&self) -> usize {
        self.stack.img_count()
    }

    pub fn get_image_width(&self) -> usize {
        self.stack.width()
    }

    pub fn get_image_height(&self) -> usize {
        self.stack.height()
    }

    pub fn get_image_npixels(&self) -> usize {
        self.stack.num_pixels()
    }

    pub fn get_imagestack(&self) -> &ImageStack {
        &self.stack
    }

    pub fn get_imagestack_mut(&mut self) -> &mut ImageStack {
        &mut self.stack
    }

    /// Minimum valid-sample count for retained candidates.
    pub fn set_min_obs(&mut self, min_observations: usize) {
        self.params.min_observations = min_observations;
    }

    /// Minimum likelihood for retained candidates.
    pub fn set_min_lh(&mut self, min_lh: f32) {
        self.params.min_lh = min_lh;
    }

    /// Enable sigma-G clipping inside the evaluation loop.
    ///
    /// # Arguments
    /// * `percentiles` - Low and high percentile bounds as fractions
    /// * `coeff` - Range-to-sigma coefficient (0.7413 for quartiles)
    /// * `min_lh` - Likelihood threshold applied after clipping
    pub fn enable_gpu_sigmag_filter(
        &mut self,
        percentiles: [f32; 2],
        coeff: f32,
        min_lh: f32,
    ) -> Result<()> {
        self.params.sigmag = SigmaGClipping::new(percentiles[0], percentiles[1], coeff)?;
        self.params.do_sigmag_filter = true;
        self.params.min_lh = min_lh;
        Ok(())
    }

    /// Select the psi/phi storage width: 1 or 2 bytes for quantized
    /// encoding, anything else for unencoded floats.
    ///
    /// Invalidates any previously-built psi/phi buffer so the next search
    /// re-encodes.
    pub fn enable_gpu_encoding(&mut self, num_bytes: usize) {
        self.params.encode_num_bytes = match num_bytes {
            1 | 2 => num_bytes,
            _ => 4,
        };
        self.psi_phi = None;
    }

    /// Restrict the start-pixel columns to `[x_min, x_max)`.
    pub fn set_start_bounds_x(&mut self, x_min: usize, x_max: usize) -> Result<()> {
        if x_min >= x_max || x_max > self.stack.width() {
            return Err(SearchError::InvalidArgument(format!(
                "x start bounds [{x_min}, {x_max}) invalid for width {}",
                self.stack.width()
            )));
        }
        self.params.x_start_min = x_min;
        self.params.x_start_max = x_max;
        Ok(())
    }

    /// Restrict the start-pixel rows to `[y_min, y_max)`.
    pub fn set_start_bounds_y(&mut self, y_min: usize, y_max: usize) -> Result<()> {
        if y_min >= y_max || y_max > self.stack.height() {
            return Err(SearchError::InvalidArgument(format!(
                "y start bounds [{y_min}, {y_max}) invalid for height {}",
                self.stack.height()
            )));
        }
        self.params.y_start_min = y_min;
        self.params.y_start_max = y_max;
        Ok(())
    }

    /// Build the packed psi/phi buffer from the stack. Idempotent: a
    /// buffer built with the current encoding is reused.
    pub fn prepare_psi_phi(&mut self) -> Result<()> {
        if self.psi_phi.is_some() {
            return Ok(());
        }

        let num_images = self.stack.img_count();
        let mut psi_images = Vec::with_capacity(num_images);
        let mut phi_images = Vec::with_capacity(num_images);
        for img in self.stack.get_images() {
            psi_images.push(img.generate_psi_image());
            phi_images.push(img.generate_phi_image());
        }

        self.psi_phi = Some(PsiPhiArray::from_images(
            self.params.encode_num_bytes,
            &psi_images,
            &phi_images,
            self.stack.build_zeroed_times(),
        )?);
        Ok(())
    }

    /// Drop the cached psi/phi buffer.
    pub fn clear_psi_phi(&mut self) {
        self.psi_phi = None;
    }

    /// Run the full grid search.
    ///
    /// Enumerates `angle_steps x velocity_steps` velocities over the
    /// configured start-pixel rectangle, retains the top
    /// [`RESULTS_PER_PIXEL`] candidates per start pixel that pass the
    /// thresholds, and stores the flattened list sorted by likelihood.
    #[allow(clippy::too_many_arguments)]
    pub fn search(
        &mut self,
        angle_steps: usize,
        velocity_steps: usize,
        min_angle: f32,
        max_angle: f32,
        min_velocity: f32,
        max_velocity: f32,
        min_observations: usize,
    ) -> Result<()> {
        if angle_steps == 0 || velocity_steps == 0 {
            return Err(SearchError::InvalidArgument(
                "angle and velocity steps must be positive".to_string(),
            ));
        }
        self.params.min_observations = min_observations;
        self.prepare_psi_phi()?;

        let candidates =
            create_grid_search_list(angle_steps, velocity_steps, min_angle, max_angle, min_velocity, max_velocity);
        let params = self.params;
        let psi_phi = self.psi_phi.as_ref().expect("psi/phi prepared above");

        info!(
            x_min = params.x_start_min,
            x_max = params.x_start_max,
            y_min = params.y_start_min,
            y_max = params.y_start_max,
            candidates = candidates.len(),
            "searching start-pixel rectangle"
        );

        // Row-parallel over start pixels; each pixel keeps its own top-K so
        // no cross-thread state is shared beyond the read-only buffers.
        let candidates: &[(f32, f32)] = &candidates;
        let mut results: Vec<Trajectory> = (params.y_start_min..params.y_start_max)
            .into_par_iter()
            .flat_map_iter(move |y| {
                (params.x_start_min..params.x_start_max).flat_map(move |x| {
                    let mut best = TopK::new(RESULTS_PER_PIXEL);
                    for &(vx, vy) in candidates {
                        let mut trj = Trajectory::new(x as i16, y as i16, vx, vy);
                        evaluate_trajectory(psi_phi, &mut trj, &params);
                        if trj.obs_count as usize >= params.min_observations
                            && trj.lh >= params.min_lh
                            && trj.obs_count > 0
                        {
                            best.insert(trj);
                        }
                    }
                    best.into_sorted_vec()
                })
            })
            .collect();

        results.sort_by(compare_by_likelihood);
        info!(results = results.len(), "search complete");
        self.results = Some(TrajectoryList::from_vec(results));
        Ok(())
    }

    /// Copy out results `[start, end)` from the sorted list, clamping `end`
    /// to the number of results.
    pub fn get_results(&self, start: usize, end: usize) -> Result<Vec<Trajectory>> {
        let results = self.results.as_ref().ok_or(SearchError::NoResults)?;
        if start >= end {
            return Err(SearchError::InvalidArgument(format!(
                "invalid result range [{start}, {end})"
            )));
        }
        results.get_batch(start, end - start)
    }

    /// Total number of stored results.
    pub fn num_results(&self) -> usize {
        self.results.as_ref().map_or(0, |r| r.get_size())
    }

    /// Replace the result list (testing hook).
    pub fn set_results(&mut self, results: Vec<Trajectory>) {
        self.results = Some(TrajectoryList::from_vec(results));
    }

    /// Drop the result list.
    pub fn clear_results(&mut self) {
        self.results = None;
    }

    /// Drop results below an observation-count cutoff.
    pub fn filter_results(&mut self, min_observations: usize) -> Result<()> {
        let results = self.results.as_mut().ok_or(SearchError::NoResults)?;
        let kept: Vec<Trajectory> = results
            .get_list()?
            .iter()
            .filter(|t| t.obs_count as usize >= min_observations)
            .copied()
            .collect();
        *results = TrajectoryList::from_vec(kept);
        Ok(())
    }

    /// Drop results below a likelihood cutoff.
    pub fn filter_results_lh(&mut self, min_lh: f32) -> Result<()> {
        let results = self.results.as_mut().ok_or(SearchError::NoResults)?;
        let kept: Vec<Trajectory> = results
            .get_list()?
            .iter()
            .filter(|t| t.lh >= min_lh)
            .copied()
            .collect();
        *results = TrajectoryList::from_vec(kept);
        Ok(())
    }

    /// Fill in `lh`, `flux`, and `obs_count` for a single candidate.
    ///
    /// Uses every valid sample without sigma-G clipping, so the result
    /// matches the grid search exactly when the filter is disabled.
    pub fn evaluate_single_trajectory(&mut self, trj: &mut Trajectory) -> Result<()> {
        self.prepare_psi_phi()?;
        let psi_phi = self.psi_phi.as_ref().expect("psi/phi prepared above");
        let mut params = self.params;
        params.do_sigmag_filter = false;
        evaluate_trajectory(psi_phi, trj, &params);
        Ok(())
    }

    /// Evaluate one candidate given by its start pixel and velocity.
    pub fn search_linear_trajectory(&mut self, x: i16, y: i16, vx: f32, vy: f32) -> Result<Trajectory> {
        let mut trj = Trajectory::new(x, y, vx, vy);
        self.evaluate_single_trajectory(&mut trj)?;
        Ok(trj)
    }

    /// Per-image psi samples along a trajectory, `NO_DATA` reported as 0.
    pub fn get_psi_curves(&mut self, trj: &Trajectory) -> Result<Vec<f32>> {
        self.extract_curve(trj, true)
    }

    /// Per-image phi samples along a trajectory, `NO_DATA` reported as 0.
    pub fn get_phi_curves(&mut self, trj: &Trajectory) -> Result<Vec<f32>> {
        self.extract_curve(trj, false)
    }

    fn extract_curve(&mut self, trj: &Trajectory, extract_psi: bool) -> Result<Vec<f32>> {
        self.prepare_psi_phi()?;
        let psi_phi = self.psi_phi.as_ref().expect("psi/phi prepared above");

        let mut curve = Vec::with_capacity(psi_phi.num_times());
        for t in 0..psi_phi.num_times() {
            let time = psi_phi.read_time(t);
            let sample = psi_phi.read_psi_phi(t, trj.get_x_index(time), trj.get_y_index(time));
            let value = if extract_psi { sample.psi } else { sample.phi };
            curve.push(if pixel_has_data(value) { value } else { 0.0 });
        }
        Ok(curve)
    }
}

/// Build the (vx, vy) grid: `angle_steps` angles evenly stepped over
/// `[min_angle, max_angle)` crossed with `velocity_steps` speeds over
/// `[min_velocity, max_velocity)`.
pub fn create_grid_search_list(
    angle_steps: usize,
    velocity_steps: usize,
    min_angle: f32,
    max_angle: f32,
    min_velocity: f32,
    max_velocity: f32,
) -> Vec<(f32, f32)> {
    let angle_step = (max_angle - min_angle) / angle_steps as f32;
    let velocity_step = (max_velocity - min_velocity) / velocity_steps as f32;

    let mut candidates = Vec::with_capacity(angle_steps * velocity_steps);
    for a in 0..angle_steps {
        let angle = min_angle + a as f32 * angle_step;
        let (sin_a, cos_a) = angle.sin_cos();
        for v in 0..velocity_steps {
            let velocity = min_velocity + v as f32 * velocity_step;
            candidates.push((cos_a * velocity, sin_a * velocity));
        }
    }
    candidates
}

/// Accumulate psi/phi sums along a candidate and fill in its statistics.
///
/// A sample is valid when the predicted pixel is in bounds, both values
/// carry data, and phi is positive. With sigma-G enabled the per-sample
/// contributions `psi / sqrt(phi)` are clipped before the sums are formed.
/// A candidate with no surviving samples (or a non-positive phi sum)
/// degrades to zero likelihood rather than erroring.
fn evaluate_trajectory(psi_phi: &PsiPhiArray, trj: &mut Trajectory, params: &SearchParameters) {
    let num_times = psi_phi.num_times();
    let mut psi_samples = Vec::with_capacity(num_times);
    let mut phi_samples = Vec::with_capacity(num_times);

    for t in 0..num_times {
        let time = psi_phi.read_time(t);
        let sample = psi_phi.read_psi_phi(t, trj.get_x_index(time), trj.get_y_index(time));
        if pixel_has_data(sample.psi) && pixel_has_data(sample.phi) && sample.phi > 0.0 {
            psi_samples.push(sample.psi);
            phi_samples.push(sample.phi);
        }
    }

    if params.do_sigmag_filter && !psi_samples.is_empty() {
        let contributions: Vec<f32> = psi_samples
            .iter()
            .zip(&phi_samples)
            .map(|(&psi, &phi)| psi / phi.sqrt())
            .collect();
        let kept = params.sigmag.keep_indices(&contributions);
        psi_samples = kept.iter().map(|&i| psi_samples[i]).collect();
        phi_samples = kept.iter().map(|&i| phi_samples[i]).collect();
    }

    let psi_sum: f32 = psi_samples.iter().sum();
    let phi_sum: f32 = phi_samples.iter().sum();

    if psi_samples.is_empty() || phi_sum <= 0.0 {
        trj.lh = 0.0;
        trj.flux = 0.0;
        trj.obs_count = 0;
    } else {
        trj.lh = psi_sum / phi_sum.sqrt();
        trj.flux = psi_sum / phi_sum;
        trj.obs_count = psi_samples.len() as i16;
    }
}

/// A bounded best-K collector ordered by the result comparator.
struct TopK {
    capacity: usize,
    items: Vec<Trajectory>,
}

impl TopK {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Vec::with_capacity(capacity + 1),
        }
    }

    fn insert(&mut self, trj: Trajectory) {
        let pos = self
            .items
            .partition_point(|existing| compare_by_likelihood(existing, &trj).is_lt());
        if pos < self.capacity {
            self.items.insert(pos, trj);
            self.items.truncate(self.capacity);
        }
    }

    fn into_sorted_vec(self) -> Vec<Trajectory> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layered_image::LayeredImage;
    use crate::psf::Psf;
    use crate::raw_image::RawImage;
    use ndarray::Array2;

    fn uniform_stack(times: &[f64], science: f32, variance: f32) -> ImageStack {
        let images = times
            .iter()
            .map(|&t| {
                LayeredImage::new(
                    RawImage::from_array(Array2::from_elem((10, 12), science)),
                    RawImage::from_array(Array2::from_elem((10, 12), variance)),
                    RawImage::new(12, 10),
                    Psf::from_gaussian(1e-5).unwrap(),
                    t,
                )
                .unwrap()
            })
            .collect();
        ImageStack::new(images).unwrap()
    }

    #[test]
    fn test_grid_list_shape() {
        let grid = create_grid_search_list(4, 3, 0.0, std::f32::consts::PI, 1.0, 4.0);
        assert_eq!(grid.len(), 12);
        // First candidate: angle 0, velocity 1.
        assert!((grid[0].0 - 1.0).abs() < 1e-6);
        assert!(grid[0].1.abs() < 1e-6);
        // Velocity varies fastest.
        assert!((grid[1].0 - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_evaluate_uniform_statistics() {
        // Uniform science 4 and variance 2 make psi = 2 and phi = 0.5 per
        // image regardless of the trajectory (away from the edges).
        let mut search = StackSearch::new(uniform_stack(&[0.0, 1.0, 2.0, 3.0], 4.0, 2.0));
        let trj = search.search_linear_trajectory(5, 5, 0.5, 0.0).unwrap();
        assert_eq!(trj.obs_count, 4);
        assert!((trj.flux - 4.0).abs() < 1e-5);
        let expected_lh = 8.0 / 2.0_f32.sqrt();
        assert!((trj.lh - expected_lh).abs() < 1e-5);
    }

    #[test]
    fn test_evaluate_counts_only_in_bounds() {
        let mut search = StackSearch::new(uniform_stack(&[0.0, 1.0, 2.0, 3.0], 4.0, 2.0));
        // Walks off the right edge after two steps.
        let trj = search.search_linear_trajectory(10, 5, 1.0, 0.0).unwrap();
        assert_eq!(trj.obs_count, 2);
    }

    #[test]
    fn test_degraded_trajectory_is_not_an_error() {
        let mut search = StackSearch::new(uniform_stack(&[0.0, 1.0], 4.0, 2.0));
        // Starts outside the frame; every sample is invalid.
        let trj = search.search_linear_trajectory(-50, 5, 0.0, 0.0).unwrap();
        assert_eq!(trj.obs_count, 0);
        assert_eq!(trj.lh, 0.0);
        assert_eq!(trj.flux, 0.0);
    }

    #[test]
    fn test_start_bounds_validation() {
        let mut search = StackSearch::new(uniform_stack(&[0.0], 1.0, 1.0));
        assert!(search.set_start_bounds_x(3, 3).is_err());
        assert!(search.set_start_bounds_x(0, 13).is_err());
        assert!(search.set_start_bounds_y(0, 11).is_err());
        assert!(search.set_start_bounds_x(2, 10).is_ok());
        assert!(search.set_start_bounds_y(1, 9).is_ok());
    }

    #[test]
    fn test_results_before_search_error() {
        let search = StackSearch::new(uniform_stack(&[0.0], 1.0, 1.0));
        assert_eq!(search.get_results(0, 10), Err(SearchError::NoResults));
    }

    #[test]
    fn test_encoding_change_invalidates_cache() {
        let mut search = StackSearch::new(uniform_stack(&[0.0, 1.0], 4.0, 2.0));
        search.prepare_psi_phi().unwrap();
        assert!(search.psi_phi.is_some());
        search.enable_gpu_encoding(2);
        assert!(search.psi_phi.is_none());
        search.prepare_psi_phi().unwrap();
        assert_eq!(search.psi_phi.as_ref().unwrap().block_size(), 2);

        // Unsupported widths fall back to floats.
        search.enable_gpu_encoding(3);
        search.prepare_psi_phi().unwrap();
        assert_eq!(search.psi_phi.as_ref().unwrap().block_size(), 4);
    }

    #[test]
    fn test_top_k_bounded_and_ordered() {
        let mut top = TopK::new(3);
        for (lh, obs) in [(1.0, 3), (5.0, 3), (2.0, 3), (4.0, 3), (3.0, 3)] {
            top.insert(Trajectory {
                lh,
                obs_count: obs,
                ..Default::default()
            });
        }
        let sorted = top.into_sorted_vec();
        let lhs: Vec<f32> = sorted.iter().map(|t| t.lh).collect();
        assert_eq!(lhs, vec![5.0, 4.0, 3.0]);
    }

    #[test]
    fn test_psi_phi_curves() {
        let mut search = StackSearch::new(uniform_stack(&[0.0, 1.0, 2.0], 4.0, 2.0));
        let trj = Trajectory::new(5, 5, 0.0, 0.0);
        let psi = search.get_psi_curves(&trj).unwrap();
        let phi = search.get_phi_curves(&trj).unwrap();
        assert_eq!(psi.len(), 3);
        assert!(psi.iter().all(|&v| (v - 2.0).abs() < 1e-6));
        assert!(phi.iter().all(|&v| (v - 0.5).abs() < 1e-6));

        // Off-frame samples report zero.
        let outside = Trajectory::new(-20, 5, 0.0, 0.0);
        let psi = search.get_psi_curves(&outside).unwrap();
        assert!(psi.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_filter_results() {
        let mut search = StackSearch::new(uniform_stack(&[0.0], 1.0, 1.0));
        search.set_results(vec![
            Trajectory {
                lh: 10.0,
                obs_count: 8,
                ..Default::default()
            },
            Trajectory {
                lh: 2.0,
                obs_count: 3,
                ..Default::default()
            },
        ]);
        search.filter_results(5).unwrap();
        assert_eq!(search.num_results(), 1);
        search.filter_results_lh(20.0).unwrap();
        assert_eq!(search.num_results(), 0);
    }
}
