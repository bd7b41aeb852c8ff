//! Postage-stamp extraction and coaddition along trajectories.
//!
//! Every candidate that survives the grid search gets a cutout from each
//! exposure, centred on its predicted position, and the cutouts are
//! combined into a single coadd for inspection and morphological
//! filtering. Mean and median coadds need invalid samples kept and tagged
//! so they can be excluded; summed coadds zero them, which is equivalent
//! to excluding them from a sum.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SearchError};
use crate::image_stack::ImageStack;
use crate::raw_image::{
    create_mean_image, create_median_image, create_summed_image, RawImage,
};
use crate::trajectory::Trajectory;
use crate::{HAS_GPU, MAX_STAMP_EDGE, NO_DATA};

/// How per-image stamps are combined into one coadd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StampType {
    Sum,
    Mean,
    Median,
}

/// Parameters controlling coadd construction and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StampParameters {
    /// Stamp radius; the stamp edge is `2 radius + 1`.
    pub radius: usize,
    pub stamp_type: StampType,
    /// Whether rejected coadds are replaced with a 1x1 `NO_DATA` marker.
    pub do_filtering: bool,
    /// Maximum allowed peak offset from the stamp centre, per axis.
    pub peak_offset_x: f32,
    pub peak_offset_y: f32,
    /// Minimum fraction of the stamp flux in the peak pixel (0 disables).
    pub center_thresh: f32,
    /// Moment limits; first moments are compared by absolute value.
    pub m01_limit: f32,
    pub m10_limit: f32,
    pub m11_limit: f32,
    pub m02_limit: f32,
    pub m20_limit: f32,
}

impl Default for StampParameters {
    fn default() -> Self {
        Self {
            radius: 10,
            stamp_type: StampType::Sum,
            do_filtering: false,
            peak_offset_x: 2.0,
            peak_offset_y: 2.0,
            center_thresh: 0.03,
            m01_limit: 0.25,
            m10_limit: 0.25,
            m11_limit: 1.0,
            m02_limit: 35.5,
            m20_limit: 35.5,
        }
    }
}

fn check_radius(radius: usize) -> Result<()> {
    if radius == 0 {
        return Err(SearchError::InvalidArgument(
            "stamp radius must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Cut one stamp per selected exposure along a trajectory.
///
/// `use_index` selects the exposures to include; an empty slice includes
/// all of them, and a non-empty slice must have one entry per exposure.
/// Invalid samples become `NO_DATA` when `keep_no_data` is set and 0
/// otherwise.
pub fn create_stamps(
    stack: &ImageStack,
    trj: &Trajectory,
    radius: usize,
    keep_no_data: bool,
    use_index: &[bool],
) -> Result<Vec<RawImage>> {
    check_radius(radius)?;
    if !use_index.is_empty() && use_index.len() != stack.img_count() {
        return Err(SearchError::InvalidArgument(format!(
            "use_index has {} entries for {} images",
            use_index.len(),
            stack.img_count()
        )));
    }

    let mut stamps = Vec::new();
    for i in 0..stack.img_count() {
        if !use_index.is_empty() && !use_index[i] {
            continue;
        }
        let time = stack.get_zeroed_time(i)?;
        let science = stack.get_single_image(i)?.get_science();
        stamps.push(science.create_stamp(
            trj.get_x_pos(time),
            trj.get_y_pos(time),
            radius,
            keep_no_data,
        ));
    }
    Ok(stamps)
}

/// Per-exposure stamps for visualization: every exposure, invalid pixels
/// replaced with zeros.
pub fn get_stamps(stack: &ImageStack, trj: &Trajectory, radius: usize) -> Result<Vec<RawImage>> {
    create_stamps(stack, trj, radius, false, &[])
}

/// Median coadd along a trajectory. Invalid samples stay tagged in the
/// per-image stamps so the median can skip them.
pub fn get_median_stamp(
    stack: &ImageStack,
    trj: &Trajectory,
    radius: usize,
    use_index: &[bool],
) -> Result<RawImage> {
    create_median_image(&create_stamps(stack, trj, radius, true, use_index)?)
}

/// Mean coadd along a trajectory. Invalid samples stay tagged in the
/// per-image stamps so the mean can skip them.
pub fn get_mean_stamp(
    stack: &ImageStack,
    trj: &Trajectory,
    radius: usize,
    use_index: &[bool],
) -> Result<RawImage> {
    create_mean_image(&create_stamps(stack, trj, radius, true, use_index)?)
}

/// Summed coadd along a trajectory. Invalid samples are zeroed, which is
/// the same as excluding them from the sum.
pub fn get_summed_stamp(
    stack: &ImageStack,
    trj: &Trajectory,
    radius: usize,
    use_index: &[bool],
) -> Result<RawImage> {
    create_summed_image(&create_stamps(stack, trj, radius, false, use_index)?)
}

/// Whether a coadd fails the morphological filter.
///
/// A stamp is rejected when its peak sits too far from the centre, when
/// too small a fraction of the flux lands in the peak pixel, or when any
/// central moment exceeds its limit.
pub fn filter_stamp(stamp: &RawImage, params: &StampParameters) -> bool {
    let radius = params.radius as f32;

    // Peak position.
    let (peak_x, peak_y) = stamp.find_peak(true);
    if (peak_x as f32 - radius).abs() >= params.peak_offset_x
        || (peak_y as f32 - radius).abs() >= params.peak_offset_y
    {
        return true;
    }

    // Fraction of the flux in the peak pixel.
    if params.center_thresh > 0.0 {
        let peak_value = stamp.get_pixel(peak_x as i64, peak_y as i64);
        let total: f32 = stamp
            .pixels()
            .iter()
            .filter(|&&v| crate::pixel_has_data(v))
            .sum();
        if total <= 0.0 || peak_value / total < params.center_thresh {
            return true;
        }
    }

    // Moment limits.
    let moments = stamp.find_central_moments();
    moments.m01.abs() >= params.m01_limit
        || moments.m10.abs() >= params.m10_limit
        || moments.m11.abs() >= params.m11_limit
        || moments.m02 >= params.m02_limit
        || moments.m20 >= params.m20_limit
}

/// One coadd per trajectory, with optional morphological filtering.
///
/// Rejected coadds are replaced with a 1x1 `NO_DATA` stamp so their slot
/// in the output stays aligned with the input trajectory list. Requesting
/// the accelerator in a build without one logs a warning and coadds on the
/// CPU; the accelerator path additionally bounds the stamp edge by
/// [`MAX_STAMP_EDGE`].
pub fn get_coadded_stamps(
    stack: &ImageStack,
    trajectories: &[Trajectory],
    use_index_vect: &[Vec<bool>],
    params: &StampParameters,
    use_gpu: bool,
) -> Result<Vec<RawImage>> {
    check_radius(params.radius)?;
    if use_index_vect.len() != trajectories.len() {
        return Err(SearchError::InvalidArgument(format!(
            "use_index_vect has {} entries for {} trajectories",
            use_index_vect.len(),
            trajectories.len()
        )));
    }
    if use_gpu {
        if 2 * params.radius + 1 > MAX_STAMP_EDGE {
            return Err(SearchError::InvalidArgument(format!(
                "stamp edge {} exceeds the accelerator limit {MAX_STAMP_EDGE}",
                2 * params.radius + 1
            )));
        }
        if !HAS_GPU {
            warn!("accelerator unavailable; performing coadds on the CPU");
        }
    }

    let mut results = Vec::with_capacity(trajectories.len());
    for (trj, use_index) in trajectories.iter().zip(use_index_vect) {
        let coadd = match params.stamp_type {
            StampType::Median => get_median_stamp(stack, trj, params.radius, use_index)?,
            StampType::Mean => get_mean_stamp(stack, trj, params.radius, use_index)?,
            StampType::Sum => get_summed_stamp(stack, trj, params.radius, use_index)?,
        };

        if params.do_filtering && filter_stamp(&coadd, params) {
            let mut rejected = RawImage::new(1, 1);
            rejected.set_all(NO_DATA);
            results.push(rejected);
        } else {
            results.push(coadd);
        }
    }
    Ok(results)
}
