//! Shift-and-stack moving-object detection for time-series astronomical
//! imagery.
//!
//! Given a stack of co-registered exposures of the same sky region, each
//! with a point-spread function and a per-pixel variance map, this crate
//! enumerates candidate linear trajectories, scores each one by coherently
//! summing matched-filter products along its path, and returns a ranked
//! result list plus coadded postage stamps for inspection.
//!
//! # Pipeline
//!
//! 1. [`LayeredImage`]s (science, variance, mask) are masked and convolved
//!    with their PSFs ([`ImageStack`]).
//! 2. Per-image psi/phi planes are packed into a [`PsiPhiArray`] for the
//!    sampling hot loop, optionally quantized to one or two bytes.
//! 3. [`StackSearch`] grids over start pixels, angles, and velocities,
//!    keeping the best candidates per start pixel.
//! 4. [`stamp_creator`] cuts and coadds stamps along the survivors and
//!    applies morphological filtering.
//!
//! A trajectory's likelihood is `sum(psi) / sqrt(sum(phi))` over its valid
//! samples, so the whole search reduces to indexed reads and additions
//! over one contiguous buffer.

pub mod error;
pub mod image_stack;
pub mod layered_image;
pub mod psf;
pub mod psi_phi_array;
pub mod raw_image;
pub mod search;
pub mod stamp_creator;
pub mod trajectory;
pub mod trajectory_list;

pub use error::{Result, SearchError};
pub use image_stack::ImageStack;
pub use layered_image::LayeredImage;
pub use psf::Psf;
pub use psi_phi_array::{
    compute_scale_params, decode_uint_scalar, encode_uint_scalar, PsiPhi, PsiPhiArray, ScaleParams,
};
pub use raw_image::{
    create_mean_image, create_median_image, create_summed_image, ImageMoments, RawImage,
};
pub use search::sigma_g::{SigmaGClipping, DEFAULT_SIGMAG_COEFF};
pub use search::{SearchParameters, StackSearch};
pub use stamp_creator::{StampParameters, StampType};
pub use trajectory::Trajectory;
pub use trajectory_list::TrajectoryList;

/// Sentinel marking invalid or masked pixels. Excluded from every
/// aggregate; preserved by every operation unless explicitly replaced.
pub const NO_DATA: f32 = -9999.99;

/// Number of results retained per start pixel in the grid search.
pub const RESULTS_PER_PIXEL: usize = 8;

/// Largest stamp edge (`2 radius + 1`) supported by accelerator coadds.
pub const MAX_STAMP_EDGE: usize = 64;

/// Whether this build can hand work to an accelerator.
pub const HAS_GPU: bool = false;

/// Whether a pixel value carries valid data (is not the sentinel).
#[inline]
pub fn pixel_has_data(value: f32) -> bool {
    value != NO_DATA
}
