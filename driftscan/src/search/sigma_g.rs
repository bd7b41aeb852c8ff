//! Robust per-trajectory outlier rejection.
//!
//! A single bad exposure (a cosmic ray, a satellite streak, an unmasked
//! artifact) can dominate a shift-and-stack sum. The sigma-G clipper
//! estimates the centre and spread of a trajectory's per-image likelihood
//! contributions from an inter-percentile range, which a small number of
//! outliers cannot move, then rejects samples outside `mu +/- 2 sigma`.
//! The coefficient relates the chosen percentile range to an equivalent
//! Gaussian sigma; for the default quartiles it is 0.7413.

use crate::error::{Result, SearchError};

/// Coefficient converting the (0.25, 0.75) inter-quartile range of a
/// Gaussian to its standard deviation.
pub const DEFAULT_SIGMAG_COEFF: f32 = 0.7413;

/// Percentile-based clipping parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SigmaGClipping {
    low_bnd: f32,
    high_bnd: f32,
    coeff: f32,
}

impl Default for SigmaGClipping {
    fn default() -> Self {
        Self {
            low_bnd: 0.25,
            high_bnd: 0.75,
            coeff: DEFAULT_SIGMAG_COEFF,
        }
    }
}

impl SigmaGClipping {
    /// Build a clipper from percentile bounds (fractions in [0, 1]) and a
    /// range-to-sigma coefficient.
    pub fn new(low_bnd: f32, high_bnd: f32, coeff: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&low_bnd) || !(0.0..=1.0).contains(&high_bnd) {
            return Err(SearchError::InvalidArgument(format!(
                "sigma-G percentiles must lie in [0, 1], got ({low_bnd}, {high_bnd})"
            )));
        }
        if low_bnd >= high_bnd {
            return Err(SearchError::InvalidArgument(format!(
                "sigma-G percentiles must be ordered, got ({low_bnd}, {high_bnd})"
            )));
        }
        if coeff <= 0.0 {
            return Err(SearchError::InvalidArgument(format!(
                "sigma-G coefficient must be positive, got {coeff}"
            )));
        }
        Ok(Self {
            low_bnd,
            high_bnd,
            coeff,
        })
    }

    /// The inclusive `[mu - 2 sigma, mu + 2 sigma]` acceptance interval for
    /// a set of samples.
    ///
    /// Returns `(f32::MIN, f32::MAX)` (accept everything) when there are
    /// fewer than two samples.
    pub fn clip_bounds(&self, values: &[f32]) -> (f32, f32) {
        if values.len() < 2 {
            return (f32::MIN, f32::MAX);
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let q_low = quantile(&sorted, self.low_bnd);
        let q_high = quantile(&sorted, self.high_bnd);
        let center = 0.5 * (q_low + q_high);
        let sigma = self.coeff * (q_high - q_low);
        (center - 2.0 * sigma, center + 2.0 * sigma)
    }

    /// Indices of the samples surviving the clip.
    pub fn keep_indices(&self, values: &[f32]) -> Vec<usize> {
        let (lower, upper) = self.clip_bounds(values);
        values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v >= lower && v <= upper)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Linear-interpolation quantile of already-sorted samples, `p` in [0, 1].
pub fn quantile(sorted: &[f32], p: f32) -> f32 {
    debug_assert!(!sorted.is_empty());
    let rank = p * (sorted.len() - 1) as f32;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        sorted[low]
    } else {
        let frac = rank - low as f32;
        sorted[low] * (1.0 - frac) + sorted[high] * frac
    }
}
