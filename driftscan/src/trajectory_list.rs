//! Fixed-capacity result buffer with host/accelerator ownership tracking.
//!
//! The grid search fills one slot per retained candidate. The buffer
//! models the host/device handoff with a single ownership flag: while the
//! data is marked device-resident every host-side read or write fails, so
//! a kernel and the host can never race on the same slots. The moves are
//! idempotent; in a build without accelerator support they only toggle the
//! marker.

use crate::error::{Result, SearchError};
use crate::trajectory::{compare_by_likelihood, compare_by_obs_count, Trajectory};

/// A fixed-capacity list of trajectories owned either by the host or by
/// the accelerator.
#[derive(Debug, Clone)]
pub struct TrajectoryList {
    trajectories: Vec<Trajectory>,
    on_gpu: bool,
}

impl TrajectoryList {
    /// Create a list of `max_size` default (empty) trajectories.
    pub fn new(max_size: usize) -> Self {
        Self {
            trajectories: vec![Trajectory::default(); max_size],
            on_gpu: false,
        }
    }

    /// Wrap an existing vector of trajectories.
    pub fn from_vec(trajectories: Vec<Trajectory>) -> Self {
        Self {
            trajectories,
            on_gpu: false,
        }
    }

    /// Capacity of the list (slot count, not live results).
    pub fn get_size(&self) -> usize {
        self.trajectories.len()
    }

    fn require_cpu(&self) -> Result<()> {
        if self.on_gpu {
            Err(SearchError::DataOnGpu)
        } else {
            Ok(())
        }
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.trajectories.len() {
            Err(SearchError::IndexOutOfBounds {
                index,
                size: self.trajectories.len(),
            })
        } else {
            Ok(())
        }
    }

    /// The trajectory in slot `index`.
    pub fn get_trajectory(&self, index: usize) -> Result<Trajectory> {
        self.require_cpu()?;
        self.check_index(index)?;
        Ok(self.trajectories[index])
    }

    /// Overwrite slot `index`.
    pub fn set_trajectory(&mut self, index: usize, value: Trajectory) -> Result<()> {
        self.require_cpu()?;
        self.check_index(index)?;
        self.trajectories[index] = value;
        Ok(())
    }

    /// Borrow the whole list.
    pub fn get_list(&self) -> Result<&[Trajectory]> {
        self.require_cpu()?;
        Ok(&self.trajectories)
    }

    /// Copy out `count` slots starting at `start`, clamped to the end of
    /// the list.
    pub fn get_batch(&self, start: usize, count: usize) -> Result<Vec<Trajectory>> {
        self.require_cpu()?;
        if start >= self.trajectories.len() {
            return Err(SearchError::IndexOutOfBounds {
                index: start,
                size: self.trajectories.len(),
            });
        }
        let end = (start + count).min(self.trajectories.len());
        Ok(self.trajectories[start..end].to_vec())
    }

    /// Sort by likelihood descending with deterministic tie-breaks.
    pub fn sort_by_likelihood(&mut self) -> Result<()> {
        self.require_cpu()?;
        self.trajectories.sort_by(compare_by_likelihood);
        Ok(())
    }

    /// Sort by observation count descending with deterministic tie-breaks.
    pub fn sort_by_obs_count(&mut self) -> Result<()> {
        self.require_cpu()?;
        self.trajectories.sort_by(compare_by_obs_count);
        Ok(())
    }

    /// Whether the data is marked as resident on the accelerator.
    pub fn on_gpu(&self) -> bool {
        self.on_gpu
    }

    /// Hand ownership to the accelerator. Idempotent.
    pub fn move_to_gpu(&mut self) {
        self.on_gpu = true;
    }

    /// Reclaim ownership for the host. Idempotent.
    pub fn move_to_cpu(&mut self) {
        self.on_gpu = false;
    }
}
