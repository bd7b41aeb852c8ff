//! Synthetic image stacks for testing the search engine.
//!
//! Builds stacks of noisy exposures with known moving objects injected
//! through the per-exposure PSF, so tests can assert that the grid search
//! recovers exactly what was planted. All randomness is driven by
//! caller-supplied seeds: every exposure derives its own `StdRng` from the
//! base seed plus its index, so stacks are reproducible and exposures stay
//! independent.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use driftscan::{ImageStack, LayeredImage, Psf, RawImage, Result, Trajectory};

/// Create one fake exposure: Gaussian-noise science, uniform variance,
/// clear mask.
///
/// # Arguments
/// * `width` / `height` - Image dimensions in pixels
/// * `noise_stdev` - Standard deviation of the science-layer noise
/// * `pixel_variance` - Uniform value of the variance layer
/// * `obstime` - Observation time (MJD)
/// * `psf` - The exposure's PSF
/// * `seed` - RNG seed for the noise realization
pub fn make_fake_layered_image(
    width: usize,
    height: usize,
    noise_stdev: f32,
    pixel_variance: f32,
    obstime: f64,
    psf: &Psf,
    seed: u64,
) -> Result<LayeredImage> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, noise_stdev as f64).expect("noise stdev must be non-negative");

    let science = Array2::from_shape_fn((height, width), |_| noise.sample(&mut rng) as f32);
    LayeredImage::new(
        RawImage::from_array(science),
        RawImage::from_array(Array2::from_elem((height, width), pixel_variance)),
        RawImage::new(width, height),
        psf.clone(),
        obstime,
    )
}

/// Inject a point source at `(x, y)` with the given total flux.
///
/// With a PSF the flux is spread over the kernel footprint through
/// bilinear deposits; without one the whole flux lands at `(x, y)`.
pub fn add_fake_object(img: &mut LayeredImage, x: f32, y: f32, flux: f32, psf: Option<&Psf>) {
    let science = img.get_science_mut();
    match psf {
        None => science.interpolated_add(x, y, flux),
        Some(psf) => {
            let radius = psf.get_radius() as f32;
            let dim = psf.get_dim();
            for i in 0..dim {
                for j in 0..dim {
                    science.interpolated_add(
                        x - radius + j as f32,
                        y - radius + i as f32,
                        flux * psf.get_value(i, j),
                    );
                }
            }
        }
    }
}

/// Build a list of observation times: `obs_per_day` samples per night
/// separated by `intra_night_gap` days, nights separated by
/// `inter_night_gap` days.
pub fn create_fake_times(
    num_times: usize,
    t0: f64,
    obs_per_day: usize,
    intra_night_gap: f64,
    inter_night_gap: usize,
) -> Vec<f64> {
    let mut times = Vec::with_capacity(num_times);
    let mut seen_on_day = 0;
    let mut day_num = 0;
    for _ in 0..num_times {
        times.push(t0 + day_num as f64 + seen_on_day as f64 * intra_night_gap);
        seen_on_day += 1;
        if seen_on_day == obs_per_day {
            seen_on_day = 0;
            day_num += inter_night_gap;
        }
    }
    times
}

/// A reproducible synthetic data set: a stack of noisy exposures plus the
/// trajectories of every object planted in it.
pub struct FakeDataSet {
    width: usize,
    height: usize,
    times: Vec<f64>,
    psf: Psf,
    pub stack: ImageStack,
    pub trajectories: Vec<Trajectory>,
}

impl FakeDataSet {
    /// Create a stack of `times.len()` noisy exposures.
    ///
    /// The variance layer is `noise_level^2`, matching the science-layer
    /// noise. Exposure `i` is seeded with `seed + i`.
    pub fn new(
        width: usize,
        height: usize,
        times: Vec<f64>,
        noise_level: f32,
        psf_sigma: f32,
        seed: u64,
    ) -> Result<Self> {
        let psf = Psf::from_gaussian(psf_sigma)?;
        let mut stack = ImageStack::default();
        for (i, &t) in times.iter().enumerate() {
            stack.append_image(make_fake_layered_image(
                width,
                height,
                noise_level,
                noise_level * noise_level,
                t,
                &psf,
                seed + i as u64,
            )?)?;
        }
        Ok(Self {
            width,
            height,
            times,
            psf,
            stack,
            trajectories: Vec::new(),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn psf(&self) -> &Psf {
        &self.psf
    }

    /// Plant an object along `trj` in every exposure, spread by the PSF,
    /// and remember the trajectory.
    pub fn insert_object(&mut self, trj: &Trajectory) {
        let t0 = self.times[0];
        let psf = self.psf.clone();
        for i in 0..self.times.len() {
            let dt = self.times[i] - t0;
            let x = trj.get_x_pos(dt);
            let y = trj.get_y_pos(dt);
            let img = self
                .stack
                .get_single_image_mut(i)
                .expect("index within stack");
            add_fake_object(img, x, y, trj.flux, Some(&psf));
        }
        self.trajectories.push(*trj);
    }

    /// Plant an object with a random start pixel and a velocity that
    /// carries it to another random on-frame pixel, returning its
    /// trajectory.
    pub fn insert_random_object(&mut self, flux: f32, rng: &mut StdRng) -> Trajectory {
        use rand::Rng;
        let dt = self.times[self.times.len() - 1] - self.times[0];

        let x = rng.gen_range(0..self.width as i16);
        let y = rng.gen_range(0..self.height as i16);
        let x_end = rng.gen_range(0..self.width as i16);
        let y_end = rng.gen_range(0..self.height as i16);

        let mut trj = Trajectory::new(x, y, 0.0, 0.0);
        if dt > 0.0 {
            trj.vx = (x_end - x) as f32 / dt as f32;
            trj.vy = (y_end - y) as f32 / dt as f32;
        }
        trj.flux = flux;
        self.insert_object(&trj);
        trj
    }
}
