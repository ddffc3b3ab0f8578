//! Core types and stepping kernel shared across the driftfield workspace.
//!
//! Three coupled scalar fields evolve on a shared square grid: a diffusing
//! substrate, a response layer that accumulates coherence from it, and an
//! accumulation field that collects overflow and occasionally emits discrete
//! manifestation events which ripple back into the substrate.

use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

/// Monotonic step counter for a simulation run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Tick(pub u64);

impl Tick {
    /// The zero tick.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// The tick following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Discrete point event emitted by the accumulation field.
///
/// Records are append-only for the lifetime of an [`AccumulationField`];
/// `sequence_id` equals the record's position in the sequence, so ids are
/// gap-free and strictly increasing from zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Manifestation {
    pub sequence_id: u64,
    pub row: usize,
    pub col: usize,
    pub strength: f32,
}

/// Scalar summary recorded once per ecosystem step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StepSummary {
    pub step: Tick,
    pub substrate_mean: f32,
    pub response_mean: f32,
    pub field_mean: f32,
    pub manifestation_count: u64,
}

/// Events emitted after processing one ecosystem step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepEvents {
    pub step: Tick,
    /// Whether a resonance pulse was generated this step.
    pub pulsed: bool,
    /// Manifestations newly appended this step.
    pub manifested: usize,
}

/// Reporting sink invoked by [`Ecosystem::run`] at the configured cadence.
pub trait StepObserver: Send {
    fn on_report(&mut self, summary: &StepSummary);
}

/// No-op observer.
#[derive(Debug, Default)]
pub struct NullObserver;

impl StepObserver for NullObserver {
    fn on_report(&mut self, _summary: &StepSummary) {}
}

/// Errors surfaced while constructing or driving an ecosystem.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EcosystemError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Indicates a coherence map that cannot be resampled onto the grid.
    #[error("invalid coherence map: {0}")]
    InvalidCoherenceMap(&'static str),
}

/// One standard Gaussian draw scaled by `std_dev`, via the Box-Muller
/// transform over two uniform draws.
fn sample_gaussian(rng: &mut dyn RngCore, std_dev: f32) -> f32 {
    let u1: f32 = rng.random::<f32>().max(f32::EPSILON);
    let u2: f32 = rng.random::<f32>();
    let z = (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos();
    z * std_dev
}

/// Normalized 1D Gaussian kernel for the separable blur, with radius
/// `ceil(3 * sigma)`. A non-positive sigma yields the identity kernel.
fn gaussian_kernel(sigma: f32) -> (Vec<f32>, usize) {
    if sigma <= 0.0 {
        return (vec![1.0], 0);
    }
    let radius = (3.0 * sigma).ceil() as usize;
    let inv_two_sigma_sq = 1.0 / (2.0 * sigma * sigma);
    let mut weights: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let d = i as f32 - radius as f32;
            (-d * d * inv_two_sigma_sq).exp()
        })
        .collect();
    let total: f32 = weights.iter().sum();
    for w in &mut weights {
        *w /= total;
    }
    (weights, radius)
}

/// Blur `cells` with the separable kernel and blend the result back as
/// `(1 - mix) * raw + mix * blurred`. Edge samples clamp to the border.
/// Both passes are row-parallel and read only the pre-pass buffer, so the
/// result is independent of scheduling.
fn blur_and_blend(
    cells: &mut [f32],
    size: usize,
    kernel: &[f32],
    radius: usize,
    mix: f32,
    tmp: &mut [f32],
    blurred: &mut [f32],
) {
    if radius == 0 || mix <= 0.0 {
        return;
    }
    let last = size as isize - 1;
    {
        let src: &[f32] = cells;
        tmp.par_chunks_mut(size).enumerate().for_each(|(y, row)| {
            let src_row = &src[y * size..(y + 1) * size];
            for (x, out) in row.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (k, w) in kernel.iter().enumerate() {
                    let sx = (x as isize + k as isize - radius as isize).clamp(0, last) as usize;
                    acc += w * src_row[sx];
                }
                *out = acc;
            }
        });
    }
    {
        let tmp: &[f32] = tmp;
        blurred
            .par_chunks_mut(size)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.iter_mut().enumerate() {
                    let mut acc = 0.0;
                    for (k, w) in kernel.iter().enumerate() {
                        let sy =
                            (y as isize + k as isize - radius as isize).clamp(0, last) as usize;
                        acc += w * tmp[sy * size + x];
                    }
                    *out = acc;
                }
            });
    }
    let keep = 1.0 - mix;
    for (value, smooth) in cells.iter_mut().zip(blurred.iter()) {
        *value = keep * *value + mix * *smooth;
    }
}

/// Sample `buffer` (dimensions `rows` x `cols`) at a fractional position with
/// bilinear interpolation, clamping to the border.
fn sample_bilinear(buffer: &[f32], rows: usize, cols: usize, y: f32, x: f32) -> f32 {
    let x = x.clamp(0.0, (cols - 1) as f32);
    let y = y.clamp(0.0, (rows - 1) as f32);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(cols - 1);
    let y1 = (y0 + 1).min(rows - 1);

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let v00 = buffer[y0 * cols + x0];
    let v10 = buffer[y0 * cols + x1];
    let v01 = buffer[y1 * cols + x0];
    let v11 = buffer[y1 * cols + x1];

    let v0 = v00 * (1.0 - fx) + v10 * fx;
    let v1 = v01 * (1.0 - fx) + v11 * fx;

    v0 * (1.0 - fy) + v1 * fy
}

/// Resample a `src_rows` x `src_cols` map onto a square `dst_size` grid with
/// bilinear interpolation.
fn resample_bilinear(src: &[f32], src_rows: usize, src_cols: usize, dst: &mut [f32], dst_size: usize) {
    let row_scale = if dst_size > 1 {
        (src_rows - 1) as f32 / (dst_size - 1) as f32
    } else {
        0.0
    };
    let col_scale = if dst_size > 1 {
        (src_cols - 1) as f32 / (dst_size - 1) as f32
    } else {
        0.0
    };
    for row in 0..dst_size {
        let sy = row as f32 * row_scale;
        for col in 0..dst_size {
            let sx = col as f32 * col_scale;
            dst[row * dst_size + col] = sample_bilinear(src, src_rows, src_cols, sy, sx);
        }
    }
}

/// Square 2D grid of scalar values, stored row-major.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalarGrid {
    size: usize,
    cells: Vec<f32>,
}

impl ScalarGrid {
    /// Construct a `size * size` grid with every cell set to `initial`.
    pub fn new(size: usize, initial: f32) -> Result<Self, EcosystemError> {
        if size == 0 {
            return Err(EcosystemError::InvalidConfig("grid size must be non-zero"));
        }
        Ok(Self {
            size,
            cells: vec![initial; size * size],
        })
    }

    /// Construct a grid seeded with Gaussian noise clamped to `[low, high]`.
    pub fn with_noise(
        size: usize,
        std_dev: f32,
        low: f32,
        high: f32,
        rng: &mut dyn RngCore,
    ) -> Result<Self, EcosystemError> {
        if low > high {
            return Err(EcosystemError::InvalidConfig(
                "initial clamp bounds must satisfy low <= high",
            ));
        }
        let mut grid = Self::new(size, 0.0)?;
        if std_dev > 0.0 {
            for cell in &mut grid.cells {
                *cell = sample_gaussian(rng, std_dev).clamp(low, high);
            }
        }
        Ok(grid)
    }

    /// Side length of the grid.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    #[must_use]
    pub fn cells_mut(&mut self) -> &mut [f32] {
        &mut self.cells
    }

    /// Returns the flat index for `(row, col)` without bounds checks.
    #[inline]
    fn offset(&self, row: usize, col: usize) -> usize {
        row * self.size + col
    }

    /// Immutable access to a specific cell.
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row < self.size && col < self.size {
            Some(self.cells[self.offset(row, col)])
        } else {
            None
        }
    }

    /// Mutable access to a specific cell.
    pub fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut f32> {
        if row < self.size && col < self.size {
            let idx = self.offset(row, col);
            Some(&mut self.cells[idx])
        } else {
            None
        }
    }

    /// Fills the grid with the provided scalar value.
    pub fn fill(&mut self, value: f32) {
        self.cells.fill(value);
    }

    /// Mean cell value, accumulated in `f64` for stability.
    #[must_use]
    pub fn mean(&self) -> f32 {
        let total: f64 = self.cells.iter().map(|&v| f64::from(v)).sum();
        (total / self.cells.len() as f64) as f32
    }

    /// Clamp every cell to `[low, high]`.
    fn clamp_all(&mut self, low: f32, high: f32) {
        for cell in &mut self.cells {
            *cell = cell.clamp(low, high);
        }
    }
}

/// Parameters for the diffusing substrate layer.
///
/// [`SubstrateConfig::default`] carries the coupled-ecosystem constants;
/// [`SubstrateConfig::free_running`] the stronger constants used when the
/// substrate runs on its own without the other layers feeding it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SubstrateConfig {
    /// Standard deviation of the construction-time noise seed.
    pub initial_noise_std: f32,
    /// Clamp bounds applied to the construction-time noise seed.
    pub initial_low: f32,
    pub initial_high: f32,
    /// Constant increment added to every cell each step.
    pub baseline: f32,
    /// Gaussian blur sigma for the diffusion pass.
    pub diffusion_sigma: f32,
    /// Fraction of the blurred copy blended back per step.
    pub diffusion_mix: f32,
    /// Perturbation values at or below this threshold are ignored.
    pub perturbation_threshold: f32,
    /// Multiplier applied to over-threshold perturbation values.
    pub perturbation_gain: f32,
    /// Per-step multiplicative fade, slightly below one.
    pub decay: f32,
    /// Standard deviation of the per-cell noise added each step.
    pub noise_std: f32,
    /// Clamp bounds maintained after every operation.
    pub bound_low: f32,
    pub bound_high: f32,
    /// Cells above this value count toward [`SubstrateGrid::global_listening`].
    pub activity_threshold: f32,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            initial_noise_std: 0.005,
            initial_low: -0.06,
            initial_high: 0.12,
            baseline: 0.000_35,
            diffusion_sigma: 0.11,
            diffusion_mix: 0.15,
            perturbation_threshold: 0.58,
            perturbation_gain: 0.0032,
            decay: 0.993,
            noise_std: 0.0018,
            bound_low: -0.09,
            bound_high: 0.28,
            activity_threshold: 0.04,
        }
    }
}

impl SubstrateConfig {
    /// Constants for a substrate running without the response and field
    /// layers: slightly stronger baseline, diffusion, and noise.
    #[must_use]
    pub fn free_running() -> Self {
        Self {
            initial_noise_std: 0.008,
            initial_low: -0.12,
            initial_high: 0.25,
            baseline: 0.0006,
            diffusion_sigma: 0.14,
            diffusion_mix: 0.18,
            perturbation_threshold: 0.65,
            perturbation_gain: 0.006,
            decay: 0.992,
            noise_std: 0.0035,
            bound_low: -0.18,
            bound_high: 0.42,
            activity_threshold: 0.04,
        }
    }

    fn validate(&self) -> Result<(), EcosystemError> {
        if self.initial_noise_std < 0.0 {
            return Err(EcosystemError::InvalidConfig(
                "initial_noise_std must be non-negative",
            ));
        }
        if self.initial_low > self.initial_high {
            return Err(EcosystemError::InvalidConfig(
                "initial clamp bounds must satisfy low <= high",
            ));
        }
        if self.baseline < 0.0 || !self.baseline.is_finite() {
            return Err(EcosystemError::InvalidConfig(
                "baseline must be non-negative and finite",
            ));
        }
        if self.diffusion_sigma < 0.0 {
            return Err(EcosystemError::InvalidConfig(
                "diffusion_sigma must be non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.diffusion_mix) {
            return Err(EcosystemError::InvalidConfig(
                "diffusion_mix must lie in [0, 1]",
            ));
        }
        if self.perturbation_gain < 0.0 {
            return Err(EcosystemError::InvalidConfig(
                "perturbation_gain must be non-negative",
            ));
        }
        if !(self.decay > 0.0 && self.decay <= 1.0) {
            return Err(EcosystemError::InvalidConfig("decay must lie in (0, 1]"));
        }
        if self.noise_std < 0.0 {
            return Err(EcosystemError::InvalidConfig(
                "noise_std must be non-negative",
            ));
        }
        if self.bound_low >= self.bound_high {
            return Err(EcosystemError::InvalidConfig(
                "clamp bounds must satisfy low < high",
            ));
        }
        Ok(())
    }
}

/// Slowly diffusing ambient background field.
///
/// Low-amplitude by construction: every step fades the whole grid and clamps
/// it to a narrow band, so patterns persist only while renewed.
#[derive(Debug, Clone)]
pub struct SubstrateGrid {
    config: SubstrateConfig,
    grid: ScalarGrid,
    kernel: Vec<f32>,
    kernel_radius: usize,
    blur_tmp: Vec<f32>,
    blur_out: Vec<f32>,
    resampled: Vec<f32>,
}

impl SubstrateGrid {
    /// Construct a substrate of side `size`, seeded with clamped noise.
    pub fn new(
        size: usize,
        config: SubstrateConfig,
        rng: &mut dyn RngCore,
    ) -> Result<Self, EcosystemError> {
        config.validate()?;
        let grid = ScalarGrid::with_noise(
            size,
            config.initial_noise_std,
            config.initial_low,
            config.initial_high,
            rng,
        )?;
        let (kernel, kernel_radius) = gaussian_kernel(config.diffusion_sigma);
        let len = size * size;
        Ok(Self {
            config,
            grid,
            kernel,
            kernel_radius,
            blur_tmp: vec![0.0; len],
            blur_out: vec![0.0; len],
            resampled: vec![0.0; len],
        })
    }

    /// Advance the substrate by one step.
    ///
    /// Order: baseline increment, diffusion, optional gated perturbation,
    /// decay, per-cell noise, clamp. `perturbation` must share the grid's
    /// shape; resolution conversion goes through [`Self::feel_resonance`].
    pub fn step(&mut self, rng: &mut dyn RngCore, perturbation: Option<&ScalarGrid>) {
        let config = self.config;
        let size = self.grid.size();

        for cell in self.grid.cells_mut() {
            *cell += config.baseline;
        }

        blur_and_blend(
            self.grid.cells_mut(),
            size,
            &self.kernel,
            self.kernel_radius,
            config.diffusion_mix,
            &mut self.blur_tmp,
            &mut self.blur_out,
        );

        if let Some(pulse) = perturbation {
            debug_assert_eq!(pulse.size(), self.grid.size());
            apply_gated_perturbation(
                self.grid.cells_mut(),
                pulse.cells(),
                config.perturbation_threshold,
                config.perturbation_gain,
            );
        }

        for cell in self.grid.cells_mut() {
            *cell *= config.decay;
        }

        if config.noise_std > 0.0 {
            for cell in self.grid.cells_mut() {
                *cell += sample_gaussian(rng, config.noise_std);
            }
        }

        self.grid.clamp_all(config.bound_low, config.bound_high);
    }

    /// Feed an externally produced coherence map into the substrate.
    ///
    /// The map is bilinearly resampled to the grid's shape when its
    /// dimensions differ, then the same threshold-and-add rule as the in-step
    /// perturbation path applies: cells at or below the threshold receive
    /// nothing.
    pub fn feel_resonance(
        &mut self,
        values: &[f32],
        rows: usize,
        cols: usize,
    ) -> Result<(), EcosystemError> {
        if rows == 0 || cols == 0 {
            return Err(EcosystemError::InvalidCoherenceMap(
                "coherence map dimensions must be non-zero",
            ));
        }
        if rows * cols != values.len() {
            return Err(EcosystemError::InvalidCoherenceMap(
                "coherence map length must equal rows * cols",
            ));
        }
        let size = self.grid.size();
        if rows == size && cols == size {
            apply_gated_perturbation(
                self.grid.cells_mut(),
                values,
                self.config.perturbation_threshold,
                self.config.perturbation_gain,
            );
        } else {
            resample_bilinear(values, rows, cols, &mut self.resampled, size);
            apply_gated_perturbation(
                self.grid.cells_mut(),
                &self.resampled,
                self.config.perturbation_threshold,
                self.config.perturbation_gain,
            );
        }
        self.grid
            .clamp_all(self.config.bound_low, self.config.bound_high);
        Ok(())
    }

    /// Fraction of cells strictly above the configured activity threshold, a
    /// coarse scalar proxy for how receptive the substrate currently is.
    #[must_use]
    pub fn global_listening(&self) -> f32 {
        let threshold = self.config.activity_threshold;
        let active = self
            .grid
            .cells()
            .iter()
            .filter(|&&v| v > threshold)
            .count();
        active as f32 / self.grid.cells().len() as f32
    }

    #[must_use]
    pub fn grid(&self) -> &ScalarGrid {
        &self.grid
    }

    #[must_use]
    pub fn grid_mut(&mut self) -> &mut ScalarGrid {
        &mut self.grid
    }

    #[must_use]
    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }
}

/// Threshold-gated additive coupling: only perturbation values strictly above
/// `threshold` contribute, scaled by `gain`.
fn apply_gated_perturbation(cells: &mut [f32], perturbation: &[f32], threshold: f32, gain: f32) {
    for (cell, &p) in cells.iter_mut().zip(perturbation.iter()) {
        if p > threshold {
            *cell += gain * p;
        }
    }
}

/// Parameters for the coherence-accumulating response layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResponseConfig {
    /// Substrate values must exceed this offset to produce any bonus.
    pub bonus_offset: f32,
    /// Linear gain applied to the over-offset excess.
    pub bonus_gain: f32,
    /// Per-step ceiling on the bonus a single cell can receive.
    pub bonus_cap: f32,
    /// Fraction of each cell's value relaxed toward zero every step.
    pub relaxation: f32,
    /// Upper clamp bound; the lower bound is zero.
    pub ceiling: f32,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            bonus_offset: 0.06,
            bonus_gain: 6.5,
            bonus_cap: 0.022,
            relaxation: 0.012,
            ceiling: 0.92,
        }
    }
}

impl ResponseConfig {
    fn validate(&self) -> Result<(), EcosystemError> {
        if self.bonus_gain < 0.0 || self.bonus_cap < 0.0 {
            return Err(EcosystemError::InvalidConfig(
                "bonus gain and cap must be non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.relaxation) {
            return Err(EcosystemError::InvalidConfig(
                "relaxation must lie in [0, 1]",
            ));
        }
        if self.ceiling <= 0.0 {
            return Err(EcosystemError::InvalidConfig("ceiling must be positive"));
        }
        Ok(())
    }
}

/// Damped transform of the substrate: accumulates a capped bonus wherever the
/// substrate runs above its offset, and relaxes toward zero everywhere.
#[derive(Debug, Clone)]
pub struct ResponseGrid {
    config: ResponseConfig,
    grid: ScalarGrid,
}

impl ResponseGrid {
    /// Construct a zeroed response grid of side `size`.
    pub fn new(size: usize, config: ResponseConfig) -> Result<Self, EcosystemError> {
        config.validate()?;
        Ok(Self {
            config,
            grid: ScalarGrid::new(size, 0.0)?,
        })
    }

    /// Accumulate one step of coherence from the substrate.
    ///
    /// Relaxation applies every step regardless of whether any bonus landed.
    pub fn update(&mut self, substrate: &ScalarGrid) {
        debug_assert_eq!(substrate.size(), self.grid.size());
        let config = self.config;
        for (cell, &s) in self.grid.cells_mut().iter_mut().zip(substrate.cells()) {
            let bonus = ((s - config.bonus_offset) * config.bonus_gain).clamp(0.0, config.bonus_cap);
            let mut value = *cell + bonus;
            value += config.relaxation * (0.0 - value);
            *cell = value.clamp(0.0, config.ceiling);
        }
    }

    #[must_use]
    pub fn grid(&self) -> &ScalarGrid {
        &self.grid
    }

    #[must_use]
    pub fn grid_mut(&mut self) -> &mut ScalarGrid {
        &mut self.grid
    }

    #[must_use]
    pub fn config(&self) -> &ResponseConfig {
        &self.config
    }
}

/// Parameters for the overflow-accumulating field layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FieldConfig {
    /// Standard deviation of the construction-time noise seed.
    pub initial_noise_std: f32,
    /// Constant increment added each step, slower than the substrate's.
    pub baseline: f32,
    /// Gaussian blur sigma for the diffusion pass.
    pub diffusion_sigma: f32,
    /// Fraction of the blurred copy blended back per step.
    pub diffusion_mix: f32,
    /// Per-step multiplicative fade.
    pub decay: f32,
    /// Response values must exceed this offset to overflow into the field.
    pub overflow_offset: f32,
    /// Upper clamp on the per-cell overflow excess.
    pub overflow_cap: f32,
    /// Gain applied to overflow before it lands in the field.
    pub accumulate_gain: f32,
    /// Field values must exceed this threshold to become emission candidates.
    pub emission_threshold: f32,
    /// Linear gain mapping over-threshold excess to emission probability.
    pub emission_gain: f32,
    /// Ceiling on the per-cell emission probability.
    pub emission_prob_cap: f32,
    /// Manifestation strength per unit of emission probability.
    pub strength_gain: f32,
    /// Fraction of the emitted strength released from the cell.
    pub release_fraction: f32,
    /// Clamp bounds maintained at step boundaries.
    pub bound_low: f32,
    pub bound_high: f32,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            initial_noise_std: 0.003,
            baseline: 0.000_18,
            diffusion_sigma: 0.08,
            diffusion_mix: 0.11,
            decay: 0.988,
            overflow_offset: 0.42,
            overflow_cap: 0.5,
            accumulate_gain: 0.007,
            emission_threshold: 0.68,
            emission_gain: 4.2,
            emission_prob_cap: 0.82,
            strength_gain: 0.09,
            release_fraction: 0.6,
            bound_low: -0.05,
            bound_high: 1.0,
        }
    }
}

impl FieldConfig {
    fn validate(&self) -> Result<(), EcosystemError> {
        if self.initial_noise_std < 0.0 {
            return Err(EcosystemError::InvalidConfig(
                "initial_noise_std must be non-negative",
            ));
        }
        if self.baseline < 0.0 || !self.baseline.is_finite() {
            return Err(EcosystemError::InvalidConfig(
                "baseline must be non-negative and finite",
            ));
        }
        if self.diffusion_sigma < 0.0 {
            return Err(EcosystemError::InvalidConfig(
                "diffusion_sigma must be non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.diffusion_mix) {
            return Err(EcosystemError::InvalidConfig(
                "diffusion_mix must lie in [0, 1]",
            ));
        }
        if !(self.decay > 0.0 && self.decay <= 1.0) {
            return Err(EcosystemError::InvalidConfig("decay must lie in (0, 1]"));
        }
        if self.overflow_cap < 0.0 || self.accumulate_gain < 0.0 {
            return Err(EcosystemError::InvalidConfig(
                "overflow cap and accumulate gain must be non-negative",
            ));
        }
        if self.emission_gain < 0.0 {
            return Err(EcosystemError::InvalidConfig(
                "emission_gain must be non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.emission_prob_cap) {
            return Err(EcosystemError::InvalidConfig(
                "emission_prob_cap must lie in [0, 1]",
            ));
        }
        if self.strength_gain < 0.0 {
            return Err(EcosystemError::InvalidConfig(
                "strength_gain must be non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.release_fraction) {
            return Err(EcosystemError::InvalidConfig(
                "release_fraction must lie in [0, 1]",
            ));
        }
        if self.bound_low >= self.bound_high {
            return Err(EcosystemError::InvalidConfig(
                "clamp bounds must satisfy low < high",
            ));
        }
        Ok(())
    }
}

/// Overflow accumulator that diffuses slowly and probabilistically emits
/// discrete [`Manifestation`] events wherever it runs over threshold.
#[derive(Debug, Clone)]
pub struct AccumulationField {
    config: FieldConfig,
    grid: ScalarGrid,
    kernel: Vec<f32>,
    kernel_radius: usize,
    blur_tmp: Vec<f32>,
    blur_out: Vec<f32>,
    snapshot: Vec<f32>,
    manifestations: Vec<Manifestation>,
}

impl AccumulationField {
    /// Construct a field of side `size`, seeded with faint noise.
    pub fn new(
        size: usize,
        config: FieldConfig,
        rng: &mut dyn RngCore,
    ) -> Result<Self, EcosystemError> {
        config.validate()?;
        let grid = ScalarGrid::with_noise(
            size,
            config.initial_noise_std,
            config.bound_low,
            config.bound_high,
            rng,
        )?;
        let (kernel, kernel_radius) = gaussian_kernel(config.diffusion_sigma);
        let len = size * size;
        Ok(Self {
            config,
            grid,
            kernel,
            kernel_radius,
            blur_tmp: vec![0.0; len],
            blur_out: vec![0.0; len],
            snapshot: vec![0.0; len],
            manifestations: Vec::new(),
        })
    }

    /// Collect overflow from the response grid. This is the only external
    /// write path into the field.
    pub fn accumulate(&mut self, response: &ScalarGrid) {
        debug_assert_eq!(response.size(), self.grid.size());
        let config = self.config;
        for (cell, &r) in self.grid.cells_mut().iter_mut().zip(response.cells()) {
            let overflow = (r - config.overflow_offset).clamp(0.0, config.overflow_cap);
            *cell = (*cell + config.accumulate_gain * overflow)
                .clamp(config.bound_low, config.bound_high);
        }
    }

    /// Advance the field by one step, returning how many manifestations were
    /// newly emitted.
    ///
    /// Emission candidates are evaluated against a snapshot taken after the
    /// decay pass, so a cell's threshold test and probability never observe
    /// the release applied to a sibling cell within the same call.
    pub fn step(&mut self, rng: &mut dyn RngCore) -> usize {
        let config = self.config;
        let size = self.grid.size();

        for cell in self.grid.cells_mut() {
            *cell += config.baseline;
        }

        blur_and_blend(
            self.grid.cells_mut(),
            size,
            &self.kernel,
            self.kernel_radius,
            config.diffusion_mix,
            &mut self.blur_tmp,
            &mut self.blur_out,
        );

        for cell in self.grid.cells_mut() {
            *cell *= config.decay;
        }

        self.snapshot.copy_from_slice(self.grid.cells());
        let mut emitted = 0;
        for row in 0..size {
            for col in 0..size {
                let idx = row * size + col;
                let value = self.snapshot[idx];
                if value <= config.emission_threshold {
                    continue;
                }
                let probability = ((value - config.emission_threshold) * config.emission_gain)
                    .clamp(0.0, config.emission_prob_cap);
                if rng.random::<f32>() < probability {
                    let strength = config.strength_gain * probability;
                    self.manifestations.push(Manifestation {
                        sequence_id: self.manifestations.len() as u64,
                        row,
                        col,
                        strength,
                    });
                    // Release local tension so the same cell does not
                    // re-trigger every step.
                    self.grid.cells_mut()[idx] -= config.release_fraction * strength;
                    emitted += 1;
                }
            }
        }

        self.grid.clamp_all(config.bound_low, config.bound_high);
        emitted
    }

    /// Every manifestation emitted over the field's lifetime, in append
    /// order.
    #[must_use]
    pub fn manifestations(&self) -> &[Manifestation] {
        &self.manifestations
    }

    #[must_use]
    pub fn grid(&self) -> &ScalarGrid {
        &self.grid
    }

    #[must_use]
    pub fn grid_mut(&mut self) -> &mut ScalarGrid {
        &mut self.grid
    }

    #[must_use]
    pub fn config(&self) -> &FieldConfig {
        &self.config
    }
}

/// Parameters for the stochastic resonance pulse source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PulseConfig {
    /// Per-step probability of producing a pulse.
    pub probability: f32,
    /// Minimum distance of the pulse center from every edge, in cells.
    pub margin: usize,
    /// Radius of the circular active region, in cells.
    pub radius: usize,
    /// Base value assigned to active cells.
    pub base_level: f32,
    /// Uniform jitter bounds added to the base level per active cell.
    pub jitter_low: f32,
    pub jitter_high: f32,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            probability: 0.12,
            margin: 40,
            radius: 24,
            base_level: 0.68,
            jitter_low: -0.14,
            jitter_high: 0.16,
        }
    }
}

impl PulseConfig {
    fn validate(&self, size: usize) -> Result<(), EcosystemError> {
        if !(0.0..=1.0).contains(&self.probability) {
            return Err(EcosystemError::InvalidConfig(
                "pulse probability must lie in [0, 1]",
            ));
        }
        if self.radius == 0 {
            return Err(EcosystemError::InvalidConfig(
                "pulse radius must be non-zero",
            ));
        }
        if size <= 2 * self.margin {
            return Err(EcosystemError::InvalidConfig(
                "grid size must exceed twice the pulse margin",
            ));
        }
        if self.jitter_low > self.jitter_high {
            return Err(EcosystemError::InvalidConfig(
                "jitter bounds must satisfy low <= high",
            ));
        }
        Ok(())
    }
}

/// Source of rare, localized perturbation grids fed into the substrate.
#[derive(Debug, Clone)]
pub struct PulseGenerator {
    config: PulseConfig,
    size: usize,
    template: ScalarGrid,
}

impl PulseGenerator {
    /// Construct a generator producing pulses on a `size` x `size` grid.
    pub fn new(size: usize, config: PulseConfig) -> Result<Self, EcosystemError> {
        config.validate(size)?;
        Ok(Self {
            config,
            size,
            template: ScalarGrid::new(size, 0.0)?,
        })
    }

    /// Draw one pulse attempt. Returns `None` on the quiet branch; otherwise
    /// a grid with a single circular active region centered at least
    /// `margin` cells from every edge. At most one center per call.
    pub fn generate(&self, rng: &mut dyn RngCore) -> Option<ScalarGrid> {
        let config = self.config;
        if rng.random::<f32>() >= config.probability {
            return None;
        }

        let center_row = rng.random_range(config.margin..self.size - config.margin);
        let center_col = rng.random_range(config.margin..self.size - config.margin);

        let mut pulse = self.template.clone();
        let radius = config.radius as isize;
        let radius_sq = radius * radius;
        let last = self.size as isize - 1;
        let row_lo = (center_row as isize - radius).clamp(0, last);
        let row_hi = (center_row as isize + radius).clamp(0, last);
        let col_lo = (center_col as isize - radius).clamp(0, last);
        let col_hi = (center_col as isize + radius).clamp(0, last);

        let jitter_span = config.jitter_high - config.jitter_low;
        for row in row_lo..=row_hi {
            for col in col_lo..=col_hi {
                let dr = row - center_row as isize;
                let dc = col - center_col as isize;
                if dr * dr + dc * dc >= radius_sq {
                    continue;
                }
                let jitter = if jitter_span > 0.0 {
                    rng.random_range(config.jitter_low..config.jitter_high)
                } else {
                    config.jitter_low
                };
                pulse.cells_mut()[row as usize * self.size + col as usize] =
                    config.base_level + jitter;
            }
        }
        Some(pulse)
    }

    #[must_use]
    pub fn config(&self) -> &PulseConfig {
        &self.config
    }
}

/// Static configuration for a full ecosystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EcosystemConfig {
    /// Side length shared by all three grids.
    pub size: usize,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent step summaries retained in memory.
    pub history_capacity: usize,
    /// Peak amplitude of the manifestation feedback ripple.
    pub ripple_amplitude: f32,
    /// Exponential distance scale of the ripple, in cells.
    pub ripple_scale: f32,
    /// Cells beyond this distance from the manifestation receive nothing.
    pub ripple_radius: f32,
    pub substrate: SubstrateConfig,
    pub response: ResponseConfig,
    pub field: FieldConfig,
    pub pulse: PulseConfig,
}

impl Default for EcosystemConfig {
    fn default() -> Self {
        Self {
            size: 180,
            rng_seed: None,
            history_capacity: 2048,
            ripple_amplitude: 0.018,
            ripple_scale: 9.0,
            ripple_radius: 18.0,
            substrate: SubstrateConfig::default(),
            response: ResponseConfig::default(),
            field: FieldConfig::default(),
            pulse: PulseConfig::default(),
        }
    }
}

impl EcosystemConfig {
    fn validate(&self) -> Result<(), EcosystemError> {
        if self.size == 0 {
            return Err(EcosystemError::InvalidConfig("grid size must be non-zero"));
        }
        if self.history_capacity == 0 {
            return Err(EcosystemError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        if self.ripple_amplitude < 0.0 {
            return Err(EcosystemError::InvalidConfig(
                "ripple_amplitude must be non-negative",
            ));
        }
        if self.ripple_scale <= 0.0 {
            return Err(EcosystemError::InvalidConfig(
                "ripple_scale must be positive",
            ));
        }
        if self.ripple_radius < 0.0 {
            return Err(EcosystemError::InvalidConfig(
                "ripple_radius must be non-negative",
            ));
        }
        Ok(())
    }

    /// Returns the seeded RNG, generating a seed from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Owns the three coupled grids and sequences one simulation step:
/// pulse, substrate, response, field accumulation, field step, manifestation
/// feedback, summary recording.
pub struct Ecosystem {
    config: EcosystemConfig,
    tick: Tick,
    rng: SmallRng,
    substrate: SubstrateGrid,
    response: ResponseGrid,
    field: AccumulationField,
    pulses: PulseGenerator,
    observer: Box<dyn StepObserver>,
    history: VecDeque<StepSummary>,
}

impl fmt::Debug for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ecosystem")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("manifestation_count", &self.field.manifestations().len())
            .finish()
    }
}

impl Ecosystem {
    /// Instantiate a new ecosystem using the supplied configuration.
    pub fn new(config: EcosystemConfig) -> Result<Self, EcosystemError> {
        Self::with_observer(config, Box::new(NullObserver))
    }

    /// Instantiate a new ecosystem with a custom reporting observer.
    pub fn with_observer(
        config: EcosystemConfig,
        observer: Box<dyn StepObserver>,
    ) -> Result<Self, EcosystemError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let substrate = SubstrateGrid::new(config.size, config.substrate, &mut rng)?;
        let response = ResponseGrid::new(config.size, config.response)?;
        let field = AccumulationField::new(config.size, config.field, &mut rng)?;
        let pulses = PulseGenerator::new(config.size, config.pulse)?;
        let history = VecDeque::with_capacity(config.history_capacity);
        Ok(Self {
            config,
            tick: Tick::zero(),
            rng,
            substrate,
            response,
            field,
            pulses,
            observer,
            history,
        })
    }

    /// Execute one full simulation step.
    ///
    /// All grids are left fully updated and clamped at return, so a run may
    /// be stopped between steps without corrupting state.
    pub fn step(&mut self) -> StepEvents {
        let next_tick = self.tick.next();

        let pulse = self.pulses.generate(&mut self.rng);
        self.substrate.step(&mut self.rng, pulse.as_ref());
        self.response.update(self.substrate.grid());
        self.field.accumulate(self.response.grid());
        let manifested = self.field.step(&mut self.rng);

        if manifested > 0
            && let Some(latest) = self.field.manifestations().last().copied()
        {
            self.apply_feedback_ripple(latest.row, latest.col);
        }

        let summary = StepSummary {
            step: next_tick,
            substrate_mean: self.substrate.grid().mean(),
            response_mean: self.response.grid().mean(),
            field_mean: self.field.grid().mean(),
            manifestation_count: self.field.manifestations().len() as u64,
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);

        self.assert_finite();
        self.tick = next_tick;

        StepEvents {
            step: next_tick,
            pulsed: pulse.is_some(),
            manifested,
        }
    }

    /// Run `steps` steps sequentially, forwarding the newest summary to the
    /// observer every `report_interval` steps. A zero interval disables
    /// reporting.
    pub fn run(&mut self, steps: u32, report_interval: u32) {
        for _ in 0..steps {
            self.step();
            if report_interval > 0
                && self.tick.0.is_multiple_of(u64::from(report_interval))
                && let Some(summary) = self.history.back().copied()
            {
                self.observer.on_report(&summary);
            }
        }
    }

    /// Radial decay ripple written into the substrate after a manifestation,
    /// the one path by which field-layer events re-enter the substrate.
    fn apply_feedback_ripple(&mut self, row: usize, col: usize) {
        let amplitude = self.config.ripple_amplitude;
        let scale = self.config.ripple_scale;
        let radius = self.config.ripple_radius;
        if amplitude <= 0.0 || radius <= 0.0 {
            return;
        }

        let size = self.substrate.grid().size();
        let low = self.config.substrate.bound_low;
        let high = self.config.substrate.bound_high;
        let reach = radius.ceil() as isize;
        let cells = self.substrate.grid_mut().cells_mut();
        for dr in -reach..=reach {
            let rr = row as isize + dr;
            if rr < 0 || rr >= size as isize {
                continue;
            }
            for dc in -reach..=reach {
                let cc = col as isize + dc;
                if cc < 0 || cc >= size as isize {
                    continue;
                }
                let dist = ((dr * dr + dc * dc) as f32).sqrt();
                if dist >= radius {
                    continue;
                }
                let idx = rr as usize * size + cc as usize;
                cells[idx] = (cells[idx] + amplitude * (-dist / scale).exp()).clamp(low, high);
            }
        }
    }

    /// Every cell of every grid must remain finite; a violation indicates a
    /// parameter misconfiguration and is fatal.
    fn assert_finite(&self) {
        assert_cells_finite("substrate", self.substrate.grid().cells());
        assert_cells_finite("response", self.response.grid().cells());
        assert_cells_finite("field", self.field.grid().cells());
    }

    /// Replace the reporting observer.
    pub fn set_observer(&mut self, observer: Box<dyn StepObserver>) {
        self.observer = observer;
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &EcosystemConfig {
        &self.config
    }

    /// Borrow the ecosystem RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    #[must_use]
    pub fn substrate(&self) -> &SubstrateGrid {
        &self.substrate
    }

    #[must_use]
    pub fn substrate_mut(&mut self) -> &mut SubstrateGrid {
        &mut self.substrate
    }

    #[must_use]
    pub fn response(&self) -> &ResponseGrid {
        &self.response
    }

    #[must_use]
    pub fn field(&self) -> &AccumulationField {
        &self.field
    }

    #[must_use]
    pub fn field_mut(&mut self) -> &mut AccumulationField {
        &mut self.field
    }

    /// Manifestations emitted so far, in append order.
    #[must_use]
    pub fn manifestations(&self) -> &[Manifestation] {
        self.field.manifestations()
    }

    /// Iterate over retained step summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StepSummary> {
        self.history.iter()
    }
}

fn assert_cells_finite(label: &str, cells: &[f32]) {
    assert!(
        cells.iter().all(|v| v.is_finite()),
        "{label} grid contains a non-finite cell",
    );
}

impl fmt::Display for Manifestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "manifestation #{} at ({}, {}) strength {:.5}",
            self.sequence_id, self.row, self.col, self.strength
        )
    }
}
