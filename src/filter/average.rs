//! Block-disparity averaging (mode filter + weighted mean).
//!
//! For every interior block the pass builds a 1024-bin moving-integral
//! histogram of the valid disparities in the surrounding
//! `(2·blkshgt+1) × (2·blkswdt+1)` neighbourhood, weighted by distance from
//! the centre, locates the dominant disparity, and replaces the block with
//! the weighted mean of the neighbours inside `mode ± range` — or zero when
//! the neighbourhood is too sparse, the centre disagrees with a weak mode,
//! or the in-range fraction is too small.
//!
//! The pass reads from a frozen copy of the grid and writes in place, so it
//! can be cut into bands with no cross-band hazards.

use crate::block::SUBPIXEL_SCALE;

/// Histogram bin count; sub-pixel precision is reduced to fit.
pub(crate) const HISTOGRAM_BINS: usize = 1024;

/// Largest supported neighbourhood (17 x 17).
const AVERAGING_BLOCKS_MAX: usize = 289;

/// Averaging parameters (ini section `[AVERAGE]`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AveragingParams {
    /// Run the averaging pass.
    pub enabled: bool,
    /// Neighbourhood half-height in blocks.
    pub block_height: usize,
    /// Neighbourhood half-width in blocks.
    pub block_width: usize,
    /// Moving-integral half-width, in pixels.
    pub integration_range: f64,
    /// Accepted distribution half-width around the mode, in pixels.
    pub limit_range: f64,
    /// Minimum valid-disparity density, percent.
    pub density_ratio: i32,
    /// Minimum in-range fraction of valid disparities, percent.
    pub valid_ratio: i32,
    /// Replacement threshold for centres outside the mode range, percent.
    pub replacement_ratio: i32,
}

impl Default for AveragingParams {
    fn default() -> Self {
        Self {
            enabled: true,
            block_height: 3,
            block_width: 3,
            integration_range: 1.0,
            limit_range: 2.0,
            density_ratio: 20,
            valid_ratio: 20,
            replacement_ratio: 50,
        }
    }
}

/// Neighbour weights by squared distance from the centre
/// (ini section `[AVERAGE_BLOCK_WEIGHT]`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeightParams {
    /// Weight of the centre block (distance² = 0).
    pub center: i32,
    /// Weight of the 4-neighbourhood (distance² 1, 2).
    pub near: i32,
    /// Weight of the next shell (distance² 4, 5, 8).
    pub round: i32,
}

impl Default for WeightParams {
    fn default() -> Self {
        Self {
            center: 1,
            near: 1,
            round: 1,
        }
    }
}

#[inline]
fn position_weight(jj: i64, ii: i64, weights: &WeightParams) -> i32 {
    match jj * jj + ii * ii {
        0 => weights.center,
        1 | 2 => weights.near,
        3..=8 => weights.round,
        _ => 1,
    }
}

/// Inputs shared by every band of one averaging pass.
pub(crate) struct AveragingInputs<'a> {
    /// Block rows in the full grid.
    pub rows: usize,
    /// Block columns in the full grid.
    pub cols: usize,
    /// Block columns carrying disparity (shade band excluded).
    pub disp_cols: usize,
    /// Matcher search depth, pixels.
    pub depth: usize,
    /// Averaging parameters.
    pub params: &'a AveragingParams,
    /// Neighbour weights.
    pub weights: &'a WeightParams,
    /// Frozen copy of the block grid read by every band.
    pub src: &'a [i32],
}

/// A 1024-bin moving-integral histogram over `[0, depth·1000)`.
///
/// Each sample covers `±integ` sub-pixel units; the mode of a run of equal
/// maxima is its middle bin. Shared by the averaging pass and the
/// edge-segment outlier filter.
pub(crate) struct MovingIntegral {
    bins: [i32; HISTOGRAM_BINS],
    /// Sub-pixel units per bin.
    scale: i32,
    /// Number of usable bins.
    width: usize,
}

impl MovingIntegral {
    pub(crate) fn new(depth: usize) -> Self {
        let full = depth as i32 * SUBPIXEL_SCALE;
        let scale = full / HISTOGRAM_BINS as i32 + 1;
        Self {
            bins: [0; HISTOGRAM_BINS],
            scale,
            width: (full / scale) as usize,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.bins.fill(0);
    }

    /// Accumulate `weight` over `disparity ± integ` sub-pixel units.
    pub(crate) fn add(&mut self, disparity: i32, integ: i32, weight: i32) {
        let start = ((disparity - integ) / self.scale).max(0) as usize;
        let end = (((disparity + integ) / self.scale) as usize).min(self.width - 1);
        for bin in start..=end {
            self.bins[bin] += weight;
        }
    }

    /// Dominant disparity in sub-pixel units; runs of equal maxima resolve
    /// to their middle bin.
    pub(crate) fn mode(&self) -> i32 {
        let mut max_count = 0;
        let mut max_bin = 0usize;
        let mut run = 0usize;
        let mut in_run = false;

        for (bin, &count) in self.bins[..self.width].iter().enumerate() {
            if count > max_count {
                max_count = count;
                max_bin = bin;
                run = 0;
                in_run = true;
            }
            if in_run {
                if count == max_count {
                    run += 1;
                } else {
                    in_run = false;
                }
            }
        }

        let centered = max_bin + (run.saturating_sub(1)) / 2;
        centered as i32 * self.scale
    }

    /// Full histogram span in sub-pixel units.
    pub(crate) fn span(&self) -> i32 {
        self.width as i32 * self.scale
    }
}

/// Run the averaging pass over block rows `[row_start, row_end)`, writing
/// into `out`, a slice of whole block rows beginning at `row_start`.
pub(crate) fn average_band(
    inputs: &AveragingInputs<'_>,
    row_start: usize,
    row_end: usize,
    out: &mut [i32],
) {
    let p = inputs.params;
    let cols = inputs.cols;
    let disp_cols = inputs.disp_cols;

    let integ = (p.integration_range * f64::from(SUBPIXEL_SCALE)) as i32;
    let range = (p.limit_range * f64::from(SUBPIXEL_SCALE)) as i32;
    let full_span = inputs.depth as i32 * SUBPIXEL_SCALE;

    let mut histogram = MovingIntegral::new(inputs.depth);
    let mut disp_samples = [0i32; AVERAGING_BLOCKS_MAX];
    let mut weight_samples = [0i32; AVERAGING_BLOCKS_MAX];

    for jd in row_start..row_end {
        for id in 0..disp_cols {
            let out_idx = (jd - row_start) * cols + id;

            // Blocks whose neighbourhood would leave the grid carry nothing.
            if jd < p.block_height
                || jd >= inputs.rows - p.block_height
                || id < p.block_width
                || id >= disp_cols - p.block_width
            {
                out[out_idx] = 0;
                continue;
            }

            histogram.reset();
            let mut sample_count = 0usize;
            let mut weight_total = 0i32;
            let mut weight_valid = 0i32;
            let center_value = inputs.src[jd * cols + id];

            for j in jd - p.block_height..=jd + p.block_height {
                let jj = j as i64 - jd as i64;
                for i in id - p.block_width..=id + p.block_width {
                    let ii = i as i64 - id as i64;
                    let disp = inputs.src[j * cols + i];
                    let weight = position_weight(jj, ii, inputs.weights);
                    weight_total += weight;

                    if disp > SUBPIXEL_SCALE {
                        disp_samples[sample_count] = disp;
                        weight_samples[sample_count] = weight;
                        sample_count += 1;
                        weight_valid += weight;
                        histogram.add(disp, integ, weight);
                    }
                }
            }

            let density = weight_valid as f32 / weight_total as f32 * 100.0;
            if density < p.density_ratio as f32 {
                out[out_idx] = 0;
                continue;
            }

            let mode = histogram.mode();
            let high = (mode + range).min(full_span - 1);
            let low = (mode - range).max(0);

            let mut sum = 0i64;
            let mut weight_in = 0i32;
            for k in 0..sample_count {
                if disp_samples[k] >= low && disp_samples[k] <= high {
                    sum += i64::from(disp_samples[k]) * i64::from(weight_samples[k]);
                    weight_in += weight_samples[k];
                }
            }
            let mean = if weight_in != 0 {
                (sum / i64::from(weight_in)) as i32
            } else {
                0
            };

            // A centre outside the dominant range is only replaced when the
            // range carries enough total weight.
            let replace = weight_in as f32 / weight_total as f32 * 100.0;
            if (center_value < low || center_value > high)
                && replace < p.replacement_ratio as f32
            {
                out[out_idx] = 0;
                continue;
            }

            let ratio = weight_in as f32 / weight_valid as f32 * 100.0;
            out[out_idx] = if ratio >= p.valid_ratio as f32 { mean } else { 0 };
        }
    }
}
