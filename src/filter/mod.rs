//! Disparity filter stage.
//!
//! Post-processes the block disparity grid produced by the matcher (or the
//! frame decoder): optional straight-edge sharpening ([`edge`]), weighted
//! block averaging ([`average`]), four-direction hole completion
//! ([`complement`]), then expansion of the block grid to per-pixel output
//! with an optional disparity range clamp.
//!
//! Like the matcher, the stage owns its scratch and parameters; updates
//! arrive through a [`ParamCell`] and are observed between frames. A
//! diagnostic dump of the averaged block grid can be requested at any time
//! and is written as CSV after the next processed frame.

// Band workers write disjoint block-row slices of the shared grid; the raw
// pointer hand-off below is the only unsafe surface.
#![allow(unsafe_code)]

pub mod average;
pub mod complement;
pub mod edge;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;

pub use average::{AveragingParams, WeightParams};
pub use complement::ComplementParams;
pub use edge::{EdgeParams, HoughParams};

use crate::band::BandPool;
use crate::block::{BlockDisparity, SUBPIXEL_SCALE};
use crate::config::CameraModel;
use crate::error::{StereoError, StereoResult};
use crate::frame::ImagePlane;
use crate::params::{IniFile, ParamCell, ParameterSet, ParameterValue};

use complement::{Completer, LineBuffers};
use edge::EdgeScratch;

/// Display name recorded on result status entries.
pub const STAGE_NAME: &str = "Disparity Filter";

/// Moving-integral half-width used by the edge-segment mode filter.
const LINE_INTEG: i32 = SUBPIXEL_SCALE;

/// Disparity range clamp (ini section `[DISPARITY_LIMITATION]`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LimitParams {
    /// Apply the clamp.
    pub enabled: bool,
    /// Lower bound, pixels.
    pub lower: f64,
    /// Upper bound, pixels.
    pub upper: f64,
}

impl Default for LimitParams {
    fn default() -> Self {
        Self {
            enabled: false,
            lower: 0.0,
            upper: 255.0,
        }
    }
}

/// Everything the configuration collaborator can tune on this stage.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FilterTunables {
    /// Range clamp applied at pixel expansion.
    pub limit: LimitParams,
    /// Averaging parameters.
    pub averaging: AveragingParams,
    /// Averaging neighbour weights.
    pub weights: WeightParams,
    /// Completion parameters.
    pub complement: ComplementParams,
    /// Edge-sharpening parameters.
    pub edge: EdgeParams,
    /// Canny/Hough parameters.
    pub hough: HoughParams,
}

/// Raw grid pointer that may cross into band workers.
#[derive(Clone, Copy)]
struct SendPtr<T>(*mut T);

// SAFETY: each band writes a disjoint block-row range; see `run_averaging`.
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

/// The disparity filter stage.
pub struct DisparityFilter {
    tunables: FilterTunables,
    shared: Arc<ParamCell<FilterTunables>>,
    pool: BandPool,
    work: Vec<i32>,
    line_buffers: LineBuffers,
    edge_scratch: EdgeScratch,
    dump_request: Arc<AtomicBool>,
    dump_dir: PathBuf,
}

impl DisparityFilter {
    /// Create the stage with `bands` worker threads, scratch sized for
    /// `max_width x max_height`, and `dump_dir` as the destination for
    /// diagnostic dumps. Returns the parameter cell and the dump-request
    /// flag for the engine API side.
    pub fn new(
        bands: usize,
        tunables: FilterTunables,
        max_width: usize,
        max_height: usize,
        dump_dir: PathBuf,
    ) -> StereoResult<(Self, Arc<ParamCell<FilterTunables>>, Arc<AtomicBool>)> {
        let shared = Arc::new(ParamCell::new(tunables));
        let dump_request = Arc::new(AtomicBool::new(false));
        let filter = Self {
            tunables,
            shared: Arc::clone(&shared),
            pool: BandPool::new(bands)?,
            work: vec![0; max_width * max_height],
            line_buffers: LineBuffers::with_capacity(max_width.max(max_height)),
            edge_scratch: EdgeScratch::default(),
            dump_request: Arc::clone(&dump_request),
            dump_dir,
        };
        Ok((filter, shared, dump_request))
    }

    /// Current tunables.
    pub fn tunables(&self) -> &FilterTunables {
        &self.tunables
    }

    fn apply_pending(&mut self) {
        if let Some(update) = self.shared.take_if_dirty() {
            tracing::info!("filter parameters updated");
            self.tunables = update;
        }
    }

    /// Run the filter over the block grid in `bd`, then expand to per-pixel
    /// output. `img_ref` is the reference image used for edge detection.
    ///
    /// Returns `Ok(false)` when both the averaging and edge phases are
    /// disabled — the caller falls back to plain matcher expansion.
    pub fn average_disparity(
        &mut self,
        img_ref: &ImagePlane,
        bd: &mut BlockDisparity,
    ) -> StereoResult<bool> {
        self.apply_pending();
        let t = self.tunables;

        if !t.averaging.enabled && !t.edge.enabled {
            return Ok(false);
        }

        let g = bd.geom;
        if g.block_height == 0 || g.block_width == 0 || g.image_width == 0 {
            return Err(StereoError::Stage {
                stage: STAGE_NAME.to_string(),
                code: -1,
            });
        }

        if t.edge.enabled && img_ref.is_present() {
            let n = g.image_width * g.image_height;
            edge::sharpen_linear_edges(
                &img_ref.data[..n],
                &g,
                &t.edge,
                &t.hough,
                LINE_INTEG,
                &mut self.edge_scratch,
                &mut bd.block_value,
            );
        }

        if t.averaging.enabled {
            self.run_averaging(bd);

            if t.complement.enabled {
                let mut completer = Completer::new(
                    &g,
                    &t.complement,
                    t.averaging.block_height,
                    t.averaging.block_width,
                    &mut bd.block_value,
                    &bd.block_contrast,
                    &mut self.line_buffers,
                    false,
                );
                completer.run_complement();
            }

            if t.complement.hole_fill {
                let mut completer = Completer::new(
                    &g,
                    &t.complement,
                    t.averaging.block_height,
                    t.averaging.block_width,
                    &mut bd.block_value,
                    &bd.block_contrast,
                    &mut self.line_buffers,
                    true,
                );
                completer.run_hole_fill();
            }
        }

        disparity_image(bd, &t.limit);

        if self.dump_request.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.write_block_dump(bd) {
                tracing::warn!(error = %e, "block disparity dump failed");
            }
        }

        Ok(true)
    }

    /// Weighted-mode averaging, cut into bands of block rows.
    fn run_averaging(&mut self, bd: &mut BlockDisparity) {
        let g = bd.geom;
        let rows = g.rows();
        let cols = g.cols();

        self.work[..rows * cols].copy_from_slice(&bd.block_value[..rows * cols]);

        let inputs = average::AveragingInputs {
            rows,
            cols,
            disp_cols: (g.image_width - g.shade_width) / g.block_width,
            depth: g.depth,
            params: &self.tunables.averaging,
            weights: &self.tunables.weights,
            src: &self.work[..rows * cols],
        };

        let out_ptr = SendPtr(bd.block_value.as_mut_ptr());
        self.pool.run(rows, &|_, band| {
            let out_ptr = out_ptr;
            if band.is_empty() {
                return;
            }
            // SAFETY: bands partition the block rows, so these output
            // slices never overlap between workers.
            let out = unsafe {
                std::slice::from_raw_parts_mut(out_ptr.0.add(band.start * cols), band.len() * cols)
            };
            average::average_band(&inputs, band.start, band.end, out);
        });
    }

    /// Request a CSV dump of the block grid after the next frame.
    pub fn request_block_dump(&self) {
        self.dump_request.store(true, Ordering::Release);
    }

    /// Write the averaged block grid as CSV, horizontally mirrored for
    /// external 3-D graphing.
    fn write_block_dump(&self, bd: &BlockDisparity) -> anyhow::Result<()> {
        let name = format!(
            "block_disparity_{}.csv",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        let path = self.dump_dir.join(name);
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("creating {}", path.display()))?;

        let rows = bd.geom.rows();
        let cols = bd.geom.cols();

        let mut header = vec![String::new()];
        header.extend((0..cols).map(|i| i.to_string()));
        writer.write_record(&header)?;

        for jd in 0..rows {
            let mut record = vec![jd.to_string()];
            for id in 0..cols {
                let v = bd.block_value[cols * (jd + 1) - id - 1];
                record.push(format!("{}", v / SUBPIXEL_SCALE));
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        tracing::info!(path = %path.display(), "block disparity dump written");
        Ok(())
    }
}

/// Expand the block grid to per-pixel output: the float block plane, the
/// 8-bit display image (scaled by `255 / depth`, rounded), and the float
/// per-pixel disparity. The optional range clamp zeroes out-of-range blocks.
pub(crate) fn disparity_image(bd: &mut BlockDisparity, limit: &LimitParams) {
    let g = bd.geom;
    let n = g.image_width * g.image_height;
    bd.display[..n].fill(0);
    bd.pixel_disp[..n].fill(0.0);

    let cols = g.cols();
    let scale = 255.0 / g.depth as f32;
    let lower = (limit.lower * f64::from(SUBPIXEL_SCALE)) as i32;
    let upper = (limit.upper * f64::from(SUBPIXEL_SCALE)) as i32;

    for jblk in 0..g.disparity_rows() {
        for iblk in 0..g.disparity_cols() {
            let mut value = bd.block_value[jblk * cols + iblk];
            if limit.enabled && (value < lower || value > upper) {
                value = 0;
            }
            let disp = value as f32 / SUBPIXEL_SCALE as f32;
            bd.block_disp[jblk * cols + iblk] = disp;

            let display = (disp * scale).round().clamp(0.0, 255.0) as u8;
            let y0 = jblk * g.block_height + g.offset_y;
            let x0 = iblk * g.block_width + g.offset_x;
            for y in y0..y0 + g.block_height {
                let row = y * g.image_width;
                for x in x0..x0 + g.block_width {
                    bd.display[row + x] = display;
                    bd.pixel_disp[row + x] = disp;
                }
            }
        }
    }
}

// ============================================================================
// Parameter projection & files
// ============================================================================

impl FilterTunables {
    /// Parameter file name for a camera model.
    pub fn file_name(model: CameraModel) -> String {
        format!("DisparityFilterParameter_{}.ini", model.file_suffix())
    }

    /// Resolve the parameter file path under `dir`.
    pub fn file_path(dir: &Path, model: CameraModel) -> PathBuf {
        dir.join(Self::file_name(model))
    }

    /// Load from the per-model file under `dir`, creating it from defaults
    /// when missing.
    pub fn load_or_create(dir: &Path, model: CameraModel) -> StereoResult<Self> {
        let path = Self::file_path(dir, model);
        if !path.exists() {
            let defaults = Self::default();
            defaults
                .to_ini()
                .save(&path)
                .with_context(|| format!("creating {}", path.display()))
                .map_err(|e| StereoError::Configuration(e.to_string()))?;
            tracing::info!(path = %path.display(), "created filter parameter file from defaults");
            return Ok(defaults);
        }
        Self::load(&path)
    }

    /// Load from an explicit file path.
    pub fn load(path: &Path) -> StereoResult<Self> {
        let ini = IniFile::load(path).map_err(|e| StereoError::Configuration(e.to_string()))?;
        Ok(Self::from_ini(&ini))
    }

    /// Write to an explicit file path.
    pub fn save(&self, path: &Path) -> StereoResult<()> {
        self.to_ini()
            .save(path)
            .map_err(|e| StereoError::Configuration(e.to_string()))
    }

    fn from_ini(ini: &IniFile) -> Self {
        let d = Self::default();
        Self {
            limit: LimitParams {
                enabled: ini.get_i32("DISPARITY_LIMITATION", "limit", 0) != 0,
                lower: ini.get_f64("DISPARITY_LIMITATION", "lower", d.limit.lower),
                upper: ini.get_f64("DISPARITY_LIMITATION", "upper", d.limit.upper),
            },
            averaging: AveragingParams {
                enabled: ini.get_i32("AVERAGE", "enb", i32::from(d.averaging.enabled)) != 0,
                block_height: ini.get_i32("AVERAGE", "blkshgt", d.averaging.block_height as i32)
                    as usize,
                block_width: ini.get_i32("AVERAGE", "blkswdt", d.averaging.block_width as i32)
                    as usize,
                integration_range: ini.get_f64("AVERAGE", "intg", d.averaging.integration_range),
                limit_range: ini.get_f64("AVERAGE", "range", d.averaging.limit_range),
                density_ratio: ini.get_i32("AVERAGE", "dsprt", d.averaging.density_ratio),
                valid_ratio: ini.get_i32("AVERAGE", "vldrt", d.averaging.valid_ratio),
                replacement_ratio: ini.get_i32("AVERAGE", "reprt", d.averaging.replacement_ratio),
            },
            weights: WeightParams {
                center: ini.get_i32("AVERAGE_BLOCK_WEIGHT", "cntwgt", d.weights.center),
                near: ini.get_i32("AVERAGE_BLOCK_WEIGHT", "nrwgt", d.weights.near),
                round: ini.get_i32("AVERAGE_BLOCK_WEIGHT", "rndwgt", d.weights.round),
            },
            complement: ComplementParams {
                enabled: ini.get_i32("COMPLEMENT", "enb", i32::from(d.complement.enabled)) != 0,
                low_limit: ini.get_f64("COMPLEMENT", "lowlmt", d.complement.low_limit),
                slope_limit: ini.get_f64("COMPLEMENT", "slplmt", d.complement.slope_limit),
                ratio_inside: ini.get_f64("COMPLEMENT", "insrt", d.complement.ratio_inside),
                ratio_round: ini.get_f64("COMPLEMENT", "rndrt", d.complement.ratio_round),
                ratio_bottom: ini.get_f64("COMPLEMENT", "btmrt", d.complement.ratio_bottom),
                contrast_limit: ini.get_i32("COMPLEMENT", "crstlmt", d.complement.contrast_limit),
                hole_fill: ini.get_i32("COMPLEMENT", "hlfil", 0) != 0,
                hole_size: ini.get_f64("COMPLEMENT", "hlsz", d.complement.hole_size),
            },
            edge: EdgeParams {
                enabled: ini.get_i32("EDGE_COMPLEMENT", "edgcmp", i32::from(d.edge.enabled)) != 0,
                min_blocks: ini.get_i32("EDGE_COMPLEMENT", "minblks", d.edge.min_blocks as i32)
                    as usize,
                min_coef: ini.get_f64("EDGE_COMPLEMENT", "mincoef", d.edge.min_coef),
                comp_width: ini.get_i32("EDGE_COMPLEMENT", "cmpwdt", d.edge.comp_width as i32)
                    as usize,
            },
            hough: HoughParams {
                canny_threshold1: ini.get_i32(
                    "HOUGH_TRANSFORM",
                    "edgthr1",
                    d.hough.canny_threshold1,
                ),
                canny_threshold2: ini.get_i32(
                    "HOUGH_TRANSFORM",
                    "edgthr2",
                    d.hough.canny_threshold2,
                ),
                line_threshold: ini.get_i32("HOUGH_TRANSFORM", "linthr", d.hough.line_threshold),
                min_length: ini.get_i32("HOUGH_TRANSFORM", "minlen", d.hough.min_length),
                max_gap: ini.get_i32("HOUGH_TRANSFORM", "maxgap", d.hough.max_gap),
            },
        }
    }

    fn to_ini(&self) -> IniFile {
        let mut ini = IniFile::default();

        ini.set("DISPARITY_LIMITATION", "limit", i32::from(self.limit.enabled));
        ini.set("DISPARITY_LIMITATION", "lower", self.limit.lower);
        ini.set("DISPARITY_LIMITATION", "upper", self.limit.upper);

        let a = &self.averaging;
        ini.set("AVERAGE", "enb", i32::from(a.enabled));
        ini.set("AVERAGE", "blkshgt", a.block_height);
        ini.set("AVERAGE", "blkswdt", a.block_width);
        ini.set("AVERAGE", "intg", a.integration_range);
        ini.set("AVERAGE", "range", a.limit_range);
        ini.set("AVERAGE", "dsprt", a.density_ratio);
        ini.set("AVERAGE", "vldrt", a.valid_ratio);
        ini.set("AVERAGE", "reprt", a.replacement_ratio);

        ini.set("AVERAGE_BLOCK_WEIGHT", "cntwgt", self.weights.center);
        ini.set("AVERAGE_BLOCK_WEIGHT", "nrwgt", self.weights.near);
        ini.set("AVERAGE_BLOCK_WEIGHT", "rndwgt", self.weights.round);

        let c = &self.complement;
        ini.set("COMPLEMENT", "enb", i32::from(c.enabled));
        ini.set("COMPLEMENT", "lowlmt", c.low_limit);
        ini.set("COMPLEMENT", "slplmt", c.slope_limit);
        ini.set("COMPLEMENT", "insrt", c.ratio_inside);
        ini.set("COMPLEMENT", "rndrt", c.ratio_round);
        ini.set("COMPLEMENT", "btmrt", c.ratio_bottom);
        ini.set("COMPLEMENT", "crstlmt", c.contrast_limit);
        ini.set("COMPLEMENT", "hlfil", i32::from(c.hole_fill));
        ini.set("COMPLEMENT", "hlsz", c.hole_size);

        let e = &self.edge;
        ini.set("EDGE_COMPLEMENT", "edgcmp", i32::from(e.enabled));
        ini.set("EDGE_COMPLEMENT", "minblks", e.min_blocks);
        ini.set("EDGE_COMPLEMENT", "mincoef", e.min_coef);
        ini.set("EDGE_COMPLEMENT", "cmpwdt", e.comp_width);

        let h = &self.hough;
        ini.set("HOUGH_TRANSFORM", "edgthr1", h.canny_threshold1);
        ini.set("HOUGH_TRANSFORM", "edgthr2", h.canny_threshold2);
        ini.set("HOUGH_TRANSFORM", "linthr", h.line_threshold);
        ini.set("HOUGH_TRANSFORM", "minlen", h.min_length);
        ini.set("HOUGH_TRANSFORM", "maxgap", h.max_gap);

        ini
    }

    /// Project to the flat parameter view.
    pub fn parameter_set(&self) -> ParameterSet {
        let mut set = ParameterSet::default();

        set.push_int(
            i32::from(self.limit.enabled),
            "limit",
            "DisparityLimitation",
            "limit disparity range 0:off 1:on",
        );
        set.push_double(self.limit.lower, "lower", "DisparityLimitation", "lower bound in pixels");
        set.push_double(self.limit.upper, "upper", "DisparityLimitation", "upper bound in pixels");

        let a = &self.averaging;
        set.push_int(i32::from(a.enabled), "enb", "Averaging", "averaging 0:off 1:on");
        set.push_int(a.block_height as i32, "blkshgt", "Averaging", "neighbourhood half height");
        set.push_int(a.block_width as i32, "blkswdt", "Averaging", "neighbourhood half width");
        set.push_double(a.integration_range, "intg", "Averaging", "moving integral half width");
        set.push_double(a.limit_range, "range", "Averaging", "distribution half width");
        set.push_int(a.density_ratio, "dsprt", "Averaging", "density ratio in percent");
        set.push_int(a.valid_ratio, "vldrt", "Averaging", "valid ratio in percent");
        set.push_int(a.replacement_ratio, "reprt", "Averaging", "replacement ratio in percent");

        set.push_int(self.weights.center, "cntwgt", "AveragingBlockWeight", "centre weight");
        set.push_int(self.weights.near, "nrwgt", "AveragingBlockWeight", "near weight");
        set.push_int(self.weights.round, "rndwgt", "AveragingBlockWeight", "round weight");

        let c = &self.complement;
        set.push_int(i32::from(c.enabled), "enb", "Complement", "completion 0:off 1:on");
        set.push_double(c.low_limit, "lowlmt", "Complement", "minimum fill disparity");
        set.push_double(c.slope_limit, "slplmt", "Complement", "maximum disparity gradient");
        set.push_double(c.ratio_inside, "insrt", "Complement", "fill width ratio, interior");
        set.push_double(c.ratio_round, "rndrt", "Complement", "fill width ratio, edges");
        set.push_double(c.ratio_bottom, "btmrt", "Complement", "fill width ratio, bottom");
        set.push_int(c.contrast_limit, "crstlmt", "Complement", "contrast upper limit");
        set.push_int(i32::from(c.hole_fill), "hlfil", "Complement", "hole filling 0:off 1:on");
        set.push_double(c.hole_size, "hlsz", "Complement", "hole width in pixels");

        let e = &self.edge;
        set.push_int(i32::from(e.enabled), "edgcmp", "EdgeComplement", "edge completion 0:off 1:on");
        set.push_int(e.min_blocks as i32, "minblks", "EdgeComplement", "minimum blocks on segment");
        set.push_double(e.min_coef, "mincoef", "EdgeComplement", "minimum linearity 0-100");
        set.push_int(e.comp_width as i32, "cmpwdt", "EdgeComplement", "strip width in blocks");

        let h = &self.hough;
        set.push_int(h.canny_threshold1, "edgthr1", "HoughTransform", "canny threshold 1");
        set.push_int(h.canny_threshold2, "edgthr2", "HoughTransform", "canny threshold 2");
        set.push_int(h.line_threshold, "linthr", "HoughTransform", "vote threshold");
        set.push_int(h.min_length, "minlen", "HoughTransform", "minimum segment length");
        set.push_int(h.max_gap, "maxgap", "HoughTransform", "maximum segment gap");

        set
    }

    /// Apply a flat parameter view. Unknown entries are rejected.
    pub fn apply_parameter_set(&mut self, set: &ParameterSet) -> StereoResult<()> {
        for entry in &set.entries {
            let v: ParameterValue = entry.value;
            match (entry.category.as_str(), entry.name.as_str()) {
                ("DisparityLimitation", "limit") => self.limit.enabled = v.as_i32() != 0,
                ("DisparityLimitation", "lower") => self.limit.lower = v.as_f64(),
                ("DisparityLimitation", "upper") => self.limit.upper = v.as_f64(),
                ("Averaging", "enb") => self.averaging.enabled = v.as_i32() != 0,
                ("Averaging", "blkshgt") => {
                    self.averaging.block_height = v.as_i32().max(0) as usize;
                }
                ("Averaging", "blkswdt") => {
                    self.averaging.block_width = v.as_i32().max(0) as usize;
                }
                ("Averaging", "intg") => self.averaging.integration_range = v.as_f64(),
                ("Averaging", "range") => self.averaging.limit_range = v.as_f64(),
                ("Averaging", "dsprt") => self.averaging.density_ratio = v.as_i32(),
                ("Averaging", "vldrt") => self.averaging.valid_ratio = v.as_i32(),
                ("Averaging", "reprt") => self.averaging.replacement_ratio = v.as_i32(),
                ("AveragingBlockWeight", "cntwgt") => self.weights.center = v.as_i32(),
                ("AveragingBlockWeight", "nrwgt") => self.weights.near = v.as_i32(),
                ("AveragingBlockWeight", "rndwgt") => self.weights.round = v.as_i32(),
                ("Complement", "enb") => self.complement.enabled = v.as_i32() != 0,
                ("Complement", "lowlmt") => self.complement.low_limit = v.as_f64(),
                ("Complement", "slplmt") => self.complement.slope_limit = v.as_f64(),
                ("Complement", "insrt") => self.complement.ratio_inside = v.as_f64(),
                ("Complement", "rndrt") => self.complement.ratio_round = v.as_f64(),
                ("Complement", "btmrt") => self.complement.ratio_bottom = v.as_f64(),
                ("Complement", "crstlmt") => self.complement.contrast_limit = v.as_i32(),
                ("Complement", "hlfil") => self.complement.hole_fill = v.as_i32() != 0,
                ("Complement", "hlsz") => self.complement.hole_size = v.as_f64(),
                ("EdgeComplement", "edgcmp") => self.edge.enabled = v.as_i32() != 0,
                ("EdgeComplement", "minblks") => {
                    self.edge.min_blocks = v.as_i32().max(0) as usize;
                }
                ("EdgeComplement", "mincoef") => self.edge.min_coef = v.as_f64(),
                ("EdgeComplement", "cmpwdt") => self.edge.comp_width = v.as_i32().max(0) as usize,
                ("HoughTransform", "edgthr1") => self.hough.canny_threshold1 = v.as_i32(),
                ("HoughTransform", "edgthr2") => self.hough.canny_threshold2 = v.as_i32(),
                ("HoughTransform", "linthr") => self.hough.line_threshold = v.as_i32(),
                ("HoughTransform", "minlen") => self.hough.min_length = v.as_i32(),
                ("HoughTransform", "maxgap") => self.hough.max_gap = v.as_i32(),
                _ => {
                    return Err(StereoError::UnknownParameter(format!(
                        "{}/{}",
                        entry.category, entry.name
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockGeometry;

    fn synthetic_bd(cols: usize, rows: usize, depth: usize) -> BlockDisparity {
        let mut bd = BlockDisparity::with_max_size(cols * 4, rows * 4);
        bd.geom = BlockGeometry {
            image_width: cols * 4,
            image_height: rows * 4,
            block_height: 4,
            block_width: 4,
            match_height: 4,
            match_width: 4,
            offset_x: 0,
            offset_y: 0,
            depth,
            shade_width: 0,
        };
        bd
    }

    fn filter_with(tunables: FilterTunables) -> DisparityFilter {
        let dir = std::env::temp_dir();
        let (filter, _cell, _dump) = DisparityFilter::new(2, tunables, 256, 256, dir).unwrap();
        filter
    }

    fn no_edge_tunables() -> FilterTunables {
        FilterTunables {
            edge: EdgeParams {
                enabled: false,
                ..EdgeParams::default()
            },
            ..FilterTunables::default()
        }
    }

    #[test]
    fn test_disabled_filter_reports_skip() {
        let mut t = no_edge_tunables();
        t.averaging.enabled = false;
        let mut filter = filter_with(t);

        let mut bd = synthetic_bd(16, 16, 64);
        let img = ImagePlane::default();
        assert!(!filter.average_disparity(&img, &mut bd).unwrap());
    }

    #[test]
    fn test_zero_window_identity_on_interior() {
        // blkshgt = blkswdt = 0 with zero ratios: averaging must not alter
        // any interior block.
        let mut t = no_edge_tunables();
        t.averaging.block_height = 0;
        t.averaging.block_width = 0;
        t.averaging.density_ratio = 0;
        t.averaging.valid_ratio = 0;
        t.complement.enabled = false;
        let mut filter = filter_with(t);

        let mut bd = synthetic_bd(20, 12, 64);
        let cols = bd.geom.cols();
        for j in 0..bd.geom.rows() {
            for i in 0..cols {
                bd.block_value[j * cols + i] = 5_000 + ((j * 31 + i * 17) % 32) as i32 * 700;
            }
        }
        let before = bd.block_value.clone();

        let img = ImagePlane::default();
        assert!(filter.average_disparity(&img, &mut bd).unwrap());

        assert_eq!(bd.block_value, before);
    }

    #[test]
    fn test_pixel_expansion_purity() {
        let mut bd = synthetic_bd(12, 8, 64);
        let cols = bd.geom.cols();
        for j in 0..bd.geom.rows() {
            for i in 0..cols {
                bd.block_value[j * cols + i] = ((j * cols + i) % 60) as i32 * 1000;
            }
        }

        disparity_image(&mut bd, &LimitParams::default());

        let g = bd.geom;
        for jblk in 0..g.disparity_rows() {
            for iblk in 0..g.disparity_cols() {
                let d = bd.block_value[jblk * cols + iblk] as f32 / 1000.0;
                let expect = (d * 255.0 / 64.0).round().clamp(0.0, 255.0) as u8;
                for y in jblk * 4..jblk * 4 + 4 {
                    for x in iblk * 4..iblk * 4 + 4 {
                        assert_eq!(bd.display[y * g.image_width + x], expect);
                        assert_eq!(bd.pixel_disp[y * g.image_width + x], d);
                    }
                }
            }
        }
    }

    #[test]
    fn test_range_clamp_zeroes_outliers() {
        let mut bd = synthetic_bd(8, 8, 64);
        let cols = bd.geom.cols();
        bd.block_value[2 * cols + 2] = 3_000; // below lower
        bd.block_value[2 * cols + 3] = 20_000; // inside
        bd.block_value[2 * cols + 4] = 60_000; // above upper

        let limit = LimitParams {
            enabled: true,
            lower: 5.0,
            upper: 50.0,
        };
        disparity_image(&mut bd, &limit);

        assert_eq!(bd.block_disp[2 * cols + 2], 0.0);
        assert_eq!(bd.block_disp[2 * cols + 3], 20.0);
        assert_eq!(bd.block_disp[2 * cols + 4], 0.0);
    }

    #[test]
    fn test_full_pipeline_fills_holes_in_uniform_field() {
        let mut t = no_edge_tunables();
        t.complement.slope_limit = 1.0;
        let mut filter = filter_with(t);

        let mut bd = synthetic_bd(24, 16, 64);
        let cols = bd.geom.cols();
        for j in 0..bd.geom.rows() {
            for i in 0..cols {
                // Uniform 20 px field with a hole block.
                bd.block_value[j * cols + i] = 20_000;
            }
        }
        bd.block_value[8 * cols + 12] = 0;

        let img = ImagePlane::default();
        assert!(filter.average_disparity(&img, &mut bd).unwrap());

        let filled = bd.block_value[8 * cols + 12];
        assert!(
            (filled - 20_000).abs() < 1_000,
            "hole should be averaged or completed to ~20 px, got {filled}"
        );
    }

    #[test]
    fn test_parameter_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let created = FilterTunables::load_or_create(dir.path(), CameraModel::Vm).unwrap();
        assert_eq!(created, FilterTunables::default());
        assert!(dir.path().join("DisparityFilterParameter_VM.ini").exists());

        let mut changed = created;
        changed.averaging.density_ratio = 35;
        changed.hough.min_length = 120;
        changed.limit.enabled = true;
        changed
            .save(&FilterTunables::file_path(dir.path(), CameraModel::Vm))
            .unwrap();

        let reread = FilterTunables::load_or_create(dir.path(), CameraModel::Vm).unwrap();
        assert_eq!(reread.averaging.density_ratio, 35);
        assert_eq!(reread.hough.min_length, 120);
        assert!(reread.limit.enabled);
    }

    #[test]
    fn test_parameter_set_projection_round_trip() {
        let tun = FilterTunables::default();
        let mut set = tun.parameter_set();
        assert!(set.set("Averaging", "dsprt", ParameterValue::Int(42)));
        assert!(set.set("Complement", "slplmt", ParameterValue::Double(0.25)));

        let mut applied = FilterTunables::default();
        applied.apply_parameter_set(&set).unwrap();
        assert_eq!(applied.averaging.density_ratio, 42);
        assert!((applied.complement.slope_limit - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_block_dump_written_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let (mut filter, _cell, _dump) = DisparityFilter::new(
            1,
            no_edge_tunables(),
            128,
            128,
            dir.path().to_path_buf(),
        )
        .unwrap();

        let mut bd = synthetic_bd(16, 16, 64);
        let cols = bd.geom.cols();
        for v in bd.block_value.iter_mut().take(cols * 16) {
            *v = 12_000;
        }

        filter.request_block_dump();
        let img = ImagePlane::default();
        filter.average_disparity(&img, &mut bd).unwrap();

        let dumps: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("block_disparity_")
            })
            .collect();
        assert_eq!(dumps.len(), 1);
    }
}
