//! Block-based stereo matching stage.
//!
//! The matcher tiles the reference (right) image into disparity blocks and,
//! for each block, searches the compared (left) image for the shift that
//! minimises the SSD cost (kernels in [`ssd`]). Sub-pixel refinement is
//! parabolic; optional back-matching re-runs the search with the images
//! swapped and blends the two grids to reject occlusions and out-of-view
//! matches. Execution is band-parallel: the image is cut into horizontal
//! bands dispatched to the long-lived [`BandPool`] workers.
//!
//! The stage owns no global state; all tunables live in
//! [`MatcherTunables`], updated between frames through a [`ParamCell`].

// Band workers write disjoint block-row slices of the shared output grids;
// the raw-pointer hand-off below is the only unsafe surface.
#![allow(unsafe_code)]

mod ssd;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::band::BandPool;
use crate::block::{BlockDisparity, BlockGeometry, SUBPIXEL_SCALE};
use crate::config::{CameraModel, MAX_MATCHING_DEPTH};
use crate::error::{StereoError, StereoResult};
use crate::frame::ImagePlane;
use crate::params::{IniFile, ParamCell, ParameterSet, ParameterValue};

use ssd::KernelInputs;

/// Display name recorded on result status entries.
pub const STAGE_NAME: &str = "Stereo Matching";

/// Contrast offset for the 752-wide sensor (scaled by 1000).
const CONTRAST_OFFSET_VM: f64 = 1.8 * 1000.0;

/// Contrast offset for the 1280-wide sensor (scaled by 1000).
const CONTRAST_OFFSET_XC: f64 = 1.2 * 1000.0;

/// Offset multiplier under gradation correction (untested sensor path; kept
/// until a reference image exists).
const CONTRAST_GRADATION_FACTOR: f64 = 2.0;

/// Core matching parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchingParams {
    /// Search depth: maximum disparity in pixels.
    pub depth: usize,
    /// Disparity block height.
    pub block_height: usize,
    /// Disparity block width.
    pub block_width: usize,
    /// Matching window height.
    pub match_height: usize,
    /// Matching window width.
    pub match_width: usize,
    /// X offset of the first block.
    pub offset_x: usize,
    /// Y offset of the first block.
    pub offset_y: usize,
    /// Minimum contrast for a block to be matched.
    pub contrast_threshold: i32,
    /// Gradation-corrected sensor mode.
    pub gradation_correction: bool,
}

impl Default for MatchingParams {
    fn default() -> Self {
        Self {
            depth: 256,
            block_height: 4,
            block_width: 4,
            match_height: 4,
            match_width: 4,
            offset_x: 0,
            offset_y: 0,
            contrast_threshold: 40,
            gradation_correction: false,
        }
    }
}

/// Back-matching parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackMatchingParams {
    /// Enable the bidirectional search.
    pub enabled: bool,
    /// Evaluation neighbourhood half-width, in blocks.
    pub eval_width: usize,
    /// Maximum |back − forward| disparity, in pixels, to count as agreeing.
    pub eval_range: i32,
    /// Minimum agreeing fraction of the neighbourhood, in percent.
    pub valid_ratio: i32,
    /// Zero-disparity fraction that invalidates the block, in percent.
    pub zero_ratio: i32,
}

impl Default for BackMatchingParams {
    fn default() -> Self {
        Self {
            enabled: false,
            eval_width: 1,
            eval_range: 3,
            valid_ratio: 30,
            zero_ratio: 60,
        }
    }
}

/// Everything the configuration collaborator can tune on this stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MatcherTunables {
    /// Core matching parameters.
    pub matching: MatchingParams,
    /// Back-matching parameters.
    pub back_matching: BackMatchingParams,
}

/// Sensor-dependent contrast offset, selected by image width.
fn contrast_offset(image_width: usize, gradation_correction: bool) -> i32 {
    match image_width {
        752 => CONTRAST_OFFSET_VM as i32,
        1280 => {
            if gradation_correction {
                (CONTRAST_OFFSET_XC * CONTRAST_GRADATION_FACTOR) as i32
            } else {
                CONTRAST_OFFSET_XC as i32
            }
        }
        _ => 0,
    }
}

/// Raw grid pointer that may cross into band workers.
#[derive(Clone, Copy)]
struct SendPtr<T>(*mut T);

// SAFETY: each band writes a disjoint block-row range; see `run_bands`.
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

/// The stereo matching stage.
pub struct StereoMatcher {
    tunables: MatcherTunables,
    shared: Arc<ParamCell<MatcherTunables>>,
    pool: BandPool,
}

impl StereoMatcher {
    /// Create the stage with `bands` worker threads and the given initial
    /// tunables. The returned [`ParamCell`] is the update channel for the
    /// engine API side.
    pub fn new(
        bands: usize,
        tunables: MatcherTunables,
    ) -> StereoResult<(Self, Arc<ParamCell<MatcherTunables>>)> {
        let shared = Arc::new(ParamCell::new(tunables));
        let matcher = Self {
            tunables,
            shared: Arc::clone(&shared),
            pool: BandPool::new(bands)?,
        };
        Ok((matcher, shared))
    }

    /// Current tunables.
    pub fn tunables(&self) -> &MatcherTunables {
        &self.tunables
    }

    /// Observe and clear a pending parameter update. Called at the top of
    /// every stage invocation.
    fn apply_pending(&mut self) {
        if let Some(update) = self.shared.take_if_dirty() {
            tracing::info!(?update, "matcher parameters updated");
            self.tunables = update;
        }
    }

    fn validate_geometry(&self, width: usize, height: usize) -> StereoResult<()> {
        let m = &self.tunables.matching;
        let ok = m.depth >= 3
            && m.depth <= MAX_MATCHING_DEPTH
            && m.block_height > 0
            && m.block_width > 0
            && m.match_height >= m.block_height
            && m.match_width >= m.block_width
            && width > m.depth + m.match_width + m.offset_x
            && height > m.match_height + m.offset_y;
        if ok {
            Ok(())
        } else {
            Err(StereoError::Stage {
                stage: STAGE_NAME.to_string(),
                code: -2,
            })
        }
    }

    /// Run the matcher over one stereo pair, filling `out` with the block
    /// disparity grids, contrast, and geometry.
    pub fn matching(
        &mut self,
        img_ref: &ImagePlane,
        img_cmp: &ImagePlane,
        out: &mut BlockDisparity,
    ) -> StereoResult<()> {
        self.apply_pending();

        if !img_ref.is_present()
            || img_ref.width != img_cmp.width
            || img_ref.height != img_cmp.height
            || img_ref.channels != 1
        {
            return Err(StereoError::Stage {
                stage: STAGE_NAME.to_string(),
                code: -1,
            });
        }
        self.validate_geometry(img_ref.width, img_ref.height)?;

        let m = &self.tunables.matching;
        let back = &self.tunables.back_matching;

        out.clear();
        out.geom = BlockGeometry {
            image_width: img_ref.width,
            image_height: img_ref.height,
            block_height: m.block_height,
            block_width: m.block_width,
            match_height: m.match_height,
            match_width: m.match_width,
            offset_x: m.offset_x,
            offset_y: m.offset_y,
            depth: m.depth,
            // Back-matching recovers the right-edge strip.
            shade_width: if back.enabled { 0 } else { m.depth },
        };

        self.run_bands(img_ref, img_cmp, out);

        if back.enabled {
            blend_back_matching(
                &out.geom,
                back,
                &mut out.block_disp,
                &out.back_disp,
            );
        }

        out.quantize_block_values();
        Ok(())
    }

    /// Dispatch the SSD kernels across the band pool.
    fn run_bands(&self, img_ref: &ImagePlane, img_cmp: &ImagePlane, out: &mut BlockDisparity) {
        let geom = out.geom;
        let m = &self.tunables.matching;
        let back_enabled = self.tunables.back_matching.enabled;

        let cols = geom.cols();
        let crstofs = contrast_offset(geom.image_width, m.gradation_correction);

        let disp_ptr = SendPtr(out.block_disp.as_mut_ptr());
        let back_ptr = SendPtr(out.back_disp.as_mut_ptr());
        let crst_ptr = SendPtr(out.block_contrast.as_mut_ptr());

        let ref_data = &img_ref.data[..geom.image_width * geom.image_height];
        let cmp_data = &img_cmp.data[..geom.image_width * geom.image_height];

        let bh = geom.block_height;
        let threshold = m.contrast_threshold;
        let gradation = m.gradation_correction;

        self.pool.run(geom.image_height, &|_, rows| {
            let disp_ptr = disp_ptr;
            let back_ptr = back_ptr;
            let crst_ptr = crst_ptr;
            // Align the band to whole disparity blocks inside the matchable
            // region.
            let mut jpx = rows.start.div_ceil(bh) * bh;
            let last_jpx = (geom.image_height - geom.match_height).min(rows.end.saturating_sub(1));
            if jpx > last_jpx {
                return;
            }
            let row0 = jpx / bh;
            let row1 = last_jpx / bh;
            let band_rows = row1 - row0 + 1;

            // SAFETY: bands partition the pixel rows, so block rows
            // [row0, row1] are disjoint between workers and these slices
            // never overlap.
            let disp = unsafe {
                std::slice::from_raw_parts_mut(disp_ptr.0.add(row0 * cols), band_rows * cols)
            };
            let bk = unsafe {
                std::slice::from_raw_parts_mut(back_ptr.0.add(row0 * cols), band_rows * cols)
            };
            let crst = unsafe {
                std::slice::from_raw_parts_mut(crst_ptr.0.add(row0 * cols), band_rows * cols)
            };

            let inputs = KernelInputs {
                geom,
                contrast_threshold: threshold,
                contrast_offset: crstofs,
                gradation_correction: gradation,
                grid_row_origin: row0,
                img_ref: ref_data,
                img_cmp: cmp_data,
            };

            while jpx <= last_jpx {
                if back_enabled {
                    let limit = geom.image_width - geom.match_width;
                    let mut ipx = 0;
                    while ipx <= limit {
                        ssd::both_disparity_by_ssd(&inputs, ipx, jpx, disp, bk, crst);
                        ipx += geom.block_width;
                    }
                } else {
                    let limit = geom.image_width - geom.depth - geom.match_width;
                    let mut ipx = 0;
                    while ipx <= limit {
                        ssd::disparity_by_ssd(&inputs, ipx, jpx, disp, crst);
                        ipx += geom.block_width;
                    }
                }
                jpx += bh;
            }
        });
    }

    /// Expand the float block disparities to per-pixel output: an 8-bit
    /// display image scaled by `255 / depth` and a float disparity plane.
    /// Used when the matcher runs without the disparity filter.
    pub fn spread_disparity(&self, out: &mut BlockDisparity) {
        let g = out.geom;
        let n = g.image_width * g.image_height;
        out.display[..n].fill(0);
        out.pixel_disp[..n].fill(0.0);

        let cols = g.cols();
        let scale = 255.0 / g.depth as f32;

        for jblk in 0..g.disparity_rows() {
            for iblk in 0..g.disparity_cols() {
                let disp = out.block_disp[jblk * cols + iblk];
                let display = (disp * scale).round().clamp(0.0, 255.0) as u8;

                let y0 = jblk * g.block_height + g.offset_y;
                let x0 = iblk * g.block_width + g.offset_x;
                for y in y0..y0 + g.block_height {
                    let row = y * g.image_width;
                    for x in x0..x0 + g.block_width {
                        out.display[row + x] = display;
                        out.pixel_disp[row + x] = disp;
                    }
                }
            }
        }
    }
}

/// Blend the forward and backward grids: a block keeps its forward disparity
/// only when enough back-matches in the neighbourhood agree and not too many
/// are zero. Border blocks within the evaluation width are zeroed.
fn blend_back_matching(
    geom: &BlockGeometry,
    params: &BackMatchingParams,
    disp: &mut [f32],
    back: &[f32],
) {
    let rows = geom.rows();
    let cols = geom.cols();
    let w = params.eval_width;

    let eval_blocks = (2 * w + 1) * (2 * w + 1);
    let valid_needed = (eval_blocks as i32 * params.valid_ratio) / 100;
    let zero_needed = (eval_blocks as i32 * params.zero_ratio) / 100;

    for jd in 0..rows {
        for id in 0..cols {
            if jd < w || jd >= rows - w || id < w || id >= cols - w {
                disp[jd * cols + id] = 0.0;
                continue;
            }

            let d = disp[jd * cols + id];
            if d == 0.0 {
                continue;
            }

            let mut zero_count = 0i32;
            let mut agree_count = 0i32;
            for j in jd - w..=jd + w {
                for i in id - w..=id + w {
                    let bk = back[j * cols + i];
                    if bk == 0.0 {
                        zero_count += 1;
                    }
                    if (bk - d).abs() <= params.eval_range as f32 {
                        agree_count += 1;
                    }
                }
            }

            if zero_count >= zero_needed || agree_count < valid_needed {
                disp[jd * cols + id] = 0.0;
            }
        }
    }
}

// ============================================================================
// Parameter projection & files
// ============================================================================

impl MatcherTunables {
    /// Parameter file name for a camera model.
    pub fn file_name(model: CameraModel) -> String {
        format!("StereoMatchingParameter_{}.ini", model.file_suffix())
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
            tracing::info!(path = %path.display(), "created matcher parameter file from defaults");
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
            matching: MatchingParams {
                depth: ini.get_i32("MATCHING", "depth", d.matching.depth as i32) as usize,
                block_height: ini.get_i32("MATCHING", "blkhgt", d.matching.block_height as i32)
                    as usize,
                block_width: ini.get_i32("MATCHING", "blkwdt", d.matching.block_width as i32)
                    as usize,
                match_height: ini.get_i32("MATCHING", "mtchgt", d.matching.match_height as i32)
                    as usize,
                match_width: ini.get_i32("MATCHING", "mtcwdt", d.matching.match_width as i32)
                    as usize,
                offset_x: ini.get_i32("MATCHING", "blkofsx", d.matching.offset_x as i32) as usize,
                offset_y: ini.get_i32("MATCHING", "blkofsy", d.matching.offset_y as i32) as usize,
                contrast_threshold: ini.get_i32(
                    "MATCHING",
                    "crstthr",
                    d.matching.contrast_threshold,
                ),
                gradation_correction: ini.get_i32("MATCHING", "grdcrct", 0) != 0,
            },
            back_matching: BackMatchingParams {
                enabled: ini.get_i32("BACKMATCHING", "enb", 0) != 0,
                eval_width: ini.get_i32(
                    "BACKMATCHING",
                    "bkevlwdt",
                    d.back_matching.eval_width as i32,
                ) as usize,
                eval_range: ini.get_i32("BACKMATCHING", "bkevlrng", d.back_matching.eval_range),
                valid_ratio: ini.get_i32("BACKMATCHING", "bkvldrt", d.back_matching.valid_ratio),
                zero_ratio: ini.get_i32("BACKMATCHING", "bkzrrt", d.back_matching.zero_ratio),
            },
        }
    }

    fn to_ini(&self) -> IniFile {
        let mut ini = IniFile::default();
        let m = &self.matching;
        ini.set("MATCHING", "depth", m.depth);
        ini.set("MATCHING", "blkhgt", m.block_height);
        ini.set("MATCHING", "blkwdt", m.block_width);
        ini.set("MATCHING", "mtchgt", m.match_height);
        ini.set("MATCHING", "mtcwdt", m.match_width);
        ini.set("MATCHING", "blkofsx", m.offset_x);
        ini.set("MATCHING", "blkofsy", m.offset_y);
        ini.set("MATCHING", "crstthr", m.contrast_threshold);
        ini.set("MATCHING", "grdcrct", i32::from(m.gradation_correction));

        let b = &self.back_matching;
        ini.set("BACKMATCHING", "enb", i32::from(b.enabled));
        ini.set("BACKMATCHING", "bkevlwdt", b.eval_width);
        ini.set("BACKMATCHING", "bkevlrng", b.eval_range);
        ini.set("BACKMATCHING", "bkvldrt", b.valid_ratio);
        ini.set("BACKMATCHING", "bkzrrt", b.zero_ratio);
        ini
    }

    /// Project to the flat parameter view.
    pub fn parameter_set(&self) -> ParameterSet {
        let mut set = ParameterSet::default();
        let m = &self.matching;
        set.push_int(m.depth as i32, "depth", "Matching", "search depth in pixels");
        set.push_int(m.block_height as i32, "blkhgt", "Matching", "disparity block height");
        set.push_int(m.block_width as i32, "blkwdt", "Matching", "disparity block width");
        set.push_int(m.match_height as i32, "mtchgt", "Matching", "matching window height");
        set.push_int(m.match_width as i32, "mtcwdt", "Matching", "matching window width");
        set.push_int(m.offset_x as i32, "blkofsx", "Matching", "block grid x offset");
        set.push_int(m.offset_y as i32, "blkofsy", "Matching", "block grid y offset");
        set.push_int(m.contrast_threshold, "crstthr", "Matching", "contrast threshold");
        set.push_int(
            i32::from(m.gradation_correction),
            "grdcrct",
            "Matching",
            "gradation corrected mode 0:off 1:on",
        );

        let b = &self.back_matching;
        set.push_int(i32::from(b.enabled), "enb", "BackMatching", "back matching 0:off 1:on");
        set.push_int(
            b.eval_width as i32,
            "bkevlwdt",
            "BackMatching",
            "evaluation area half width in blocks",
        );
        set.push_int(
            b.eval_range,
            "bkevlrng",
            "BackMatching",
            "evaluation disparity range in pixels",
        );
        set.push_int(b.valid_ratio, "bkvldrt", "BackMatching", "valid ratio in percent");
        set.push_int(b.zero_ratio, "bkzrrt", "BackMatching", "zero ratio in percent");
        set
    }

    /// Apply a flat parameter view. Unknown entries are rejected.
    pub fn apply_parameter_set(&mut self, set: &ParameterSet) -> StereoResult<()> {
        for entry in &set.entries {
            let v: ParameterValue = entry.value;
            match (entry.category.as_str(), entry.name.as_str()) {
                ("Matching", "depth") => self.matching.depth = v.as_i32().max(0) as usize,
                ("Matching", "blkhgt") => self.matching.block_height = v.as_i32().max(0) as usize,
                ("Matching", "blkwdt") => self.matching.block_width = v.as_i32().max(0) as usize,
                ("Matching", "mtchgt") => self.matching.match_height = v.as_i32().max(0) as usize,
                ("Matching", "mtcwdt") => self.matching.match_width = v.as_i32().max(0) as usize,
                ("Matching", "blkofsx") => self.matching.offset_x = v.as_i32().max(0) as usize,
                ("Matching", "blkofsy") => self.matching.offset_y = v.as_i32().max(0) as usize,
                ("Matching", "crstthr") => self.matching.contrast_threshold = v.as_i32(),
                ("Matching", "grdcrct") => self.matching.gradation_correction = v.as_i32() != 0,
                ("BackMatching", "enb") => self.back_matching.enabled = v.as_i32() != 0,
                ("BackMatching", "bkevlwdt") => {
                    self.back_matching.eval_width = v.as_i32().max(0) as usize;
                }
                ("BackMatching", "bkevlrng") => self.back_matching.eval_range = v.as_i32(),
                ("BackMatching", "bkvldrt") => self.back_matching.valid_ratio = v.as_i32(),
                ("BackMatching", "bkzrrt") => self.back_matching.zero_ratio = v.as_i32(),
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
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn plane(width: usize, height: usize, data: Vec<u8>) -> ImagePlane {
        let mut p = ImagePlane::default();
        p.data = data;
        p.width = width;
        p.height = height;
        p.channels = 1;
        p
    }

    fn noise_image(width: usize, height: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..width * height).map(|_| rng.gen_range(20..235)).collect()
    }

    fn shift_right(img: &[u8], width: usize, height: usize, shift: usize) -> Vec<u8> {
        let mut out = vec![0u8; width * height];
        for y in 0..height {
            for x in shift..width {
                out[y * width + x] = img[y * width + x - shift];
            }
        }
        out
    }

    fn small_tunables(depth: usize) -> MatcherTunables {
        MatcherTunables {
            matching: MatchingParams {
                depth,
                contrast_threshold: 10,
                ..MatchingParams::default()
            },
            back_matching: BackMatchingParams::default(),
        }
    }

    #[test]
    fn test_identical_images_give_zero_disparity() {
        let (w, h) = (160, 32);
        let img = noise_image(w, h, 1);
        let img_ref = plane(w, h, img.clone());
        let img_cmp = plane(w, h, img);

        let (mut matcher, _cell) = StereoMatcher::new(1, small_tunables(32)).unwrap();
        let mut out = BlockDisparity::with_max_size(w, h);
        matcher.matching(&img_ref, &img_cmp, &mut out).unwrap();

        let cols = out.geom.cols();
        let mut contrast_seen = false;
        for j in 0..out.geom.disparity_rows() {
            for i in 0..out.geom.disparity_cols() {
                assert_eq!(out.block_value[j * cols + i], 0);
                contrast_seen |= out.block_contrast[j * cols + i] > 0;
            }
        }
        assert!(contrast_seen, "noise must register contrast");
    }

    #[test]
    fn test_uniform_shift_recovered_everywhere() {
        let (w, h) = (200, 24);
        let shift = 7;
        let base = noise_image(w, h, 2);
        let img_ref = plane(w, h, base.clone());
        let img_cmp = plane(w, h, shift_right(&base, w, h, shift));

        let (mut matcher, _cell) = StereoMatcher::new(2, small_tunables(16)).unwrap();
        let mut out = BlockDisparity::with_max_size(w, h);
        matcher.matching(&img_ref, &img_cmp, &mut out).unwrap();

        let cols = out.geom.cols();
        for j in 0..out.geom.disparity_rows() {
            // Skip the leading columns where the shifted image has no data.
            for i in (shift / 4 + 1)..out.geom.disparity_cols() {
                let v = out.block_value[j * cols + i];
                if out.block_contrast[j * cols + i] == 0 {
                    continue;
                }
                let d = v as f64 / f64::from(SUBPIXEL_SCALE);
                assert!(
                    (d - shift as f64).abs() < 0.05,
                    "block ({j},{i}) disparity {d}"
                );
            }
        }
    }

    #[test]
    fn test_band_split_matches_single_band() {
        let (w, h) = (160, 48);
        let base = noise_image(w, h, 3);
        let img_ref = plane(w, h, base.clone());
        let img_cmp = plane(w, h, shift_right(&base, w, h, 5));

        let (mut single, _c1) = StereoMatcher::new(1, small_tunables(16)).unwrap();
        let (mut banded, _c2) = StereoMatcher::new(4, small_tunables(16)).unwrap();

        let mut out_single = BlockDisparity::with_max_size(w, h);
        let mut out_banded = BlockDisparity::with_max_size(w, h);
        single.matching(&img_ref, &img_cmp, &mut out_single).unwrap();
        banded.matching(&img_ref, &img_cmp, &mut out_banded).unwrap();

        assert_eq!(out_single.block_value, out_banded.block_value);
        assert_eq!(out_single.block_contrast, out_banded.block_contrast);
    }

    #[test]
    fn test_back_matching_zeroes_occluded_blocks() {
        let (w, h) = (200, 40);
        let base = noise_image(w, h, 4);
        let fg = noise_image(w, h, 40);

        // Background at disparity 5 with a foreground square at disparity 40.
        // In the compared image the foreground lands over the area where the
        // background right of the square would have appeared, occluding it.
        let mut img_ref = base.clone();
        let mut img_cmp = shift_right(&base, w, h, 5);
        for y in 8..32 {
            for x in 80..120 {
                img_ref[y * w + x] = fg[y * w + x];
                if x + 40 < w {
                    img_cmp[y * w + x + 40] = fg[y * w + x];
                }
            }
        }

        let mut tun = small_tunables(64);
        tun.back_matching.enabled = true;
        let (mut matcher, _cell) = StereoMatcher::new(2, tun).unwrap();

        let mut out = BlockDisparity::with_max_size(w, h);
        matcher
            .matching(&plane(w, h, img_ref), &plane(w, h, img_cmp), &mut out)
            .unwrap();

        // Shade width collapses to zero when back-matching runs.
        assert_eq!(out.geom.shade_width, 0);

        // Background blocks right of the foreground square are hidden in the
        // compared image: they must come out zeroed, never matched to the
        // visible background at 5.
        let cols = out.geom.cols();
        let mut zeroed = 0;
        let mut total = 0;
        for j in 3..7 {
            for i in 31..37 {
                let d = out.block_value[j * cols + i] as f64 / 1000.0;
                assert!(
                    (d - 5.0).abs() > 1.0,
                    "occluded block ({j},{i}) false-matched background: {d}"
                );
                total += 1;
                if d == 0.0 {
                    zeroed += 1;
                }
            }
        }
        assert!(
            zeroed * 10 >= total * 8,
            "expected most occluded blocks zeroed ({zeroed}/{total})"
        );
    }

    #[test]
    fn test_invalid_geometry_is_stage_error() {
        let (w, h) = (64, 16);
        let img = noise_image(w, h, 5);
        let img_ref = plane(w, h, img.clone());
        let img_cmp = plane(w, h, img);

        // depth + match width exceeds the image width
        let (mut matcher, _cell) = StereoMatcher::new(1, small_tunables(256)).unwrap();
        let mut out = BlockDisparity::with_max_size(w, h);
        let err = matcher.matching(&img_ref, &img_cmp, &mut out);
        assert!(matches!(err, Err(StereoError::Stage { .. })));
    }

    #[test]
    fn test_spread_display_scaling() {
        let (w, h) = (160, 16);
        let base = noise_image(w, h, 6);
        let img_ref = plane(w, h, base.clone());
        let img_cmp = plane(w, h, shift_right(&base, w, h, 8));

        let (mut matcher, _cell) = StereoMatcher::new(1, small_tunables(32)).unwrap();
        let mut out = BlockDisparity::with_max_size(w, h);
        matcher.matching(&img_ref, &img_cmp, &mut out).unwrap();
        matcher.spread_disparity(&mut out);

        let cols = out.geom.cols();
        let scale = 255.0 / 32.0;
        for jblk in 0..out.geom.disparity_rows() {
            for iblk in 0..out.geom.disparity_cols() {
                let d = out.block_disp[jblk * cols + iblk];
                let expect = (d * scale).round().clamp(0.0, 255.0) as u8;
                let pixel = out.display[(jblk * 4) * w + iblk * 4];
                assert_eq!(pixel, expect);
                assert_eq!(out.pixel_disp[(jblk * 4) * w + iblk * 4], d);
            }
        }
    }

    #[test]
    fn test_parameter_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();

        // First access creates the file from defaults.
        let loaded = MatcherTunables::load_or_create(dir.path(), CameraModel::Xc).unwrap();
        assert_eq!(loaded, MatcherTunables::default());
        assert!(dir.path().join("StereoMatchingParameter_XC.ini").exists());

        // Persist a change and read it back.
        let mut changed = loaded;
        changed.matching.contrast_threshold = 55;
        changed.back_matching.enabled = true;
        changed
            .save(&MatcherTunables::file_path(dir.path(), CameraModel::Xc))
            .unwrap();

        let reread = MatcherTunables::load_or_create(dir.path(), CameraModel::Xc).unwrap();
        assert_eq!(reread.matching.contrast_threshold, 55);
        assert!(reread.back_matching.enabled);
    }

    #[test]
    fn test_parameter_set_projection_round_trip() {
        let tun = MatcherTunables::default();
        let mut set = tun.parameter_set();
        assert!(set.set("Matching", "crstthr", ParameterValue::Int(77)));

        let mut applied = MatcherTunables::default();
        applied.apply_parameter_set(&set).unwrap();
        assert_eq!(applied.matching.contrast_threshold, 77);
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let mut set = ParameterSet::default();
        set.push_int(1, "nosuch", "Matching", "");
        let mut tun = MatcherTunables::default();
        assert!(matches!(
            tun.apply_parameter_set(&set),
            Err(StereoError::UnknownParameter(_))
        ));
    }

    #[test]
    fn test_contrast_offset_table() {
        assert_eq!(contrast_offset(752, false), 1800);
        assert_eq!(contrast_offset(1280, false), 1200);
        assert_eq!(contrast_offset(1280, true), 2400);
        assert_eq!(contrast_offset(640, false), 0);
    }
}
