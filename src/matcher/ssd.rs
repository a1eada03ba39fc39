//! SSD matching kernels.
//!
//! For each disparity block the kernel finds the integer shift `k` that
//! minimises the zero-mean SSD between the reference (right) window and the
//! compared (left) window, then refines it with parabolic interpolation:
//!
//! ```text
//! SSD(k) = ΣR² + ΣC² − 2ΣRC − ((ΣR)² + (ΣC)² − 2·ΣR·ΣC) / N
//! δ      = (S(d−1) − S(d+1)) / (2·S(d−1) − 4·S(d) + 2·S(d+1))
//! ```
//!
//! Blocks whose contrast falls under the threshold are skipped before any
//! SSD is computed. The bidirectional kernel additionally searches the right
//! image for the best match of the left block shifted left, producing the
//! back-matching grid used for occlusion rejection.

use crate::block::BlockGeometry;

/// Brightness floor for the block maximum.
const BLOCK_BRIGHTNESS_MAX: f64 = 15.0;

/// Brightness floor for the in-block delta.
const BLOCK_MIN_DELTA_BRIGHTNESS: f64 = 2.0;

/// Brightness floor for the block average.
const BLOCK_MIN_AVERAGE_BRIGHTNESS: f64 = 7.5;

/// Per-band kernel inputs shared by every block in the band.
pub(crate) struct KernelInputs<'a> {
    /// Block grid geometry for the current frame.
    pub geom: BlockGeometry,
    /// Contrast threshold; blocks under it produce no disparity.
    pub contrast_threshold: i32,
    /// Sensor-dependent contrast offset (already scaled by 1000).
    pub contrast_offset: i32,
    /// Gradation-corrected sensor mode.
    pub gradation_correction: bool,
    /// First block row covered by the output slices. Band dispatch hands
    /// each worker a slice of whole block rows; the kernel indexes relative
    /// to this origin.
    pub grid_row_origin: usize,
    /// Reference (right) image.
    pub img_ref: &'a [u8],
    /// Compared (left) image.
    pub img_cmp: &'a [u8],
}

/// Brightness statistics over one matching window.
struct WindowStats {
    sum: i32,
    sum_sq: i32,
    contrast: i32,
}

/// Evaluate brightness sums and the gated contrast for the window at
/// `(x, y)` in `img`.
fn window_stats(inputs: &KernelInputs<'_>, img: &[u8], x: usize, y: usize) -> WindowStats {
    let width = inputs.geom.image_width;
    let wh = inputs.geom.match_height;
    let ww = inputs.geom.match_width;
    let count = (wh * ww) as f64;

    let mut sum = 0i32;
    let mut sum_sq = 0i32;
    let mut lum_sum = 0.0f64;
    let mut lum_min = 255.0f64;
    let mut lum_max = 0.0f64;

    for j in y..y + wh {
        let row = j * width;
        for i in x..x + ww {
            let v = f64::from(img[row + i]);
            let v_sq = v * v;
            sum += v as i32;
            sum_sq += v_sq as i32;

            // Gradation-corrected sensors deliver sqrt-compressed values;
            // undo the compression before the brightness statistics.
            let lum = if inputs.gradation_correction { v_sq / 255.0 } else { v };
            lum_sum += lum;
            if lum < lum_min {
                lum_min = lum;
            }
            if lum > lum_max {
                lum_max = lum;
            }
        }
    }

    let average = lum_sum / count;
    let delta = lum_max - lum_min;

    let contrast = if lum_max >= BLOCK_BRIGHTNESS_MAX
        && delta >= BLOCK_MIN_DELTA_BRIGHTNESS
        && average >= BLOCK_MIN_AVERAGE_BRIGHTNESS
    {
        ((delta * 1000.0 - f64::from(inputs.contrast_offset)) / average) as i32
    } else {
        0
    };

    WindowStats {
        sum,
        sum_sq,
        contrast,
    }
}

/// Parabolic sub-pixel refinement around the integer argmin. Falls back to
/// the integer disparity when the cost curve is flat.
fn parabolic_subpixel(ssd: &[f32], disp: usize) -> f32 {
    let prev = ssd[disp - 1];
    let cur = ssd[disp];
    let next = ssd[disp + 1];
    let denom = 2.0 * prev - 4.0 * cur + 2.0 * next;
    if denom == 0.0 {
        disp as f32
    } else {
        disp as f32 + (prev - next) / denom
    }
}

/// Forward-only kernel: one block at pixel `(x, y)`.
///
/// Writes the float disparity and contrast for the block containing the
/// pixel; a block gated out by contrast gets disparity 0.
pub(crate) fn disparity_by_ssd(
    inputs: &KernelInputs<'_>,
    x: usize,
    y: usize,
    out_disp: &mut [f32],
    out_contrast: &mut [i32],
) {
    let g = &inputs.geom;
    let width = g.image_width;
    let depth = g.depth;

    // Matched region excludes the shade band on the right edge.
    if x >= width - depth {
        return;
    }

    let jblk = y / g.block_height - inputs.grid_row_origin;
    let iblk = x / g.block_width;
    let idx = jblk * g.cols() + iblk;

    let stats = window_stats(inputs, inputs.img_ref, x, y);
    if stats.contrast < inputs.contrast_threshold {
        out_disp[idx] = 0.0;
        out_contrast[idx] = 0;
        return;
    }

    let count = (g.match_height * g.match_width) as f32;
    let mut ssd = [0.0f32; crate::config::MAX_MATCHING_DEPTH];
    let mut best = f32::MAX;
    let mut disp = 0usize;

    for (k, slot) in ssd.iter_mut().enumerate().take(depth) {
        let mut sum_c = 0i32;
        let mut sum_cc = 0i32;
        let mut sum_rc = 0i32;

        for j in y..y + g.match_height {
            let row = j * width;
            for i in x..x + g.match_width {
                let r = i32::from(inputs.img_ref[row + i]);
                let c = i32::from(inputs.img_cmp[row + i + k]);
                sum_c += c;
                sum_cc += c * c;
                sum_rc += r * c;
            }
        }

        let cross = {
            let (r, c) = (i64::from(stats.sum), i64::from(sum_c));
            r * r + c * c - 2 * r * c
        };
        let cost = (stats.sum_sq + sum_cc - 2 * sum_rc) as f32 - cross as f32 / count;
        *slot = cost;
        if cost < best {
            best = cost;
            disp = k;
        }
    }

    // No sub-pixel at the search bounds; those matches are rejected.
    if disp < 1 || disp >= depth - 1 {
        out_disp[idx] = 0.0;
    } else {
        out_disp[idx] = parabolic_subpixel(&ssd, disp);
    }
    out_contrast[idx] = stats.contrast;
}

/// Bidirectional kernel: one block at pixel `(x, y)`.
///
/// Fills the forward grid exactly like [`disparity_by_ssd`] and additionally
/// projects the best backward match into the reference block grid.
#[allow(clippy::too_many_lines)]
pub(crate) fn both_disparity_by_ssd(
    inputs: &KernelInputs<'_>,
    x: usize,
    y: usize,
    out_disp: &mut [f32],
    out_back: &mut [f32],
    out_contrast: &mut [i32],
) {
    let g = &inputs.geom;
    let width = g.image_width;
    let depth = g.depth;

    if x >= width - g.match_width {
        return;
    }

    let jblk = y / g.block_height - inputs.grid_row_origin;
    let iblk = x / g.block_width;
    let cols = g.cols();
    let idx = jblk * cols + iblk;

    let fwd = window_stats(inputs, inputs.img_ref, x, y);
    let bwd = window_stats(inputs, inputs.img_cmp, x, y);

    // Truncate the search where it would run off either image edge.
    let fwd_margin = width as i64 - (x + depth + g.match_width) as i64;
    let fwd_depth = if fwd_margin < 0 {
        (depth as i64 + fwd_margin + 1).max(0) as usize
    } else {
        depth
    };
    let bwd_margin = x as i64 - depth as i64;
    let bwd_depth = if bwd_margin < 0 {
        (depth as i64 + bwd_margin + 1).max(0) as usize
    } else {
        depth
    };

    let count = (g.match_height * g.match_width) as f32;
    let mut ssd = [0.0f32; crate::config::MAX_MATCHING_DEPTH];
    let mut bk_ssd = [0.0f32; crate::config::MAX_MATCHING_DEPTH];
    let mut best = f32::MAX;
    let mut bk_best = f32::MAX;
    let mut disp = 0usize;
    let mut bk_disp = 0usize;

    for k in 0..depth {
        let mut sum_c = 0i32;
        let mut sum_cc = 0i32;
        let mut sum_rc = 0i32;
        let mut bk_sum_c = 0i32;
        let mut bk_sum_cc = 0i32;
        let mut bk_sum_rc = 0i32;

        for j in y..y + g.match_height {
            let row = j * width;
            for i in x..x + g.match_width {
                if k < fwd_depth {
                    let r = i32::from(inputs.img_ref[row + i]);
                    let c = i32::from(inputs.img_cmp[row + i + k]);
                    sum_c += c;
                    sum_cc += c * c;
                    sum_rc += r * c;
                }
                if k < bwd_depth {
                    let r = i32::from(inputs.img_cmp[row + i]);
                    let c = i32::from(inputs.img_ref[row + i - k]);
                    bk_sum_c += c;
                    bk_sum_cc += c * c;
                    bk_sum_rc += r * c;
                }
            }
        }

        if k < fwd_depth {
            let cross = {
                let (r, c) = (i64::from(fwd.sum), i64::from(sum_c));
                r * r + c * c - 2 * r * c
            };
            let cost = (fwd.sum_sq + sum_cc - 2 * sum_rc) as f32 - cross as f32 / count;
            ssd[k] = cost;
            if cost < best {
                best = cost;
                disp = k;
            }
        }
        if k < bwd_depth {
            let cross = {
                let (r, c) = (i64::from(bwd.sum), i64::from(bk_sum_c));
                r * r + c * c - 2 * r * c
            };
            let cost = (bwd.sum_sq + bk_sum_cc - 2 * bk_sum_rc) as f32 - cross as f32 / count;
            bk_ssd[k] = cost;
            if cost < bk_best {
                bk_best = cost;
                bk_disp = k;
            }
        }
    }

    let mut contrast = fwd.contrast;

    if fwd_depth < 3 || disp < 1 || disp >= fwd_depth - 1 || contrast < inputs.contrast_threshold {
        out_disp[idx] = 0.0;
        contrast = 0;
    } else {
        out_disp[idx] = parabolic_subpixel(&ssd, disp);
    }

    if bwd_depth >= 3
        && bk_disp >= 1
        && bk_disp < bwd_depth - 1
        && bwd.contrast >= inputs.contrast_threshold
    {
        let bk_sub = parabolic_subpixel(&bk_ssd, bk_disp);
        // Project the backward match onto the reference grid.
        let bk_x = x as f32 - bk_sub;
        if bk_x >= 0.0 {
            let bk_iblk = (bk_x / g.block_width as f32) as usize;
            if bk_iblk < cols {
                out_back[jblk * cols + bk_iblk] = bk_sub;
            }
        }
    }

    out_contrast[idx] = contrast;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_inputs<'a>(
        img_ref: &'a [u8],
        img_cmp: &'a [u8],
        width: usize,
        height: usize,
        depth: usize,
    ) -> KernelInputs<'a> {
        KernelInputs {
            geom: BlockGeometry {
                image_width: width,
                image_height: height,
                block_height: 4,
                block_width: 4,
                match_height: 4,
                match_width: 4,
                offset_x: 0,
                offset_y: 0,
                depth,
                shade_width: depth,
            },
            contrast_threshold: 10,
            contrast_offset: 0,
            gradation_correction: false,
            grid_row_origin: 0,
            img_ref,
            img_cmp,
        }
    }

    /// Textured pattern with a known shift: cmp[x] = ref[x - shift].
    fn shifted_pair(width: usize, height: usize, shift: usize) -> (Vec<u8>, Vec<u8>) {
        let mut img_ref = vec![0u8; width * height];
        let mut img_cmp = vec![0u8; width * height];
        for y in 0..height {
            for x in 0..width {
                let v = ((x * 37 + y * 11) % 191 + 30) as u8;
                img_ref[y * width + x] = v;
                if x >= shift {
                    img_cmp[y * width + x] = img_ref[y * width + x - shift];
                }
            }
        }
        (img_ref, img_cmp)
    }

    #[test]
    fn test_known_shift_recovered() {
        let (img_ref, img_cmp) = shifted_pair(64, 8, 5);
        let inputs = small_inputs(&img_ref, &img_cmp, 64, 8, 16);

        let cols = inputs.geom.cols();
        let mut disp = vec![0.0f32; cols * inputs.geom.rows()];
        let mut crst = vec![0i32; cols * inputs.geom.rows()];

        disparity_by_ssd(&inputs, 8, 0, &mut disp, &mut crst);

        let d = disp[2];
        assert!((d - 5.0).abs() < 0.05, "expected ~5.0, got {d}");
        assert!(crst[2] > 0);
    }

    #[test]
    fn test_zero_shift_is_rejected_as_no_disparity() {
        let (img_ref, _) = shifted_pair(64, 8, 0);
        let inputs = small_inputs(&img_ref, &img_ref, 64, 8, 16);

        let cols = inputs.geom.cols();
        let mut disp = vec![0.0f32; cols * inputs.geom.rows()];
        let mut crst = vec![0i32; cols * inputs.geom.rows()];

        disparity_by_ssd(&inputs, 8, 0, &mut disp, &mut crst);

        // Identical images match best at k = 0, below the sub-pixel floor.
        assert_eq!(disp[2], 0.0);
        assert!(crst[2] > 0, "texture should still register contrast");
    }

    #[test]
    fn test_flat_block_gated_by_contrast() {
        let img = vec![128u8; 64 * 8];
        let inputs = small_inputs(&img, &img, 64, 8, 16);

        let cols = inputs.geom.cols();
        let mut disp = vec![9.0f32; cols * inputs.geom.rows()];
        let mut crst = vec![9i32; cols * inputs.geom.rows()];

        disparity_by_ssd(&inputs, 0, 0, &mut disp, &mut crst);

        assert_eq!(disp[0], 0.0);
        assert_eq!(crst[0], 0);
    }

    #[test]
    fn test_dark_block_has_zero_contrast() {
        // Max brightness below BLOCK_BRIGHTNESS_MAX forces contrast 0.
        let mut img = vec![0u8; 64 * 8];
        for (i, v) in img.iter_mut().enumerate() {
            *v = (i % 9) as u8;
        }
        let inputs = small_inputs(&img, &img, 64, 8, 16);
        let stats = window_stats(&inputs, &img, 0, 0);
        assert_eq!(stats.contrast, 0);
    }

    #[test]
    fn test_parabolic_vertex() {
        // Perfect parabola with vertex at 3.25.
        let mut ssd = vec![0.0f32; 8];
        for (k, v) in ssd.iter_mut().enumerate() {
            let d = k as f32 - 3.25;
            *v = d * d;
        }
        let refined = parabolic_subpixel(&ssd, 3);
        assert!((refined - 3.25).abs() < 1e-4);
    }

    #[test]
    fn test_flat_cost_curve_falls_back_to_integer() {
        let ssd = vec![1.0f32; 8];
        assert_eq!(parabolic_subpixel(&ssd, 4), 4.0);
    }

    #[test]
    fn test_backmatching_agrees_on_plain_shift() {
        let (img_ref, img_cmp) = shifted_pair(96, 8, 6);
        let mut inputs = small_inputs(&img_ref, &img_cmp, 96, 8, 16);
        inputs.geom.shade_width = 0;

        let cols = inputs.geom.cols();
        let n = cols * inputs.geom.rows();
        let mut disp = vec![0.0f32; n];
        let mut back = vec![0.0f32; n];
        let mut crst = vec![0i32; n];

        // Interior block well clear of both margins.
        both_disparity_by_ssd(&inputs, 32, 0, &mut disp, &mut back, &mut crst);

        let fwd = disp[8];
        assert!((fwd - 6.0).abs() < 0.05, "forward {fwd}");

        // The backward match lands shift/block_width columns to the left.
        let bk_col = ((32.0 - fwd) / 4.0) as usize;
        let bwd = back[bk_col];
        assert!((bwd - 6.0).abs() < 0.2, "backward {bwd}");
    }
}
