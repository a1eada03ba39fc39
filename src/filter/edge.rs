//! Line-segment edge sharpening.
//!
//! Disparity along straight scene edges tends to smear across blocks. This
//! pass re-anchors it: Canny edges on the reference image feed a
//! probabilistic Hough transform; every detected non-horizontal segment is
//! walked in half-block steps, the disparities found along it are cleaned
//! with a histogram mode filter, fitted with a least-squares line, and —
//! when enough blocks agree linearly — the gaps along the segment are
//! refilled by two-pass interpolation (slope-extrapolated at the open ends)
//! and written back into the segment's parallel block strip.

use crate::block::{BlockGeometry, SUBPIXEL_SCALE};
use crate::filter::average::MovingIntegral;

/// Maximum number of segments processed per frame.
const MAX_LINES: usize = 300;

/// Segments with |Δy| under this are considered horizontal and skipped.
const MIN_VERTICAL_EXTENT: i32 = 4;

/// Edge-complement parameters (ini section `[EDGE_COMPLEMENT]`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeParams {
    /// Run the edge-sharpening phase.
    pub enabled: bool,
    /// Minimum disparity blocks on a segment for acceptance.
    pub min_blocks: usize,
    /// Minimum coefficient of determination, 0-100.
    pub min_coef: f64,
    /// Width of the parallel strip written back, in blocks.
    pub comp_width: usize,
}

impl Default for EdgeParams {
    fn default() -> Self {
        Self {
            enabled: true,
            min_blocks: 20,
            min_coef: 20.0,
            comp_width: 1,
        }
    }
}

/// Edge detection and Hough parameters (ini section `[HOUGH_TRANSFORM]`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HoughParams {
    /// Canny hysteresis threshold 1.
    pub canny_threshold1: i32,
    /// Canny hysteresis threshold 2.
    pub canny_threshold2: i32,
    /// Hough accumulator vote threshold.
    pub line_threshold: i32,
    /// Minimum accepted segment length, pixels.
    pub min_length: i32,
    /// Maximum bridged gap along a segment, pixels.
    pub max_gap: i32,
}

impl Default for HoughParams {
    fn default() -> Self {
        Self {
            canny_threshold1: 50,
            canny_threshold2: 100,
            line_threshold: 100,
            min_length: 80,
            max_gap: 5,
        }
    }
}

/// A detected line segment in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineSegment {
    /// Start point.
    pub x1: i32,
    /// Start point.
    pub y1: i32,
    /// End point.
    pub x2: i32,
    /// End point.
    pub y2: i32,
}

// ============================================================================
// Canny
// ============================================================================

/// Canny edge detector: Sobel gradients, L1 magnitude, non-maximum
/// suppression, double-threshold hysteresis. Returns a 0/255 edge map.
pub(crate) fn canny(img: &[u8], width: usize, height: usize, t1: i32, t2: i32) -> Vec<u8> {
    let low = t1.min(t2);
    let high = t1.max(t2);

    if width < 3 || height < 3 {
        return vec![0; width * height];
    }

    let mut gx = vec![0i32; width * height];
    let mut gy = vec![0i32; width * height];
    let mut mag = vec![0i32; width * height];

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let p = |dy: isize, dx: isize| -> i32 {
                let yy = (y as isize + dy) as usize;
                let xx = (x as isize + dx) as usize;
                i32::from(img[yy * width + xx])
            };
            let sx = -p(-1, -1) + p(-1, 1) - 2 * p(0, -1) + 2 * p(0, 1) - p(1, -1) + p(1, 1);
            let sy = -p(-1, -1) - 2 * p(-1, 0) - p(-1, 1) + p(1, -1) + 2 * p(1, 0) + p(1, 1);
            let idx = y * width + x;
            gx[idx] = sx;
            gy[idx] = sy;
            mag[idx] = sx.abs() + sy.abs();
        }
    }

    // Non-maximum suppression with 4 quantized gradient directions.
    const TAN_22_5: f32 = 0.414_213_56;
    let mut thin = vec![0i32; width * height];
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let idx = y * width + x;
            let m = mag[idx];
            if m == 0 {
                continue;
            }
            let ax = gx[idx].abs() as f32;
            let ay = gy[idx].abs() as f32;

            let (m1, m2) = if ay <= ax * TAN_22_5 {
                (mag[idx - 1], mag[idx + 1])
            } else if ax <= ay * TAN_22_5 {
                (mag[idx - width], mag[idx + width])
            } else if (gx[idx] > 0) == (gy[idx] > 0) {
                (mag[idx - width - 1], mag[idx + width + 1])
            } else {
                (mag[idx - width + 1], mag[idx + width - 1])
            };

            if m >= m1 && m >= m2 {
                thin[idx] = m;
            }
        }
    }

    // Hysteresis: strong seeds grow through weak neighbours.
    let mut edges = vec![0u8; width * height];
    let mut stack = Vec::new();
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let idx = y * width + x;
            if thin[idx] >= high && edges[idx] == 0 {
                edges[idx] = 255;
                stack.push(idx);
                while let Some(cur) = stack.pop() {
                    let cy = cur / width;
                    let cx = cur % width;
                    for dy in -1isize..=1 {
                        for dx in -1isize..=1 {
                            let ny = cy as isize + dy;
                            let nx = cx as isize + dx;
                            if ny < 1
                                || ny >= height as isize - 1
                                || nx < 1
                                || nx >= width as isize - 1
                            {
                                continue;
                            }
                            let n = ny as usize * width + nx as usize;
                            if edges[n] == 0 && thin[n] >= low {
                                edges[n] = 255;
                                stack.push(n);
                            }
                        }
                    }
                }
            }
        }
    }

    edges
}

// ============================================================================
// Probabilistic Hough transform
// ============================================================================

/// Deterministic linear-congruential generator for the point sampling order.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as usize) % bound
    }
}

/// Progressive probabilistic Hough transform over a 0/255 edge map with
/// 1 px / 1° resolution.
pub(crate) fn hough_lines_p(
    edges: &[u8],
    width: usize,
    height: usize,
    threshold: i32,
    min_length: i32,
    max_gap: i32,
    max_lines: usize,
) -> Vec<LineSegment> {
    const NUM_ANGLE: usize = 180;
    let num_rho = (width + height) * 2 + 1;
    let half_rho = (width + height) as i32;

    let mut tab_sin = [0.0f32; NUM_ANGLE];
    let mut tab_cos = [0.0f32; NUM_ANGLE];
    for n in 0..NUM_ANGLE {
        let angle = n as f32 * std::f32::consts::PI / NUM_ANGLE as f32;
        tab_sin[n] = angle.sin();
        tab_cos[n] = angle.cos();
    }

    let mut mask: Vec<bool> = edges.iter().map(|&e| e != 0).collect();
    let mut points: Vec<(i32, i32)> = Vec::new();
    for y in 0..height {
        for x in 0..width {
            if mask[y * width + x] {
                points.push((x as i32, y as i32));
            }
        }
    }

    let mut accum = vec![0i32; NUM_ANGLE * num_rho];
    let mut lines = Vec::new();
    let mut rng = Lcg(0x4d5_95df_4d95_df4d);

    while !points.is_empty() && lines.len() < max_lines {
        let pick = rng.next(points.len());
        let (px, py) = points.swap_remove(pick);

        // The point may have been erased by a previous segment walk.
        if !mask[py as usize * width + px as usize] {
            continue;
        }

        // Vote and track the best angle for this point.
        let mut best_votes = threshold - 1;
        let mut best_angle = 0usize;
        for n in 0..NUM_ANGLE {
            let rho = (px as f32 * tab_cos[n] + py as f32 * tab_sin[n]).round() as i32 + half_rho;
            let votes = {
                let v = &mut accum[n * num_rho + rho as usize];
                *v += 1;
                *v
            };
            if votes > best_votes {
                best_votes = votes;
                best_angle = n;
            }
        }
        if best_votes < threshold {
            continue;
        }

        // Walk the candidate line in both directions, bridging gaps up to
        // max_gap pixels.
        let cos_a = tab_cos[best_angle];
        let sin_a = tab_sin[best_angle];
        // Direction along the line: perpendicular to the normal.
        let (dx, dy) = (-sin_a, cos_a);

        let mut ends = [(px, py); 2];
        for (dir_index, sign) in [1.0f32, -1.0f32].iter().enumerate() {
            let mut gap = 0;
            let mut step = 1;
            loop {
                let fx = px as f32 + sign * dx * step as f32;
                let fy = py as f32 + sign * dy * step as f32;
                let ix = fx.round() as i32;
                let iy = fy.round() as i32;
                if ix < 0 || iy < 0 || ix >= width as i32 || iy >= height as i32 {
                    break;
                }
                if mask[iy as usize * width + ix as usize] {
                    gap = 0;
                    ends[dir_index] = (ix, iy);
                } else {
                    gap += 1;
                    if gap > max_gap {
                        break;
                    }
                }
                step += 1;
            }
        }

        let (x1, y1) = ends[0];
        let (x2, y2) = ends[1];
        let length_sq = (x2 - x1).pow(2) + (y2 - y1).pow(2);
        let good = length_sq >= min_length.pow(2);

        // Erase the pixels along the walked span and withdraw their votes so
        // they cannot seed further lines.
        for sign in [1.0f32, -1.0f32] {
            let mut gap = 0;
            let mut step = 0;
            loop {
                let ix = (px as f32 + sign * dx * step as f32).round() as i32;
                let iy = (py as f32 + sign * dy * step as f32).round() as i32;
                if ix < 0 || iy < 0 || ix >= width as i32 || iy >= height as i32 {
                    break;
                }
                let idx = iy as usize * width + ix as usize;
                if mask[idx] {
                    gap = 0;
                    mask[idx] = false;
                    for n in 0..NUM_ANGLE {
                        let rho = (ix as f32 * tab_cos[n] + iy as f32 * tab_sin[n]).round() as i32
                            + half_rho;
                        accum[n * num_rho + rho as usize] -= 1;
                    }
                } else {
                    gap += 1;
                    if gap > max_gap {
                        break;
                    }
                }
                step += 1;
                if sign > 0.0 && (ix, iy) == ends[0] && gap == 0 && step > 1 {
                    break;
                }
                if sign < 0.0 && (ix, iy) == ends[1] && gap == 0 && step > 1 {
                    break;
                }
            }
        }

        if good {
            lines.push(LineSegment { x1, y1, x2, y2 });
        }
    }

    lines
}

// ============================================================================
// Segment disparity operations
// ============================================================================

/// Remove disparities outside `mode ± mode/4` along one segment. Returns the
/// number of valid samples seen.
pub(crate) fn remove_outside_disparity(values: &mut [i32], depth: usize, integ: i32) -> usize {
    let mut histogram = MovingIntegral::new(depth);
    let mut count = 0;

    for &v in values.iter() {
        if v > SUBPIXEL_SCALE {
            count += 1;
            histogram.add(v, integ, 1);
        }
    }

    let mode = histogram.mode();
    let high = (mode + mode / 4).min(histogram.span() - 1);
    let low = (mode - mode / 4).max(SUBPIXEL_SCALE);

    for v in values.iter_mut() {
        if *v <= low || *v > high {
            *v = 0;
        }
    }

    count
}

/// Least-squares regression of disparity against segment position over the
/// non-zero samples. Returns `(slope, intercept, coefdet·100, samples)`.
pub(crate) fn regression_line(values: &[i32]) -> (f64, f64, f64, usize) {
    let mut num = 0usize;
    let mut sum_x = 0i64;
    let mut sum_y = 0i64;

    for (i, &v) in values.iter().enumerate() {
        if v > 0 {
            sum_x += i as i64;
            sum_y += i64::from(v);
            num += 1;
        }
    }

    if num <= 2 {
        return (0.0, 0.0, 0.0, num);
    }

    let ave_x = sum_x as f64 / num as f64;
    let ave_y = sum_y as f64 / num as f64;

    let mut var_x = 0.0;
    let mut var_y = 0.0;
    let mut covar = 0.0;
    for (i, &v) in values.iter().enumerate() {
        if v > 0 {
            let dx = i as f64 - ave_x;
            let dy = f64::from(v) - ave_y;
            var_x += dx * dx;
            var_y += dy * dy;
            covar += dx * dy;
        }
    }

    let slope = covar / var_x;
    let intercept = ave_y - slope * ave_x;

    let mut residual = 0.0;
    for (i, &v) in values.iter().enumerate() {
        if v > 0 {
            let fit = slope * i as f64 + intercept;
            let diff = f64::from(v) - fit;
            residual += diff * diff;
        }
    }

    let coefdet = if var_y > 0.0 {
        (1.0 - residual / var_y) * 100.0
    } else {
        0.0
    };

    (slope, intercept, coefdet, num)
}

/// Two-pass refill of zero blocks along a segment. Interior gaps are
/// distance-weighted between their flanks; runs reaching either end are
/// extrapolated with the regression slope.
pub(crate) fn fill_segment_disparity(
    values: &mut [i32],
    weights: &mut Vec<i32>,
    carried: &mut Vec<i32>,
    slope: f64,
) {
    let n = values.len();
    weights.clear();
    weights.resize(n, 0);
    carried.clear();
    carried.resize(n, 0);

    // Forward: weight zero runs by distance, carry the last valid value.
    let mut prev_weight = 0;
    let mut prev_carry = 0;
    for i in 0..n {
        if values[i] == 0 {
            weights[i] = prev_weight + 1;
            carried[i] = prev_carry;
        } else {
            weights[i] = 0;
            carried[i] = values[i];
        }
        prev_weight = weights[i];
        prev_carry = carried[i];
    }

    // Nothing valid anywhere: leave the segment untouched.
    if prev_carry == 0 {
        return;
    }

    // Backward: resolve weights into interpolated values.
    let mut back_weight = 0i64;
    let mut back_carry = 0i64;
    for i in (0..n).rev() {
        let set;
        if weights[i] == 0 {
            set = i64::from(carried[i]);
            back_weight = 0;
            back_carry = set;
        } else if back_carry == 0 {
            // Run reaches the segment end: extend with the regression slope.
            set = (slope * f64::from(weights[i]) + f64::from(carried[i])) as i64;
        } else if carried[i] == 0 {
            // Run reaches the segment start: walk the slope back.
            set = (back_carry as f64 - slope) as i64;
            back_carry = set;
        } else {
            back_weight += 1;
            set = (i64::from(carried[i]) * back_weight + back_carry * i64::from(weights[i]))
                / (back_weight + i64::from(weights[i]));
        }
        values[i] = set as i32;
    }
}

// ============================================================================
// Phase entry
// ============================================================================

/// Scratch reused across frames by the edge phase.
#[derive(Default)]
pub(crate) struct EdgeScratch {
    block_points: Vec<(i32, i32)>,
    block_values: Vec<i32>,
    weights: Vec<i32>,
    carried: Vec<i32>,
}

/// Sharpen disparity along the detected straight edges of the reference
/// image, writing corrected values back into `values` (full block grid).
pub(crate) fn sharpen_linear_edges(
    img: &[u8],
    geom: &BlockGeometry,
    edge: &EdgeParams,
    hough: &HoughParams,
    integ: i32,
    scratch: &mut EdgeScratch,
    values: &mut [i32],
) {
    let width = geom.image_width;
    let height = geom.image_height;

    let edges = canny(
        img,
        width,
        height,
        hough.canny_threshold1,
        hough.canny_threshold2,
    );
    let segments = hough_lines_p(
        &edges,
        width,
        height,
        hough.line_threshold,
        hough.min_length,
        hough.max_gap,
        MAX_LINES,
    );

    tracing::debug!(segments = segments.len(), "edge segments detected");

    // Parallel-strip offsets around the segment.
    let strip = edge.comp_width.saturating_sub(1) as i32;
    let upper = strip / 2;
    let lower = -(strip % 2 + upper);

    let rows = geom.rows() as i32;
    let cols = geom.cols() as i32;

    for seg in &segments {
        if (seg.y1 - seg.y2).abs() < MIN_VERTICAL_EXTENT {
            continue;
        }

        let diff_x = seg.x2 - seg.x1;
        let diff_y = seg.y2 - seg.y1;
        let shallow = diff_x.abs() > diff_y.abs();

        scratch.block_points.clear();
        scratch.block_values.clear();

        if shallow {
            let slope = f64::from(diff_y) / f64::from(diff_x);
            let (ox, oy, ex) = if diff_x < 0 {
                (seg.x2, seg.y2, seg.x1)
            } else {
                (seg.x1, seg.y1, seg.x2)
            };
            let step = geom.block_width as f64 / 2.0;
            let mut x = f64::from(ox);
            while x < f64::from(ex) + step {
                let y = slope * (x - f64::from(ox)) + f64::from(oy);
                push_block(geom, x, y, rows, cols, scratch, values);
                x += step;
            }
        } else {
            let slope = f64::from(diff_x) / f64::from(diff_y);
            let (ox, oy, ey) = if diff_y < 0 {
                (seg.x2, seg.y2, seg.y1)
            } else {
                (seg.x1, seg.y1, seg.y2)
            };
            let step = geom.block_height as f64 / 2.0;
            let mut y = f64::from(oy);
            while y < f64::from(ey) + step {
                let x = slope * (y - f64::from(oy)) + f64::from(ox);
                push_block(geom, x, y, rows, cols, scratch, values);
                y += step;
            }
        }

        remove_outside_disparity(&mut scratch.block_values, geom.depth, integ);
        let (slope, _intercept, coefdet, samples) = regression_line(&scratch.block_values);

        if samples < edge.min_blocks || coefdet < edge.min_coef {
            continue;
        }

        fill_segment_disparity(
            &mut scratch.block_values,
            &mut scratch.weights,
            &mut scratch.carried,
            slope,
        );

        // Write back along the segment and into the parallel strip.
        for (k, &(bx, by)) in scratch.block_points.iter().enumerate() {
            for offset in lower..=upper {
                let (x, y) = if shallow { (bx, by + offset) } else { (bx + offset, by) };
                if x >= 0 && x < cols && y >= 0 && y < rows {
                    values[y as usize * cols as usize + x as usize] = scratch.block_values[k];
                }
            }
        }
    }
}

fn push_block(
    geom: &BlockGeometry,
    x: f64,
    y: f64,
    rows: i32,
    cols: i32,
    scratch: &mut EdgeScratch,
    values: &[i32],
) {
    let bx = ((x - geom.offset_x as f64) / geom.block_width as f64) as i32;
    let by = ((y - geom.offset_y as f64) / geom.block_height as f64) as i32;
    if bx < 0 || bx >= cols || by < 0 || by >= rows {
        return;
    }
    scratch.block_points.push((bx, by));
    scratch
        .block_values
        .push(values[by as usize * cols as usize + bx as usize]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canny_finds_vertical_step() {
        let (w, h) = (64, 32);
        let mut img = vec![50u8; w * h];
        for y in 0..h {
            for x in 32..w {
                img[y * w + x] = 200;
            }
        }

        let edges = canny(&img, w, h, 50, 100);

        // An edge column appears at the step, nowhere else (away from it).
        let mut edge_cols = std::collections::HashSet::new();
        for y in 2..h - 2 {
            for x in 2..w - 2 {
                if edges[y * w + x] != 0 {
                    edge_cols.insert(x);
                }
            }
        }
        assert!(!edge_cols.is_empty(), "step edge must be detected");
        for col in edge_cols {
            assert!(
                (31..=33).contains(&col),
                "edge pixel far from the step at column {col}"
            );
        }
    }

    #[test]
    fn test_canny_flat_image_has_no_edges() {
        let img = vec![128u8; 64 * 32];
        let edges = canny(&img, 64, 32, 50, 100);
        assert!(edges.iter().all(|&e| e == 0));
    }

    #[test]
    fn test_hough_recovers_vertical_line() {
        let (w, h) = (128, 128);
        let mut edges = vec![0u8; w * h];
        for y in 10..120 {
            edges[y * w + 60] = 255;
        }

        let lines = hough_lines_p(&edges, w, h, 50, 80, 5, 10);
        assert_eq!(lines.len(), 1);
        let line = lines[0];
        assert_eq!(line.x1, 60);
        assert_eq!(line.x2, 60);
        assert!((line.y1 - line.y2).abs() >= 100);
    }

    #[test]
    fn test_hough_ignores_short_segments() {
        let (w, h) = (128, 128);
        let mut edges = vec![0u8; w * h];
        for y in 10..40 {
            edges[y * w + 60] = 255;
        }
        // 30 px < min_length 80, even though votes pass the threshold.
        let lines = hough_lines_p(&edges, w, h, 20, 80, 5, 10);
        assert!(lines.is_empty());
    }

    #[test]
    fn test_regression_on_perfect_line() {
        let values: Vec<i32> = (0..40).map(|i| 10_000 + i * 250).collect();
        let (slope, intercept, coefdet, num) = regression_line(&values);
        assert_eq!(num, 40);
        assert!((slope - 250.0).abs() < 1e-6);
        assert!((intercept - 10_000.0).abs() < 1e-6);
        assert!((coefdet - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_regression_needs_three_samples() {
        let values = vec![0, 5000, 0, 6000, 0];
        let (_, _, coefdet, num) = regression_line(&values);
        assert_eq!(num, 2);
        assert_eq!(coefdet, 0.0);
    }

    #[test]
    fn test_outlier_removal_keeps_mode_band() {
        let mut values = vec![20_000i32; 30];
        values[5] = 60_000; // far outlier
        values[6] = 2_000; // below the band
        let count = remove_outside_disparity(&mut values, 64, SUBPIXEL_SCALE);
        assert_eq!(count, 30);
        assert_eq!(values[5], 0);
        assert_eq!(values[6], 0);
        assert!(values[10] > 0);
    }

    #[test]
    fn test_fill_segment_interior_gap() {
        let mut values = vec![10_000, 0, 0, 0, 14_000];
        let mut weights = Vec::new();
        let mut carried = Vec::new();
        fill_segment_disparity(&mut values, &mut weights, &mut carried, 0.0);

        // Distance-weighted between the flanks, monotone across the gap.
        assert_eq!(values[0], 10_000);
        assert_eq!(values[4], 14_000);
        assert!(values[1] > 10_000 && values[1] < values[2]);
        assert!(values[2] < values[3] && values[3] < 14_000);
    }

    #[test]
    fn test_fill_segment_extrapolates_open_end() {
        let mut values = vec![10_000, 11_000, 12_000, 0, 0];
        let mut weights = Vec::new();
        let mut carried = Vec::new();
        fill_segment_disparity(&mut values, &mut weights, &mut carried, 1_000.0);

        // Tail run extended with the regression slope.
        assert_eq!(values[3], 13_000);
        assert_eq!(values[4], 14_000);
    }

    #[test]
    fn test_fill_segment_all_zero_untouched() {
        let mut values = vec![0; 6];
        let mut weights = Vec::new();
        let mut carried = Vec::new();
        fill_segment_disparity(&mut values, &mut weights, &mut carried, 500.0);
        assert!(values.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_sharpen_propagates_along_step_edge() {
        use crate::block::BlockGeometry;

        let (w, h) = (160, 160);
        let geom = BlockGeometry {
            image_width: w,
            image_height: h,
            block_height: 4,
            block_width: 4,
            match_height: 4,
            match_width: 4,
            offset_x: 0,
            offset_y: 0,
            depth: 64,
            shade_width: 0,
        };

        // Vertical step edge at x = 80.
        let mut img = vec![50u8; w * h];
        for y in 0..h {
            for x in 80..w {
                img[y * w + x] = 200;
            }
        }

        // Blocks on the edge column carry a gentle disparity ramp around
        // 16.0 px, with a few holes to refill.
        let cols = geom.cols();
        let rows = geom.rows();
        let edge_col = 80 / 4;
        let mut values = vec![0i32; cols * rows];
        for row in 0..rows {
            if row % 5 != 2 {
                values[row * cols + edge_col] = 16_000 + row as i32 * 20;
            }
        }

        let edge = EdgeParams {
            min_blocks: 10,
            ..EdgeParams::default()
        };
        let hough = HoughParams {
            line_threshold: 50,
            min_length: 80,
            ..HoughParams::default()
        };

        let mut scratch = EdgeScratch::default();
        sharpen_linear_edges(
            &img,
            &geom,
            &edge,
            &hough,
            SUBPIXEL_SCALE,
            &mut scratch,
            &mut values,
        );

        // Holes along the edge are refilled close to the ramp.
        for row in 2..rows - 2 {
            let v = values[row * cols + edge_col];
            let expect = 16_000 + row as i32 * 20;
            assert!(
                (v - expect).abs() < 800,
                "edge block row {row} should hold ~{expect}, got {v}"
            );
        }
    }
}
