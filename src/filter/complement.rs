//! Disparity completion by directional scanning.
//!
//! Zero (no-disparity) runs are filled from the valid disparities flanking
//! them. Four scan directions are applied — horizontal, vertical, diagonal
//! down, diagonal up — and every line is walked twice: a forward pass that
//! records, for each zero block, the consecutive-zero count and the
//! disparity carried from the last valid block, then a backward pass that
//! combines both flanks into a distance-weighted interpolation
//! `(w_b·d_front + w_f·d_back) / (w_f + w_b)`.
//!
//! A gap is only filled when the block is weak enough (contrast gate,
//! skipped in hole-fill mode), both flanks are above the minimum disparity,
//! the run is narrow enough for the flanking disparities, and the gradient
//! across the run stays under the slope limit. At image edges the missing
//! flank weight is synthesised from the present disparity and the boundary
//! ratio.

use crate::block::{BlockGeometry, SUBPIXEL_SCALE};

/// Completion parameters (ini section `[COMPLEMENT]`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ComplementParams {
    /// Run the completion pass.
    pub enabled: bool,
    /// Minimum flank disparity, pixels.
    pub low_limit: f64,
    /// Maximum disparity gradient across a filled run.
    pub slope_limit: f64,
    /// Fill-width multiplier, interior flank.
    pub ratio_inside: f64,
    /// Fill-width multiplier, lateral edges.
    pub ratio_round: f64,
    /// Fill-width multiplier, bottom edge.
    pub ratio_bottom: f64,
    /// Contrast above which a block is left alone (complement mode only).
    pub contrast_limit: i32,
    /// Run the extra hole-fill cycle.
    pub hole_fill: bool,
    /// Hole-fill gap tolerance, pixels.
    pub hole_size: f64,
}

impl Default for ComplementParams {
    fn default() -> Self {
        Self {
            enabled: true,
            low_limit: 5.0,
            slope_limit: 0.1,
            ratio_inside: 1.0,
            ratio_round: 0.2,
            ratio_bottom: 0.1,
            contrast_limit: 20,
            hole_fill: false,
            hole_size: 8.0,
        }
    }
}

/// Reusable line buffers; sized once for the widest scan line.
pub(crate) struct LineBuffers {
    disp: Vec<i32>,
    weight: Vec<i32>,
}

impl LineBuffers {
    pub(crate) fn with_capacity(len: usize) -> Self {
        Self {
            disp: vec![0; len + 2],
            weight: vec![0; len + 2],
        }
    }
}

/// One completion pass over the block grid.
pub(crate) struct Completer<'a> {
    geom: &'a BlockGeometry,
    params: &'a ComplementParams,
    /// Averaging neighbourhood half-height: rows inside it carry no
    /// averaged disparity, so scans start below it.
    v_ofs: usize,
    /// Averaging neighbourhood half-width.
    h_ofs: usize,
    values: &'a mut [i32],
    contrast: &'a [i32],
    buffers: &'a mut LineBuffers,
    hole_fill: bool,
}

impl<'a> Completer<'a> {
    pub(crate) fn new(
        geom: &'a BlockGeometry,
        params: &'a ComplementParams,
        avg_half_height: usize,
        avg_half_width: usize,
        values: &'a mut [i32],
        contrast: &'a [i32],
        buffers: &'a mut LineBuffers,
        hole_fill: bool,
    ) -> Self {
        Self {
            geom,
            params,
            v_ofs: avg_half_height,
            h_ofs: avg_half_width,
            values,
            contrast,
            buffers,
            hole_fill,
        }
    }

    /// Complement-mode order: vertical, horizontal, both diagonals.
    pub(crate) fn run_complement(&mut self) {
        self.vertical();
        self.horizontal();
        self.diagonal_up();
        self.diagonal_down();
    }

    /// Hole-fill-mode order repeats the axis scans after the diagonals.
    pub(crate) fn run_hole_fill(&mut self) {
        self.horizontal();
        self.vertical();
        self.diagonal_up();
        self.diagonal_down();
        self.horizontal();
        self.vertical();
    }

    fn row_end(&self) -> usize {
        (self.geom.image_height - self.geom.match_height) / self.geom.block_height + 1
    }

    fn col_end(&self) -> usize {
        (self.geom.image_width - self.geom.shade_width - self.geom.match_width)
            / self.geom.block_width
            + 1
    }

    fn diagonal_span(&self) -> f64 {
        let h = self.geom.block_height as f64;
        let w = self.geom.block_width as f64;
        (h * h + w * w).sqrt()
    }

    fn horizontal(&mut self) {
        let je = self.row_end();
        let ie = self.col_end();
        let (v, h) = (self.v_ofs, self.h_ofs);
        if je <= 2 * v || ie <= 2 * h {
            return;
        }
        let span = self.geom.block_width as f64;
        let p = *self.params;

        for jd in v..je - v {
            for id in h..ie - h {
                self.forward(id, h, jd, id);
            }
            let last = ie - h - 1;
            for id in (h..=last).rev() {
                self.backward(id, last, jd, id, span, p.ratio_inside, p.ratio_round, p.ratio_round);
            }
        }
    }

    fn vertical(&mut self) {
        let je = self.row_end();
        let ie = self.col_end();
        let (v, h) = (self.v_ofs, self.h_ofs);
        if je <= 2 * v || ie <= 2 * h {
            return;
        }
        let span = self.geom.block_height as f64;
        let p = *self.params;

        for id in h..ie - h {
            for jd in v..je - v {
                self.forward(jd, v, jd, id);
            }
            let last = je - v - 1;
            for jd in (v..=last).rev() {
                self.backward(jd, last, jd, id, span, p.ratio_inside, p.ratio_bottom, p.ratio_round);
            }
        }
    }

    /// Scan down-right lines starting along the top row, then down the left
    /// column. The scan head ratio switches from bottom to round once the
    /// head leaves the first row.
    fn diagonal_down(&mut self) {
        let je = self.row_end() as isize;
        let ie = self.col_end() as isize;
        let v = self.v_ofs as isize;
        let h = self.h_ofs as isize;
        if je <= 2 * v || ie <= 2 * h {
            return;
        }
        let span = self.diagonal_span();
        let p = *self.params;

        let mut on_first_row = true;
        let mut idd = h - 1;
        let mut jdd = v;
        let mut head_ratio = p.ratio_bottom;

        loop {
            if on_first_row {
                jdd = v;
                idd += 1;
                if idd > ie - (h + 1) {
                    on_first_row = false;
                }
            } else {
                jdd += 1;
                if jdd > je - (v + 1) {
                    break;
                }
                idd = h;
                head_ratio = p.ratio_round;
            }

            let (mut jd, mut id) = (jdd, idd);
            while jd < je - v && id < ie - h {
                self.forward(id as usize, idd as usize, jd as usize, id as usize);
                jd += 1;
                id += 1;
            }

            let last = id - 1;
            jd -= 1;
            id = last;
            while jd >= v && id >= h {
                self.backward(
                    id as usize,
                    last as usize,
                    jd as usize,
                    id as usize,
                    span,
                    p.ratio_inside,
                    head_ratio,
                    p.ratio_round,
                );
                jd -= 1;
                id -= 1;
            }
        }
    }

    /// Scan up-right lines starting along the top row, then down the right
    /// column; the line index runs over rows here.
    fn diagonal_up(&mut self) {
        let je = self.row_end() as isize;
        let ie = self.col_end() as isize;
        let v = self.v_ofs as isize;
        let h = self.h_ofs as isize;
        if je <= 2 * v || ie <= 2 * h {
            return;
        }
        let span = self.diagonal_span();
        let p = *self.params;

        let mut on_first_row = true;
        let mut idd = h - 1;
        let mut jdd = v;
        let mut head_ratio = p.ratio_bottom;

        loop {
            if on_first_row {
                jdd = v;
                idd += 1;
                if idd > ie - (h + 1) {
                    on_first_row = false;
                }
            } else {
                jdd += 1;
                if jdd > je - (v + 1) {
                    break;
                }
                idd = ie - (h + 1);
                head_ratio = p.ratio_round;
            }

            let (mut jd, mut id) = (jdd, idd);
            while jd < je - v && id >= h {
                self.forward(jd as usize, jdd as usize, jd as usize, id as usize);
                jd += 1;
                id -= 1;
            }

            let last = jd - 1;
            jd = last;
            id += 1;
            while jd >= v && id < ie - h {
                self.backward(
                    jd as usize,
                    last as usize,
                    jd as usize,
                    id as usize,
                    span,
                    p.ratio_inside,
                    head_ratio,
                    p.ratio_bottom,
                );
                jd -= 1;
                id += 1;
            }
        }
    }

    /// Ascending pass: record zero-run weights and carry the last valid
    /// disparity forward.
    fn forward(&mut self, ii: usize, sti: usize, jd: usize, id: usize) {
        let cols = self.geom.cols();
        let buf = &mut *self.buffers;

        buf.weight[ii] = 0;
        buf.disp[ii] = self.values[jd * cols + id];

        if ii != sti {
            if buf.disp[ii] == 0 {
                if buf.disp[ii - 1] > 0 {
                    buf.weight[ii] = buf.weight[ii - 1] + 1;
                    buf.disp[ii] = buf.disp[ii - 1];
                } else if buf.weight[ii - 1] > 0 {
                    // Run starting at the line head: weights only.
                    buf.weight[ii] = buf.weight[ii - 1] + 1;
                }
            }
        } else if buf.disp[ii] == 0 {
            buf.weight[ii] = 1;
        }
    }

    /// Descending pass: resolve weights into interpolated disparities.
    #[allow(clippy::too_many_arguments)]
    fn backward(
        &mut self,
        ii: usize,
        sti: usize,
        jd: usize,
        id: usize,
        span: f64,
        mid_ratio: f64,
        head_ratio: f64,
        tail_ratio: f64,
    ) {
        let cols = self.geom.cols();
        let p = self.params;
        let scale = f64::from(SUBPIXEL_SCALE);
        let buf = &mut *self.buffers;

        // A zero run reaching the scan tail has no far flank; synthesise its
        // weight from the present disparity so the fill width stays bounded.
        if ii == sti && buf.weight[ii] > 0 {
            buf.weight[ii + 1] =
                (f64::from(buf.disp[ii]) / scale / span * (2.0 * mid_ratio - tail_ratio)) as i32;
            buf.disp[ii + 1] = buf.disp[ii];
        }

        let mut weight_front = buf.weight[ii + 1];
        let disp_front = buf.disp[ii + 1];

        // A run reaching the scan head: inherit the far value and synthesise
        // the head weight.
        if buf.disp[ii] == 0 && buf.weight[ii] > 0 {
            buf.disp[ii] = disp_front;
            if weight_front == 0 {
                weight_front =
                    (f64::from(disp_front) / scale / span * (2.0 * mid_ratio - head_ratio)) as i32;
            }
        }

        if buf.disp[ii] > 0 && buf.weight[ii] > 0 {
            weight_front += 1;

            let gated = self.hole_fill || self.contrast[jd * cols + id] <= p.contrast_limit;
            if gated {
                let low = (p.low_limit * scale) as i32;
                if disp_front >= low && buf.disp[ii] >= low {
                    let run_width = f64::from(weight_front + buf.weight[ii]) * span;
                    let reach_front = f64::from(disp_front) * mid_ratio / scale;
                    let reach_back = f64::from(buf.disp[ii]) * mid_ratio / scale;

                    let narrow_enough = if self.hole_fill {
                        run_width < p.hole_size + span
                    } else {
                        run_width <= reach_front + reach_back
                    };

                    if narrow_enough {
                        let diff = f64::from((disp_front - buf.disp[ii]).abs() / SUBPIXEL_SCALE);
                        if diff / run_width < p.slope_limit {
                            let back = buf.disp[ii] as f32;
                            let front = disp_front as f32;
                            let filled = (back * weight_front as f32
                                + front * buf.weight[ii] as f32)
                                / (weight_front + buf.weight[ii]) as f32;
                            self.values[jd * cols + id] = filled as i32;
                        }
                    }
                }
            }

            buf.weight[ii] = weight_front;
            buf.disp[ii] = disp_front;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(cols: usize, rows: usize) -> BlockGeometry {
        BlockGeometry {
            image_width: cols * 4,
            image_height: rows * 4,
            block_height: 4,
            block_width: 4,
            match_height: 4,
            match_width: 4,
            offset_x: 0,
            offset_y: 0,
            depth: 64,
            shade_width: 0,
        }
    }

    fn run_complement(
        geom: &BlockGeometry,
        params: &ComplementParams,
        values: &mut [i32],
        contrast: &[i32],
    ) {
        let mut buffers = LineBuffers::with_capacity(geom.cols().max(geom.rows()));
        let mut completer =
            Completer::new(geom, params, 0, 0, values, contrast, &mut buffers, false);
        completer.run_complement();
    }

    #[test]
    fn test_small_gap_is_interpolated() {
        let geom = geometry(24, 8);
        let cols = geom.cols();
        let params = ComplementParams {
            slope_limit: 1.0,
            ..ComplementParams::default()
        };

        // One row: 20.0 px on both sides of a 3-block zero gap. Reach is
        // 20 * 1.0 = 20 px per flank, gap is 3 * 4 = 12 px: fillable.
        let mut values = vec![20_000i32; cols * geom.rows()];
        let contrast = vec![0i32; cols * geom.rows()];
        for id in 10..13 {
            for jd in 0..geom.rows() {
                values[jd * cols + id] = 0;
            }
        }

        run_complement(&geom, &params, &mut values, &contrast);

        for id in 10..13 {
            let v = values[3 * cols + id];
            assert!(
                (v - 20_000).abs() < 500,
                "gap block {id} should interpolate near 20.0, got {v}"
            );
        }
    }

    #[test]
    fn test_wide_gap_is_left_open() {
        let geom = geometry(40, 8);
        let cols = geom.cols();
        let params = ComplementParams::default();

        // 5.0 px flanks can reach 5 px each; a 20-block (80 px) gap must
        // stay open.
        let mut values = vec![5_000i32; cols * geom.rows()];
        let contrast = vec![0i32; cols * geom.rows()];
        for id in 10..30 {
            for jd in 0..geom.rows() {
                values[jd * cols + id] = 0;
            }
        }

        run_complement(&geom, &params, &mut values, &contrast);

        assert_eq!(values[4 * cols + 20], 0, "centre of wide gap must stay 0");
    }

    #[test]
    fn test_low_disparity_flanks_do_not_fill() {
        let geom = geometry(24, 8);
        let cols = geom.cols();
        let params = ComplementParams::default(); // low_limit = 5.0

        // Flanks at 3.0 px are below the minimum fill disparity.
        let mut values = vec![3_000i32; cols * geom.rows()];
        let contrast = vec![0i32; cols * geom.rows()];
        for jd in 0..geom.rows() {
            values[jd * cols + 11] = 0;
        }

        run_complement(&geom, &params, &mut values, &contrast);
        assert_eq!(values[3 * cols + 11], 0);
    }

    #[test]
    fn test_strong_contrast_blocks_not_overwritten() {
        let geom = geometry(24, 8);
        let cols = geom.cols();
        let params = ComplementParams {
            slope_limit: 1.0,
            ..ComplementParams::default()
        };

        let mut values = vec![20_000i32; cols * geom.rows()];
        // Every block far above the contrast limit: a textured block with no
        // disparity is a real mismatch, not a weak-pattern hole.
        let contrast = vec![500i32; cols * geom.rows()];
        for jd in 0..geom.rows() {
            values[jd * cols + 11] = 0;
        }

        run_complement(&geom, &params, &mut values, &contrast);
        assert_eq!(values[3 * cols + 11], 0);
    }

    #[test]
    fn test_steep_gradient_rejected() {
        let geom = geometry(24, 8);
        let cols = geom.cols();
        let params = ComplementParams {
            slope_limit: 0.01,
            ..ComplementParams::default()
        };

        // 10 px vs 30 px across a 2-block gap: gradient way over 0.01.
        let mut values = vec![0i32; cols * geom.rows()];
        let contrast = vec![0i32; cols * geom.rows()];
        for jd in 0..geom.rows() {
            for id in 0..10 {
                values[jd * cols + id] = 10_000;
            }
            for id in 12..cols {
                values[jd * cols + id] = 30_000;
            }
        }

        run_complement(&geom, &params, &mut values, &contrast);
        assert_eq!(values[3 * cols + 10], 0);
        assert_eq!(values[3 * cols + 11], 0);
    }

    #[test]
    fn test_completion_is_idempotent_after_two_cycles() {
        let geom = geometry(32, 16);
        let cols = geom.cols();
        let params = ComplementParams {
            slope_limit: 1.0,
            ..ComplementParams::default()
        };

        let mut values = vec![0i32; cols * geom.rows()];
        let contrast = vec![0i32; cols * geom.rows()];
        // A textured field of valid disparities with scattered holes.
        for jd in 0..geom.rows() {
            for id in 0..cols {
                let v = 15_000 + ((jd * 7 + id * 13) % 40) as i32 * 25;
                values[jd * cols + id] = if (jd * cols + id) % 5 == 0 { 0 } else { v };
            }
        }

        run_complement(&geom, &params, &mut values, &contrast);
        run_complement(&geom, &params, &mut values, &contrast);
        let after_two = values.clone();

        run_complement(&geom, &params, &mut values, &contrast);
        assert_eq!(values, after_two, "third cycle must change nothing");
    }

    #[test]
    fn test_hole_fill_mode_ignores_contrast() {
        let geom = geometry(24, 8);
        let cols = geom.cols();
        let params = ComplementParams {
            slope_limit: 1.0,
            hole_size: 16.0,
            ..ComplementParams::default()
        };

        let mut values = vec![20_000i32; cols * geom.rows()];
        let contrast = vec![500i32; cols * geom.rows()];
        for jd in 0..geom.rows() {
            values[jd * cols + 11] = 0;
        }

        let mut buffers = LineBuffers::with_capacity(geom.cols().max(geom.rows()));
        let mut completer = Completer::new(
            &geom,
            &params,
            0,
            0,
            &mut values,
            &contrast,
            &mut buffers,
            true,
        );
        completer.run_hole_fill();

        assert!(
            values[3 * cols + 11] > 0,
            "hole-fill mode must fill despite contrast"
        );
    }
}
