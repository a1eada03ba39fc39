//! Frame data model.
//!
//! [`ImageFrame`] is one rectified stereo sample as delivered by the camera
//! or replay collaborator: up to three slots (latest, previous, merged) of
//! planar images plus capture metadata and the camera intrinsics needed to
//! derive depth from disparity. [`ResultFrame`] is what the pipeline
//! publishes: a deep copy of the frame plus the per-stage processing status.
//!
//! Plane buffers are allocated once for the maximum image size and reused;
//! a plane with `width == 0` is unused. No stage mutates an input frame —
//! writes go to caller-provided output planes or into the result slot.

use chrono::{DateTime, Utc};

/// Number of frame-data slots carried per sample.
pub const FRAME_DATA_COUNT: usize = 3;

/// Shutter control mode the sample was captured with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShutterMode {
    /// Fixed exposure.
    #[default]
    Manual,
    /// Sensor-side auto exposure.
    Auto,
    /// Alternating exposures merged into one frame.
    DoubleCombined,
    /// Alternating exposures delivered independently.
    DoubleIndependent,
}

/// Colour capture mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorMode {
    /// Grayscale only.
    #[default]
    Off,
    /// Colour planes populated.
    On,
}

/// Identifies one of the three frame-data slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameSlot {
    /// Most recent capture.
    Latest,
    /// Previous capture (double-shutter modes).
    Previous,
    /// Merged image produced by the frame decoder.
    Merged,
}

impl FrameSlot {
    /// Slot index into [`ImageFrame::frame_data`].
    pub fn index(self) -> usize {
        match self {
            FrameSlot::Latest => 0,
            FrameSlot::Previous => 1,
            FrameSlot::Merged => 2,
        }
    }
}

/// Camera intrinsics required to turn disparity into depth.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CameraIntrinsics {
    /// Disparity at infinity.
    pub d_inf: f32,
    /// Baseline times focal length.
    pub bf: f32,
    /// Baseline length in metres.
    pub base_length: f32,
    /// Depth offset.
    pub dz: f32,
}

impl CameraIntrinsics {
    /// Depth in metres for a sub-pixel disparity in pixels. Disparities at
    /// or below the infinity point carry no depth and map to 0.
    pub fn depth(&self, disparity: f32) -> f32 {
        let d = disparity - self.d_inf;
        if d <= 0.0 {
            0.0
        } else {
            self.bf / d + self.dz
        }
    }
}

/// One planar 8-bit image.
#[derive(Clone, Debug, Default)]
pub struct ImagePlane {
    /// Valid width in pixels; 0 marks the plane unused.
    pub width: usize,
    /// Valid height in pixels.
    pub height: usize,
    /// Channels per pixel (1 or 3).
    pub channels: usize,
    /// Pixel buffer, sized for the maximum image at allocation.
    pub data: Vec<u8>,
}

impl ImagePlane {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            width: 0,
            height: 0,
            channels: 0,
            data: vec![0; capacity],
        }
    }

    /// Number of valid bytes in `data`.
    pub fn valid_len(&self) -> usize {
        self.width * self.height * self.channels
    }

    /// True when the plane carries an image.
    pub fn is_present(&self) -> bool {
        self.width > 0
    }

    /// Set the geometry and copy `pixels` in. `pixels` must match the
    /// geometry; the backing buffer grows if it was allocated smaller.
    pub fn fill(&mut self, width: usize, height: usize, channels: usize, pixels: &[u8]) {
        debug_assert!(pixels.len() >= width * height * channels);
        self.width = width;
        self.height = height;
        self.channels = channels;
        let n = width * height * channels;
        if self.data.len() < n {
            self.data.resize(n, 0);
        }
        self.data[..n].copy_from_slice(&pixels[..n]);
    }

    /// Copy geometry and valid pixels from another plane, growing the
    /// backing buffer if this plane was allocated smaller.
    pub fn copy_from(&mut self, src: &ImagePlane) {
        self.width = src.width;
        self.height = src.height;
        self.channels = src.channels;
        let n = src.valid_len();
        if n > 0 {
            if self.data.len() < n {
                self.data.resize(n, 0);
            }
            self.data[..n].copy_from_slice(&src.data[..n]);
        }
    }

    /// Mark the plane unused.
    pub fn clear(&mut self) {
        self.width = 0;
        self.height = 0;
        self.channels = 0;
    }
}

/// One planar 32-bit float image (per-pixel depth / disparity).
#[derive(Clone, Debug, Default)]
pub struct DepthPlane {
    /// Valid width in pixels; 0 marks the plane unused.
    pub width: usize,
    /// Valid height in pixels.
    pub height: usize,
    /// Value buffer, sized for the maximum image at allocation.
    pub data: Vec<f32>,
}

impl DepthPlane {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            width: 0,
            height: 0,
            data: vec![0.0; capacity],
        }
    }

    /// True when the plane carries data.
    pub fn is_present(&self) -> bool {
        self.width > 0
    }

    /// Copy geometry and valid values from another plane, growing the
    /// backing buffer if this plane was allocated smaller.
    pub fn copy_from(&mut self, src: &DepthPlane) {
        self.width = src.width;
        self.height = src.height;
        let n = src.width * src.height;
        if n > 0 {
            if self.data.len() < n {
                self.data.resize(n, 0.0);
            }
            self.data[..n].copy_from_slice(&src.data[..n]);
        }
    }

    /// Mark the plane unused.
    pub fn clear(&mut self) {
        self.width = 0;
        self.height = 0;
    }
}

/// Camera-side status attached to each frame-data slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct CameraStatus {
    /// Non-zero when the camera reported a capture problem.
    pub error_code: i32,
    /// Interval between captures, in milliseconds.
    pub tact_time: u64,
}

/// One slot of planar images plus capture metadata.
#[derive(Clone, Debug, Default)]
pub struct FrameData {
    /// Monotonically increasing capture number.
    pub frame_no: i64,
    /// Analog gain at capture.
    pub gain: i32,
    /// Exposure at capture.
    pub exposure: i32,
    /// Camera-reported status.
    pub camera_status: CameraStatus,
    /// Base image: the right camera, reference side for matching.
    pub p1: ImagePlane,
    /// Compare image: the left camera.
    pub p2: ImagePlane,
    /// Colour image.
    pub color: ImagePlane,
    /// Per-pixel depth.
    pub depth: DepthPlane,
    /// Raw sensor data.
    pub raw: ImagePlane,
    /// Raw colour sensor data.
    pub raw_color: ImagePlane,
    /// Bayer pattern, base side.
    pub bayer_base: ImagePlane,
    /// Bayer pattern, compare side.
    pub bayer_compare: ImagePlane,
}

impl FrameData {
    fn with_capacity(one_frame: usize) -> Self {
        Self {
            frame_no: 0,
            gain: 0,
            exposure: 0,
            camera_status: CameraStatus::default(),
            p1: ImagePlane::with_capacity(one_frame),
            p2: ImagePlane::with_capacity(one_frame),
            color: ImagePlane::with_capacity(one_frame * 3),
            depth: DepthPlane::with_capacity(one_frame),
            raw: ImagePlane::with_capacity(one_frame * 2),
            raw_color: ImagePlane::with_capacity(one_frame * 2),
            bayer_base: ImagePlane::with_capacity(one_frame * 2),
            bayer_compare: ImagePlane::with_capacity(one_frame * 2),
        }
    }

    /// Copy metadata and every present plane from `src`.
    pub fn copy_from(&mut self, src: &FrameData) {
        self.frame_no = src.frame_no;
        self.gain = src.gain;
        self.exposure = src.exposure;
        self.camera_status = src.camera_status;
        self.p1.copy_from(&src.p1);
        self.p2.copy_from(&src.p2);
        self.color.copy_from(&src.color);
        self.depth.copy_from(&src.depth);
        self.raw.copy_from(&src.raw);
        self.raw_color.copy_from(&src.raw_color);
        self.bayer_base.copy_from(&src.bayer_base);
        self.bayer_compare.copy_from(&src.bayer_compare);
    }

    /// Reset metadata and mark all planes unused.
    pub fn clear(&mut self) {
        self.frame_no = 0;
        self.gain = 0;
        self.exposure = 0;
        self.camera_status = CameraStatus::default();
        self.p1.clear();
        self.p2.clear();
        self.color.clear();
        self.depth.clear();
        self.raw.clear();
        self.raw_color.clear();
        self.bayer_base.clear();
        self.bayer_compare.clear();
    }
}

/// One rectified stereo sample.
#[derive(Clone, Debug, Default)]
pub struct ImageFrame {
    /// Shutter mode at capture.
    pub shutter_mode: ShutterMode,
    /// Colour mode at capture.
    pub color_mode: ColorMode,
    /// Camera intrinsics for depth derivation.
    pub intrinsics: CameraIntrinsics,
    /// Latest / previous / merged slots.
    pub frame_data: Vec<FrameData>,
}

impl ImageFrame {
    /// Allocate a frame with plane capacity for `width x height` pixels.
    pub fn with_max_size(width: usize, height: usize) -> Self {
        let one_frame = width * height;
        Self {
            shutter_mode: ShutterMode::Manual,
            color_mode: ColorMode::Off,
            intrinsics: CameraIntrinsics::default(),
            frame_data: (0..FRAME_DATA_COUNT)
                .map(|_| FrameData::with_capacity(one_frame))
                .collect(),
        }
    }

    /// Access a slot by identity.
    pub fn slot(&self, slot: FrameSlot) -> &FrameData {
        &self.frame_data[slot.index()]
    }

    /// Mutable access to a slot.
    pub fn slot_mut(&mut self, slot: FrameSlot) -> &mut FrameData {
        &mut self.frame_data[slot.index()]
    }

    /// Frame number of the latest slot; 0 for an unallocated frame.
    pub fn frame_no(&self) -> i64 {
        self.frame_data.first().map_or(0, |fd| fd.frame_no)
    }

    /// Deep-copy metadata and all slots from `src`. A default-constructed
    /// frame grows the slots it is missing.
    pub fn copy_from(&mut self, src: &ImageFrame) {
        self.shutter_mode = src.shutter_mode;
        self.color_mode = src.color_mode;
        self.intrinsics = src.intrinsics;
        if self.frame_data.len() < src.frame_data.len() {
            self.frame_data
                .resize_with(src.frame_data.len(), FrameData::default);
        }
        for (dst, s) in self.frame_data.iter_mut().zip(src.frame_data.iter()) {
            dst.copy_from(s);
        }
    }

    /// Reset all slots.
    pub fn clear(&mut self) {
        self.shutter_mode = ShutterMode::Manual;
        self.color_mode = ColorMode::Off;
        self.intrinsics = CameraIntrinsics::default();
        for fd in &mut self.frame_data {
            fd.clear();
        }
    }
}

/// Status of one stage invocation, recorded on the result.
#[derive(Clone, Debug, Default)]
pub struct StageStatus {
    /// Stage display name.
    pub name: String,
    /// 0 on success; stage-specific code otherwise.
    pub error_code: i32,
    /// Wall-clock processing time.
    pub processing_time: std::time::Duration,
}

/// Processing summary attached to each published result.
#[derive(Clone, Debug, Default)]
pub struct ProcResult {
    /// 0 on success.
    pub error_code: i32,
    /// Interval between consecutive results, in milliseconds.
    pub tact_time: u64,
    /// Per-stage status in execution order.
    pub stage_status: Vec<StageStatus>,
}

impl ProcResult {
    /// Reset for reuse in a ring slot.
    pub fn clear(&mut self) {
        self.error_code = 0;
        self.tact_time = 0;
        self.stage_status.clear();
    }
}

/// What the pipeline publishes for each processed frame.
#[derive(Clone, Debug, Default)]
pub struct ResultFrame {
    /// When the worker finished the frame.
    pub completed_at: Option<DateTime<Utc>>,
    /// Deep copy of the input frame; the latest slot's depth plane carries
    /// the per-pixel float disparity.
    pub image: ImageFrame,
    /// 8-bit disparity display image, scaled by `255 / depth`.
    pub disparity_display: ImagePlane,
    /// Per-frame processing status.
    pub proc: ProcResult,
}

impl ResultFrame {
    /// Allocate a result with plane capacity for `width x height` pixels.
    pub fn with_max_size(width: usize, height: usize) -> Self {
        Self {
            completed_at: None,
            image: ImageFrame::with_max_size(width, height),
            disparity_display: ImagePlane::with_capacity(width * height),
            proc: ProcResult::default(),
        }
    }

    /// Deep-copy another result into this one.
    pub fn copy_from(&mut self, src: &ResultFrame) {
        self.completed_at = src.completed_at;
        self.image.copy_from(&src.image);
        self.disparity_display.copy_from(&src.disparity_display);
        self.proc = src.proc.clone();
    }

    /// Reset for reuse in a ring slot.
    pub fn clear(&mut self) {
        self.completed_at = None;
        self.image.clear();
        self.disparity_display.clear();
        self.proc.clear();
    }
}
