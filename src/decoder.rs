//! External collaborator contracts.
//!
//! The camera (or file replay) source and the frame decoder are not part of
//! this library; the pipeline reaches them only through these traits. The
//! decoder consumes camera-side disparity data and, in double-shutter mode,
//! produces the merged image the filter operates on.

use crate::block::BlockDisparity;
use crate::error::StereoResult;
use crate::frame::ImageFrame;
use crate::params::ParameterSet;

/// Outcome of a frame acquisition attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceStatus {
    /// A frame was written to the output.
    Ok,
    /// No frame is available yet; try again.
    NoImage,
    /// The source failed with a device-specific code.
    Error(i32),
}

/// A producer of rectified stereo frames (camera SDK or file replay).
///
/// Frames arrive at irregular rates; the pipeline is robust to drops.
pub trait FrameSource: Send {
    /// Fill `frame` with the next available sample.
    fn next_frame(&mut self, frame: &mut ImageFrame) -> SourceStatus;
}

/// The frame-decoder stage collaborator.
///
/// Runs when the pipeline is started with `frame_decoder` enabled. `input`
/// is the submitted frame, `output` the result slot (already a deep copy of
/// the input); the decoder fills the block grid and, for double-shutter
/// captures, the merged slot of `output`.
pub trait FrameDecoder: Send {
    /// Decode a single-exposure frame.
    fn decode(
        &mut self,
        input: &ImageFrame,
        output: &mut ImageFrame,
        out: &mut BlockDisparity,
    ) -> StereoResult<()>;

    /// Decode a double-shutter frame, merging the bright and dark exposures
    /// into the output's merged slot.
    fn decode_double_shutter(
        &mut self,
        input: &ImageFrame,
        output: &mut ImageFrame,
        out: &mut BlockDisparity,
    ) -> StereoResult<()>;

    /// Flat view of the decoder's tunables, if it has any.
    fn parameter_set(&self) -> ParameterSet {
        ParameterSet::default()
    }

    /// Apply a flat parameter view.
    fn apply_parameter_set(&mut self, _set: &ParameterSet) -> StereoResult<()> {
        Ok(())
    }
}
