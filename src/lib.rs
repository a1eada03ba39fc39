//! Core library for the stereo disparity processing pipeline.
//!
//! This library turns a stream of rectified stereo frames into sub-pixel
//! disparity maps. It contains the pipeline controller (frame rings plus a
//! dedicated worker thread), the block-matching stage, the disparity filter
//! stage, and the parameter-file plumbing shared by the stages. Camera
//! access, frame decoding and display are external collaborators reached
//! through the traits in [`decoder`].

pub mod band;
pub mod block;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod filter;
pub mod frame;
pub mod matcher;
pub mod params;
pub mod ring;

pub use config::{CameraModel, EngineConfig};
pub use engine::{StartMode, StereoEngine};
pub use error::{StereoError, StereoResult};
pub use frame::{ImageFrame, ResultFrame};
