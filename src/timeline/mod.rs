//! Channel-time authority
//!
//! Producers decode in media time (the PTS inside an asset); the output runs
//! in channel time (microseconds since the channel epoch). The controller in
//! this module is the only component allowed to convert one into the other.

mod controller;
mod mapping;

pub use controller::{AdmissionResult, TimelineController, TimelineStats};
pub use mapping::SegmentMapping;
