//! Metrics for the pipe transport
//!
//! Thin wrappers over the `metrics` facade so call sites stay one line and
//! metric names live in one place. No recorder is installed by this crate;
//! without one every call is a no-op.

pub mod counters;
pub mod histograms;
pub mod labels;
