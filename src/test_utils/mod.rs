//! Test utilities for `trigger-dissect`
//!
//! Provides synthetic Trigger 5/6 packet generation for exercising the
//! reassembly pipeline without an adapter or a recorded capture.

pub mod packet_generator;

pub use packet_generator::*;
