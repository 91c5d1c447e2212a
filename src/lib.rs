//! Structured-light capture rig.
//!
//! A projector shows a sequence of coded patterns while N synchronized
//! cameras save one frame of each:
//! - Camera acquisition behind a provider/source abstraction
//! - Pattern sequencing on a display surface
//! - A capture coordinator that paces both
//! - Gray code pattern generation

pub mod camera;
pub mod capture;
pub mod config;
pub mod export;
pub mod projector;
pub mod render;
