//! Visualization analysis
//!
//! Each capture or playback component owns an [`AnalyserTap`] written from its
//! audio callback. A [`SpectrumAnalyzer`] reads a tap on demand and buckets the
//! result into bands for bar rendering.

pub mod spectrum;
pub mod tap;

pub use spectrum::{analyze, AnalysisKind, BinningStrategy, Spectrum, SpectrumAnalyzer};
pub use tap::AnalyserTap;
