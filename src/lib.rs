//! # Voice Pipeline
//!
//! Streaming audio core for realtime voice clients: framed microphone
//! capture, gapless playback of network PCM16 chunks with sample-accurate
//! interruption, and live spectrum analysis of both streams.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   frames    ┌───────────────┐   PCM16 bytes  ┌──────────────┐
//! │  Microphone  │────────────▶│  FrameSource  │──────────────▶ │  transport   │
//! └──────────────┘  (backend)  │ audio::capture│  (callback)    │  (external)  │
//!                              └──────┬────────┘                └──────┬───────┘
//!                                     │ input tap                      │ chunks + track id
//!                                     ▼                                ▼
//!                              ┌───────────────┐               ┌───────────────┐
//!                              │SpectrumAnalyzer│◀── output tap │ StreamPlayer  │
//!                              │   analysis     │               │audio::playback│
//!                              └───────────────┘               │  + tracks     │
//!                                                              └──────┬────────┘
//!                                                                     │ render (sample clock)
//!                                                                     ▼
//!                                                              ┌───────────────┐
//!                                                              │ Output device │
//!                                                              └───────────────┘
//! ```
//!
//! Devices are reached through [`audio::AudioBackend`]; [`audio::CpalBackend`]
//! drives real hardware and [`audio::SyntheticBackend`] is clocked by hand.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod tracks;

pub use analysis::{AnalysisKind, BinningStrategy, Spectrum, SpectrumAnalyzer};
pub use audio::{AudioFrame, CaptureToken, FrameSource, StreamPlayer};
pub use error::{Error, Result};
pub use tracks::{InterruptOffset, PlayerEvent, TrackId, TrackState};

/// Pipeline-wide constants
pub mod constants {
    /// Default sample rate for capture and playback
    pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

    /// Lowest sample rate accepted by `configure`
    pub const MIN_SAMPLE_RATE: u32 = 3_000;

    /// Highest sample rate accepted by `configure`
    pub const MAX_SAMPLE_RATE: u32 = 384_000;

    /// Default capture frame duration in milliseconds
    pub const DEFAULT_FRAME_SIZE_MS: f32 = 100.0;

    /// Longest capture frame accepted by `configure`, in milliseconds
    pub const MAX_FRAME_SIZE_MS: f32 = 5_000.0;

    /// How long a starved track may wait for more audio before it is drained
    pub const DEFAULT_DRAIN_GRACE_MS: u32 = 250;

    /// Frames queued between the capture callback and the dispatch thread
    pub const FRAME_QUEUE_CAPACITY: usize = 256;

    /// Interrupted track ids remembered so their late chunks are discarded
    pub const INTERRUPTED_TRACK_HISTORY: usize = 256;

    /// Asynchronous events buffered before new ones are dropped
    pub const EVENT_QUEUE_CAPACITY: usize = 64;

    /// Default analyser window length (must be a power of 2)
    pub const DEFAULT_FFT_SIZE: usize = 8192;

    /// Default smoothing time constant for frequency queries
    pub const DEFAULT_SMOOTHING: f32 = 0.1;

    /// Decibel value mapped to 0.0 in normalized output
    pub const DEFAULT_MIN_DECIBELS: f32 = -100.0;

    /// Decibel value mapped to 1.0 in normalized output
    pub const DEFAULT_MAX_DECIBELS: f32 = -30.0;
}
