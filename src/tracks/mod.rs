//! Playback track management

pub mod scheduler;
pub mod track;

pub use scheduler::{ChunkOutcome, IgnoreReason, InterruptOffset, PlayerEvent, Scheduler};
pub use track::{ChunkPlacement, ScheduledChunk, TrackBuffer, TrackId, TrackState};
