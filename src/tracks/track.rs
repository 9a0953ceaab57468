//! One logical playback stream and its lifecycle

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

use crate::audio::buffer::i16_to_f32;

/// Caller-supplied track identifier. The empty id is the anonymous track.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn anonymous() -> Self {
        Self(String::new())
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TrackId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TrackId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_anonymous() {
            write!(f, "<anonymous>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Track lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Created, nothing appended yet
    Unstarted,
    /// Has audio queued; the clock has not reached its first sample
    Scheduled,
    /// The clock has reached its first sample
    Playing,
    /// Played out and idle for the grace period
    Drained,
    /// Cut off by an interrupt
    Interrupted,
}

impl TrackState {
    pub fn can_transition_to(self, next: TrackState) -> bool {
        use TrackState::*;
        matches!(
            (self, next),
            (Unstarted, Scheduled)
                | (Scheduled, Playing)
                | (Playing, Drained)
                | (Unstarted | Scheduled | Playing, Interrupted)
        )
    }

    /// Scheduled or playing: eligible to be reported by an interrupt
    pub fn is_live(self) -> bool {
        matches!(self, TrackState::Scheduled | TrackState::Playing)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TrackState::Drained | TrackState::Interrupted)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid track transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: TrackState,
    pub to: TrackState,
}

/// A chunk pinned to the output clock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledChunk {
    /// Clock sample at which the chunk's first sample plays
    pub start: u64,
    /// Index of the chunk's first sample in the track timeline
    pub offset: u64,
    pub samples: Vec<i16>,
}

impl ScheduledChunk {
    pub fn len(&self) -> u64 {
        self.samples.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Clock sample just past the chunk
    pub fn end(&self) -> u64 {
        self.start + self.len()
    }
}

/// Where an appended chunk landed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPlacement {
    pub track_id: TrackId,
    /// Clock sample of the chunk's first sample
    pub start: u64,
    /// Track timeline index of the chunk's first sample
    pub offset: u64,
    pub len: u64,
    /// Silence inserted before the chunk because the track had starved
    pub gap: u64,
}

/// Queued audio of one track plus its cursors
#[derive(Debug)]
pub struct TrackBuffer {
    id: TrackId,
    state: TrackState,
    chunks: VecDeque<ScheduledChunk>,
    /// Samples appended so far; the next chunk's track offset
    written: u64,
    /// Samples rendered so far
    played: u64,
    /// Clock sample where the next appended chunk begins
    cursor: u64,
    first_start: Option<u64>,
    created_seq: u64,
    underruns: u32,
}

impl TrackBuffer {
    pub fn new(id: TrackId, created_seq: u64, now: u64) -> Self {
        Self {
            id,
            state: TrackState::Unstarted,
            chunks: VecDeque::new(),
            written: 0,
            played: 0,
            cursor: now,
            first_start: None,
            created_seq,
            underruns: 0,
        }
    }

    pub fn id(&self) -> &TrackId {
        &self.id
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn transition(&mut self, next: TrackState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Schedule `samples` right after the previous chunk, or at `now` if the
    /// track has starved past its cursor.
    pub fn append(&mut self, samples: Vec<i16>, now: u64) -> ChunkPlacement {
        let start = self.cursor.max(now);
        let gap = start - self.cursor;
        if gap > 0 {
            self.underruns += 1;
        }
        if self.state == TrackState::Unstarted {
            self.state = TrackState::Scheduled;
            self.first_start = Some(start);
        }

        let len = samples.len() as u64;
        let offset = self.written;
        self.chunks.push_back(ScheduledChunk { start, offset, samples });
        self.written += len;
        self.cursor = start + len;

        ChunkPlacement {
            track_id: self.id.clone(),
            start,
            offset,
            len,
            gap,
        }
    }

    /// Mix this track's samples for the block starting at clock `block_start`
    /// into `out`, dropping chunks that finish inside the block. Returns the
    /// number of samples rendered.
    pub fn render_into(&mut self, out: &mut [f32], block_start: u64) -> u64 {
        let block_end = block_start + out.len() as u64;
        let mut rendered = 0;

        for chunk in &self.chunks {
            if chunk.start >= block_end {
                break;
            }
            let from = chunk.start.max(block_start);
            let to = chunk.end().min(block_end);
            if from >= to {
                continue;
            }
            let src = &chunk.samples[(from - chunk.start) as usize..(to - chunk.start) as usize];
            let dst = &mut out[(from - block_start) as usize..(to - block_start) as usize];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += i16_to_f32(*s);
            }
            rendered += to - from;
        }

        while self.chunks.front().is_some_and(|c| c.end() <= block_end) {
            self.chunks.pop_front();
        }

        self.played += rendered;
        rendered
    }

    /// Chunks not yet fully played, in clock order
    pub fn chunks(&self) -> impl Iterator<Item = &ScheduledChunk> {
        self.chunks.iter()
    }

    /// Every appended sample has been rendered
    pub fn is_exhausted(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn played(&self) -> u64 {
        self.played
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn first_start(&self) -> Option<u64> {
        self.first_start
    }

    pub fn created_seq(&self) -> u64 {
        self.created_seq
    }

    pub fn underruns(&self) -> u32 {
        self.underruns
    }
}
