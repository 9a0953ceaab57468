//! Sample-clock scheduler behind the stream player
//!
//! The clock counts output samples rendered. Chunks are pinned to clock
//! positions when appended; rendering only reads those positions, so network
//! jitter never reorders or overlaps audio within a track.

use crossbeam_channel::Sender;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

use super::track::{ChunkPlacement, TrackBuffer, TrackId, TrackState};
use crate::constants::INTERRUPTED_TRACK_HISTORY;
use crate::error::DeviceError;

/// Where playback of the audible track was cut off
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptOffset {
    pub track_id: TrackId,
    /// Samples of the track that were rendered before the cut
    pub offset: u64,
}

/// Asynchronous player notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// The clock reached the track's first sample
    TrackStarted { track_id: TrackId, start: u64 },
    /// The track played out and stayed idle for the grace period
    TrackDrained { track_id: TrackId, samples: u64 },
    /// A chunk arrived after its track had starved
    Underrun { track_id: TrackId, gap: u64 },
    /// The output device failed mid-stream
    DeviceLost(DeviceError),
}

/// Why a chunk was not scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Empty,
    /// The track was interrupted; the remote side was told to cancel it
    TrackInterrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Scheduled(ChunkPlacement),
    Ignored(IgnoreReason),
}

pub(crate) fn emit(events: &Option<Sender<PlayerEvent>>, event: PlayerEvent) {
    if let Some(tx) = events {
        // Never block the audio thread on a slow consumer
        let _ = tx.try_send(event);
    }
}

/// Owns every live track and the output clock
#[derive(Debug)]
pub struct Scheduler {
    /// Output samples rendered so far
    clock: u64,

    /// Idle samples after which a played-out track is drained
    drain_grace: u64,

    /// Scheduled and playing tracks
    tracks: HashMap<TrackId, TrackBuffer>,

    /// Recently interrupted named tracks; their chunks are discarded
    sealed: HashSet<TrackId>,

    /// Seal order, oldest first, for evicting past the history limit
    sealed_order: VecDeque<TrackId>,

    /// Creation counter used to break ties between tracks
    next_seq: u64,

    /// Optional event sink
    events: Option<Sender<PlayerEvent>>,

    /// Reused mono render buffer
    mix: Vec<f32>,
}

impl Scheduler {
    /// `drain_grace` is in samples
    pub fn new(drain_grace: u64) -> Self {
        Self {
            clock: 0,
            drain_grace,
            tracks: HashMap::new(),
            sealed: HashSet::new(),
            sealed_order: VecDeque::new(),
            next_seq: 0,
            events: None,
            mix: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Sender<PlayerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Output samples rendered so far
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn append(&mut self, track_id: TrackId, samples: Vec<i16>) -> ChunkOutcome {
        if samples.is_empty() {
            return ChunkOutcome::Ignored(IgnoreReason::Empty);
        }
        if self.sealed.contains(&track_id) {
            tracing::debug!("Discarding chunk for interrupted track {}", track_id);
            return ChunkOutcome::Ignored(IgnoreReason::TrackInterrupted);
        }

        let now = self.clock;
        let next_seq = &mut self.next_seq;
        let track = self.tracks.entry(track_id.clone()).or_insert_with(|| {
            let track = TrackBuffer::new(track_id.clone(), *next_seq, now);
            *next_seq += 1;
            track
        });

        let placement = track.append(samples, now);
        tracing::debug!(
            "Track {}: {} samples at clock {} (offset {})",
            track_id,
            placement.len,
            placement.start,
            placement.offset
        );

        if placement.gap > 0 {
            tracing::warn!("Track {} underrun: {} samples of silence", track_id, placement.gap);
            emit(
                &self.events,
                PlayerEvent::Underrun {
                    track_id,
                    gap: placement.gap,
                },
            );
        }

        ChunkOutcome::Scheduled(placement)
    }

    /// Render one mono block and advance the clock by its length
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let block_start = self.clock;
        let block_end = block_start + out.len() as u64;
        let mut drained = Vec::new();

        for track in self.tracks.values_mut() {
            track.render_into(out, block_start);

            if track.state() == TrackState::Scheduled
                && track.first_start().is_some_and(|start| start < block_end)
                && track.transition(TrackState::Playing).is_ok()
            {
                emit(
                    &self.events,
                    PlayerEvent::TrackStarted {
                        track_id: track.id().clone(),
                        start: track.first_start().unwrap_or(block_start),
                    },
                );
            }

            if track.state() == TrackState::Playing
                && track.is_exhausted()
                && block_end >= track.cursor() + self.drain_grace
                && track.transition(TrackState::Drained).is_ok()
            {
                tracing::debug!("Track {} drained after {} samples", track.id(), track.played());
                emit(
                    &self.events,
                    PlayerEvent::TrackDrained {
                        track_id: track.id().clone(),
                        samples: track.played(),
                    },
                );
                drained.push(track.id().clone());
            }
        }

        for id in drained {
            self.tracks.remove(&id);
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        self.clock = block_end;
    }

    /// Render into an interleaved device buffer, copying the mono mix to
    /// every channel. Returns the mono mix.
    pub fn render_interleaved(&mut self, out: &mut [f32], channels: u16) -> &[f32] {
        let channels = channels.max(1) as usize;
        let frames = out.len() / channels;
        let mut mix = std::mem::take(&mut self.mix);
        mix.resize(frames, 0.0);
        self.render(&mut mix);

        for (frame, &sample) in out.chunks_exact_mut(channels).zip(&mix) {
            frame.fill(sample);
        }
        // Trailing values that do not form a whole frame stay silent
        out[frames * channels..].fill(0.0);

        self.mix = mix;
        &self.mix
    }

    /// The most recently started live track and how far it has played
    pub fn audible_offset(&self) -> Option<InterruptOffset> {
        self.tracks
            .values()
            .filter(|t| t.state().is_live())
            .max_by_key(|t| (t.first_start(), t.created_seq()))
            .map(|t| InterruptOffset {
                track_id: t.id().clone(),
                offset: t.played(),
            })
    }

    /// Silence everything from the next block on. Reports the audible track.
    pub fn interrupt(&mut self) -> Option<InterruptOffset> {
        let audible = self.audible_offset();

        for (id, mut track) in self.tracks.drain() {
            if let Err(e) = track.transition(TrackState::Interrupted) {
                tracing::warn!("Track {}: {}", id, e);
            }
            if !id.is_anonymous() && self.sealed.insert(id.clone()) {
                self.sealed_order.push_back(id);
            }
        }
        while self.sealed_order.len() > INTERRUPTED_TRACK_HISTORY {
            if let Some(oldest) = self.sealed_order.pop_front() {
                self.sealed.remove(&oldest);
            }
        }

        if let Some(cut) = &audible {
            tracing::info!("Interrupted track {} at sample {}", cut.track_id, cut.offset);
        }
        audible
    }

    pub fn track(&self, id: &TrackId) -> Option<&TrackBuffer> {
        self.tracks.get(id)
    }

    pub fn track_state(&self, id: &TrackId) -> Option<TrackState> {
        if let Some(track) = self.tracks.get(id) {
            Some(track.state())
        } else if self.sealed.contains(id) {
            Some(TrackState::Interrupted)
        } else {
            None
        }
    }

    /// Number of tracks scheduled or playing
    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_idle(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use proptest::prelude::*;

    fn placement(outcome: ChunkOutcome) -> ChunkPlacement {
        match outcome {
            ChunkOutcome::Scheduled(p) => p,
            other => panic!("chunk not scheduled: {:?}", other),
        }
    }

    #[test]
    fn test_three_chunks_scheduled_back_to_back() {
        let mut scheduler = Scheduler::new(6000);
        let starts: Vec<u64> = (0..3)
            .map(|_| placement(scheduler.append("a".into(), vec![100; 4800])).start)
            .collect();

        assert_eq!(starts, vec![0, 4800, 9600]);
        let track = scheduler.track(&"a".into()).unwrap();
        assert_eq!(track.written(), 14_400);
        let chunks: Vec<_> = track.chunks().collect();
        assert!(chunks.windows(2).all(|w| w[0].end() == w[1].start));
    }

    #[test]
    fn test_interrupt_before_start_reports_zero() {
        let mut scheduler = Scheduler::new(6000);
        scheduler.append("a".into(), vec![1; 4800]);

        let cut = scheduler.interrupt().unwrap();
        assert_eq!(cut, InterruptOffset { track_id: "a".into(), offset: 0 });
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_interrupt_with_nothing_playing() {
        let mut scheduler = Scheduler::new(6000);
        assert_eq!(scheduler.interrupt(), None);
    }

    #[test]
    fn test_interrupt_silences_next_block_and_seals_track() {
        let mut scheduler = Scheduler::new(6000);
        scheduler.append("resp_1".into(), vec![8192; 1000]);

        let mut block = vec![0.0; 300];
        scheduler.render(&mut block);
        assert!(block.iter().all(|s| *s == 0.25));

        let cut = scheduler.interrupt().unwrap();
        assert_eq!(cut.offset, 300);

        scheduler.render(&mut block);
        assert!(block.iter().all(|s| *s == 0.0));

        assert_eq!(
            scheduler.append("resp_1".into(), vec![1; 10]),
            ChunkOutcome::Ignored(IgnoreReason::TrackInterrupted)
        );
        assert_eq!(scheduler.track_state(&"resp_1".into()), Some(TrackState::Interrupted));
    }

    #[test]
    fn test_anonymous_track_survives_interrupt() {
        let mut scheduler = Scheduler::new(6000);
        scheduler.append(TrackId::anonymous(), vec![1; 10]);
        scheduler.interrupt();

        let again = placement(scheduler.append(TrackId::anonymous(), vec![1; 10]));
        assert_eq!(again.offset, 0);
    }

    #[test]
    fn test_interrupted_history_is_bounded() {
        let mut scheduler = Scheduler::new(6000);
        let total = INTERRUPTED_TRACK_HISTORY + 10;
        for n in 0..total {
            scheduler.append(format!("resp_{}", n).into(), vec![1; 10]);
            scheduler.interrupt();
        }

        assert_eq!(scheduler.sealed.len(), INTERRUPTED_TRACK_HISTORY);
        assert_eq!(scheduler.sealed_order.len(), INTERRUPTED_TRACK_HISTORY);
        assert_eq!(scheduler.track_state(&"resp_0".into()), None);
        assert_eq!(
            scheduler.track_state(&format!("resp_{}", total - 1).into()),
            Some(TrackState::Interrupted)
        );
        assert!(matches!(
            scheduler.append("resp_0".into(), vec![1; 10]),
            ChunkOutcome::Scheduled(_)
        ));
    }

    #[test]
    fn test_most_recent_track_is_audible() {
        let mut scheduler = Scheduler::new(6000);
        scheduler.append("first".into(), vec![1; 1000]);
        let mut block = vec![0.0; 100];
        scheduler.render(&mut block);
        scheduler.append("second".into(), vec![1; 1000]);
        scheduler.render(&mut block);

        let cut = scheduler.interrupt().unwrap();
        assert_eq!(cut, InterruptOffset { track_id: "second".into(), offset: 100 });
    }

    #[test]
    fn test_lifecycle_events_and_drain() {
        let (tx, rx) = unbounded();
        let mut scheduler = Scheduler::new(50).with_events(tx);
        scheduler.append("a".into(), vec![1; 100]);
        assert_eq!(scheduler.track_state(&"a".into()), Some(TrackState::Scheduled));

        let mut block = vec![0.0; 100];
        scheduler.render(&mut block);
        assert_eq!(scheduler.track_state(&"a".into()), Some(TrackState::Playing));
        assert_eq!(rx.try_recv(), Ok(PlayerEvent::TrackStarted { track_id: "a".into(), start: 0 }));

        // Exhausted, but still inside the grace period
        let mut short = vec![0.0; 20];
        scheduler.render(&mut short);
        assert_eq!(scheduler.track_state(&"a".into()), Some(TrackState::Playing));

        scheduler.render(&mut block);
        assert_eq!(scheduler.track_state(&"a".into()), None);
        assert_eq!(rx.try_recv(), Ok(PlayerEvent::TrackDrained { track_id: "a".into(), samples: 100 }));
    }

    #[test]
    fn test_underrun_splices_without_advancing_offset() {
        let (tx, rx) = unbounded();
        let mut scheduler = Scheduler::new(1000).with_events(tx);
        scheduler.append("a".into(), vec![1; 100]);
        let mut block = vec![0.0; 150];
        scheduler.render(&mut block);

        let late = placement(scheduler.append("a".into(), vec![1; 100]));
        assert_eq!((late.start, late.offset, late.gap), (150, 100, 50));
        assert!(rx.try_iter().any(|e| e == PlayerEvent::Underrun { track_id: "a".into(), gap: 50 }));

        scheduler.render(&mut block[..40]);
        assert_eq!(scheduler.audible_offset().unwrap().offset, 140);
    }

    #[test]
    fn test_concurrent_tracks_mix_and_clamp() {
        let mut scheduler = Scheduler::new(0);
        scheduler.append("a".into(), vec![24576; 4]);
        scheduler.append("b".into(), vec![24576; 2]);

        let mut block = vec![0.0; 4];
        scheduler.render(&mut block);
        assert_eq!(block, vec![1.0, 1.0, 0.75, 0.75]);
    }

    #[test]
    fn test_render_interleaved_duplicates_channels() {
        let mut scheduler = Scheduler::new(0);
        scheduler.append("a".into(), vec![16384, -16384]);

        let mut out = vec![9.0; 5];
        let mono = scheduler.render_interleaved(&mut out, 2).to_vec();
        assert_eq!(mono, vec![0.5, -0.5]);
        assert_eq!(out, vec![0.5, 0.5, -0.5, -0.5, 0.0]);
        assert_eq!(scheduler.clock(), 2);
    }

    #[test]
    fn test_interrupt_offset_serializes_camel_case() {
        let cut = InterruptOffset { track_id: "item_7".into(), offset: 4800 };
        assert_eq!(serde_json::to_string(&cut).unwrap(), r#"{"trackId":"item_7","offset":4800}"#);
    }

    proptest! {
        #[test]
        fn prop_single_track_output_equals_input(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<i16>(), 1..400), 1..12),
            block in 1usize..512,
        ) {
            let mut scheduler = Scheduler::new(1_000_000);
            let mut expected = Vec::new();
            for chunk in &chunks {
                expected.extend(chunk.iter().map(|&s| s as f32 / 32768.0));
                scheduler.append("a".into(), chunk.clone());
            }

            let mut rendered = Vec::new();
            let mut buf = vec![0.0; block];
            while rendered.len() < expected.len() {
                scheduler.render(&mut buf);
                rendered.extend_from_slice(&buf);
            }
            rendered.truncate(expected.len());
            prop_assert_eq!(rendered, expected);
        }

        #[test]
        fn prop_interrupt_offset_within_bounds(
            chunks in proptest::collection::vec(1usize..2000, 1..8),
            blocks in proptest::collection::vec(1usize..700, 0..10),
        ) {
            let mut scheduler = Scheduler::new(1_000_000);
            let total: u64 = chunks.iter().map(|&n| n as u64).sum();
            for &n in &chunks {
                scheduler.append("a".into(), vec![0; n]);
            }

            let mut elapsed = 0u64;
            for &n in &blocks {
                let mut buf = vec![0.0; n];
                scheduler.render(&mut buf);
                elapsed += n as u64;
            }

            let cut = scheduler.interrupt().unwrap();
            prop_assert!(cut.offset <= total);
            prop_assert_eq!(cut.offset, elapsed.min(total));
        }
    }
}
