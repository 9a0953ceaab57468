//! Gapless PCM16 playback with sample-exact interrupt

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

use super::backend::{AudioBackend, ErrorCallback, OpenStream, RenderCallback, StreamRequest};
use super::buffer::decode_pcm16;
use super::device::CpalBackend;
use crate::analysis::{AnalyserTap, AnalysisKind, BinningStrategy, Spectrum, SpectrumAnalyzer};
use crate::config::{PipelineConfig, PlaybackConfig};
use crate::constants::EVENT_QUEUE_CAPACITY;
use crate::error::{from_device, DeviceError, Error, Result};
use crate::tracks::{ChunkOutcome, InterruptOffset, PlayerEvent, Scheduler, TrackId, TrackState};

/// Plays PCM16 chunks from any number of tracks on one output device.
///
/// Chunks of a track play back to back with no gap or overlap. Tracks with
/// different ids are mixed. [`StreamPlayer::interrupt`] reports exactly how many
/// samples of the audible track were heard.
pub struct StreamPlayer {
    config: PlaybackConfig,
    backend: Arc<dyn AudioBackend>,
    scheduler: Arc<Mutex<Scheduler>>,
    tap: Arc<AnalyserTap>,
    analyzer: SpectrumAnalyzer,
    stream: Option<OpenStream>,
    event_tx: Sender<PlayerEvent>,
    event_rx: Receiver<PlayerEvent>,
}

impl StreamPlayer {
    /// Play through a cpal device
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_backend(config, Arc::new(CpalBackend::new()))
    }

    pub fn with_backend(config: &PipelineConfig, backend: Arc<dyn AudioBackend>) -> Self {
        let (event_tx, event_rx) = bounded(EVENT_QUEUE_CAPACITY);
        let scheduler = Scheduler::new(config.playback.drain_grace_samples()).with_events(event_tx.clone());

        Self {
            tap: Arc::new(AnalyserTap::new(config.playback.sample_rate, &config.analysis)),
            analyzer: SpectrumAnalyzer::new(&config.analysis),
            config: config.playback.clone(),
            backend,
            scheduler: Arc::new(Mutex::new(scheduler)),
            stream: None,
            event_tx,
            event_rx,
        }
    }

    /// Open the output device. Idempotent while connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.config.validate()?;

        let scheduler = self.scheduler.clone();
        let tap = self.tap.clone();
        let render: RenderCallback = Box::new(move |out: &mut [f32], channels: u16| {
            let mut scheduler = scheduler.lock();
            let mix = scheduler.render_interleaved(out, channels);
            tap.write(mix);
        });

        let event_tx = self.event_tx.clone();
        let on_error: ErrorCallback = Box::new(move |err: DeviceError| {
            tracing::warn!("Playback device error: {}", err);
            let _ = event_tx.try_send(PlayerEvent::DeviceLost(err));
        });

        let backend = self.backend.clone();
        let request = StreamRequest {
            device: self.config.device.clone(),
            sample_rate: self.config.sample_rate,
        };
        let stream = tokio::task::spawn_blocking(move || backend.open_output(&request, render, on_error))
            .await
            .map_err(|e| Error::Device(DeviceError::StreamFailed(e.to_string())))?
            .map_err(from_device)?;

        tracing::info!(
            "Playback device open via {} at {} Hz ({} channels)",
            self.backend.name(),
            self.config.sample_rate,
            stream.channels
        );
        self.stream = Some(stream);
        Ok(())
    }

    /// Queue little-endian PCM16 bytes on `track_id`. An empty id is the
    /// anonymous track.
    ///
    /// A rejected chunk leaves the track's earlier chunks untouched.
    pub fn add_16bit_pcm(&self, chunk: &[u8], track_id: impl Into<TrackId>) -> Result<ChunkOutcome> {
        self.ensure_connected()?;
        let samples = decode_pcm16(chunk)?;
        Ok(self.scheduler.lock().append(track_id.into(), samples))
    }

    /// Queue already decoded PCM16 samples on `track_id`
    pub fn add_samples(&self, samples: Vec<i16>, track_id: impl Into<TrackId>) -> Result<ChunkOutcome> {
        self.ensure_connected()?;
        Ok(self.scheduler.lock().append(track_id.into(), samples))
    }

    /// Stop all playback from the next device block on.
    ///
    /// Returns the audible track and how many of its samples were rendered,
    /// or `None` when nothing was scheduled or playing. Later chunks for an
    /// interrupted named track are ignored.
    pub fn interrupt(&self) -> Option<InterruptOffset> {
        self.scheduler.lock().interrupt()
    }

    /// Playback position of the audible track, without interrupting it
    pub fn track_offset(&self) -> Option<InterruptOffset> {
        self.scheduler.lock().audible_offset()
    }

    pub fn track_state(&self, track_id: &TrackId) -> Option<TrackState> {
        self.scheduler.lock().track_state(track_id)
    }

    /// Analysis of the mixed output; a single zero before connect
    pub fn get_frequencies(&self, kind: AnalysisKind) -> Spectrum {
        if !self.is_connected() {
            return Spectrum::silent();
        }
        self.analyzer.measure(&self.tap, kind)
    }

    /// [`Self::get_frequencies`] bucketed into `band_count` bands
    pub fn get_bands(&self, kind: AnalysisKind, band_count: usize, binning: BinningStrategy) -> Spectrum {
        if !self.is_connected() {
            return Spectrum::zeros(band_count);
        }
        self.analyzer.bands(&self.tap, kind, band_count, binning)
    }

    /// Track lifecycle, underrun and device loss notifications
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.event_rx.clone()
    }

    /// Release the output device and drop all queued audio. Idempotent.
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };

        tokio::task::spawn_blocking(move || stream.handle.stop())
            .await
            .map_err(|e| Error::Device(DeviceError::StreamFailed(e.to_string())))?;

        // The next connect starts a fresh clock
        *self.scheduler.lock() =
            Scheduler::new(self.config.drain_grace_samples()).with_events(self.event_tx.clone());
        self.tap.reset();
        tracing::info!("Playback device released");
        Ok(())
    }

    /// Output samples rendered since `connect()`
    pub fn clock(&self) -> u64 {
        self.scheduler.lock().clock()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| s.handle.is_running())
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// The output analyser node
    pub fn tap(&self) -> Arc<AnalyserTap> {
        self.tap.clone()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::NotReady("playback requires connect() to complete"));
        }
        Ok(())
    }
}

impl Drop for StreamPlayer {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::{encode_pcm16, i16_to_f32};
    use crate::audio::SyntheticBackend;
    use crate::error::ChunkError;
    use crate::tracks::IgnoreReason;
    use std::time::Duration;

    fn player(backend: &SyntheticBackend) -> StreamPlayer {
        let mut config = PipelineConfig::default();
        config.analysis.fft_size = 256;
        StreamPlayer::with_backend(&config, Arc::new(backend.clone()))
    }

    fn ramp(len: usize, seed: i16) -> Vec<i16> {
        (0..len).map(|i| (i as i16).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_add_before_connect_not_ready() {
        let backend = SyntheticBackend::new();
        let player = player(&backend);
        assert!(matches!(
            player.add_16bit_pcm(&[0, 0], ""),
            Err(Error::NotReady(_))
        ));
        assert_eq!(player.get_frequencies(AnalysisKind::Voice), Spectrum::silent());
    }

    #[tokio::test]
    async fn test_chunks_play_gapless() {
        let backend = SyntheticBackend::new();
        let mut player = player(&backend);
        player.connect().await.unwrap();

        let chunks: Vec<Vec<i16>> = (0..3).map(|n| ramp(4800, n * 100)).collect();
        for chunk in &chunks {
            player.add_16bit_pcm(&encode_pcm16(chunk), "resp_1").unwrap();
        }

        let mut heard = Vec::new();
        while heard.len() < 14_400 {
            heard.extend(backend.pull_output(1000).unwrap());
        }
        let expected: Vec<f32> = chunks.concat().into_iter().map(i16_to_f32).collect();
        assert_eq!(&heard[..14_400], &expected[..]);
        assert!(heard[14_400..].iter().all(|s| *s == 0.0));

        player.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_chunk_keeps_earlier_audio() {
        let backend = SyntheticBackend::new();
        let mut player = player(&backend);
        player.connect().await.unwrap();

        player.add_16bit_pcm(&encode_pcm16(&[16384, 16384]), "a").unwrap();
        assert!(matches!(
            player.add_16bit_pcm(&[1, 2, 3], "a"),
            Err(Error::Chunk(ChunkError::OddLength(3)))
        ));

        assert_eq!(backend.pull_output(3).unwrap(), vec![0.5, 0.5, 0.0]);
        player.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_reports_rendered_samples() {
        let backend = SyntheticBackend::new();
        let mut player = player(&backend);
        player.connect().await.unwrap();

        player.add_samples(vec![8192; 4800], "resp_1").unwrap();
        backend.pull_output(1000).unwrap();
        assert_eq!(player.track_offset().unwrap().offset, 1000);

        let cut = player.interrupt().unwrap();
        assert_eq!(cut, InterruptOffset { track_id: "resp_1".into(), offset: 1000 });
        assert_eq!(
            serde_json::to_value(&cut).unwrap(),
            serde_json::json!({ "trackId": "resp_1", "offset": 1000 })
        );

        assert!(backend.pull_output(500).unwrap().iter().all(|s| *s == 0.0));
        assert_eq!(
            player.add_samples(vec![1; 10], "resp_1").unwrap(),
            ChunkOutcome::Ignored(IgnoreReason::TrackInterrupted)
        );
        assert_eq!(player.track_state(&"resp_1".into()), Some(TrackState::Interrupted));
        assert_eq!(player.interrupt(), None);
        player.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_stereo_output_duplicates_mix() {
        let backend = SyntheticBackend::with_channels(1, 2);
        let mut player = player(&backend);
        player.connect().await.unwrap();

        player.add_samples(vec![16384, -16384], "").unwrap();
        assert_eq!(backend.pull_output(2).unwrap(), vec![0.5, 0.5, -0.5, -0.5]);
        assert_eq!(player.clock(), 2);
        player.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_track_lifecycle_events() {
        let backend = SyntheticBackend::new();
        let mut player = player(&backend);
        let events = player.events();
        player.connect().await.unwrap();

        player.add_samples(vec![100; 100], "a").unwrap();
        backend.pull_output(100).unwrap();
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            PlayerEvent::TrackStarted { track_id: "a".into(), start: 0 }
        );

        // 250 ms of grace at 24 kHz
        backend.pull_output(6000).unwrap();
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            PlayerEvent::TrackDrained { track_id: "a".into(), samples: 100 }
        );
        assert_eq!(player.track_state(&"a".into()), None);
        player.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_output_spectrum_follows_playback() {
        let backend = SyntheticBackend::new();
        let mut player = player(&backend);
        player.connect().await.unwrap();

        player.add_samples(vec![16384; 512], "").unwrap();
        backend.pull_output(256).unwrap();

        let spectrum = player.get_frequencies(AnalysisKind::Frequency);
        assert_eq!(spectrum.len(), 128);
        assert!(spectrum.peak() > 0.0);
        assert_eq!(
            player.get_bands(AnalysisKind::Voice, 80, BinningStrategy::Linear).len(),
            80
        );
        player.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_device_loss_event() {
        let backend = SyntheticBackend::new();
        let mut player = player(&backend);
        let events = player.events();
        player.connect().await.unwrap();

        backend.disconnect_output("unplugged");
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            PlayerEvent::DeviceLost(DeviceError::Disconnected("unplugged".into()))
        );
        assert!(!player.is_connected());
        player.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_and_reconnect() {
        let backend = SyntheticBackend::new();
        backend.deny_output(DeviceError::NotFound("speaker".into()));
        let mut player = player(&backend);

        assert!(player.connect().await.unwrap_err().is_device_unavailable());
        player.connect().await.unwrap();
        player.connect().await.unwrap();
        assert!(backend.output_open());

        player.add_samples(vec![1; 10], "a").unwrap();
        backend.pull_output(10).unwrap();
        assert_eq!(player.clock(), 10);

        player.disconnect().await.unwrap();
        player.disconnect().await.unwrap();
        assert!(!backend.output_open());
        assert_eq!(player.clock(), 0);
        assert_eq!(player.track_state(&"a".into()), None);
    }
}
