//! Framed microphone capture
//!
//! The device callback converts samples to PCM16 and cuts them into
//! fixed-size frames. Frames cross a bounded queue to a dispatch thread, which
//! hands each one to the subscribed callback in production order. The
//! subscription lock is released before the callback runs, so the callback
//! may pause or unsubscribe itself.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

use super::backend::{AudioBackend, Direction, ErrorCallback, InputCallback, OpenStream, StreamRequest};
use super::buffer::{AudioFrame, FrameAccumulator};
use super::device::CpalBackend;
use crate::analysis::{AnalyserTap, AnalysisKind, BinningStrategy, Spectrum, SpectrumAnalyzer};
use crate::config::{AnalysisConfig, CaptureConfig, PipelineConfig};
use crate::constants::{EVENT_QUEUE_CAPACITY, FRAME_QUEUE_CAPACITY};
use crate::error::{from_device, DeviceError, Error, Result};

/// How often the dispatch thread checks for shutdown while idle
const DISPATCH_POLL: Duration = Duration::from_millis(50);

/// Receives every captured frame while subscribed
pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send + 'static>;

struct Subscription {
    id: Uuid,

    /// Only frames stamped with this generation reach the callback
    generation: u64,

    callback: Arc<Mutex<FrameCallback>>,
}

/// A frame and the subscription generation it was captured under
type StampedFrame = (u64, AudioFrame);

/// State shared with the device callback and the dispatch thread
struct CaptureShared {
    /// Whether frames are being cut and delivered
    capturing: AtomicBool,

    /// Set by `end()`; stops the dispatch thread
    closed: AtomicBool,

    /// Bumped on every subscribe and pause
    generation: AtomicU64,

    /// Current frame subscriber
    subscription: Mutex<Option<Subscription>>,

    /// Partial frame under construction
    accumulator: Mutex<Option<FrameAccumulator>>,

    /// Set when the device vanished mid-stream
    lost: Mutex<Option<DeviceError>>,

    /// Total frames cut
    frames_produced: AtomicU64,

    /// Frames lost to a full dispatch queue
    frames_dropped: AtomicU64,
}

impl CaptureShared {
    fn stop_delivery(&self) {
        self.capturing.store(false, Ordering::SeqCst);
        *self.subscription.lock() = None;
        // Frames still queued belong to the old subscription
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn is_lost(&self) -> bool {
        self.lost.lock().is_some()
    }
}

/// Proof of a frame subscription
#[derive(Clone)]
pub struct CaptureToken {
    id: Uuid,
    shared: Weak<CaptureShared>,
}

impl CaptureToken {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// True while this subscription is the current one and frames flow
    pub fn is_active(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let current = shared.subscription.lock().as_ref().map(|s| s.id);
        shared.capturing.load(Ordering::SeqCst) && !shared.is_lost() && current == Some(self.id)
    }
}

impl std::fmt::Debug for CaptureToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureToken")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Cloneable pause/unsubscribe handle, safe to use inside the frame callback
#[derive(Clone)]
pub struct CaptureControl {
    shared: Arc<CaptureShared>,
}

impl CaptureControl {
    /// Stop delivering frames; the device stays open. No-op when idle.
    pub fn pause(&self) {
        if self.shared.capturing.load(Ordering::SeqCst) {
            tracing::debug!("Capture paused");
        }
        self.shared.stop_delivery();
    }

    /// Unsubscribe `token` if it is still the current subscription
    pub fn stop(&self, token: &CaptureToken) -> bool {
        let mut subscription = self.shared.subscription.lock();
        if subscription.as_ref().map(|s| s.id) != Some(token.id) {
            return false;
        }
        *subscription = None;
        self.shared.capturing.store(false, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::SeqCst)
    }
}

/// Capture counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_produced: u64,
    /// Frames lost because the dispatch queue was full
    pub frames_dropped: u64,
    /// Samples collected toward the next frame
    pub pending_samples: usize,
}

/// Owns the capture device and turns it into a stream of fixed-size frames
pub struct FrameSource {
    /// Rate, frame duration and device name
    config: CaptureConfig,

    /// Needed to rebuild the tap when the rate changes
    analysis: AnalysisConfig,

    /// Where streams come from
    backend: Arc<dyn AudioBackend>,

    /// State shared with the device callback and the dispatch thread
    shared: Arc<CaptureShared>,

    /// Input analyser node
    tap: Arc<AnalyserTap>,

    analyzer: SpectrumAnalyzer,

    /// Open capture stream, `None` before `begin()`
    stream: Option<OpenStream>,

    /// Frame dispatch thread handle
    dispatcher: Option<JoinHandle<()>>,

    /// Channel for asynchronous device errors
    error_tx: Sender<DeviceError>,
    error_rx: Receiver<DeviceError>,
}

impl FrameSource {
    /// Capture from a cpal device
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_backend(config, Arc::new(CpalBackend::new()))
    }

    pub fn with_backend(config: &PipelineConfig, backend: Arc<dyn AudioBackend>) -> Self {
        let (error_tx, error_rx) = bounded(EVENT_QUEUE_CAPACITY);
        Self {
            tap: Arc::new(AnalyserTap::new(config.capture.sample_rate, &config.analysis)),
            analyzer: SpectrumAnalyzer::new(&config.analysis),
            config: config.capture.clone(),
            analysis: config.analysis.clone(),
            backend,
            shared: Arc::new(CaptureShared {
                capturing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                subscription: Mutex::new(None),
                accumulator: Mutex::new(None),
                lost: Mutex::new(None),
                frames_produced: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
            stream: None,
            dispatcher: None,
            error_tx,
            error_rx,
        }
    }

    /// Set the capture rate and frame duration.
    ///
    /// Repeating the current settings is a no-op. Other settings are rejected
    /// while the device is open, or when the device cannot run at the rate.
    pub fn configure(&mut self, sample_rate: u32, frame_duration: Duration) -> Result<()> {
        let mut next = self.config.clone();
        next.sample_rate = sample_rate;
        next.frame_duration_ms = frame_duration.as_secs_f32() * 1000.0;

        if next == self.config {
            return Ok(());
        }
        next.validate()?;

        if self.stream.is_some() {
            return Err(Error::Config(
                "capture settings cannot change while the device is open".to_string(),
            ));
        }

        let supported = self
            .backend
            .supports_rate(Direction::Input, next.device.as_deref(), sample_rate)
            .map_err(from_device)?;
        if !supported {
            return Err(Error::Config(format!(
                "capture device does not support {} Hz",
                sample_rate
            )));
        }

        tracing::info!(
            "Capture configured: {} Hz, {} samples per frame",
            next.sample_rate,
            next.frame_samples()
        );
        self.tap = Arc::new(AnalyserTap::new(next.sample_rate, &self.analysis));
        self.config = next;
        Ok(())
    }

    /// Open the capture device. Idempotent while open; reopens a device that
    /// was lost.
    pub async fn begin(&mut self) -> Result<()> {
        if self.stream.is_some() {
            if !self.shared.is_lost() {
                return Ok(());
            }
            tracing::info!("Reopening lost capture device");
            self.end().await?;
        }
        self.config.validate()?;
        *self.shared.lost.lock() = None;

        let (frame_tx, frame_rx) = bounded::<StampedFrame>(FRAME_QUEUE_CAPACITY);
        let on_data = self.input_callback(frame_tx);
        let on_error = self.error_callback();

        let backend = self.backend.clone();
        let request = StreamRequest {
            device: self.config.device.clone(),
            sample_rate: self.config.sample_rate,
        };
        let mut stream = tokio::task::spawn_blocking(move || backend.open_input(&request, on_data, on_error))
            .await
            .map_err(|e| Error::Device(DeviceError::StreamFailed(e.to_string())))?
            .map_err(from_device)?;

        *self.shared.accumulator.lock() = Some(FrameAccumulator::new(
            self.config.frame_samples(),
            stream.channels,
            self.config.sample_rate,
        ));
        self.shared.closed.store(false, Ordering::SeqCst);

        let dispatcher = match spawn_dispatcher(self.shared.clone(), frame_rx) {
            Ok(handle) => handle,
            Err(e) => {
                stream.handle.stop();
                return Err(e);
            }
        };

        tracing::info!(
            "Capture device open via {} ({} channels)",
            self.backend.name(),
            stream.channels
        );
        self.dispatcher = Some(dispatcher);
        self.stream = Some(stream);
        Ok(())
    }

    /// Subscribe `on_frame` and start delivering frames. Replaces any
    /// previous subscription.
    pub fn start_capture<F>(&self, on_frame: F) -> Result<CaptureToken>
    where
        F: FnMut(AudioFrame) + Send + 'static,
    {
        if self.stream.is_none() {
            return Err(Error::NotReady("start_capture requires begin() to complete"));
        }
        if let Some(err) = self.shared.lost.lock().clone() {
            return Err(Error::Device(err));
        }

        let id = Uuid::new_v4();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.subscription.lock() = Some(Subscription {
            id,
            generation,
            callback: Arc::new(Mutex::new(Box::new(on_frame))),
        });
        if !self.shared.capturing.swap(true, Ordering::SeqCst) {
            self.tap.reset();
            tracing::debug!("Capture started");
        }

        Ok(CaptureToken {
            id,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Unsubscribe `token`. Stale tokens are ignored.
    pub fn stop_capture(&self, token: &CaptureToken) -> bool {
        self.control().stop(token)
    }

    /// Stop delivering frames, keeping the device open. No-op when idle.
    pub fn pause(&self) {
        self.control().pause();
    }

    pub fn control(&self) -> CaptureControl {
        CaptureControl {
            shared: self.shared.clone(),
        }
    }

    /// Release the device and the dispatch thread. Idempotent.
    pub async fn end(&mut self) -> Result<()> {
        self.shared.stop_delivery();
        self.shared.closed.store(true, Ordering::SeqCst);

        let stream = self.stream.take();
        let dispatcher = self.dispatcher.take();
        if stream.is_none() && dispatcher.is_none() {
            return Ok(());
        }

        tokio::task::spawn_blocking(move || release(stream, dispatcher))
            .await
            .map_err(|e| Error::Device(DeviceError::StreamFailed(e.to_string())))?;

        *self.shared.accumulator.lock() = None;
        self.tap.reset();
        tracing::info!("Capture device released");
        Ok(())
    }

    /// Latest analysis of the live input; a single zero when not capturing
    pub fn current_spectrum(&self, kind: AnalysisKind) -> Spectrum {
        if !self.is_capturing() {
            return Spectrum::silent();
        }
        self.analyzer.measure(&self.tap, kind)
    }

    /// [`Self::current_spectrum`] bucketed into `band_count` bands
    pub fn current_bands(&self, kind: AnalysisKind, band_count: usize, binning: BinningStrategy) -> Spectrum {
        if !self.is_capturing() {
            return Spectrum::zeros(band_count);
        }
        self.analyzer.bands(&self.tap, kind, band_count, binning)
    }

    /// Copy of the samples collected toward the next frame
    pub fn pending_frame(&self) -> AudioFrame {
        match self.shared.accumulator.lock().as_ref() {
            Some(acc) => acc.pending(),
            None => AudioFrame {
                mono: Vec::new(),
                raw: Vec::new(),
                channels: 1,
                sample_rate: self.config.sample_rate,
                sequence: 0,
            },
        }
    }

    /// Asynchronous device failures, such as the microphone being unplugged
    pub fn errors(&self) -> Receiver<DeviceError> {
        self.error_rx.clone()
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_produced: self.shared.frames_produced.load(Ordering::Relaxed),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
            pending_samples: self
                .shared
                .accumulator
                .lock()
                .as_ref()
                .map_or(0, |acc| acc.pending_len()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn frame_samples(&self) -> usize {
        self.config.frame_samples()
    }

    /// The input analyser node
    pub fn tap(&self) -> Arc<AnalyserTap> {
        self.tap.clone()
    }

    fn input_callback(&self, frame_tx: Sender<StampedFrame>) -> InputCallback {
        let shared = self.shared.clone();
        let tap = self.tap.clone();

        Box::new(move |data: &[f32], channels: u16| {
            if !shared.capturing.load(Ordering::Relaxed) {
                return;
            }
            tap.write_interleaved(data, channels);

            let mut accumulator = shared.accumulator.lock();
            let Some(acc) = accumulator.as_mut() else {
                return;
            };
            let generation = shared.generation.load(Ordering::SeqCst);
            acc.push(data, |frame| {
                shared.frames_produced.fetch_add(1, Ordering::Relaxed);
                if frame_tx.try_send((generation, frame)).is_err() {
                    let dropped = shared.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped.is_power_of_two() {
                        tracing::warn!("Frame queue full, {} frames dropped so far", dropped);
                    }
                }
            });
        })
    }

    fn error_callback(&self) -> ErrorCallback {
        let shared = self.shared.clone();
        let error_tx = self.error_tx.clone();

        Box::new(move |err: DeviceError| {
            tracing::warn!("Capture device error: {}", err);
            if matches!(err, DeviceError::Disconnected(_)) {
                *shared.lost.lock() = Some(err.clone());
                shared.stop_delivery();
            }
            let _ = error_tx.try_send(err);
        })
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.shared.stop_delivery();
        self.shared.closed.store(true, Ordering::SeqCst);
        release(self.stream.take(), self.dispatcher.take());
    }
}

fn release(stream: Option<OpenStream>, dispatcher: Option<JoinHandle<()>>) {
    if let Some(mut stream) = stream {
        stream.handle.stop();
    }
    if let Some(handle) = dispatcher {
        let _ = handle.join();
    }
}

fn spawn_dispatcher(shared: Arc<CaptureShared>, frames: Receiver<StampedFrame>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("frame-dispatch".to_string())
        .spawn(move || loop {
            match frames.recv_timeout(DISPATCH_POLL) {
                Ok((generation, frame)) => {
                    if !shared.capturing.load(Ordering::SeqCst) {
                        continue;
                    }
                    let callback = shared
                        .subscription
                        .lock()
                        .as_ref()
                        .filter(|s| s.generation == generation)
                        .map(|s| s.callback.clone());
                    if let Some(callback) = callback {
                        (callback.lock())(frame);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if shared.closed.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SyntheticBackend;
    use crossbeam_channel::unbounded;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(150);

    fn source(backend: &SyntheticBackend) -> FrameSource {
        let mut config = PipelineConfig::default();
        config.capture.frame_duration_ms = 10.0; // 240 samples at 24 kHz
        config.analysis.fft_size = 256;
        FrameSource::with_backend(&config, Arc::new(backend.clone()))
    }

    #[test]
    fn test_pause_before_start_is_noop() {
        let backend = SyntheticBackend::new();
        let capture = source(&backend);
        capture.pause();
        assert!(!capture.is_capturing());
    }

    #[test]
    fn test_start_before_begin_not_ready() {
        let backend = SyntheticBackend::new();
        let capture = source(&backend);
        assert!(matches!(capture.start_capture(|_| {}), Err(Error::NotReady(_))));
    }

    #[tokio::test]
    async fn test_pause_after_begin_delivers_nothing() {
        let backend = SyntheticBackend::new();
        let mut capture = source(&backend);
        capture.begin().await.unwrap();
        capture.pause();

        backend.feed_input(&[0.1; 1000]);
        assert_eq!(capture.stats().frames_produced, 0);
        capture.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_delivered_in_order() {
        let backend = SyntheticBackend::new();
        let mut capture = source(&backend);
        capture.begin().await.unwrap();

        let (tx, rx) = unbounded();
        let token = capture.start_capture(move |frame| tx.send(frame).unwrap()).unwrap();
        assert!(token.is_active());

        backend.feed_input(&[0.25; 1000]);
        let frames: Vec<AudioFrame> = (0..4).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();

        assert_eq!(frames.iter().map(|f| f.sequence).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(frames.iter().all(|f| f.mono.len() == 240 && f.raw == f.mono));
        assert_eq!(capture.pending_frame().mono.len(), 40);
        assert!(rx.recv_timeout(QUIET).is_err());

        capture.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_stereo_frames_keep_raw_channels() {
        let backend = SyntheticBackend::with_channels(2, 1);
        let mut capture = source(&backend);
        capture.begin().await.unwrap();

        let (tx, rx) = unbounded();
        capture.start_capture(move |frame| tx.send(frame).unwrap()).unwrap();
        let interleaved: Vec<f32> = (0..480).flat_map(|_| [0.5, -0.5]).collect();
        backend.feed_input(&interleaved);

        let frame = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(frame.channels, 2);
        assert_eq!(frame.raw.len(), 480);
        assert!(frame.mono.iter().all(|&s| s == 0));
        capture.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_from_inside_callback() {
        let backend = SyntheticBackend::new();
        let mut capture = source(&backend);
        capture.begin().await.unwrap();

        let control = capture.control();
        let (tx, rx) = unbounded();
        let token = capture
            .start_capture(move |frame| {
                control.pause();
                tx.send(frame.sequence).unwrap();
            })
            .unwrap();

        backend.feed_input(&[0.0; 720]);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0);
        assert!(rx.recv_timeout(QUIET).is_err());
        assert!(!token.is_active());
        capture.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_subscription_replaces_old() {
        let backend = SyntheticBackend::new();
        let mut capture = source(&backend);
        capture.begin().await.unwrap();

        let first = capture.start_capture(|_| {}).unwrap();
        let (tx, rx) = unbounded();
        let second = capture.start_capture(move |frame| tx.send(frame).unwrap()).unwrap();

        assert!(!first.is_active());
        assert!(!capture.stop_capture(&first));
        backend.feed_input(&[0.0; 240]);
        assert!(rx.recv_timeout(WAIT).is_ok());

        assert!(capture.stop_capture(&second));
        assert!(!second.is_active());
        capture.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_configure_rules() {
        let backend = SyntheticBackend::new().with_supported_rates(&[24_000, 48_000]);
        let mut capture = source(&backend);

        assert!(matches!(
            capture.configure(44_100, Duration::from_millis(20)),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            capture.configure(24_000, Duration::ZERO),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            capture.configure(24_000, Duration::from_secs(10_000_000)),
            Err(Error::Config(_))
        ));
        capture.configure(48_000, Duration::from_millis(20)).unwrap();
        assert_eq!(capture.frame_samples(), 960);

        capture.begin().await.unwrap();
        capture.configure(48_000, Duration::from_millis(20)).unwrap();
        assert!(matches!(
            capture.configure(24_000, Duration::from_millis(20)),
            Err(Error::Config(_))
        ));
        capture.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let backend = SyntheticBackend::new();
        backend.deny_input(DeviceError::PermissionDenied("blocked".into()));
        let mut capture = source(&backend);

        let err = capture.begin().await.unwrap_err();
        assert!(err.is_device_unavailable());
        assert!(!capture.is_open());
    }

    #[tokio::test]
    async fn test_spectrum_only_while_capturing() {
        let backend = SyntheticBackend::new();
        let mut capture = source(&backend);
        assert_eq!(capture.current_spectrum(AnalysisKind::Frequency), Spectrum::silent());
        assert_eq!(
            capture.current_bands(AnalysisKind::Voice, 80, BinningStrategy::Linear).len(),
            80
        );

        capture.begin().await.unwrap();
        capture.start_capture(|_| {}).unwrap();
        backend.feed_input(&[0.5; 256]);

        let spectrum = capture.current_spectrum(AnalysisKind::Frequency);
        assert_eq!(spectrum.len(), 128);
        assert!(spectrum.peak() > 0.0);
        let time = capture.current_spectrum(AnalysisKind::TimeDomain);
        assert!(time.values.iter().all(|v| *v == 0.5));

        capture.pause();
        assert_eq!(capture.current_spectrum(AnalysisKind::Frequency), Spectrum::silent());
        capture.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_device_loss_reported() {
        let backend = SyntheticBackend::new();
        let mut capture = source(&backend);
        let errors = capture.errors();
        capture.begin().await.unwrap();
        capture.start_capture(|_| {}).unwrap();

        backend.disconnect_input("unplugged");
        assert_eq!(
            errors.recv_timeout(WAIT).unwrap(),
            DeviceError::Disconnected("unplugged".into())
        );
        assert!(!capture.is_capturing());
        capture.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_after_device_loss_fails_until_reopened() {
        let backend = SyntheticBackend::new();
        let mut capture = source(&backend);
        capture.begin().await.unwrap();
        let token = capture.start_capture(|_| {}).unwrap();

        backend.disconnect_input("unplugged");
        assert!(!token.is_active());
        assert!(matches!(
            capture.start_capture(|_| {}),
            Err(Error::Device(DeviceError::Disconnected(_)))
        ));

        capture.begin().await.unwrap();
        assert!(backend.input_open());
        let (tx, rx) = unbounded();
        let token = capture.start_capture(move |frame| tx.send(frame).unwrap()).unwrap();
        assert!(token.is_active());
        backend.feed_input(&[0.0; 240]);
        assert!(rx.recv_timeout(WAIT).is_ok());
        capture.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_frames_do_not_leak_into_next_subscription() {
        let backend = SyntheticBackend::new();
        let mut capture = source(&backend);
        capture.begin().await.unwrap();

        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();
        capture
            .start_capture(move |frame| {
                entered_tx.send(frame.sequence).unwrap();
                let _ = release_rx.recv_timeout(WAIT);
            })
            .unwrap();

        // Frame 0 blocks the first callback while frames 1..=3 wait in the queue
        backend.feed_input(&[0.1; 960]);
        assert_eq!(entered_rx.recv_timeout(WAIT).unwrap(), 0);

        capture.pause();
        let (tx, rx) = unbounded();
        capture.start_capture(move |frame| tx.send(frame.sequence).unwrap()).unwrap();
        release_tx.send(()).unwrap();

        backend.feed_input(&[0.1; 240]);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 4);
        assert!(rx.recv_timeout(QUIET).is_err());
        assert!(entered_rx.recv_timeout(QUIET).is_err());
        capture.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_is_idempotent_and_resets() {
        let backend = SyntheticBackend::new();
        let mut capture = source(&backend);
        capture.end().await.unwrap();

        capture.begin().await.unwrap();
        capture.start_capture(|_| {}).unwrap();
        backend.feed_input(&[0.0; 100]);
        capture.end().await.unwrap();
        capture.end().await.unwrap();

        assert!(!backend.input_open());
        assert_eq!(capture.pending_frame().mono.len(), 0);
        assert!(matches!(capture.start_capture(|_| {}), Err(Error::NotReady(_))));

        // The device can be reopened after end
        capture.begin().await.unwrap();
        assert!(backend.input_open());
        capture.end().await.unwrap();
    }
}
