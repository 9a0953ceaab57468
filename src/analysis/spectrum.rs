//! Band bucketing and normalized spectrum queries for visualization

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

use super::tap::AnalyserTap;
use crate::config::AnalysisConfig;

/// What to read from a tap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisKind {
    /// Every FFT bin, normalized from decibels
    Frequency,
    /// Absolute sample values of the most recent window
    TimeDomain,
    /// One value per equal-tempered note, octaves 1 through 8
    Music,
    /// Notes within the speaking range
    Voice,
}

/// How raw indices map onto bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BinningStrategy {
    /// Equal-width spans
    #[default]
    Linear,
    /// Spans widen geometrically toward the end of the input
    Logarithmic,
}

impl BinningStrategy {
    /// Half-open input span of `band`, never empty for non-empty input
    fn span(self, band: usize, band_count: usize, len: usize) -> (usize, usize) {
        let (lo, hi) = match self {
            BinningStrategy::Linear => (band * len / band_count, (band + 1) * len / band_count),
            BinningStrategy::Logarithmic => {
                let edge = |b: usize| {
                    ((len as f64 + 1.0).powf(b as f64 / band_count as f64) - 1.0).floor() as usize
                };
                (edge(band), edge(band + 1))
            }
        };
        let lo = lo.min(len - 1);
        (lo, hi.max(lo + 1).min(len))
    }
}

/// Magnitude array ready for bar rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    pub values: Vec<f32>,
}

impl Spectrum {
    /// Single zero, reported when nothing is streaming
    pub fn silent() -> Self {
        Self { values: vec![0.0] }
    }

    pub fn zeros(len: usize) -> Self {
        Self {
            values: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Loudest value, 0.0 for an empty spectrum
    pub fn peak(&self) -> f32 {
        self.values.iter().copied().fold(0.0, f32::max)
    }
}

/// Lowest and highest frequency of the speaking range, in Hz
pub const VOICE_FREQUENCY_RANGE: (f32, f32) = (32.0, 2000.0);

/// C8 through B8
const OCTAVE_8_FREQUENCIES: [f32; 12] = [
    4186.01, 4434.92, 4698.63, 4978.03, 5274.04, 5587.65, 5919.91, 6271.93, 6644.88, 7040.0, 7458.62,
    7902.13,
];

/// Equal-tempered note frequencies from C1 to B8, ascending
pub fn note_frequencies() -> Vec<f32> {
    (1..=8)
        .flat_map(|octave: i32| {
            let divisor = 2f32.powi(8 - octave);
            OCTAVE_8_FREQUENCIES.iter().map(move |f| f / divisor)
        })
        .collect()
}

/// Notes inside [`VOICE_FREQUENCY_RANGE`]
pub fn voice_frequencies() -> Vec<f32> {
    let (low, high) = VOICE_FREQUENCY_RANGE;
    note_frequencies()
        .into_iter()
        .filter(|f| *f > low && *f < high)
        .collect()
}

#[inline]
fn magnitude(value: f32) -> f32 {
    if value.is_finite() {
        value.abs().min(1.0)
    } else {
        0.0
    }
}

/// Re-bucket `raw` into exactly `band_count` bands.
///
/// Each band is the mean magnitude of its span. Pure: no state, no failure.
/// Empty input gives all zeros.
pub fn analyze(raw: &[f32], band_count: usize, binning: BinningStrategy) -> Vec<f32> {
    let mut bands = vec![0.0f32; band_count];
    let len = raw.len();
    if len == 0 {
        return bands;
    }

    for (band, value) in bands.iter_mut().enumerate() {
        let (lo, hi) = binning.span(band, band_count, len);
        let sum: f32 = raw[lo..hi].iter().map(|&v| magnitude(v)).sum();
        *value = sum / (hi - lo) as f32;
    }
    bands
}

/// Reads analyser taps and turns them into normalized spectra.
///
/// Holds only a weak reference to the last tap it read, so it never keeps a
/// capture or playback node alive.
pub struct SpectrumAnalyzer {
    min_decibels: f32,
    max_decibels: f32,
    music_notes: Vec<f32>,
    voice_notes: Vec<f32>,
    last_source: Mutex<Weak<AnalyserTap>>,
}

impl SpectrumAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels,
            music_notes: note_frequencies(),
            voice_notes: voice_frequencies(),
            last_source: Mutex::new(Weak::new()),
        }
    }

    /// See [`analyze`]
    pub fn analyze(raw: &[f32], band_count: usize, binning: BinningStrategy) -> Spectrum {
        Spectrum {
            values: analyze(raw, band_count, binning),
        }
    }

    /// Raw normalized array for `kind`; its length depends on the kind and
    /// the tap's FFT size.
    pub fn measure(&self, tap: &Arc<AnalyserTap>, kind: AnalysisKind) -> Spectrum {
        *self.last_source.lock() = Arc::downgrade(tap);

        let values = match kind {
            AnalysisKind::TimeDomain => tap.time_domain().into_iter().map(magnitude).collect(),
            AnalysisKind::Frequency => tap.frequency_db().into_iter().map(|db| self.normalize(db)).collect(),
            AnalysisKind::Music => self.aggregate_notes(tap, &self.music_notes),
            AnalysisKind::Voice => self.aggregate_notes(tap, &self.voice_notes),
        };
        Spectrum { values }
    }

    /// [`Self::measure`] bucketed into exactly `band_count` bands
    pub fn bands(
        &self,
        tap: &Arc<AnalyserTap>,
        kind: AnalysisKind,
        band_count: usize,
        binning: BinningStrategy,
    ) -> Spectrum {
        let raw = self.measure(tap, kind);
        Self::analyze(&raw.values, band_count, binning)
    }

    /// The tap most recently measured, if it is still alive
    pub fn last_source(&self) -> Option<Arc<AnalyserTap>> {
        self.last_source.lock().upgrade()
    }

    fn normalize(&self, db: f32) -> f32 {
        let value = (db - self.min_decibels) / (self.max_decibels - self.min_decibels);
        if value.is_nan() {
            0.0
        } else {
            value.clamp(0.0, 1.0)
        }
    }

    /// Each bin feeds the highest note strictly below its frequency; a note
    /// keeps the loudest bin it received.
    fn aggregate_notes(&self, tap: &AnalyserTap, notes: &[f32]) -> Vec<f32> {
        let bins = tap.frequency_db();
        let nyquist = tap.sample_rate() as f32 / 2.0;
        let bin_width = nyquist / bins.len().max(1) as f32;

        let mut loudest = vec![self.min_decibels; notes.len()];
        for (i, db) in bins.into_iter().enumerate() {
            let frequency = i as f32 * bin_width;
            let below = notes.partition_point(|&note| note < frequency);
            if below > 0 {
                let slot = &mut loudest[below - 1];
                *slot = slot.max(db);
            }
        }
        loudest.into_iter().map(|db| self.normalize(db)).collect()
    }
}

impl std::fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("min_decibels", &self.min_decibels)
            .field("max_decibels", &self.max_decibels)
            .finish()
    }
}
