//! PCM16 frames and the accumulator that cuts device audio into them

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ChunkError;

/// One fixed-size capture frame, handed to exactly one consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Mono samples (channel average)
    pub mono: Vec<i16>,
    /// Interleaved device samples; equals `mono` for single-channel capture
    pub raw: Vec<i16>,
    /// Number of channels in `raw`
    pub channels: u16,
    pub sample_rate: u32,
    /// Frame sequence number within one capture session
    pub sequence: u64,
}

impl AudioFrame {
    /// Get number of samples per channel
    pub fn samples_per_channel(&self) -> usize {
        self.mono.len()
    }

    /// Get frame duration in microseconds
    pub fn duration_us(&self) -> u64 {
        (self.samples_per_channel() as u64 * 1_000_000) / self.sample_rate.max(1) as u64
    }

    /// Little-endian PCM16 bytes of the mono channel, ready for transport
    pub fn to_pcm16_bytes(&self) -> Bytes {
        encode_pcm16(&self.mono)
    }
}

/// f32 in [-1, 1] to PCM16; negative values scale by 32768, positive by 32767
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    let s = if sample.is_finite() { sample.clamp(-1.0, 1.0) } else { 0.0 };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// PCM16 to f32; exact for every i16
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Decode little-endian PCM16 bytes. A trailing half sample rejects the chunk.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<i16>, ChunkError> {
    if bytes.len() % 2 != 0 {
        return Err(ChunkError::OddLength(bytes.len()));
    }
    let mut buf = bytes;
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while buf.has_remaining() {
        samples.push(buf.get_i16_le());
    }
    Ok(samples)
}

pub fn encode_pcm16(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.put_i16_le(sample);
    }
    buf.freeze()
}

/// Collects interleaved device samples and emits fixed-size frames.
///
/// Samples that do not fill a frame stay pending until the next push.
#[derive(Debug)]
pub struct FrameAccumulator {
    frame_samples: usize,
    channels: u16,
    sample_rate: u32,
    mono: Vec<i16>,
    raw: Vec<i16>,
    next_sequence: u64,
}

impl FrameAccumulator {
    pub fn new(frame_samples: usize, channels: u16, sample_rate: u32) -> Self {
        let frame_samples = frame_samples.max(1);
        let channels = channels.max(1);
        Self {
            frame_samples,
            channels,
            sample_rate,
            mono: Vec::with_capacity(frame_samples),
            raw: Vec::with_capacity(frame_samples * channels as usize),
            next_sequence: 0,
        }
    }

    /// Push interleaved samples; `emit` is called once per completed frame,
    /// in order. A trailing partial device frame (fewer values than
    /// `channels`) is ignored.
    pub fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(AudioFrame)) {
        let channels = self.channels as usize;
        for device_frame in interleaved.chunks_exact(channels) {
            let mut sum = 0.0f32;
            for &sample in device_frame {
                self.raw.push(f32_to_i16(sample));
                sum += sample;
            }
            self.mono.push(f32_to_i16(sum / channels as f32));

            if self.mono.len() == self.frame_samples {
                emit(self.take_frame());
            }
        }
    }

    fn take_frame(&mut self) -> AudioFrame {
        let mono = std::mem::replace(&mut self.mono, Vec::with_capacity(self.frame_samples));
        let raw = std::mem::replace(
            &mut self.raw,
            Vec::with_capacity(self.frame_samples * self.channels as usize),
        );
        let raw = if self.channels == 1 { mono.clone() } else { raw };
        let frame = AudioFrame {
            mono,
            raw,
            channels: self.channels,
            sample_rate: self.sample_rate,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        frame
    }

    /// Copy of the samples collected toward the next frame
    pub fn pending(&self) -> AudioFrame {
        AudioFrame {
            mono: self.mono.clone(),
            raw: self.raw.clone(),
            channels: self.channels,
            sample_rate: self.sample_rate,
            sequence: self.next_sequence,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.mono.len()
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }
}
