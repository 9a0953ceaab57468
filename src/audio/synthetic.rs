//! Manually clocked backend
//!
//! Nothing runs on its own: input arrives when [`SyntheticBackend::feed_input`]
//! is called and output is rendered when [`SyntheticBackend::pull_output`] is
//! called, on the caller's thread. Used for headless rendering and tests.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::backend::{
    AudioBackend, Direction, ErrorCallback, InputCallback, OpenStream, RenderCallback,
    StreamHandle, StreamRequest,
};
use crate::error::DeviceError;

struct InputSlot {
    callback: InputCallback,
    on_error: ErrorCallback,
    running: Arc<AtomicBool>,
}

struct OutputSlot {
    render: RenderCallback,
    on_error: ErrorCallback,
    running: Arc<AtomicBool>,
}

#[derive(Default)]
struct SyntheticState {
    input: Option<InputSlot>,
    output: Option<OutputSlot>,
    deny_input: Option<DeviceError>,
    deny_output: Option<DeviceError>,
    supported_rates: Option<Vec<u32>>,
}

/// Backend whose streams are driven by explicit calls
#[derive(Clone)]
pub struct SyntheticBackend {
    input_channels: u16,
    output_channels: u16,
    state: Arc<Mutex<SyntheticState>>,
}

impl SyntheticBackend {
    /// Mono in, mono out
    pub fn new() -> Self {
        Self::with_channels(1, 1)
    }

    pub fn with_channels(input_channels: u16, output_channels: u16) -> Self {
        Self {
            input_channels: input_channels.max(1),
            output_channels: output_channels.max(1),
            state: Arc::new(Mutex::new(SyntheticState::default())),
        }
    }

    /// Restrict the rates `supports_rate` accepts
    pub fn with_supported_rates(self, rates: &[u32]) -> Self {
        self.state.lock().supported_rates = Some(rates.to_vec());
        self
    }

    /// Make the next `open_input` fail, e.g. with a permission error
    pub fn deny_input(&self, err: DeviceError) {
        self.state.lock().deny_input = Some(err);
    }

    /// Make the next `open_output` fail
    pub fn deny_output(&self, err: DeviceError) {
        self.state.lock().deny_output = Some(err);
    }

    /// Deliver interleaved samples to the open capture stream.
    /// Returns false when no capture stream is open.
    pub fn feed_input(&self, samples: &[f32]) -> bool {
        // Take the slot out so the callback runs without our lock held
        let Some(mut slot) = self.state.lock().input.take() else {
            return false;
        };
        let running = slot.running.load(Ordering::SeqCst);
        if running {
            (slot.callback)(samples, self.input_channels);
        }
        let mut state = self.state.lock();
        if state.input.is_none() && slot.running.load(Ordering::SeqCst) {
            state.input = Some(slot);
        }
        running
    }

    /// Render `frames` frames from the open playback stream, interleaved.
    /// Returns `None` when no playback stream is open.
    pub fn pull_output(&self, frames: usize) -> Option<Vec<f32>> {
        let mut slot = self.state.lock().output.take()?;
        if !slot.running.load(Ordering::SeqCst) {
            return None;
        }
        let mut buffer = vec![0.0f32; frames * self.output_channels as usize];
        (slot.render)(&mut buffer, self.output_channels);
        let mut state = self.state.lock();
        if state.output.is_none() && slot.running.load(Ordering::SeqCst) {
            state.output = Some(slot);
        }
        Some(buffer)
    }

    /// Simulate the capture device vanishing mid-stream
    pub fn disconnect_input(&self, reason: &str) {
        if let Some(mut slot) = self.state.lock().input.take() {
            slot.running.store(false, Ordering::SeqCst);
            (slot.on_error)(DeviceError::Disconnected(reason.to_string()));
        }
    }

    /// Simulate the playback device vanishing mid-stream
    pub fn disconnect_output(&self, reason: &str) {
        if let Some(mut slot) = self.state.lock().output.take() {
            slot.running.store(false, Ordering::SeqCst);
            (slot.on_error)(DeviceError::Disconnected(reason.to_string()));
        }
    }

    pub fn input_open(&self) -> bool {
        self.state.lock().input.is_some()
    }

    pub fn output_open(&self) -> bool {
        self.state.lock().output.is_some()
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct SyntheticStreamHandle {
    running: Arc<AtomicBool>,
    state: Arc<Mutex<SyntheticState>>,
    direction: Direction,
}

impl StreamHandle for SyntheticStreamHandle {
    fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        // Only clear the slot if it still belongs to this stream
        match self.direction {
            Direction::Input => {
                if state.input.as_ref().is_some_and(|s| Arc::ptr_eq(&s.running, &self.running)) {
                    state.input = None;
                }
            }
            Direction::Output => {
                if state.output.as_ref().is_some_and(|s| Arc::ptr_eq(&s.running, &self.running)) {
                    state.output = None;
                }
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for SyntheticStreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AudioBackend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn supports_rate(
        &self,
        _direction: Direction,
        _device: Option<&str>,
        sample_rate: u32,
    ) -> Result<bool, DeviceError> {
        Ok(match &self.state.lock().supported_rates {
            Some(rates) => rates.contains(&sample_rate),
            None => true,
        })
    }

    fn open_input(
        &self,
        request: &StreamRequest,
        on_data: InputCallback,
        on_error: ErrorCallback,
    ) -> Result<OpenStream, DeviceError> {
        let mut state = self.state.lock();
        if let Some(err) = state.deny_input.take() {
            return Err(err);
        }
        if let Some(rates) = &state.supported_rates {
            if !rates.contains(&request.sample_rate) {
                return Err(DeviceError::UnsupportedConfig(format!("{} Hz", request.sample_rate)));
            }
        }
        let running = Arc::new(AtomicBool::new(true));
        state.input = Some(InputSlot {
            callback: on_data,
            on_error,
            running: running.clone(),
        });
        Ok(OpenStream {
            channels: self.input_channels,
            handle: Box::new(SyntheticStreamHandle {
                running,
                state: self.state.clone(),
                direction: Direction::Input,
            }),
        })
    }

    fn open_output(
        &self,
        request: &StreamRequest,
        render: RenderCallback,
        on_error: ErrorCallback,
    ) -> Result<OpenStream, DeviceError> {
        let mut state = self.state.lock();
        if let Some(err) = state.deny_output.take() {
            return Err(err);
        }
        if let Some(rates) = &state.supported_rates {
            if !rates.contains(&request.sample_rate) {
                return Err(DeviceError::UnsupportedConfig(format!("{} Hz", request.sample_rate)));
            }
        }
        let running = Arc::new(AtomicBool::new(true));
        state.output = Some(OutputSlot {
            render,
            on_error,
            running: running.clone(),
        });
        Ok(OpenStream {
            channels: self.output_channels,
            handle: Box::new(SyntheticStreamHandle {
                running,
                state: self.state.clone(),
                direction: Direction::Output,
            }),
        })
    }
}
