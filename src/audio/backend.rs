//! Device backend seam
//!
//! Capture and playback never touch hardware directly. They hand callbacks to
//! an [`AudioBackend`], which drives them from whatever clock it owns: a cpal
//! stream thread in production, or a test thread in [`super::SyntheticBackend`].

use crate::error::DeviceError;

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Receives interleaved f32 samples and the device channel count
pub type InputCallback = Box<dyn FnMut(&[f32], u16) + Send + 'static>;

/// Fills an interleaved f32 buffer for the given device channel count
pub type RenderCallback = Box<dyn FnMut(&mut [f32], u16) + Send + 'static>;

/// Reports asynchronous stream failures (device unplugged, backend crash)
pub type ErrorCallback = Box<dyn FnMut(DeviceError) + Send + 'static>;

/// What to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Device name, `None` for the system default
    pub device: Option<String>,
    pub sample_rate: u32,
}

/// Keeps an open stream alive. Dropping the handle closes the stream.
pub trait StreamHandle: Send {
    /// Close the stream and release the device. Idempotent.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// An opened stream and the channel layout the device settled on
pub struct OpenStream {
    pub channels: u16,
    pub handle: Box<dyn StreamHandle>,
}

impl std::fmt::Debug for OpenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenStream")
            .field("channels", &self.channels)
            .field("running", &self.handle.is_running())
            .finish()
    }
}

/// Source of input and output streams
pub trait AudioBackend: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Whether the named (or default) device can run at `sample_rate`
    fn supports_rate(
        &self,
        direction: Direction,
        device: Option<&str>,
        sample_rate: u32,
    ) -> Result<bool, DeviceError>;

    /// Open a capture stream. Blocking; callers run it off the async runtime.
    fn open_input(
        &self,
        request: &StreamRequest,
        on_data: InputCallback,
        on_error: ErrorCallback,
    ) -> Result<OpenStream, DeviceError>;

    /// Open a playback stream. Blocking; callers run it off the async runtime.
    fn open_output(
        &self,
        request: &StreamRequest,
        render: RenderCallback,
        on_error: ErrorCallback,
    ) -> Result<OpenStream, DeviceError>;
}
