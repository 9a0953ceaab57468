//! Audio subsystem module

pub mod backend;
pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;
pub mod synthetic;

pub use backend::{AudioBackend, Direction, OpenStream, StreamHandle, StreamRequest};
pub use buffer::{AudioFrame, FrameAccumulator};
pub use capture::{CaptureControl, CaptureStats, CaptureToken, FrameCallback, FrameSource};
pub use device::{list_devices, AudioDeviceInfo, CpalBackend};
pub use playback::StreamPlayer;
pub use synthetic::SyntheticBackend;
