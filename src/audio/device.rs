//! Audio device enumeration and the cpal backend

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::backend::{
    AudioBackend, Direction, ErrorCallback, InputCallback, OpenStream, RenderCallback,
    StreamHandle, StreamRequest,
};
use crate::error::DeviceError;

/// Summary of a device for pickers and logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                devices.push(AudioDeviceInfo {
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                } else {
                    devices.push(AudioDeviceInfo {
                        name,
                        is_input: false,
                        is_output: true,
                        is_default,
                    });
                }
            }
        }
    }

    devices
}

/// Find a device by name, or the default device for the direction
fn find_device(direction: Direction, name: Option<&str>) -> Result<cpal::Device, DeviceError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        let device = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        return device.ok_or_else(|| DeviceError::NotFound(format!("no default {:?} device", direction)));
    };

    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| DeviceError::NotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(DeviceError::NotFound(name.to_string()))
}

/// Pick a stream config at exactly `sample_rate`, preferring the device's
/// default channel count.
fn stream_config_for(
    device: &cpal::Device,
    direction: Direction,
    sample_rate: u32,
) -> Result<cpal::StreamConfig, DeviceError> {
    let rate = cpal::SampleRate(sample_rate);
    let ranges: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Input => device.supported_input_configs().map(|it| it.collect()),
        Direction::Output => device.supported_output_configs().map(|it| it.collect()),
    }
    .map_err(|e| DeviceError::NotFound(e.to_string()))?;

    let preferred_channels = match direction {
        Direction::Input => device.default_input_config().ok(),
        Direction::Output => device.default_output_config().ok(),
    }
    .map(|c| c.channels());

    let mut candidates: Vec<&cpal::SupportedStreamConfigRange> = ranges
        .iter()
        .filter(|r| rate >= r.min_sample_rate() && rate <= r.max_sample_rate())
        .collect();
    candidates.sort_by_key(|r| (Some(r.channels()) != preferred_channels, r.channels()));

    candidates
        .first()
        .map(|range| cpal::StreamConfig {
            channels: range.channels(),
            sample_rate: rate,
            buffer_size: cpal::BufferSize::Default,
        })
        .ok_or_else(|| DeviceError::UnsupportedConfig(format!("{} Hz not supported by device", sample_rate)))
}

fn map_build_error(err: cpal::BuildStreamError) -> DeviceError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceError::NotFound(err.to_string()),
        cpal::BuildStreamError::StreamConfigNotSupported => DeviceError::UnsupportedConfig(err.to_string()),
        cpal::BuildStreamError::BackendSpecific { err } => classify_backend_message(err.description),
        other => DeviceError::StreamFailed(other.to_string()),
    }
}

fn map_stream_error(err: cpal::StreamError) -> DeviceError {
    match err {
        cpal::StreamError::DeviceNotAvailable => DeviceError::Disconnected(err.to_string()),
        cpal::StreamError::BackendSpecific { err } => DeviceError::StreamFailed(err.description),
    }
}

/// Forwards stream errors and marks the stream stopped once the device is
/// gone, which also ends the thread that owns the stream.
fn stream_error_handler(
    running: Arc<AtomicBool>,
    mut on_error: ErrorCallback,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err: cpal::StreamError| {
        let err = map_stream_error(err);
        if matches!(err, DeviceError::Disconnected(_)) {
            running.store(false, Ordering::SeqCst);
        }
        on_error(err);
    }
}

/// Hosts report permission problems only as backend text.
fn classify_backend_message(message: String) -> DeviceError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        DeviceError::PermissionDenied(message)
    } else {
        DeviceError::StreamFailed(message)
    }
}

/// Keeps a cpal stream alive on its own thread. cpal streams are not `Send`,
/// so the stream is built and dropped on the thread that owns it.
pub struct CpalStreamHandle {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl StreamHandle for CpalStreamHandle {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CpalStreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

enum StreamKind {
    Input(InputCallback),
    Output(RenderCallback),
}

/// Production backend on the default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn open(
        &self,
        direction: Direction,
        request: &StreamRequest,
        kind: StreamKind,
        on_error: ErrorCallback,
    ) -> Result<OpenStream, DeviceError> {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(u16, String), DeviceError>>(1);
        let device_request = request.device.clone();
        let sample_rate = request.sample_rate;

        let thread_name = match direction {
            Direction::Input => "capture-stream",
            Direction::Output => "playback-stream",
        };

        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                // cpal devices and streams stay on this thread
                let opened = find_device(direction, device_request.as_deref()).and_then(|device| {
                    let config = stream_config_for(&device, direction, sample_rate)?;
                    Ok((device, config))
                });
                let (device, config) = match opened {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let channels = config.channels;
                let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

                let error_callback = stream_error_handler(running_for_loop.clone(), on_error);

                let stream = match kind {
                    StreamKind::Input(mut on_data) => device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| on_data(data, channels),
                        error_callback,
                        None,
                    ),
                    StreamKind::Output(mut render) => device.build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| render(data, channels),
                        error_callback,
                        None,
                    ),
                };

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(map_build_error(e)));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let err = match e {
                        cpal::PlayStreamError::DeviceNotAvailable => DeviceError::NotFound(e.to_string()),
                        cpal::PlayStreamError::BackendSpecific { err } => classify_backend_message(err.description),
                    };
                    let _ = ready_tx.send(Err(err));
                    return;
                }

                let _ = ready_tx.send(Ok((channels, device_name)));

                // Keep thread alive while running; the stream drops here
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| DeviceError::StreamFailed(e.to_string()))?;

        let mut stream_handle = CpalStreamHandle {
            running,
            thread_handle: Some(handle),
        };

        match ready_rx.recv() {
            Ok(Ok((channels, device_name))) => {
                tracing::info!(
                    "Opened {:?} stream on {} ({} Hz, {} channels)",
                    direction,
                    device_name,
                    request.sample_rate,
                    channels
                );
                Ok(OpenStream {
                    channels,
                    handle: Box::new(stream_handle),
                })
            }
            Ok(Err(e)) => {
                stream_handle.stop();
                Err(e)
            }
            Err(_) => {
                stream_handle.stop();
                Err(DeviceError::StreamFailed("stream thread exited before starting".to_string()))
            }
        }
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn supports_rate(
        &self,
        direction: Direction,
        device: Option<&str>,
        sample_rate: u32,
    ) -> Result<bool, DeviceError> {
        let device = find_device(direction, device)?;
        match stream_config_for(&device, direction, sample_rate) {
            Ok(_) => Ok(true),
            Err(DeviceError::UnsupportedConfig(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn open_input(
        &self,
        request: &StreamRequest,
        on_data: InputCallback,
        on_error: ErrorCallback,
    ) -> Result<OpenStream, DeviceError> {
        self.open(Direction::Input, request, StreamKind::Input(on_data), on_error)
    }

    fn open_output(
        &self,
        request: &StreamRequest,
        render: RenderCallback,
        on_error: ErrorCallback,
    ) -> Result<OpenStream, DeviceError> {
        self.open(Direction::Output, request, StreamKind::Output(render), on_error)
    }
}
