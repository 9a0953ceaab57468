//! Loopback demo
//!
//! Captures the microphone and plays it straight back, one track per turn.
//! Ctrl-C interrupts playback and prints where the audible turn was cut.
//!
//! Usage: `loopback [turn seconds]`

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use voice_pipeline::{
    audio::list_devices,
    config::PipelineConfig,
    AnalysisKind, BinningStrategy, FrameSource, PlayerEvent, StreamPlayer, TrackId,
};

const BAR_COUNT: usize = 80;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voice pipeline loopback");

    let turn_length = match std::env::args().nth(1) {
        Some(arg) => Duration::from_secs_f32(arg.parse::<f32>().context("turn length must be seconds")?),
        None => Duration::from_secs(3),
    };

    let config = PipelineConfig::load().context("failed to load config")?;

    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
    }
    println!();

    let mut capture = FrameSource::new(&config);
    let mut player = StreamPlayer::new(&config);

    player.connect().await.context("failed to open playback device")?;
    capture.begin().await.context("failed to open capture device")?;

    let (chunk_tx, chunk_rx) = crossbeam_channel::unbounded();
    capture.start_capture(move |frame| {
        let _ = chunk_tx.send(frame.to_pcm16_bytes());
    })?;

    let events = player.events();
    let errors = capture.errors();

    let mut turn = TrackId::new(Uuid::new_v4().to_string());
    let mut turn_started = Instant::now();
    let mut last_report = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(20));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tracing::info!("Speak now; Ctrl-C to interrupt");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                while let Ok(chunk) = chunk_rx.try_recv() {
                    if let Err(e) = player.add_16bit_pcm(&chunk, turn.clone()) {
                        tracing::warn!("Dropped chunk: {}", e);
                    }
                }

                if turn_started.elapsed() >= turn_length {
                    turn = TrackId::new(Uuid::new_v4().to_string());
                    turn_started = Instant::now();
                    tracing::debug!("New turn {}", turn);
                }

                while let Ok(event) = events.try_recv() {
                    match event {
                        PlayerEvent::DeviceLost(e) => anyhow::bail!("playback device lost: {}", e),
                        other => tracing::debug!("{:?}", other),
                    }
                }
                if let Ok(e) = errors.try_recv() {
                    anyhow::bail!("capture device lost: {}", e);
                }

                if last_report.elapsed() >= Duration::from_secs(1) {
                    let input = capture.current_bands(AnalysisKind::Voice, BAR_COUNT, BinningStrategy::Linear);
                    let output = player.get_bands(AnalysisKind::Voice, BAR_COUNT, BinningStrategy::Linear);
                    let stats = capture.stats();
                    tracing::info!(
                        "mic peak {:.2} | speaker peak {:.2} | frames {} ({} dropped) | clock {}",
                        input.peak(),
                        output.peak(),
                        stats.frames_produced,
                        stats.frames_dropped,
                        player.clock()
                    );
                    last_report = Instant::now();
                }
            }
            _ = &mut ctrl_c => {
                match player.interrupt() {
                    Some(cut) => println!("{}", serde_json::to_string(&cut)?),
                    None => println!("null"),
                }
                break;
            }
        }
    }

    capture.end().await?;
    player.disconnect().await?;
    tracing::info!("Loopback stopped");
    Ok(())
}
