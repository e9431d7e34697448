//! # Onboard Voice - Headless Runner
//!
//! Runs one onboarding voice session against a relay without sound hardware.
//! The microphone is a WAV file (or silence), the agent's speech is recorded
//! into another WAV file, and every session event is logged to the console.
//!
//! ## What this binary does:
//! 1. **Loads configuration** from defaults, `onboard.toml` and `APP_*` variables
//! 2. **Sets up logging** with `tracing-subscriber`
//! 3. **Builds a virtual audio backend** fed by `runner.input_wav`
//! 4. **Connects** with the system instruction from `runner.instruction_file`
//! 5. **Follows the event stream** until the session ends or Ctrl+C is pressed
//! 6. **Writes** the recorded agent audio to `runner.output_wav`

use anyhow::{Context, Result};
use futures_util::StreamExt;
use onboard_voice::audio::wav_io;
use onboard_voice::{
    EngineConfig, LifecycleEvent, SessionController, SessionEvent, TranscriptLog, VirtualBackend,
    VirtualClock,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_INSTRUCTION: &str =
    "You are a friendly onboarding assistant. Guide the customer through the six onboarding stages.";

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = EngineConfig::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    info!("Starting onboard-voice v{}", env!("CARGO_PKG_VERSION"));
    info!("Relay: {} ({:?} dialect)", config.transport.url, config.transport.dialect);
    tracing::debug!("Effective configuration:\n{}", config.to_toml()?);

    let instruction = match &config.runner.instruction_file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read instruction file {}", path.display()))?,
        None => DEFAULT_INSTRUCTION.to_string(),
    };

    let mut backend = VirtualBackend::new(VirtualClock::wall());
    if let Some(path) = &config.runner.input_wav {
        backend = backend
            .with_wav_input(path, config.audio.input_sample_rate)
            .with_context(|| format!("failed to load microphone input {}", path.display()))?;
        info!("Streaming {} as microphone input", path.display());
    }

    let controller = SessionController::new(config.clone(), Arc::new(backend.clone()));
    let mut events = controller
        .events()
        .context("session event stream already taken")?;

    controller.connect(&instruction).await?;

    let mut transcript = TranscriptLog::new();
    let mut interrupted = false;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                if log_event(&event, &mut transcript) {
                    break;
                }
            }
            signal = &mut shutdown, if !interrupted => {
                interrupted = true;
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    continue;
                }
                info!("Interrupt received, ending session...");
                controller.disconnect().await;
            }
        }
    }

    for entry in transcript.entries() {
        info!("[{:?}] {}", entry.sender, entry.text);
    }

    if let Some(path) = &config.runner.output_wav {
        let (samples, sample_rate) = backend.recorded_output();
        wav_io::write_mono(path, &samples, sample_rate)
            .with_context(|| format!("failed to write agent audio to {}", path.display()))?;
        info!(
            "Wrote {:.1}s of agent audio to {}",
            samples.len() as f64 / sample_rate.max(1) as f64,
            path.display()
        );
    }

    Ok(())
}

/// Log one event. Returns `true` once the session has ended.
fn log_event(event: &SessionEvent, transcript: &mut TranscriptLog) -> bool {
    match event {
        SessionEvent::Lifecycle(LifecycleEvent::Reconnecting { attempt, delay }) => {
            warn!("Connection dropped, reconnect attempt {} in {:?}", attempt, delay);
        }
        SessionEvent::Lifecycle(lifecycle) => info!("Lifecycle: {:?}", lifecycle),
        SessionEvent::StageChanged { stage } => info!("Onboarding stage {}", stage),
        SessionEvent::Transcript(fragment) => {
            transcript.apply(fragment);
            tracing::debug!("{:?}: {}", fragment.sender, fragment.text);
        }
        SessionEvent::Amplitude(_) => {}
        SessionEvent::Completed(completion) => info!("Onboarding finished: {:?}", completion),
        SessionEvent::Error(e) => error!("Session error: {}", e),
        SessionEvent::Ended(summary) => {
            match serde_json::to_string_pretty(summary) {
                Ok(json) => info!("Session summary:\n{}", json),
                Err(e) => warn!("Failed to render session summary: {}", e),
            }
            return true;
        }
    }
    false
}

/// Console logging; `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "onboard_voice=debug,tokio_tungstenite=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
