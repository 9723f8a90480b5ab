use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::{info, warn};
use tokio::{signal, sync::broadcast, time};

use crate::{
    clock::format_elapsed,
    db::Database,
    finalizer::HttpScoreStore,
    identity::{CredentialChain, EnvCredentials, FileCredentials},
    sampler::{CaptureDevice, DirectoryDevice, UnavailableDevice},
    session::{LiveSession, SessionDeps, SessionEvent, SessionMode, SessionOptions},
    settings::{debug_enabled, SettingsStore},
    telemetry::WebSocketConnector,
    utils::logging,
};

pub const AUTH_TOKEN_ENV: &str = "PREPAI_AUTH_TOKEN";

/// How long to wait for the final report after asking for it.
const FINAL_REPORT_GRACE: Duration = Duration::from_secs(10);

/// Run one live practice session against the scoring service.
#[derive(Parser, Debug)]
#[command(name = "prepai")]
#[command(about = "Stream a practice session to the scoring service")]
#[command(version)]
pub struct Args {
    /// Session mode
    #[arg(long, value_enum, ignore_case = true, default_value_t = SessionMode::Interview)]
    pub mode: SessionMode,

    /// Directory of images replayed as the camera feed
    #[arg(long)]
    pub frames_dir: Option<PathBuf>,

    /// Start with the camera off
    #[arg(long)]
    pub no_camera: bool,

    /// Start with the microphone off
    #[arg(long)]
    pub no_mic: bool,

    /// Where settings, credentials and the session journal live
    #[arg(long, default_value = ".prepai", env = "PREPAI_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Override the scoring service WebSocket URL
    #[arg(long)]
    pub scorer_url: Option<String>,

    /// Override the score persistence URL
    #[arg(long)]
    pub store_url: Option<String>,
}

pub fn run() -> Result<()> {
    let args = Args::parse();
    logging::init(debug_enabled());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run_session(args))
}

async fn run_session(args: Args) -> Result<()> {
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create {}", args.data_dir.display()))?;

    let journal = Database::new(args.data_dir.join("prepai.sqlite3"))?;
    let recovered = journal.recover_interrupted_sessions(Utc::now()).await?;
    if recovered > 0 {
        warn!("Marked {recovered} unfinished session(s) as interrupted");
    }

    let settings_store = SettingsStore::new(args.data_dir.join("settings.json"))?;
    let mut settings = settings_store.settings().with_env_overrides();
    if let Some(url) = args.scorer_url {
        settings.scorer_url = url;
    }
    if let Some(url) = args.store_url {
        settings.store_url = url;
    }

    let credentials = CredentialChain::new()
        .with(EnvCredentials::new(AUTH_TOKEN_ENV))
        .with(FileCredentials::new(args.data_dir.join("auth_token")));

    let device: Arc<dyn CaptureDevice> = match &args.frames_dir {
        Some(dir) => {
            let device = DirectoryDevice::new(dir);
            info!("Replaying camera frames from {}", device.dir().display());
            Arc::new(device)
        }
        None => Arc::new(UnavailableDevice),
    };

    let connector = WebSocketConnector::new(settings.scorer_url.clone());
    let store = HttpScoreStore::new(settings.store_url.clone(), settings.request_timeout())?;
    info!(
        "Scoring service {}, score store {}",
        connector.url(),
        store.url()
    );

    let session = LiveSession::new(
        SessionDeps {
            connector: Arc::new(connector),
            device,
            store: Arc::new(store),
            credentials: Arc::new(credentials),
            journal: Some(journal),
        },
        SessionOptions {
            mode: args.mode,
            camera_enabled: !args.no_camera,
            mic_enabled: !args.no_mic,
            sampler: settings.sampler_config(),
            ..SessionOptions::default()
        },
    );

    let printer = tokio::spawn(print_events(session.subscribe()));
    session.start().await?;
    info!("Session {} running; press Ctrl-C to end", session.id());

    let outcome = tokio::select! {
        outcome = session.finished() => outcome,
        interrupted = signal::ctrl_c() => {
            if let Err(err) = interrupted {
                warn!("Failed to listen for Ctrl-C: {err}");
            }
            session.end_session().await;
            match time::timeout(FINAL_REPORT_GRACE, session.finished()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("No final report within {}s", FINAL_REPORT_GRACE.as_secs());
                    None
                }
            }
        }
    };

    session.shutdown().await;
    printer.abort();

    match outcome {
        Some(outcome) => info!(
            "Session complete: user={} duration={} submitted={}",
            outcome.payload.user_id,
            format_elapsed(outcome.payload.duration),
            outcome.submitted
        ),
        None => warn!("Session ended without a final report"),
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::ScoresUpdated { scores }) => info!(
                "attention {:.0} | stability {:.0} | smoothness {:.0} | confidence {:.0}",
                scores.attention, scores.stability, scores.smoothness, scores.confidence
            ),
            Ok(SessionEvent::ChannelStateChanged { state }) => {
                info!("Telemetry channel {:?}", state)
            }
            Ok(SessionEvent::CameraChanged { enabled }) => {
                info!("Camera {}", if enabled { "on" } else { "off" })
            }
            Ok(SessionEvent::Finalized { outcome }) => {
                info!("Final report: {:?}", outcome.report.scores)
            }
            Ok(SessionEvent::Ended { snapshot }) => {
                info!("Session ended at {}", snapshot.duration_label)
            }
            Ok(SessionEvent::ClockTick { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Display lagged; skipped {skipped} events")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Args::try_parse_from(["prepai"]).unwrap();
        assert_eq!(args.mode, SessionMode::Interview);
        assert!(!args.no_camera);
        assert!(args.frames_dir.is_none());
    }

    #[test]
    fn flags_parse() {
        let args = Args::try_parse_from([
            "prepai",
            "--mode",
            "informal",
            "--no-camera",
            "--no-mic",
            "--scorer-url",
            "ws://10.0.0.2:8765",
        ])
        .unwrap();
        assert_eq!(args.mode, SessionMode::Informal);
        assert!(args.no_camera && args.no_mic);
        assert_eq!(args.scorer_url.as_deref(), Some("ws://10.0.0.2:8765"));
        assert!(Args::try_parse_from(["prepai", "--mode", "panel"]).is_err());
    }

    #[test]
    fn mode_ignores_case() {
        let args = Args::try_parse_from(["prepai", "--mode", "Informal"]).unwrap();
        assert_eq!(args.mode, SessionMode::Informal);
    }
}
