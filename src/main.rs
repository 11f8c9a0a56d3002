use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtc_session::config::{AppConfig, EnvCredentialProvider};
use rtc_session::events::{EventBus, SessionEvent};
use rtc_session::media::{MediaConstraints, SampleMediaDevices};
use rtc_session::peer::RtcPeerFactory;
use rtc_session::session::SessionController;
use rtc_session::signaling::SignalingChannel;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// rtc-session command line arguments
#[derive(Parser, Debug)]
#[command(name = "rtc-session")]
#[command(version, about = "Peer-to-peer streaming session manager", long_about = None)]
struct CliArgs {
    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Signaling server URL (overrides config)
    #[arg(short = 's', long, value_name = "URL")]
    signaling_url: Option<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a stream
    Broadcast {
        stream_id: String,

        /// Video only, no audio track
        #[arg(long)]
        no_audio: bool,

        /// Video bitrate cap in kbps (overrides config)
        #[arg(long, value_name = "KBPS")]
        max_bitrate_kbps: Option<u32>,
    },
    /// Watch a stream
    View { stream_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting rtc-session v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load_or_default(args.config.as_deref()).await?;
    if let Some(url) = args.signaling_url {
        config.signaling.url = url;
    }
    if let Command::Broadcast {
        max_bitrate_kbps: Some(kbps),
        ..
    } = &args.command
    {
        config.media.max_video_bitrate_kbps = *kbps;
    }
    config.validate()?;

    let ice_servers = config.resolve_ice_servers(&EnvCredentialProvider);
    tracing::info!(
        "Using {} ICE server entries, signaling at {}",
        ice_servers.len(),
        config.signaling.url
    );

    let config = Arc::new(config);
    let events = Arc::new(EventBus::new());
    let event_log = tokio::spawn(log_events(events.subscribe()));

    let signaling = SignalingChannel::connect(
        config.signaling.url.clone(),
        events.clone(),
        Duration::from_millis(config.signaling.reconnect_delay_ms),
    );

    let controller = SessionController::new(
        config.clone(),
        ice_servers,
        events.clone(),
        signaling.clone(),
        Arc::new(RtcPeerFactory::new()),
        Arc::new(SampleMediaDevices::default()),
    );
    let dispatcher = controller.attach_signaling(signaling.subscribe());

    wait_for_signaling(&signaling).await;

    match &args.command {
        Command::Broadcast {
            stream_id,
            no_audio,
            ..
        } => {
            let constraints = if *no_audio {
                MediaConstraints::video_only()
            } else {
                MediaConstraints::audio_video()
            };
            controller.start_streaming(stream_id, constraints).await?;
        }
        Command::View { stream_id } => {
            controller.join_stream(stream_id).await?;
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    let stopped = match &args.command {
        Command::Broadcast { .. } => controller.stop_streaming().await,
        Command::View { .. } => controller.leave_stream().await,
    };
    if let Err(e) = stopped {
        tracing::warn!("Failed to end session cleanly: {}", e);
    }

    signaling.shutdown().await;
    dispatcher.abort();
    event_log.abort();
    tracing::info!("Bye");
    Ok(())
}

/// Give the signaling channel a moment to come up before the first send
async fn wait_for_signaling(signaling: &SignalingChannel) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !signaling.is_open() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if !signaling.is_open() {
        tracing::warn!(
            "Signaling to {} not open yet, continuing; messages sent now are dropped",
            signaling.url()
        );
    }
}

async fn log_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        match rx.recv().await {
            Ok(SessionEvent::StatsUpdate { stream_id, stats }) => {
                tracing::debug!(
                    "[{}] stats: {:.0} kbps, loss {:.2}%, rtt {:?}",
                    stream_id,
                    stats.avg_bitrate_bps / 1000.0,
                    stats.loss_rate * 100.0,
                    stats.round_trip_time
                );
            }
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::info!("event {}", json),
                Err(_) => tracing::info!("event {:?}", event),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event log lagged by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Initialize logging with the given level and verbosity
fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "rtc_session=error,webrtc=error",
        LogLevel::Warn => "rtc_session=warn,webrtc=warn",
        LogLevel::Info => "rtc_session=info,webrtc=warn",
        LogLevel::Verbose => "rtc_session=debug,webrtc=warn",
        LogLevel::Debug => "rtc_session=debug,webrtc=info",
        LogLevel::Trace => "rtc_session=trace,webrtc=debug",
    };

    // RUST_LOG wins over the CLI level
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
