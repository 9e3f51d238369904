use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mediamtx_whep::auth::{RefreshingToken, StaticToken, TokenProvider};
use mediamtx_whep::config::{ConfigStore, WhepConfig};
use mediamtx_whep::control::{ChannelTarget, ControlMessage, ControlReceiver, ControlSender};
use mediamtx_whep::whep::{
    max_restarts, ClientHooks, ClientState, ReqwestTransport, TrackEvent, WhepClient, WhepHandle,
};

/// How often the RTP counters are logged
const STATS_INTERVAL: Duration = Duration::from_secs(5);

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

/// mediamtx-whep command line arguments
#[derive(Parser, Debug)]
#[command(name = "mediamtx-whep")]
#[command(version, about = "Watch a MediaMTX stream over WHEP", long_about = None)]
struct CliArgs {
    /// JSON configuration file (created with defaults if missing)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Widget hand-off: base64 JSON, optionally prefixed with `?config=`
    #[arg(long, value_name = "BASE64", conflicts_with = "config")]
    card_config: Option<String>,

    /// Origin of the home-automation host
    #[arg(short = 'o', long, value_name = "URL")]
    origin: Option<String>,

    /// Stream resource name
    #[arg(short = 'r', long, value_name = "NAME")]
    resource: Option<String>,

    /// Endpoint base URL; repeat to rotate between several
    #[arg(short = 'e', long = "endpoint", value_name = "URL")]
    endpoints: Vec<String>,

    /// Static bearer token
    #[arg(short = 't', long, value_name = "TOKEN")]
    token: Option<String>,

    /// Refresh token used to renew the access token
    #[arg(long, value_name = "TOKEN")]
    refresh_token: Option<String>,

    /// OAuth client id sent with refresh requests
    #[arg(long, value_name = "ID")]
    client_id: Option<String>,

    /// Stop retrying after this many restarts
    #[arg(long, value_name = "N")]
    max_restarts: Option<u32>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting mediamtx-whep v{}", env!("CARGO_PKG_VERSION"));

    let (mut config, store) = load_config(&args).await?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    tracing::info!(
        "Stream: {} ({}), origin {}",
        config.name.as_deref().unwrap_or(&config.resource),
        config.resource,
        config.origin
    );

    let tokens: Arc<dyn TokenProvider> = if config.auth.can_refresh() {
        tracing::info!("Using refreshing access token");
        let provider = match store {
            Some(store) => RefreshingToken::with_store(&config.origin, config.auth.clone(), store)?,
            None => RefreshingToken::new(&config.origin, config.auth.clone())?,
        };
        Arc::new(provider)
    } else {
        Arc::new(StaticToken::new(config.auth.access_token.clone()))
    };

    let transport = Arc::new(ReqwestTransport::new(&config.origin)?);

    let mut hooks = ClientHooks::new()
        .on_track(spawn_rtp_counter)
        .on_connection_state(|state| tracing::info!("Connection state: {}", state));
    if let Some(max) = args.max_restarts {
        hooks = hooks.should_retry(max_restarts(max));
    }

    let handle = WhepClient::new(&config, transport, tokens)
        .with_hooks(hooks)
        .spawn();

    spawn_event_logger(&handle);
    spawn_control(&handle, &config.origin);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            tracing::info!("Shutdown signal received");
            handle.stop().await?;
        }
        _ = client_finished(&handle) => {
            handle.wait().await?;
        }
    }

    tracing::info!("Viewer shutdown complete");
    Ok(())
}

/// Resolves once the client task has stopped on its own
async fn client_finished(handle: &WhepHandle) {
    let mut state = handle.watch_state();
    let _ = state.wait_for(|s| *s == ClientState::Stopped).await;
}

/// Load the configuration from a file, the widget hand-off, or defaults
async fn load_config(args: &CliArgs) -> anyhow::Result<(WhepConfig, Option<ConfigStore>)> {
    if let Some(path) = &args.config {
        tracing::info!("Configuration file: {}", path.display());
        let store = ConfigStore::new(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let config = (*store.get()).clone();
        return Ok((config, Some(store)));
    }

    if let Some(encoded) = &args.card_config {
        let config = WhepConfig::from_card_query(encoded).context("Invalid card configuration")?;
        return Ok((config, None));
    }

    Ok((WhepConfig::default(), None))
}

fn apply_overrides(config: &mut WhepConfig, args: &CliArgs) {
    if let Some(origin) = &args.origin {
        config.origin = origin.clone();
    }
    if let Some(resource) = &args.resource {
        config.resource = resource.clone();
    }
    if !args.endpoints.is_empty() {
        config.endpoints = args.endpoints.clone();
    }
    if let Some(token) = &args.token {
        config.auth.access_token = token.clone();
    }
    if let Some(refresh_token) = &args.refresh_token {
        config.auth.refresh_token = Some(refresh_token.clone());
        // expired, so the first request refreshes
        config.auth.expires.get_or_insert(0);
    }
    if let Some(client_id) = &args.client_id {
        config.auth.client_id = Some(client_id.clone());
    }
}

/// Count RTP packets of a remote track and log throughput periodically
fn spawn_rtp_counter(event: TrackEvent) {
    let Some(track) = event.track else {
        return;
    };

    tokio::spawn(async move {
        let mut packets: u64 = 0;
        let mut bytes: u64 = 0;
        let mut report = tokio::time::interval(STATS_INTERVAL);
        report.tick().await;

        loop {
            tokio::select! {
                result = track.read_rtp() => match result {
                    Ok((packet, _)) => {
                        packets += 1;
                        bytes += packet.payload.len() as u64;
                    }
                    Err(e) => {
                        tracing::debug!("{} track {} ended: {}", event.kind, event.track_id, e);
                        break;
                    }
                },
                _ = report.tick() => {
                    tracing::info!(
                        "{} track {}: {} packets, {} bytes",
                        event.kind,
                        event.track_id,
                        packets,
                        bytes
                    );
                }
            }
        }
    });
}

fn spawn_event_logger(handle: &WhepHandle) {
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::debug!("event: {}", json),
                    Err(e) => {
                        tracing::debug!("event {} not serializable: {}", event.event_name(), e)
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Event logger lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Wire stdin to the control protocol: one JSON message per line
fn spawn_control(handle: &WhepHandle, origin: &str) {
    let target = Arc::new(ChannelTarget::new());
    let rx = target.attach();

    let receiver = ControlReceiver::new(origin, Arc::new(handle.clone()));
    let mut view = receiver.watch_view();
    tokio::spawn(receiver.run(rx));

    tokio::spawn(async move {
        while view.changed().await.is_ok() {
            let state = *view.borrow();
            tracing::info!("View: fullscreen={}, muted={}", state.fullscreen, state.muted);
        }
    });

    let sender = ControlSender::new(origin, target);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match ControlMessage::from_json(&line) {
                Ok(message) => match sender.post(message).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!("Control message dropped: viewer not ready"),
                    Err(e) => tracing::warn!("Failed to post control message: {}", e),
                },
                Err(e) => tracing::warn!("Invalid control message '{}': {}", line.trim(), e),
            }
        }
    });
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "mediamtx_whep=error,webrtc=error",
        LogLevel::Warn => "mediamtx_whep=warn,webrtc=warn",
        LogLevel::Info => "mediamtx_whep=info,webrtc=warn",
        LogLevel::Verbose => "mediamtx_whep=debug,webrtc=warn",
        LogLevel::Debug => "mediamtx_whep=debug,webrtc=info",
        LogLevel::Trace => "mediamtx_whep=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
