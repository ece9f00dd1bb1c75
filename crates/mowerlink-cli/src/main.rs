use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use mowerlink_core::stream::CredentialCache;
use mowerlink_core::transport::cloud::{CloudClient, CloudRestTransport};
use mowerlink_core::transport::mqtt::{MqttAddress, MqttIdentity, MqttTransport};
use mowerlink_core::{
    CloudCredentialSource, Command as DeviceCommand, DeviceRecord, JsonFileStore, MowJob,
    MowerController, NudgeDirection, ScheduledTask, Session, StateStore, TelemetrySnapshot,
    Transport, TransportKind,
};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod exporter;
mod viewer;

use config::HostConfig;

#[derive(Debug, Parser)]
#[command(name = "mowerlinkd")]
#[command(about = "Mammotion mower session host")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, default_value = "./mowerlink.json")]
    config: PathBuf,

    /// Overrides the transport preference from the config file.
    #[arg(long, value_enum)]
    transport: Option<TransportArg>,

    #[arg(long)]
    command_timeout_ms: Option<u64>,

    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Status {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    Watch {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    Mow {
        /// Zone ids from the config file; empty mows the whole map.
        #[arg(long = "zone")]
        zones: Vec<String>,
        #[arg(long)]
        speed: Option<f64>,
        #[arg(long)]
        channel_mode: Option<u8>,
        #[arg(long)]
        blade_height_mm: Option<u8>,
        #[arg(long)]
        path_spacing_cm: Option<u8>,
    },
    Dock,
    Pause,
    Cancel,
    Nudge {
        #[arg(value_enum)]
        direction: DirectionArg,
        #[arg(long)]
        speed: Option<f64>,
    },
    BladeHeight {
        mm: u8,
    },
    Video {
        #[command(subcommand)]
        action: VideoAction,
    },
    SyncMaps,
    Firmware {
        #[command(subcommand)]
        action: FirmwareAction,
    },
    /// Runs the configured mowing schedules until interrupted.
    Run {
        #[arg(long, default_value_t = 30)]
        tick_sec: u64,
    },
    View {
        #[arg(long, default_value_t = 600.0)]
        window_sec: f64,
    },
    Export {
        #[arg(long, default_value = "./data/telemetry")]
        output_dir: String,
        #[arg(long, default_value_t = 90)]
        retention_days: u64,
    },
}

#[derive(Debug, Subcommand)]
enum VideoAction {
    Start,
    Stop,
    Refresh,
    Tokens,
}

#[derive(Debug, Subcommand)]
enum FirmwareAction {
    /// Requests the device version and prints it once reported.
    Version,
    Update,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Ndjson,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Ble,
    Mqtt,
    Cloud,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Ble => TransportKind::Ble,
            TransportArg::Mqtt => TransportKind::Mqtt,
            TransportArg::Cloud => TransportKind::CloudRest,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DirectionArg {
    Forward,
    Back,
    Left,
    Right,
}

impl From<DirectionArg> for NudgeDirection {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Forward => NudgeDirection::Forward,
            DirectionArg::Back => NudgeDirection::Back,
            DirectionArg::Left => NudgeDirection::Left,
            DirectionArg::Right => NudgeDirection::Right,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut host = HostConfig::load(&cli.config)?;
    let store = JsonFileStore::new(host.state_dir.clone());

    if let Some(record) = store.load(&host.device.id)? {
        host.device.preference = record.preference;
    }
    if let Some(transport) = cli.transport {
        host.device.preference = transport.into();
    }

    let mut session_config = host.session_config();
    if let Some(ms) = cli.command_timeout_ms {
        session_config.command_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = cli.heartbeat_interval_ms {
        session_config.heartbeat_interval = Duration::from_millis(ms);
    }

    if let Command::Video { action } = &cli.command {
        if matches!(action, VideoAction::Refresh | VideoAction::Tokens) {
            return video_tokens(&host, &store, matches!(action, VideoAction::Refresh)).await;
        }
    }

    let transports = build_transports(&host)?;
    let session = Session::spawn(
        host.device.clone(),
        transports,
        session_config.clone(),
        host.limits.clone(),
    );
    let link = session.connect().await.context("connecting to mower")?;
    info!(device=%host.device.id, transport=%link.kind, endpoint=%link.endpoint, "session up");
    remember_preference(&store, &host, link.kind);

    let controller = MowerController::new(session.clone());
    let result = match cli.command {
        Command::Status { format } => {
            wait_for_telemetry(&session, session_config.command_timeout).await;
            print_snapshot(&session, &session.telemetry().latest(), format)
        }
        Command::Watch { format } => watch_loop(&session, format).await,
        Command::Mow {
            zones,
            speed,
            channel_mode,
            blade_height_mm,
            path_spacing_cm,
        } => {
            wait_for_telemetry(&session, session_config.command_timeout).await;
            let defaults = MowJob::default();
            let job = MowJob {
                areas: host.zone_registry()?.area_hashes(&zones)?,
                speed: speed.unwrap_or(defaults.speed),
                channel_mode: channel_mode.unwrap_or(defaults.channel_mode),
                blade_height_mm: blade_height_mm.unwrap_or(defaults.blade_height_mm),
                path_spacing_cm: path_spacing_cm.unwrap_or(defaults.path_spacing_cm),
                ..defaults
            };
            report(controller.start_mowing(Some(job)).await?)
        }
        Command::Dock => {
            wait_for_telemetry(&session, session_config.command_timeout).await;
            report(controller.dock().await?)
        }
        Command::Pause => {
            wait_for_telemetry(&session, session_config.command_timeout).await;
            report(controller.pause().await?)
        }
        Command::Cancel => report(controller.cancel_job().await?),
        Command::Nudge { direction, speed } => {
            report(controller.nudge(direction.into(), speed).await?)
        }
        Command::BladeHeight { mm } => report(controller.set_blade_height(mm).await?),
        Command::Video { action } => match action {
            VideoAction::Start => {
                session.execute(DeviceCommand::JoinWebrtc).await?;
                video_tokens(&host, &store, false).await
            }
            VideoAction::Stop => {
                session.execute(DeviceCommand::LeaveWebrtc).await?;
                println!("video relay stopped");
                Ok(())
            }
            VideoAction::Refresh | VideoAction::Tokens => Ok(()),
        },
        Command::SyncMaps => report(controller.sync_maps().await?),
        Command::Firmware { action } => match action {
            FirmwareAction::Version => {
                let mut telemetry = session.telemetry();
                report(controller.check_firmware_version().await?)?;
                if telemetry.latest().device_version().is_none() {
                    let _ = timeout(session_config.command_timeout, telemetry.changed()).await;
                }
                let version = telemetry.latest().device_version();
                println!("firmware: {}", version.as_deref().unwrap_or("unknown"));
                Ok(())
            }
            FirmwareAction::Update => report(controller.update_firmware().await?),
        },
        Command::Run { tick_sec } => run_schedules(&host, &controller, tick_sec).await,
        Command::View { window_sec } => viewer::run_viewer(&session, window_sec).await,
        Command::Export {
            output_dir,
            retention_days,
        } => exporter::run_exporter(&session, &output_dir, retention_days).await,
    };

    session.shutdown().await;
    result
}

fn build_transports(host: &HostConfig) -> Result<Vec<Box<dyn Transport>>> {
    let mut transports: Vec<Box<dyn Transport>> = Vec::new();

    if let Some(mqtt) = &host.mqtt {
        let identity = MqttIdentity {
            product_key: host.device.product_key.clone().unwrap_or_default(),
            device_name: host.device.id.clone(),
            client_id: mqtt.client_id.clone(),
            username: mqtt.username.clone(),
            password: mqtt.password.clone(),
        };
        let address = MqttAddress {
            host: mqtt.host.clone(),
            port: mqtt.port,
            use_tls: mqtt.use_tls,
        };
        transports.push(Box::new(MqttTransport::new(address, identity)));
    }

    if let Some(cloud) = &host.cloud {
        let api = CloudClient::new(&cloud.base_url, &cloud.token, host.session_config().command_timeout)?;
        let mut transport = CloudRestTransport::new(api, &host.device.id);
        if let Some(ms) = cloud.poll_interval_ms {
            transport = transport.with_poll_interval(Duration::from_millis(ms));
        }
        transports.push(Box::new(transport));
    }

    debug!(configured=?host.transports_configured(), "transports built");
    if transports.is_empty() {
        bail!("no transport configured: add an \"mqtt\" or \"cloud\" section");
    }
    if host.device.preference == TransportKind::Ble {
        warn!("BLE needs a host radio stack; falling back to network transports");
    }
    Ok(transports)
}

fn remember_preference(store: &JsonFileStore, host: &HostConfig, kind: TransportKind) {
    let previous = store.load(&host.device.id).ok().flatten();
    let record = DeviceRecord {
        device_id: host.device.id.clone(),
        preference: kind,
        last_credentials: previous.and_then(|r| r.last_credentials),
    };
    if let Err(err) = store.save(&record) {
        warn!(error=%err, "could not persist device state");
    }
}

async fn video_tokens(host: &HostConfig, store: &JsonFileStore, force: bool) -> Result<()> {
    let Some(cloud) = &host.cloud else {
        bail!("video credentials need a \"cloud\" section");
    };
    let stream_config = host.stream_config();
    let api = CloudClient::new(&cloud.base_url, &cloud.token, stream_config.fetch_timeout)?;
    let source = CloudCredentialSource::new(api, stream_config.default_ttl);
    let mut cache = CredentialCache::new(source, host.device.id.clone(), &stream_config);

    let mut record = store.load(&host.device.id)?.unwrap_or_else(|| DeviceRecord {
        device_id: host.device.id.clone(),
        preference: host.device.preference,
        last_credentials: None,
    });
    if let Some(previous) = record.last_credentials.clone() {
        cache.seed(previous);
    }

    let credentials = if force {
        cache.refresh().await?
    } else {
        cache.current().await?
    };
    record.last_credentials = Some(credentials.clone());
    store.save(&record)?;

    println!("{}", serde_json::to_string_pretty(&credentials.bundle())?);
    info!(expires_at=%credentials.expires_at, "stream tokens issued");
    Ok(())
}

async fn wait_for_telemetry(session: &Session, limit: Duration) {
    let mut reader = session.telemetry();
    if reader.last_updated().is_some() {
        return;
    }
    if timeout(limit, reader.changed()).await.is_err() {
        warn!("no telemetry yet, using an empty snapshot");
    }
}

fn report(issued: Vec<DeviceCommand>) -> Result<()> {
    if issued.is_empty() {
        println!("nothing to do in the current mode");
    }
    for command in issued {
        println!("acked: {}", command.name());
    }
    Ok(())
}

async fn watch_loop(session: &Session, format: OutputFormat) -> Result<()> {
    let mut reader = session.telemetry();
    let mut states = session.watch_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(%state, "connection");
            }
            snapshot = reader.changed() => {
                let Some(snapshot) = snapshot else { break };
                print_snapshot(session, &snapshot, format)?;
            }
        }
    }

    Ok(())
}

async fn run_schedules(host: &HostConfig, controller: &MowerController, tick_sec: u64) -> Result<()> {
    let schedule = host.schedule()?;
    info!(entries=%schedule.list().len(), next=?schedule.next_due(Utc::now()), "schedule loaded");

    let mut since = Utc::now();
    let mut ticker = interval(Duration::from_secs(tick_sec.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            _ = ticker.tick() => {
                let now = Utc::now();
                for action in schedule.due(since, now) {
                    let outcome = match action.task {
                        ScheduledTask::StartMowing { job } => controller.start_mowing(job).await,
                        ScheduledTask::Dock => controller.dock().await,
                    };
                    match outcome {
                        Ok(issued) => info!(entry=%action.entry, commands=%issued.len(), "scheduled action done"),
                        Err(err) => warn!(entry=%action.entry, error=%err, "scheduled action failed"),
                    }
                }
                since = now;
            }
        }
    }

    Ok(())
}

fn print_snapshot(session: &Session, snapshot: &Arc<TelemetrySnapshot>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
        }
        OutputFormat::Ndjson => {
            println!("{}", serde_json::to_string(snapshot.as_ref())?);
        }
        OutputFormat::Human => {
            let device = session.device();
            println!("=== {} ({}) ===", device.name, device.id);
            println!(
                "Link:       state={} transport={} seq={}",
                session.state(),
                session
                    .link_info()
                    .map(|l| l.kind.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                snapshot.seq,
            );
            println!("Updated:    {}", freshness(snapshot, session.stale_after(), Utc::now()));
            println!(
                "Activity:   {} (work mode {:?})",
                snapshot
                    .activity()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                snapshot.work_mode(),
            );
            if let Some(battery) = snapshot.battery_percent() {
                println!("Battery:    {battery:.0}%");
            }
            if let Some(progress) = snapshot.progress_percent() {
                println!("Progress:   {progress:.0}%");
            }
            for (key, value) in snapshot.values.iter() {
                println!("  {key:<20} {value}");
            }
        }
    }

    Ok(())
}

fn freshness(snapshot: &TelemetrySnapshot, stale_after: Duration, now: DateTime<Utc>) -> String {
    format!(
        "{} stale={}",
        snapshot
            .last_updated
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "never".to_string()),
        snapshot.is_stale(stale_after, now),
    )
}
