//! tdoa-node application.
//!
//! This module contains the top-level [`App`] structure that wires the
//! subsystems together and runs them concurrently, and the shared
//! [`AppState`] handle used by the background tasks and the controller
//! command listener.

use crate::args::Args;
use crate::bus::{command_channel, EventBus, NodeCommand};
use crate::db::query::{QueryInterface, TimeRange};
use crate::db::report::{
    ReportFormat, ReportGenerator, ReportOptions, ReportTemplate,
};
use crate::db::{EventRecord, EventSeverity, ReportRecord, SignalDb};
use crate::device::bb60::{Bb60Device, UseCase};
use crate::device::SignalSource;
use crate::monitor::{LoadGauges, MetricsReporter};
use crate::stream::IqBuffer;
use crate::tiles::cache::{CompressionConfig, TileCache};
use crate::tiles::download::{DownloadQueue, Downloader};
use crate::tiles::server::{ServerConfig, TileServer, UpdateSweeper};
use crate::tiles::TileStats;
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the controller command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// tdoa-node application.
///
/// Owns the background subsystems and runs them concurrently. The
/// application only stops when one of them fails fatally.
#[derive(Debug)]
pub struct App {
    state: AppState,
    tile_server: TileServer,
    downloader: Downloader,
    sweeper: UpdateSweeper,
    scheduler: ReportScheduler,
    reporter: MetricsReporter,
    commands: CommandListener,
}

impl App {
    /// Creates a new application from the CLI arguments.
    pub fn new(args: &Args) -> Result<App> {
        let db = Arc::new(
            SignalDb::open(&args.db_path)
                .with_context(|| format!("opening signal database {:?}", args.db_path))?,
        );
        db.insert_event(&EventRecord {
            id: None,
            timestamp: Utc::now(),
            event_type: "node_startup".to_string(),
            severity: EventSeverity::Info,
            source: args.node_id.clone(),
            description: format!("node {} starting", args.node_id),
            metadata: None,
            created_at: Utc::now(),
        })
        .context("recording the startup event")?;
        let query = QueryInterface::new(db.clone());
        let mut reports = ReportGenerator::new(query);
        reports
            .register_template(default_daily_template())
            .context("registering the built-in report template")?;

        let compression = CompressionConfig {
            enabled: !args.no_tile_compression,
            level: args.tile_compression_level,
        };
        let tile_cache = Arc::new(
            TileCache::new(&args.tile_cache, compression)
                .with_context(|| format!("opening tile cache {:?}", args.tile_cache))?,
        );
        let tile_stats = Arc::new(TileStats::new());
        let tile_queue = Arc::new(DownloadQueue::new());
        let bus = EventBus::new();
        let gauges = Arc::new(LoadGauges::new());
        let cancel = CancellationToken::new();
        let (command_sender, command_receiver) = command_channel(COMMAND_CHANNEL_CAPACITY);

        let device = if args.enable_receiver {
            Some(Mutex::new(open_receiver(args, &gauges)?))
        } else {
            None
        };

        let state = AppState(Arc::new(State {
            db,
            reports: Mutex::new(reports),
            tile_cache: tile_cache.clone(),
            tile_stats: tile_stats.clone(),
            bus: bus.clone(),
            gauges: gauges.clone(),
            command_sender,
            device,
        }));

        let tile_server = TileServer::new(
            &ServerConfig {
                port: args.tile_port,
                rate_limit: args.tile_rate_limit,
                ..Default::default()
            },
            tile_cache.clone(),
            tile_stats,
            tile_queue.clone(),
        );
        let downloader = Downloader::new(
            tile_queue.clone(),
            tile_cache.clone(),
            state.tile_stats().clone(),
            args.max_concurrent_downloads,
            cancel.clone(),
        );
        let sweeper = UpdateSweeper::new(
            tile_cache,
            tile_queue.clone(),
            Duration::from_secs(args.tile_check_interval_hours * 3600),
            Duration::from_secs(args.tile_max_age_hours * 3600),
            cancel.clone(),
        );
        let scheduler = ReportScheduler {
            state: state.clone(),
            tick: Duration::from_secs(args.report_tick_secs),
            cancel: cancel.clone(),
        };
        let disk_path = match args.db_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        let reporter = MetricsReporter::new(
            bus,
            gauges,
            tile_queue,
            disk_path,
            Duration::from_secs(args.metrics_interval_secs),
            cancel,
        );
        let commands = CommandListener {
            state: state.clone(),
            receiver: command_receiver,
        };
        Ok(App {
            state,
            tile_server,
            downloader,
            sweeper,
            scheduler,
            reporter,
            commands,
        })
    }

    /// The shared application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Runs the application.
    ///
    /// This only returns if one of the subsystems fails.
    #[tracing::instrument(name = "App::run", skip_all)]
    pub async fn run(self) -> Result<()> {
        tokio::select! {
            ret = self.tile_server.run() => ret,
            ret = self.downloader.run() => ret,
            ret = self.sweeper.run() => ret,
            ret = self.scheduler.run() => ret,
            ret = self.reporter.run() => ret,
            ret = self.commands.run() => ret,
        }
    }
}

/// Application state.
///
/// Behaves as an `Arc<...>`: cheap to clone, clones share the same state.
#[derive(Debug, Clone)]
pub struct AppState(Arc<State>);

#[derive(Debug)]
struct State {
    db: Arc<SignalDb>,
    reports: Mutex<ReportGenerator>,
    tile_cache: Arc<TileCache>,
    tile_stats: Arc<TileStats>,
    bus: EventBus,
    gauges: Arc<LoadGauges>,
    command_sender: mpsc::Sender<NodeCommand>,
    device: Option<Mutex<Bb60Device>>,
}

impl AppState {
    /// Gives access to the signal database.
    pub fn db(&self) -> &Arc<SignalDb> {
        &self.0.db
    }

    /// Gives access to the report generator.
    pub fn reports(&self) -> &Mutex<ReportGenerator> {
        &self.0.reports
    }

    /// Gives access to the tile cache.
    pub fn tile_cache(&self) -> &Arc<TileCache> {
        &self.0.tile_cache
    }

    /// Gives access to the tile service counters.
    pub fn tile_stats(&self) -> &Arc<TileStats> {
        &self.0.tile_stats
    }

    /// Gives access to the event bus.
    pub fn bus(&self) -> &EventBus {
        &self.0.bus
    }

    /// Gives access to the workload gauges.
    pub fn gauges(&self) -> &Arc<LoadGauges> {
        &self.0.gauges
    }

    /// Sender half of the controller command channel.
    pub fn command_sender(&self) -> mpsc::Sender<NodeCommand> {
        self.0.command_sender.clone()
    }

    /// Gives access to the receiver, when one was opened at startup.
    pub fn device(&self) -> Option<&Mutex<Bb60Device>> {
        self.0.device.as_ref()
    }
}

fn default_daily_template() -> ReportTemplate {
    ReportTemplate {
        name: "daily_summary".to_string(),
        description: "Daily signal activity summary".to_string(),
        sections: vec![
            "signal_summary".to_string(),
            "geolocation_summary".to_string(),
            "event_summary".to_string(),
        ],
        parameters: HashMap::new(),
        supported_formats: vec![ReportFormat::Csv, ReportFormat::Json, ReportFormat::Kml],
    }
}

fn open_receiver(args: &Args, gauges: &Arc<LoadGauges>) -> Result<Bb60Device> {
    let mut device = Bb60Device::new();
    device.set_profile_dir(&args.profile_dir);
    device
        .open(None)
        .map_err(|e| anyhow::anyhow!("opening receiver: {e}"))?;
    device
        .optimize_for(UseCase::Tdoa)
        .map_err(|e| anyhow::anyhow!("configuring receiver: {e}"))?;
    let handle = device.metrics_handle();
    let buffer_period_us =
        device.config().buffer_size as f64 / device.config().sample_rate * 1.0e6;
    let gauges = gauges.clone();
    device
        .start_stream(Box::new(move |buffer: &IqBuffer| {
            // The DSP chain is an external consumer; here only liveness and
            // loss are accounted.
            gauges.set_active_signals(1);
            let metrics = handle.snapshot();
            gauges.set_signal_load(metrics.avg_callback_time_us / buffer_period_us * 100.0);
            if buffer.sample_loss() {
                tracing::warn!("receiver reported a sample break");
            }
        }))
        .map_err(|e| anyhow::anyhow!("starting receiver stream: {e}"))?;
    tracing::info!("receiver streaming");
    Ok(device)
}

/// Periodic report scheduler tick.
#[derive(Debug)]
struct ReportScheduler {
    state: AppState,
    tick: Duration,
    cancel: CancellationToken,
}

impl ReportScheduler {
    #[tracing::instrument(name = "report_scheduler", skip_all)]
    async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.tick) => {}
            }
            self.state
                .reports()
                .lock()
                .unwrap()
                .process_due_reports(Utc::now());
        }
    }
}

/// Controller command listener.
#[derive(Debug)]
struct CommandListener {
    state: AppState,
    receiver: mpsc::Receiver<NodeCommand>,
}

impl CommandListener {
    #[tracing::instrument(name = "command_listener", skip_all)]
    async fn run(mut self) -> Result<()> {
        while let Some(command) = self.receiver.recv().await {
            dispatch_command(&self.state, command);
        }
        Ok(())
    }
}

fn dispatch_command(state: &AppState, command: NodeCommand) {
    match command {
        NodeCommand::GenerateReport {
            template,
            format,
            output_path,
        } => {
            let now = Utc::now();
            let options = ReportOptions {
                format,
                time_range: Some(TimeRange {
                    start: now - ChronoDuration::hours(24),
                    end: now,
                }),
                ..Default::default()
            };
            let reports = state.reports().lock().unwrap();
            let result = reports
                .generate_report(&template, &options)
                .and_then(|report| {
                    reports.export(&report, format, &output_path)?;
                    Ok(())
                });
            match result {
                Ok(()) => {
                    let record = ReportRecord {
                        id: None,
                        timestamp: now,
                        report_type: template.clone(),
                        title: template.clone(),
                        description: None,
                        parameters: None,
                        format: format.as_str().to_string(),
                        file_path: output_path.display().to_string(),
                        created_at: now,
                        created_by: "controller".to_string(),
                    };
                    if let Err(error) = state.db().insert_report(&record) {
                        tracing::warn!(%error, "report row insert failed");
                    }
                    tracing::info!(%template, path = %output_path.display(), "report generated");
                }
                Err(error) => tracing::warn!(%template, %error, "report command failed"),
            }
        }
        NodeCommand::ClearTileCache { older_than } => {
            match state.tile_cache().clear(older_than) {
                Ok(removed) => tracing::info!(removed, "tile cache cleared"),
                Err(error) => tracing::warn!(%error, "tile cache clear failed"),
            }
        }
        NodeCommand::PurgeDatabase { before } => match state.db().purge(&before) {
            Ok(removed) => tracing::info!(removed, "database purged"),
            Err(error) => tracing::warn!(%error, "database purge failed"),
        },
        NodeCommand::VacuumDatabase => match state.db().vacuum() {
            Ok(()) => tracing::info!("database vacuumed"),
            Err(error) => tracing::warn!(%error, "database vacuum failed"),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::testutil::signal;
    use clap::Parser;

    fn test_args(dir: &tempfile::TempDir) -> Args {
        Args::parse_from([
            "tdoa-node",
            "--db-path",
            dir.path().join("signals.db").to_str().unwrap(),
            "--tile-cache",
            dir.path().join("tiles").to_str().unwrap(),
            "--profile-dir",
            dir.path().join("profiles").to_str().unwrap(),
        ])
    }

    #[test]
    fn app_construction_wires_subsystems() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(&test_args(&dir)).unwrap();
        assert!(app.state().device().is_none());
        let stats = app.state().db().stats().unwrap();
        assert_eq!(stats.total_signals, 0);
        // The startup event is on record.
        assert_eq!(stats.total_events, 1);
        assert!(app.state().reports().lock().unwrap().template("daily_summary").is_some());
    }

    #[test]
    fn app_with_receiver_streams() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = test_args(&dir);
        args.enable_receiver = true;
        let app = App::new(&args).unwrap();
        let device = app.state().device().unwrap();
        assert!(device.lock().unwrap().is_open());
        std::thread::sleep(Duration::from_millis(30));
        let metrics = device.lock().unwrap().metrics();
        assert!(metrics.callback_count > 0);
        device.lock().unwrap().stop_stream().unwrap();
    }

    #[test]
    fn generate_report_command_writes_file_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(&test_args(&dir)).unwrap();
        let state = app.state().clone();
        state
            .db()
            .insert_signal(&signal(0, 145.5e6, "node001", None))
            .unwrap();
        let output = dir.path().join("daily.json");
        dispatch_command(
            &state,
            NodeCommand::GenerateReport {
                template: "daily_summary".to_string(),
                format: ReportFormat::Json,
                output_path: output.clone(),
            },
        );
        assert!(output.exists());
        let written = std::fs::read_to_string(&output).unwrap();
        assert!(written.starts_with("Signal Summary"));
        assert_eq!(state.db().stats().unwrap().total_reports, 1);
    }

    #[test]
    fn clear_tile_cache_command() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(&test_args(&dir)).unwrap();
        let state = app.state().clone();
        state
            .tile_cache()
            .write(crate::tiles::TileId::new(0, 0, 0).unwrap(), b"\x89PNGx")
            .unwrap();
        dispatch_command(&state, NodeCommand::ClearTileCache { older_than: None });
        assert!(!state
            .tile_cache()
            .contains(crate::tiles::TileId::new(0, 0, 0).unwrap()));
    }
}
