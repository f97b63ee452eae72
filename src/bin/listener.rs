use clap::{App, Arg};
use evobus::catalog::CommandCatalog;
use evobus::config::ListenerConfig;
use evobus::listener::{BusListener, ListenerSettings};
use evobus::measurement::{BufferedSink, JsonLinesSink, DEFAULT_RETRY_CAPACITY};
use evobus::scheduler::RefreshScheduler;
use evobus::state::{run_snapshot_publisher, JsonFileSnapshotStore};
use evobus::summary::run_summary_export;
use evobus::transport::SerialTransport;
use evobus::zones::ZoneStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("evobus-listener")
        .version("0.1.0")
        .author("Home Heating Systems Team")
        .about("Evohome RF bus listener for an HGI80 bridge")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON config file; command-line flags override its values")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("device")
                .short("d")
                .long("device")
                .value_name("PATH")
                .help("Serial device of the HGI80")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("baud")
                .short("b")
                .long("baud")
                .value_name("RATE")
                .help("Serial baud rate")
                .takes_value(true)
                .validator(|v| match v.parse::<u32>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Baud rate must be a number".into()),
                }),
        )
        .arg(
            Arg::with_name("controller")
                .long("controller")
                .value_name("ADDRESS")
                .help("Controller address, e.g. 01:160371")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("gateway")
                .long("gateway")
                .value_name("ADDRESS")
                .help("Address the bridge sends from")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("state-file")
                .long("state-file")
                .value_name("FILE")
                .help("Zone snapshot file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("measurements-file")
                .long("measurements-file")
                .value_name("FILE")
                .help("Append-only JSON lines file for measurements")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("summary-file")
                .long("summary-file")
                .value_name("FILE")
                .help("Append-only JSON lines file for the accumulated zone export")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log-level")
                .short("l")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log verbosity")
                .takes_value(true)
                .possible_values(&["error", "warn", "info", "debug", "trace"])
                .default_value("info"),
        )
        .get_matches();

    let level: Level = matches.value_of("log-level").unwrap_or("info").parse()?;
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = match matches.value_of("config") {
        Some(path) => ListenerConfig::from_file(path)?,
        None => ListenerConfig::default(),
    };
    if let Some(device) = matches.value_of("device") {
        config.device = device.to_string();
    }
    if let Some(baud) = matches.value_of("baud") {
        config.baud_rate = baud.parse()?;
    }
    if let Some(controller) = matches.value_of("controller") {
        config.set_controller(controller)?;
    }
    if let Some(gateway) = matches.value_of("gateway") {
        config.set_gateway(gateway)?;
    }
    if let Some(path) = matches.value_of("state-file") {
        config.state_file = path.into();
    }
    if let Some(path) = matches.value_of("measurements-file") {
        config.measurements_file = path.into();
    }
    if let Some(path) = matches.value_of("summary-file") {
        config.summary_file = path.into();
    }
    config.validate()?;
    let controller = config.controller()?;

    let mut snapshot_store = JsonFileSnapshotStore::new(&config.state_file);
    let store = ZoneStore::from_snapshot(snapshot_store.load_or_default()?);
    info!(zones = store.len(), "Loaded zone state from {}", config.state_file.display());

    let sink = BufferedSink::new(
        JsonLinesSink::open(&config.measurements_file)?,
        DEFAULT_RETRY_CAPACITY,
    );

    let summary_sink = JsonLinesSink::open(&config.summary_file)?;

    let transport = match SerialTransport::open(config.device.clone(), config.baud_rate) {
        Ok(transport) => transport,
        Err(e) => {
            // the listener keeps retrying through its reconnect path
            warn!("{}", e);
            SerialTransport::new(config.device.clone(), config.baud_rate)
        }
    };

    let (mut listener, handles) = BusListener::new(
        transport,
        sink,
        Arc::new(CommandCatalog::new()),
        config.gateway,
        store,
        ListenerSettings::from(&config),
    )?;

    let cancel = CancellationToken::new();
    let scheduler = RefreshScheduler::new(controller, handles.outbound.clone(), config.jitter_percent);
    scheduler.enqueue_startup_requests().await;

    let tasks = vec![
        tokio::spawn(scheduler.clone().run_refresh(
            config.refresh_interval(),
            handles.refresh_generation,
            cancel.clone(),
        )),
        tokio::spawn(
            scheduler
                .clone()
                .run_heartbeat(config.heartbeat_interval(), cancel.clone()),
        ),
        tokio::spawn(scheduler.run_health_check(
            Arc::clone(&handles.monitor),
            config.health_check_interval(),
            config.link_timeout(),
            Arc::clone(&handles.reconnect),
            cancel.clone(),
        )),
        tokio::spawn(run_summary_export(
            summary_sink,
            handles.snapshots.clone(),
            config.summary_warmup(),
            config.summary_interval(),
            config.jitter_percent,
            cancel.clone(),
        )),
        tokio::spawn(run_snapshot_publisher(
            snapshot_store,
            handles.snapshots,
            config.snapshot_interval(),
            config.jitter_percent,
            cancel.clone(),
        )),
    ];

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let result = listener.run(cancel.clone()).await;
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }

    let state = listener.get_state();
    info!(
        lines = state.lines_read,
        dropped = state.lines_dropped,
        measurements = state.measurements_emitted,
        reconnects = state.reconnects,
        "Listener summary"
    );

    result.map_err(Into::into)
}
