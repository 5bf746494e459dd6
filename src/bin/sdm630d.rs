//! SDM630 polling daemon
//!
//! Loads a YAML configuration, attaches every meter to its (possibly shared)
//! link and polls them until Ctrl-C. Each published snapshot is logged as
//! JSON.
//!
//! Usage: sdm630d --config sdm630.yaml [--log-level debug] [--once]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use sdm630_poller::{
    init_logging, run_poller, AppConfig, ConnectionKey, ConnectionPool, MeterConfig, MeterLink,
    ModbusResult, PollEngine, Snapshot,
};

#[derive(Debug, Parser)]
#[command(name = "sdm630d", version, about = "Poll Eastron SDM630 meters over Modbus")]
struct Cli {
    /// Path to the YAML configuration
    #[arg(short, long, env = "SDM630_CONFIG", default_value = "sdm630.yaml")]
    config: PathBuf,

    /// Log filter, overrides `log_level` from the config (RUST_LOG wins over both)
    #[arg(long, env = "SDM630_LOG_LEVEL")]
    log_level: Option<String>,

    /// Run a single cycle per meter, print the snapshots and exit
    #[arg(long)]
    once: bool,
}

struct Meter {
    key: ConnectionKey,
    engine: Arc<PollEngine<MeterLink>>,
}

impl std::fmt::Debug for Meter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meter").field("key", &self.key).finish_non_exhaustive()
    }
}

fn snapshot_json(engine: &PollEngine<MeterLink>, snapshot: &Snapshot) -> String {
    let report = serde_json::json!({
        "meter": engine.name(),
        "unit_id": engine.unit_id(),
        "ok": engine.last_update_succeeded(),
        "snapshot": snapshot,
    });
    report.to_string()
}

async fn attach_meter(meter: &MeterConfig, pool: &ConnectionPool<MeterLink>) -> ModbusResult<Meter> {
    let register_set = meter.register_set()?;
    let key = meter.connection.key();
    let link = pool
        .attach(&key, || MeterLink::open(&meter.connection, meter.timeout()))
        .await?;

    let engine = match PollEngine::new(link, meter.unit_id, register_set, meter.poll_settings()) {
        Ok(engine) => engine.with_name(meter.name.clone()),
        Err(e) => {
            if let Err(detach_err) = pool.detach(&key).await {
                warn!("Detach {} failed: {}", key, detach_err);
            }
            return Err(e);
        }
    };

    info!(
        "Meter '{}' (unit {}) on {}: {} registers in {} reads",
        meter.name,
        meter.unit_id,
        key,
        engine.register_set().len(),
        engine.groups().len()
    );
    Ok(Meter {
        key,
        engine: Arc::new(engine),
    })
}

/// Attach every configured meter. On failure the links attached so far are
/// released again.
async fn attach_meters(config: &AppConfig, pool: &ConnectionPool<MeterLink>) -> ModbusResult<Vec<Meter>> {
    let mut meters = Vec::with_capacity(config.meters.len());

    for meter in &config.meters {
        match attach_meter(meter, pool).await {
            Ok(attached) => meters.push(attached),
            Err(e) => {
                detach_meters(&meters, pool).await;
                return Err(e);
            }
        }
    }

    Ok(meters)
}

async fn detach_meters(meters: &[Meter], pool: &ConnectionPool<MeterLink>) {
    for meter in meters {
        match pool.detach(&meter.key).await {
            Ok(true) => debug!("Link {} closed", meter.key),
            Ok(false) => {}
            Err(e) => warn!("Detach {} failed: {}", meter.key, e),
        }
    }
}

/// One cycle per meter. Returns `true` when every meter answered.
async fn run_once(meters: &[Meter]) -> bool {
    let mut cycles = JoinSet::new();
    for meter in meters {
        let engine = Arc::clone(&meter.engine);
        cycles.spawn(async move {
            let result = engine.poll_once().await;
            (engine, result)
        });
    }

    let mut all_ok = true;
    while let Some(joined) = cycles.join_next().await {
        match joined {
            Ok((engine, Ok(snapshot))) => println!("{}", snapshot_json(&engine, &snapshot)),
            Ok((engine, Err(e))) => {
                warn!("[{}] cycle failed: {}", engine.name(), e);
                all_ok = false;
            }
            Err(e) => {
                warn!("cycle task panicked: {}", e);
                all_ok = false;
            }
        }
    }
    all_ok
}

async fn run_daemon(meters: &[Meter]) -> ModbusResult<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut pollers = JoinSet::new();
    let mut reporters = JoinSet::new();

    for meter in meters {
        pollers.spawn(run_poller(Arc::clone(&meter.engine), shutdown_rx.clone()));

        let engine = Arc::clone(&meter.engine);
        let mut updates = engine.subscribe();
        reporters.spawn(async move {
            while updates.changed().await.is_ok() {
                let snapshot = Arc::clone(&updates.borrow_and_update());
                info!("{}", snapshot_json(&engine, &snapshot));
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for running cycles");

    // Pollers only exit between cycles.
    if shutdown_tx.send(true).is_err() {
        debug!("No poller was running");
    }
    while pollers.join_next().await.is_some() {}
    reporters.abort_all();

    Ok(())
}

async fn run(cli: Cli) -> ModbusResult<bool> {
    let config = AppConfig::load(&cli.config)?;
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level))?;
    info!("{}", sdm630_poller::info());

    let pool = ConnectionPool::new();
    let meters = attach_meters(&config, &pool).await?;

    let all_ok = if cli.once {
        run_once(&meters).await
    } else {
        run_daemon(&meters).await?;
        true
    };

    detach_meters(&meters, &pool).await;

    Ok(all_ok)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("sdm630d: {e}");
            ExitCode::FAILURE
        }
    }
}
