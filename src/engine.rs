//! # Poll Cycle Engine
//!
//! One [`PollEngine`] per meter. A cycle reads every address group of the
//! meter's register set over the shared link, decodes the values and
//! publishes a fresh [`Snapshot`].
//!
//! ## Cycle
//!
//! 1. Refuse to start if this engine is already mid-cycle.
//! 2. Lock the shared link for the whole cycle and connect if needed. A
//!    failed connect aborts the cycle and keeps the last snapshot.
//! 3. Read the groups in order. A failed group is skipped: its keys are
//!    absent from the new snapshot, the link is closed, the bus rests for the
//!    error backoff, and a reconnect is attempted before the next group.
//! 4. After every group the bus rests for the inter-request delay.
//! 5. Publish the snapshot as a whole.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sdm630_poller::{
//!     ConnectionParams, MeterLink, PollEngine, PollSettings, RegisterSet, RegisterTier,
//!     ModbusResult,
//! };
//! use tokio::sync::Mutex;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let link = MeterLink::open(&ConnectionParams::tcp("192.168.1.50", 502), Duration::from_secs(5))?;
//!     let engine = PollEngine::new(
//!         Arc::new(Mutex::new(link)),
//!         1,
//!         RegisterSet::tier(RegisterTier::Basic),
//!         PollSettings::default(),
//!     )?;
//!
//!     let snapshot = engine.poll_once().await?;
//!     println!("{:?}", snapshot.get("frequency"));
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::batcher::{build_groups, AddressGroup};
use crate::catalog::RegisterSet;
use crate::codec::decode_group;
use crate::constants::{MAX_UNIT_ID, MIN_UNIT_ID};
use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::pool::SharedConnection;
use crate::snapshot::Snapshot;
use crate::transport::ModbusTransport;

/// Default time between cycles, in seconds.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 10;

/// Per-meter polling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub refresh_interval: Duration,
    pub limits: DeviceLimits,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            limits: DeviceLimits::default(),
        }
    }
}

impl PollSettings {
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Resets the in-progress flag when the cycle ends, including when the cycle
/// future is dropped mid-flight.
struct CycleGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> CycleGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Polling engine for one meter on a (possibly shared) link.
pub struct PollEngine<T> {
    name: String,
    connection: SharedConnection<T>,
    unit_id: u8,
    register_set: RegisterSet,
    groups: Vec<AddressGroup>,
    settings: PollSettings,
    in_progress: AtomicBool,
    last_success: AtomicBool,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
}

impl<T: ModbusTransport> PollEngine<T> {
    /// Validate the setup and compute the read groups.
    ///
    /// # Errors
    ///
    /// [`ModbusError::Configuration`] for a unit id outside 1-247, a zero
    /// refresh interval or an out-of-range batch size.
    pub fn new(
        connection: SharedConnection<T>,
        unit_id: u8,
        register_set: RegisterSet,
        settings: PollSettings,
    ) -> ModbusResult<Self> {
        if !(MIN_UNIT_ID..=MAX_UNIT_ID).contains(&unit_id) {
            return Err(ModbusError::configuration(format!(
                "Unit id must be {}-{}, got {}",
                MIN_UNIT_ID, MAX_UNIT_ID, unit_id
            )));
        }
        if settings.refresh_interval.is_zero() {
            return Err(ModbusError::configuration("Refresh interval must be non-zero"));
        }
        settings.limits.validate()?;

        let groups = build_groups(&register_set, settings.limits.max_read_registers)?;
        debug_assert!(groups
            .iter()
            .all(|group| settings.limits.is_read_within_limits(group.register_count())));
        let (snapshot_tx, _) = watch::channel(Arc::new(Snapshot::empty()));
        debug!(
            "Engine for unit {}: {} registers in {} groups",
            unit_id,
            register_set.len(),
            groups.len()
        );

        Ok(Self {
            name: format!("unit {unit_id}"),
            connection,
            unit_id,
            register_set,
            groups,
            settings,
            in_progress: AtomicBool::new(false),
            last_success: AtomicBool::new(false),
            snapshot_tx,
        })
    }

    /// Label used in log lines.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Run one poll cycle and return the snapshot it published.
    ///
    /// # Errors
    ///
    /// - [`ModbusError::CycleInProgress`] if a cycle of this engine is running
    /// - [`ModbusError::ConnectFailed`] if the link could not be established;
    ///   the previous snapshot stays published
    pub async fn poll_once(&self) -> ModbusResult<Arc<Snapshot>> {
        let _guard = CycleGuard::try_acquire(&self.in_progress).ok_or(ModbusError::CycleInProgress)?;

        let mut transport = self.connection.lock().await;

        if !transport.is_connected() {
            if let Err(e) = transport.connect().await {
                self.last_success.store(false, Ordering::Release);
                warn!("[{}] connect failed, keeping previous values: {}", self.name, e);
                return Err(ModbusError::connect_failed(e.to_string()));
            }
        }

        let limits = &self.settings.limits;
        let mut values = BTreeMap::new();
        let mut failed_groups = 0usize;

        for group in &self.groups {
            let count = group.register_count();
            let result = transport
                .read_input_registers(self.unit_id, group.start_address, count)
                .await
                .and_then(|registers| {
                    if registers.len() == usize::from(count) {
                        Ok(registers)
                    } else {
                        Err(ModbusError::invalid_data(format!(
                            "Expected {} registers, got {}",
                            count,
                            registers.len()
                        )))
                    }
                });

            match result {
                Ok(registers) => {
                    let descriptors = group.keys.iter().filter_map(|key| self.register_set.get(key));
                    for (key, reading) in decode_group(&registers, descriptors) {
                        values.insert(key.to_string(), reading);
                    }
                }
                Err(e) => {
                    failed_groups += 1;
                    debug!(
                        "[{}] group @{} ({} registers) failed: {}",
                        self.name, group.start_address, count, e
                    );

                    // nothing to close when the transport already dropped the link
                    let link_gone = e.is_connection_lost() && !transport.is_connected();
                    if !link_gone {
                        if let Err(close_err) = transport.close().await {
                            debug!("[{}] close after failure: {}", self.name, close_err);
                        }
                    }
                    sleep(limits.error_backoff).await;
                    if let Err(reconnect_err) = transport.connect().await {
                        debug!("[{}] reconnect failed: {}", self.name, reconnect_err);
                    }
                }
            }

            sleep(limits.inter_request_delay).await;
        }

        let snapshot = Arc::new(Snapshot::new(values, Utc::now()));
        self.snapshot_tx.send_replace(Arc::clone(&snapshot));
        self.last_success.store(true, Ordering::Release);

        if failed_groups > 0 {
            debug!(
                "[{}] cycle done: {} values, {}/{} groups failed",
                self.name,
                snapshot.len(),
                failed_groups,
                self.groups.len()
            );
        }
        Ok(snapshot)
    }
}

impl<T> PollEngine<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn register_set(&self) -> &RegisterSet {
        &self.register_set
    }

    /// Read groups in the order a cycle issues them.
    pub fn groups(&self) -> &[AddressGroup] {
        &self.groups
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    pub fn connection(&self) -> &SharedConnection<T> {
        &self.connection
    }

    /// Latest published snapshot; empty before the first successful cycle.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot_tx.borrow())
    }

    /// Receiver notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Outcome of the most recent cycle; `false` until one completes.
    pub fn last_update_succeeded(&self) -> bool {
        self.last_success.load(Ordering::Acquire)
    }

    pub fn is_cycle_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
}

/// Drive `engine` at its refresh interval until `shutdown` turns `true` or
/// its sender is dropped.
///
/// Missed ticks are skipped. Shutdown is only observed between cycles, so a
/// cycle that has started always runs to completion.
pub async fn run_poller<T>(engine: Arc<PollEngine<T>>, mut shutdown: watch::Receiver<bool>)
where
    T: ModbusTransport,
{
    let mut ticker = interval(engine.settings.refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        "[{}] polling every {:?}",
        engine.name,
        engine.settings.refresh_interval
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        match engine.poll_once().await {
            Ok(snapshot) => debug!("[{}] published {} values", engine.name, snapshot.len()),
            Err(ModbusError::CycleInProgress) => debug!("[{}] previous cycle still running", engine.name),
            Err(e) => warn!("[{}] cycle failed: {}", engine.name, e),
        }
    }

    info!("[{}] poller stopped", engine.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::{f32_to_regs, WordOrder};
    use crate::catalog::RegisterTier;
    use crate::snapshot::Reading;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    /// Answers every read with 230.5 per float; `fail_at` start addresses time out.
    struct FakeMeter {
        connected: bool,
        fail_at: Vec<u16>,
        read_delay: Duration,
        reads: Arc<AtomicUsize>,
    }

    impl FakeMeter {
        fn new() -> Self {
            Self {
                connected: false,
                fail_at: Vec::new(),
                read_delay: Duration::ZERO,
                reads: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ModbusTransport for FakeMeter {
        async fn connect(&mut self) -> ModbusResult<()> {
            self.connected = true;
            Ok(())
        }

        async fn read_input_registers(&mut self, _unit_id: u8, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            sleep(self.read_delay).await;
            if self.fail_at.contains(&start) {
                return Err(ModbusError::timeout("read", 5000));
            }
            let pair = f32_to_regs(230.5, WordOrder::AB);
            Ok(pair.iter().copied().cycle().take(count as usize).collect())
        }

        async fn close(&mut self) -> ModbusResult<()> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    fn engine_with(meter: FakeMeter, settings: PollSettings) -> PollEngine<FakeMeter> {
        PollEngine::new(
            Arc::new(Mutex::new(meter)),
            1,
            RegisterSet::tier(RegisterTier::Basic),
            settings,
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_bad_unit_id() {
        for unit_id in [0u8, 248, 255] {
            let result = PollEngine::new(
                Arc::new(Mutex::new(FakeMeter::new())),
                unit_id,
                RegisterSet::tier(RegisterTier::Basic),
                PollSettings::default(),
            );
            assert!(matches!(result, Err(ModbusError::Configuration { .. })));
        }
    }

    #[test]
    fn test_rejects_zero_refresh_and_bad_batch() {
        let zero = PollSettings::default().with_refresh_interval(Duration::ZERO);
        assert!(PollEngine::new(
            Arc::new(Mutex::new(FakeMeter::new())),
            1,
            RegisterSet::tier(RegisterTier::Basic),
            zero
        )
        .is_err());

        let huge = PollSettings::default().with_limits(DeviceLimits::new().with_max_read_registers(200));
        assert!(PollEngine::new(
            Arc::new(Mutex::new(FakeMeter::new())),
            1,
            RegisterSet::tier(RegisterTier::Basic),
            huge
        )
        .is_err());
    }

    #[test]
    fn test_initial_state() {
        let engine = engine_with(FakeMeter::new(), PollSettings::default());
        assert!(engine.snapshot().is_empty());
        assert!(!engine.last_update_succeeded());
        assert!(!engine.is_cycle_in_progress());
        assert_eq!(engine.groups().len(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_pacing() {
        let mut meter = FakeMeter::new();
        meter.fail_at = vec![52];
        let engine = engine_with(meter, PollSettings::default());

        let started = Instant::now();
        let snapshot = engine.poll_once().await.unwrap();

        // 9 inter-request delays plus one error backoff
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(9 * 100 + 500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(9 * 100 + 500 + 50), "{elapsed:?}");
        assert_eq!(snapshot.get("total_system_power"), None);
        assert_eq!(snapshot.get("frequency"), Some(Reading::Value(230.5)));
        assert_eq!(snapshot.len(), 13);
        assert!(engine.last_update_succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_cycle_is_refused() {
        let mut meter = FakeMeter::new();
        meter.read_delay = Duration::from_secs(1);
        let engine = Arc::new(engine_with(meter, PollSettings::default()));

        let background = Arc::clone(&engine);
        let handle = tokio::spawn(async move { background.poll_once().await });
        tokio::task::yield_now().await;

        assert!(engine.is_cycle_in_progress());
        assert!(matches!(engine.poll_once().await, Err(ModbusError::CycleInProgress)));

        handle.await.unwrap().unwrap();
        assert!(!engine.is_cycle_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_cycle_releases_guard() {
        let mut meter = FakeMeter::new();
        meter.read_delay = Duration::from_secs(60);
        let engine = engine_with(meter, PollSettings::default());

        let result = tokio::time::timeout(Duration::from_secs(1), engine.poll_once()).await;
        assert!(result.is_err());
        assert!(!engine.is_cycle_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_each_snapshot() {
        let engine = engine_with(FakeMeter::new(), PollSettings::default());
        let mut rx = engine.subscribe();

        engine.poll_once().await.unwrap();
        assert!(rx.has_changed().unwrap());
        let seen = Arc::clone(&rx.borrow_and_update());
        assert_eq!(seen.len(), 14);
        assert!(Arc::ptr_eq(&seen, &engine.snapshot()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_poller_ticks_and_stops() {
        let meter = FakeMeter::new();
        let reads = Arc::clone(&meter.reads);
        let settings = PollSettings::default()
            .with_refresh_interval(Duration::from_secs(10))
            .with_limits(DeviceLimits::new().with_inter_request_delay_ms(0));
        let engine = Arc::new(engine_with(meter, settings));

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_poller(Arc::clone(&engine), stop_rx));

        // first tick fires immediately, then at 10s and 20s
        sleep(Duration::from_secs(25)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(reads.load(Ordering::SeqCst), 3 * engine.groups().len());
        assert!(engine.last_update_succeeded());
    }
}
