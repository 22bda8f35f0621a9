use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::observability;

/// How often the compactor looks at the journal's append count.
pub const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub reconcile_interval: Duration,
    /// A pass running longer than this is logged and left to finish; ticks
    /// are skipped until it does.
    pub reconcile_timeout: Duration,
    /// Compact once more than this many records were appended. 0 disables.
    pub compact_threshold: u64,
    pub compact_check_interval: Duration,
}

impl From<&Config> for MaintenanceConfig {
    fn from(config: &Config) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval,
            reconcile_timeout: config.reconcile_timeout,
            compact_threshold: config.compact_threshold,
            compact_check_interval: COMPACT_CHECK_INTERVAL,
        }
    }
}

/// Background tasks of one engine. Dropping the handle leaves them running;
/// call `stop` to shut them down.
pub struct MaintenanceHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Cancel both loops and wait for them, including a reconcile pass that
    /// is still in flight.
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("maintenance task ended abnormally: {e}");
            }
        }
    }
}

pub fn spawn(engine: Arc<Engine>, config: MaintenanceConfig) -> MaintenanceHandle {
    let cancel = CancellationToken::new();
    let mut tasks = vec![tokio::spawn(run_reconciler(
        engine.clone(),
        config.reconcile_interval,
        config.reconcile_timeout,
        cancel.clone(),
    ))];
    if config.compact_threshold > 0 {
        tasks.push(tokio::spawn(run_compactor(
            engine,
            config.compact_threshold,
            config.compact_check_interval,
            cancel.clone(),
        )));
    }
    MaintenanceHandle { cancel, tasks }
}

/// Periodic availability reconciliation. Each pass runs in its own task so a
/// slow pass never blocks the timer, and never more than one at a time.
pub async fn run_reconciler(
    engine: Arc<Engine>,
    every: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
            metrics::counter!(observability::RECONCILE_SKIPPED_TOTAL).increment(1);
            warn!("reconcile tick skipped: previous pass still running");
            continue;
        }

        let tick_engine = engine.clone();
        let mut handle = tokio::spawn(async move { reconcile_tick(&tick_engine).await });
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => in_flight = None,
            Ok(Err(e)) => {
                error!("reconcile pass panicked: {e}");
                in_flight = None;
            }
            Err(_) => {
                warn!("reconcile pass exceeded {timeout:?}, letting it finish");
                in_flight = Some(handle);
            }
        }
    }

    if let Some(handle) = in_flight {
        let _ = handle.await;
    }
    info!("reconciler stopped");
}

async fn reconcile_tick(engine: &Engine) {
    let now = engine.now_ms();
    if let Err(e) = engine.reconcile_expired(now).await {
        metrics::counter!(observability::RECONCILE_FAILURES_TOTAL).increment(1);
        error!("reconcile at {now} failed: {e}");
    }
}

/// Rewrites the journal as a snapshot once it has grown past `threshold`
/// appends.
pub async fn run_compactor(
    engine: Arc<Engine>,
    threshold: u64,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let appends = engine.journal_appends_since_compact().await;
        if appends <= threshold {
            debug!("compaction not needed: {appends} appends");
            continue;
        }
        match engine.compact_journal().await {
            Ok(records) => {
                metrics::counter!(observability::JOURNAL_COMPACTIONS_TOTAL).increment(1);
                info!("compacted journal after {appends} appends into {records} records");
            }
            Err(e) => error!("journal compaction failed: {e}"),
        }
    }
    info!("compactor stopped");
}
