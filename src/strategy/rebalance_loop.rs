//! Session lifecycle and the minute-tick rebalance loop.
//!
//! A session waits for the open, logs the opening buckets, then ticks at a
//! fixed interval. Each tick either runs one rebalance cycle or, inside the
//! pre-close window, liquidates everything and sleeps into the next session.

use crate::config::Config;
use crate::gateway::BrokerGateway;
use crate::strategy::batch::{BatchOrderEngine, BucketExecution};
use crate::strategy::bucketizer::{Bucketizer, Buckets};
use crate::strategy::clock::{sleep_or_shutdown, MarketClock};
use crate::strategy::ranker::Ranker;
use crate::strategy::reconciler::{PositionReconciler, Reconciliation};
use crate::strategy::sampler::PriceSampler;
use crate::strategy::session::{liquidate_all, CloseCheck, PreCloseGuard, SessionTicker};
use crate::strategy::submitter::OrderSubmitter;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where the loop is in the trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    WaitingForOpen,
    Rebalancing,
    ClosingPositions,
    SleepingUntilNextSession,
}

/// Loop parameters resolved from configuration.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub universe: Vec<String>,
    pub bucket_fraction: Decimal,
    pub lookback_bars: u32,
    pub short_ratio: Decimal,
    pub tick_interval: Duration,
    /// Liquidate once the time to close drops below this
    pub pre_close: Duration,
    /// Clock poll cadence while the market is closed
    pub open_poll_interval: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &Config, universe: Vec<String>) -> Self {
        let tick_interval = Duration::from_secs(config.schedule.tick_interval_secs);
        Self {
            universe,
            bucket_fraction: config.strategy.bucket_fraction,
            lookback_bars: config.strategy.lookback_bars,
            short_ratio: config.strategy.short_ratio,
            tick_interval,
            pre_close: Duration::from_secs(config.schedule.pre_close_minutes * 60),
            open_poll_interval: tick_interval,
        }
    }
}

/// Summary of one rebalance cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub buckets: Buckets,
    pub cancelled_orders: usize,
    /// False when the position fetch failed and reconciliation was skipped
    pub positions_available: bool,
    pub blacklisted: usize,
    pub reconcile_failures: usize,
    pub long: BucketExecution,
    pub short: BucketExecution,
    /// Non-zero orders sent to the gateway, accepted or not
    pub orders_sent: usize,
}

impl CycleReport {
    pub fn compensated(&self) -> bool {
        self.long.compensation.is_some() || self.short.compensation.is_some()
    }
}

/// Result of one tick.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Rebalanced(Box<CycleReport>),
    /// Inside the pre-close window; positions were liquidated
    Closing { liquidated: usize },
    /// No clock reading available
    Skipped,
}

/// Running counters for the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopMetrics {
    pub ticks_run: u64,
    /// Ticks dropped because the previous one overran the interval
    pub ticks_skipped: u64,
    /// Ticks with no clock reading
    pub ticks_without_clock: u64,
    pub sessions: u64,
    pub orders_sent: u64,
    pub compensations: u64,
    pub liquidations: u64,
}

/// Owns every strategy component and drives them from the market clock.
pub struct RebalanceLoop {
    gateway: Arc<dyn BrokerGateway>,
    settings: LoopSettings,
    clock: MarketClock,
    ranker: Ranker,
    bucketizer: Bucketizer,
    reconciler: PositionReconciler,
    batch: BatchOrderEngine,
    submitter: OrderSubmitter,
    state: LoopState,
    metrics: LoopMetrics,
    guard: PreCloseGuard,
}

impl RebalanceLoop {
    pub fn new(gateway: Arc<dyn BrokerGateway>, settings: LoopSettings) -> Self {
        let sampler = PriceSampler::new(gateway.clone());
        let submitter = OrderSubmitter::new(gateway.clone());

        Self {
            guard: PreCloseGuard::new(settings.pre_close),
            clock: MarketClock::new(gateway.clone(), settings.open_poll_interval),
            ranker: Ranker::new(sampler.clone()),
            bucketizer: Bucketizer::new(gateway.clone(), sampler.clone(), settings.short_ratio),
            reconciler: PositionReconciler::new(submitter.clone()),
            batch: BatchOrderEngine::new(submitter.clone(), sampler),
            submitter,
            gateway,
            settings,
            state: LoopState::WaitingForOpen,
            metrics: LoopMetrics::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn metrics(&self) -> &LoopMetrics {
        &self.metrics
    }

    /// Run sessions until `shutdown` flips to true.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            symbols = self.settings.universe.len(),
            tick_secs = self.settings.tick_interval.as_secs(),
            "Starting rebalance loop"
        );

        'session: loop {
            if !self.start_session(&mut shutdown).await {
                break;
            }

            // The opening buckets already ran, so the first tick is one period out
            let mut ticker = SessionTicker::start(self.settings.tick_interval).await;

            loop {
                let Some(missed) = ticker.next(&mut shutdown).await else {
                    break 'session;
                };
                if missed > 0 {
                    warn!(missed, "Previous tick overran the interval, skipping");
                    self.metrics.ticks_skipped += missed;
                }

                if let TickOutcome::Closing { .. } = self.tick().await {
                    self.state = LoopState::SleepingUntilNextSession;
                    info!(
                        minutes = self.settings.pre_close.as_secs() / 60,
                        "Sleeping until market close"
                    );
                    if sleep_or_shutdown(self.settings.pre_close, &mut shutdown).await {
                        break 'session;
                    }
                    continue 'session;
                }
            }
        }

        info!(metrics = ?self.metrics, "Rebalance loop stopped");
    }

    /// Cancel stale orders, wait for the open and log the opening buckets.
    ///
    /// Returns `false` if shutdown was requested while waiting.
    pub async fn start_session(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        self.state = LoopState::WaitingForOpen;
        self.guard.reset();

        self.submitter.cancel_open_orders().await;

        info!("Waiting for market to open...");
        if !self.clock.await_market_open(shutdown).await {
            return false;
        }
        info!("Market opened");
        self.metrics.sessions += 1;

        let buckets = self.preview().await;
        info!(
            short = ?buckets.short.symbols,
            long = ?buckets.long.symbols,
            short_quantity = buckets.short.target_quantity_per_symbol,
            long_quantity = buckets.long.target_quantity_per_symbol,
            "Opening buckets"
        );

        self.state = LoopState::Rebalancing;
        true
    }

    /// Rank and bucketize without sending orders.
    pub async fn preview(&mut self) -> Buckets {
        let ranked = self
            .ranker
            .rank(&self.settings.universe, self.settings.lookback_bars)
            .await;
        self.bucketizer
            .bucketize(&ranked, self.settings.bucket_fraction)
            .await
    }

    /// Run a single tick.
    pub async fn tick(&mut self) -> TickOutcome {
        self.metrics.ticks_run += 1;

        match self.guard.check(&self.clock).await {
            CloseCheck::Unknown => {
                error!("Skipping tick without a clock reading");
                self.metrics.ticks_without_clock += 1;
                return TickOutcome::Skipped;
            }
            CloseCheck::Closing(time_to_close) => {
                info!(
                    minutes_to_close = time_to_close.as_secs() / 60,
                    "Market closing soon. Closing positions"
                );
                self.state = LoopState::ClosingPositions;
                let liquidated = liquidate_all(self.gateway.as_ref(), &self.submitter).await;
                self.metrics.liquidations += 1;
                self.metrics.orders_sent += liquidated as u64;
                return TickOutcome::Closing { liquidated };
            }
            CloseCheck::Trading(_) => {}
        }

        self.state = LoopState::Rebalancing;
        let report = self.rebalance_cycle().await;
        self.metrics.orders_sent += report.orders_sent as u64;
        if report.compensated() {
            self.metrics.compensations += 1;
        }
        info!(
            blacklisted = report.blacklisted,
            long_executed = report.long.outcome.executed.len(),
            long_incomplete = report.long.outcome.incomplete.len(),
            short_executed = report.short.outcome.executed.len(),
            short_incomplete = report.short.outcome.incomplete.len(),
            compensated = report.compensated(),
            orders = report.orders_sent,
            "Rebalance cycle complete"
        );
        TickOutcome::Rebalanced(Box::new(report))
    }

    /// One full cycle: cancel, rank, bucketize, reconcile, batch, compensate.
    pub async fn rebalance_cycle(&mut self) -> CycleReport {
        let cancelled_orders = self.submitter.cancel_open_orders().await;
        let buckets = self.preview().await;

        let (positions_available, reconciliation) = match self.gateway.get_positions().await {
            Ok(positions) => (true, self.reconciler.reconcile(&positions, &buckets).await),
            Err(e) => {
                error!(error = %e, "Error while getting positions, skipping reconciliation");
                (false, Reconciliation::default())
            }
        };
        debug!(blacklist = ?reconciliation.blacklist, "Reconciled positions");

        let (long, short) = tokio::join!(
            self.batch.execute_bucket(&buckets.long, &reconciliation.blacklist),
            self.batch.execute_bucket(&buckets.short, &reconciliation.blacklist),
        );

        let orders_sent = reconciliation
            .actions
            .iter()
            .filter(|a| a.order().quantity > 0)
            .count()
            + bucket_orders(&long, buckets.long.target_quantity_per_symbol)
            + bucket_orders(&short, buckets.short.target_quantity_per_symbol);

        CycleReport {
            cancelled_orders,
            positions_available,
            blacklisted: reconciliation.blacklist.len(),
            reconcile_failures: reconciliation.failed.len(),
            long,
            short,
            orders_sent,
            buckets,
        }
    }
}

fn bucket_orders(execution: &BucketExecution, target_qty: u64) -> usize {
    let batch = if target_qty > 0 {
        execution.outcome.executed.len() + execution.outcome.incomplete.len()
    } else {
        0
    };
    let compensation = match &execution.compensation {
        Some(c) if c.delta != 0 => execution.outcome.executed.len(),
        _ => 0,
    };
    batch + compensation
}
