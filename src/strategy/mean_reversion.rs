//! Mean-reversion loop over the same universe and session plumbing.
//!
//! Each tick compares a symbol's latest close with the running average of its
//! recent closes. Longs trading above the average are sold out; symbols
//! trading below it are sized toward a target that grows with the discount.
//! All orders are day limit orders at the latest close.

use crate::config::Config;
use crate::gateway::{BrokerGateway, OrderSide, PositionSide};
use crate::strategy::clock::{sleep_or_shutdown, MarketClock};
use crate::strategy::rebalance_loop::{LoopMetrics, LoopState};
use crate::strategy::sampler::{PriceSampler, PriceSignal};
use crate::strategy::session::{liquidate_all, CloseCheck, PreCloseGuard, SessionTicker};
use crate::strategy::submitter::{OrderSubmitter, PendingOrder};
use crate::utils::whole_shares;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Mean-reversion parameters resolved from configuration.
#[derive(Debug, Clone)]
pub struct MeanReversionSettings {
    pub universe: Vec<String>,
    /// Closes in the running average
    pub average_bars: u32,
    /// Portfolio share per unit of relative discount
    pub portfolio_scale: Decimal,
    pub tick_interval: Duration,
    pub pre_close: Duration,
    pub open_poll_interval: Duration,
}

impl MeanReversionSettings {
    pub fn from_config(config: &Config, universe: Vec<String>) -> Self {
        let tick_interval = Duration::from_secs(config.schedule.tick_interval_secs);
        Self {
            universe,
            average_bars: config.mean_reversion.average_bars,
            portfolio_scale: config.mean_reversion.portfolio_scale,
            tick_interval,
            pre_close: Duration::from_secs(config.schedule.pre_close_minutes * 60),
            open_poll_interval: tick_interval,
        }
    }
}

/// What to do with one symbol this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReversionAction {
    /// Price above the average: sell the whole long position
    Exit(u64),
    /// Price below the average, holding under target
    Add(u64),
    /// Price below the average, holding over target
    Trim(u64),
    Hold,
}

impl ReversionAction {
    fn order(&self, symbol: &str, price: Decimal) -> Option<PendingOrder> {
        match *self {
            Self::Add(qty) => Some(PendingOrder::limit(symbol, qty, OrderSide::Buy, price)),
            Self::Exit(qty) | Self::Trim(qty) => {
                Some(PendingOrder::limit(symbol, qty, OrderSide::Sell, price))
            }
            Self::Hold => None,
        }
    }
}

/// Long holding in one symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Holding {
    pub quantity: u64,
    pub market_value: Decimal,
}

/// Account figures a decision is sized against.
#[derive(Debug, Clone, Copy)]
pub struct Sizing {
    pub portfolio_value: Decimal,
    /// Remaining for this tick
    pub buying_power: Decimal,
    pub portfolio_scale: Decimal,
}

/// Decide the action for one symbol.
///
/// Below the average the target value is
/// `portfolio_value * (average - price) / price * portfolio_scale`. Buys are
/// capped by buying power and sells by the shares held.
pub fn decide(signal: PriceSignal, holding: Holding, sizing: &Sizing) -> ReversionAction {
    let PriceSignal { price, average } = signal;
    if price <= Decimal::ZERO {
        return ReversionAction::Hold;
    }

    match price.cmp(&average) {
        Ordering::Greater if holding.quantity > 0 => ReversionAction::Exit(holding.quantity),
        Ordering::Greater | Ordering::Equal => ReversionAction::Hold,
        Ordering::Less => {
            let share = (average - price) / price * sizing.portfolio_scale;
            let target = sizing.portfolio_value * share;
            let amount = target - holding.market_value;

            if amount > Decimal::ZERO {
                match whole_shares(amount.min(sizing.buying_power), price) {
                    Some(qty) if qty > 0 => ReversionAction::Add(qty),
                    _ => ReversionAction::Hold,
                }
            } else {
                match whole_shares(-amount, price).map(|qty| qty.min(holding.quantity)) {
                    Some(qty) if qty > 0 => ReversionAction::Trim(qty),
                    _ => ReversionAction::Hold,
                }
            }
        }
    }
}

/// Summary of one mean-reversion pass.
#[derive(Debug, Clone, Default)]
pub struct ReversionReport {
    pub cancelled_orders: usize,
    /// False when the account or positions were unavailable; nothing traded
    pub account_available: bool,
    /// Decisions in universe order
    pub actions: Vec<(String, ReversionAction)>,
    /// Symbols without a usable signal, or held short
    pub skipped: Vec<String>,
    pub orders_sent: usize,
    pub failed: Vec<String>,
}

/// Result of one tick.
#[derive(Debug, Clone)]
pub enum ReversionTick {
    Traded(ReversionReport),
    Closing { liquidated: usize },
    Skipped,
}

/// Drives the mean-reversion strategy from the market clock.
pub struct MeanReversionLoop {
    gateway: Arc<dyn BrokerGateway>,
    settings: MeanReversionSettings,
    clock: MarketClock,
    sampler: PriceSampler,
    submitter: OrderSubmitter,
    guard: PreCloseGuard,
    state: LoopState,
    metrics: LoopMetrics,
}

impl MeanReversionLoop {
    pub fn new(gateway: Arc<dyn BrokerGateway>, settings: MeanReversionSettings) -> Self {
        Self {
            clock: MarketClock::new(gateway.clone(), settings.open_poll_interval),
            sampler: PriceSampler::new(gateway.clone()),
            submitter: OrderSubmitter::new(gateway.clone()),
            guard: PreCloseGuard::new(settings.pre_close),
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
            average_bars = self.settings.average_bars,
            "Starting mean reversion loop"
        );

        'session: loop {
            if !self.start_session(&mut shutdown).await {
                break;
            }

            let mut ticker = SessionTicker::start(self.settings.tick_interval).await;
            loop {
                let Some(missed) = ticker.next(&mut shutdown).await else {
                    break 'session;
                };
                if missed > 0 {
                    warn!(missed, "Previous tick overran the interval, skipping");
                    self.metrics.ticks_skipped += missed;
                }

                if let ReversionTick::Closing { .. } = self.tick().await {
                    self.state = LoopState::SleepingUntilNextSession;
                    if sleep_or_shutdown(self.guard.window(), &mut shutdown).await {
                        break 'session;
                    }
                    continue 'session;
                }
            }
        }

        info!(metrics = ?self.metrics, "Mean reversion loop stopped");
    }

    /// Cancel stale orders and wait for the open.
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
        self.state = LoopState::Rebalancing;
        true
    }

    /// Run a single tick.
    pub async fn tick(&mut self) -> ReversionTick {
        self.metrics.ticks_run += 1;

        match self.guard.check(&self.clock).await {
            CloseCheck::Unknown => {
                self.metrics.ticks_without_clock += 1;
                ReversionTick::Skipped
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
                ReversionTick::Closing { liquidated }
            }
            CloseCheck::Trading(_) => {
                self.state = LoopState::Rebalancing;
                let report = self.rebalance().await;
                self.metrics.orders_sent += report.orders_sent as u64;
                info!(
                    decisions = report.actions.len(),
                    skipped = report.skipped.len(),
                    orders = report.orders_sent,
                    failed = report.failed.len(),
                    "Mean reversion pass complete"
                );
                ReversionTick::Traded(report)
            }
        }
    }

    /// Cancel working orders, then decide and submit every symbol.
    ///
    /// Buying power is drawn down in universe order so buys within one pass
    /// never exceed it.
    pub async fn rebalance(&mut self) -> ReversionReport {
        let mut report = ReversionReport {
            cancelled_orders: self.submitter.cancel_open_orders().await,
            ..Default::default()
        };

        let account = match self.gateway.get_account().await {
            Ok(account) => account,
            Err(e) => {
                error!(error = %e, "Error while getting account, holding positions");
                return report;
            }
        };
        let positions: HashMap<String, _> = match self.gateway.get_positions().await {
            Ok(positions) => positions.into_iter().map(|p| (p.symbol.clone(), p)).collect(),
            Err(e) => {
                error!(error = %e, "Error while getting positions, holding positions");
                return report;
            }
        };
        report.account_available = true;

        let sampler = &self.sampler;
        let window = self.settings.average_bars;
        let signals = join_all(self.settings.universe.iter().map(|symbol| async move {
            (symbol, sampler.running_average(symbol, window).await)
        }))
        .await;

        let mut sizing = Sizing {
            portfolio_value: account.portfolio_value,
            buying_power: account.buying_power,
            portfolio_scale: self.settings.portfolio_scale,
        };
        let mut orders = Vec::new();

        for (symbol, signal) in signals {
            let signal = match signal {
                Ok(Some(signal)) => signal,
                Ok(None) => {
                    report.skipped.push(symbol.clone());
                    continue;
                }
                Err(e) => {
                    warn!(%symbol, error = %e, "Error while getting bars");
                    report.skipped.push(symbol.clone());
                    continue;
                }
            };

            let holding = match positions.get(symbol) {
                Some(p) if p.side == PositionSide::Short => {
                    debug!(%symbol, "Short position held, leaving it alone");
                    report.skipped.push(symbol.clone());
                    continue;
                }
                Some(p) => Holding {
                    quantity: p.quantity,
                    market_value: p.market_value,
                },
                None => Holding::default(),
            };

            let action = decide(signal, holding, &sizing);
            debug!(
                %symbol,
                price = %signal.price,
                average = %signal.average,
                ?action,
                "Mean reversion decision"
            );
            if let ReversionAction::Add(qty) = action {
                sizing.buying_power -= Decimal::from(qty) * signal.price;
            }
            if let Some(order) = action.order(symbol, signal.price) {
                orders.push(order);
            }
            report.actions.push((symbol.clone(), action));
        }

        let results = self.submitter.submit_all(&orders).await;
        report.orders_sent = orders.len();
        report.failed = orders
            .iter()
            .zip(&results)
            .filter(|(_, ok)| !**ok)
            .map(|(order, _)| order.symbol.clone())
            .collect();
        report
    }
}
