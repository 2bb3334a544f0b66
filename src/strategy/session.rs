//! Session plumbing shared by the strategy loops: the pre-close guard, full
//! liquidation and the overlap-free ticker.

use crate::gateway::{BrokerGateway, Position};
use crate::strategy::clock::MarketClock;
use crate::strategy::submitter::{OrderSubmitter, PendingOrder};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{error, warn};

/// Where the current tick sits relative to the close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCheck {
    Trading(Duration),
    /// Inside the pre-close window
    Closing(Duration),
    /// Clock unavailable and no earlier reading this session
    Unknown,
}

/// Decides when to stop trading and flatten before the close.
///
/// Clock failures fall back to the last reading of the session.
#[derive(Debug, Clone)]
pub struct PreCloseGuard {
    window: Duration,
    last_time_to_close: Option<Duration>,
}

impl PreCloseGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_time_to_close: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Forget the last reading, at the start of a session.
    pub fn reset(&mut self) {
        self.last_time_to_close = None;
    }

    pub async fn check(&mut self, clock: &MarketClock) -> CloseCheck {
        let remaining = match clock.time_to_close().await {
            Ok(remaining) => {
                self.last_time_to_close = Some(remaining);
                remaining
            }
            Err(e) => match self.last_time_to_close {
                Some(remaining) => {
                    warn!(error = %e, "Clock unavailable, reusing last time to close");
                    remaining
                }
                None => {
                    error!(error = %e, "Clock unavailable and no previous reading");
                    return CloseCheck::Unknown;
                }
            },
        };

        if remaining < self.window {
            CloseCheck::Closing(remaining)
        } else {
            CloseCheck::Trading(remaining)
        }
    }
}

/// Close every open position at market. Returns the number of orders sent.
pub async fn liquidate_all(gateway: &dyn BrokerGateway, submitter: &OrderSubmitter) -> usize {
    let positions = match gateway.get_positions().await {
        Ok(positions) => positions,
        Err(e) => {
            error!(error = %e, "Error while getting positions to close");
            return 0;
        }
    };

    let orders: Vec<PendingOrder> = positions.iter().map(closing_order).collect();
    let results = submitter.submit_all(&orders).await;
    let failed: Vec<&str> = orders
        .iter()
        .zip(&results)
        .filter(|(_, ok)| !**ok)
        .map(|(o, _)| o.symbol.as_str())
        .collect();
    if !failed.is_empty() {
        warn!(?failed, "Some positions could not be closed");
    }
    orders.iter().filter(|o| o.quantity > 0).count()
}

fn closing_order(position: &Position) -> PendingOrder {
    PendingOrder::new(
        position.symbol.clone(),
        position.quantity,
        position.side.closing_side(),
    )
}

/// Fixed-period ticker whose ticks are awaited inline, so a slow tick delays
/// the next one instead of overlapping it. Overdue ticks are dropped.
pub(crate) struct SessionTicker {
    interval: Interval,
    period: Duration,
    last: Instant,
}

impl SessionTicker {
    /// Start ticking one `period` from now.
    pub(crate) async fn start(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        let last = interval.tick().await;
        Self {
            interval,
            period,
            last,
        }
    }

    /// Wait for the next tick. Returns the number of ticks dropped since the
    /// previous one, or `None` once shutdown is signalled.
    pub(crate) async fn next(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<u64> {
        let now = loop {
            if *shutdown.borrow() {
                return None;
            }
            tokio::select! {
                instant = self.interval.tick() => break instant,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone: keep ticking without a shutdown path
                        break self.interval.tick().await;
                    }
                }
            }
        };

        let period = self.period.as_nanos().max(1);
        let elapsed = now.saturating_duration_since(self.last).as_nanos();
        self.last = now;
        Some((elapsed / period).saturating_sub(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PaperGateway;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    fn guard_and_clock(gateway: &PaperGateway) -> (PreCloseGuard, MarketClock) {
        (
            PreCloseGuard::new(Duration::from_secs(15 * 60)),
            MarketClock::new(Arc::new(gateway.clone()), Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn test_guard_flags_pre_close_window() {
        let gateway = PaperGateway::default();
        let (mut guard, clock) = guard_and_clock(&gateway);

        assert!(matches!(guard.check(&clock).await, CloseCheck::Trading(_)));

        gateway
            .update(|s| s.clock.next_close = s.clock.timestamp + ChronoDuration::minutes(14))
            .await;
        assert_eq!(
            guard.check(&clock).await,
            CloseCheck::Closing(Duration::from_secs(14 * 60))
        );
    }

    #[tokio::test]
    async fn test_guard_falls_back_to_last_reading() {
        let gateway = PaperGateway::default();
        gateway.update(|s| s.clock_fails = true).await;
        let (mut guard, clock) = guard_and_clock(&gateway);

        assert_eq!(guard.check(&clock).await, CloseCheck::Unknown);

        gateway
            .update(|s| {
                s.clock_fails = false;
                s.clock.next_close = s.clock.timestamp + ChronoDuration::minutes(5);
            })
            .await;
        guard.check(&clock).await;
        gateway.update(|s| s.clock_fails = true).await;
        assert!(matches!(guard.check(&clock).await, CloseCheck::Closing(_)));

        guard.reset();
        assert_eq!(guard.check(&clock).await, CloseCheck::Unknown);
    }

    #[tokio::test]
    async fn test_liquidate_all_flattens_both_sides() {
        let gateway = PaperGateway::default();
        gateway.set_holding("AAPL", 12).await;
        gateway.set_holding("TSLA", -4).await;
        let submitter = OrderSubmitter::new(Arc::new(gateway.clone()));

        assert_eq!(liquidate_all(&gateway, &submitter).await, 2);
        assert!(gateway.snapshot().await.holdings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_counts_dropped_ticks() {
        let (_tx, mut rx) = watch::channel(false);
        let mut ticker = SessionTicker::start(Duration::from_secs(60)).await;

        assert_eq!(ticker.next(&mut rx).await, Some(0));
        // Overrun past the next deadline: the overdue tick fires at once and
        // the one after it is dropped
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(ticker.next(&mut rx).await, Some(0));
        assert_eq!(ticker.next(&mut rx).await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let mut ticker = SessionTicker::start(Duration::from_secs(60)).await;
        tx.send(true).unwrap();

        assert_eq!(ticker.next(&mut rx).await, None);
    }
}
