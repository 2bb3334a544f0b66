//! Market session queries.

use crate::gateway::{BrokerGateway, Clock};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info};

/// Thin query wrapper over the gateway clock.
pub struct MarketClock {
    gateway: Arc<dyn BrokerGateway>,
    poll_interval: Duration,
}

impl MarketClock {
    /// Create a market clock polling at `poll_interval` while waiting for the open.
    pub fn new(gateway: Arc<dyn BrokerGateway>, poll_interval: Duration) -> Self {
        Self {
            gateway,
            poll_interval,
        }
    }

    /// Time remaining until the next close.
    pub async fn time_to_close(&self) -> Result<Duration> {
        let clock = self.gateway.get_clock().await?;
        Ok(Self::remaining_until_close(&clock))
    }

    /// Whole minutes until the next session opens (zero while open).
    pub fn minutes_to_open(clock: &Clock) -> i64 {
        if clock.is_open {
            return 0;
        }
        (clock.next_open - clock.timestamp).num_minutes().max(0)
    }

    fn remaining_until_close(clock: &Clock) -> Duration {
        (clock.next_close - clock.timestamp)
            .abs()
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Poll until the market opens.
    ///
    /// Returns `false` if shutdown was requested while waiting. Clock errors are
    /// logged and retried on the next poll.
    pub async fn await_market_open(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *shutdown.borrow() {
                return false;
            }

            match self.gateway.get_clock().await {
                Ok(clock) if clock.is_open => return true,
                Ok(clock) => {
                    info!(
                        minutes = Self::minutes_to_open(&clock),
                        "Minutes till the market opens again"
                    );
                }
                Err(e) => error!(error = %e, "Error while waiting for the market to open"),
            }

            if sleep_or_shutdown(self.poll_interval, shutdown).await {
                return false;
            }
        }
    }
}

/// Sleep for `duration`, returning `true` early if shutdown is signalled.
///
/// Changes that leave the flag `false` do not cut the sleep short.
pub(crate) async fn sleep_or_shutdown(
    duration: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let deadline = Instant::now() + duration;
    let mut watching = true;

    loop {
        if *shutdown.borrow() {
            return true;
        }
        if !watching {
            // Sender dropped: nothing can signal shutdown any more
            tokio::time::sleep_until(deadline).await;
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return *shutdown.borrow(),
            changed = shutdown.changed() => {
                if changed.is_err() {
                    watching = false;
                }
            }
        }
    }
}
