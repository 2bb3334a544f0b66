//! Price sampling from recent bars.

use crate::gateway::{BrokerGateway, GatewayResult, Timeframe};
use crate::utils::percent_change;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, warn};

/// Latest close against the running average of recent closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceSignal {
    pub price: Decimal,
    pub average: Decimal,
}

/// Fetches recent one-minute bars and derives momentum and price figures.
#[derive(Clone)]
pub struct PriceSampler {
    gateway: Arc<dyn BrokerGateway>,
}

impl PriceSampler {
    pub fn new(gateway: Arc<dyn BrokerGateway>) -> Self {
        Self { gateway }
    }

    /// Percent change from the first bar's open to the last bar's close over
    /// the `lookback` most recent bars.
    ///
    /// No bars (or a zero opening price) scores zero. Fetch errors propagate so
    /// the caller can log them with context.
    pub async fn percent_change(&self, symbol: &str, lookback: u32) -> GatewayResult<Decimal> {
        let bars = self
            .gateway
            .get_bars(symbol, Timeframe::Minute, lookback)
            .await?;

        let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
            debug!(%symbol, "No bars found for symbol");
            return Ok(Decimal::ZERO);
        };

        Ok(percent_change(first.open, last.close))
    }

    /// Latest close price, or zero when no bar is available.
    pub async fn latest_close(&self, symbol: &str) -> GatewayResult<Decimal> {
        let bars = self.gateway.get_bars(symbol, Timeframe::Minute, 1).await?;
        match bars.last() {
            Some(bar) => Ok(bar.close),
            None => {
                debug!(%symbol, "No bars found for symbol");
                Ok(Decimal::ZERO)
            }
        }
    }

    /// Latest close and the mean of the `window` most recent closes.
    ///
    /// `None` when fewer than `window` bars came back.
    pub async fn running_average(
        &self,
        symbol: &str,
        window: u32,
    ) -> GatewayResult<Option<PriceSignal>> {
        let bars = self
            .gateway
            .get_bars(symbol, Timeframe::Minute, window)
            .await?;

        let Some(last) = bars.last() else {
            debug!(%symbol, "No bars found for symbol");
            return Ok(None);
        };
        if bars.len() < window as usize {
            debug!(%symbol, bars = bars.len(), window, "Not enough bars for running average");
            return Ok(None);
        }

        let sum: Decimal = bars.iter().map(|bar| bar.close).sum();
        Ok(Some(PriceSignal {
            price: last.close,
            average: sum / Decimal::from(bars.len() as u64),
        }))
    }

    /// Sum of latest closes across `symbols`, fetched concurrently.
    ///
    /// A symbol whose price cannot be fetched contributes zero.
    pub async fn total_price(&self, symbols: &[String]) -> Decimal {
        let prices = join_all(symbols.iter().map(|symbol| async move {
            match self.latest_close(symbol).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(%symbol, error = %e, "Error while getting latest price");
                    Decimal::ZERO
                }
            }
        }))
        .await;

        prices.into_iter().sum()
    }
}
