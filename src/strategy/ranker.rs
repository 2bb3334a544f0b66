//! Momentum ranking of the symbol universe.

use crate::strategy::sampler::PriceSampler;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, error};

/// Momentum score for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolScore {
    pub symbol: String,
    pub percent_change: Decimal,
}

/// Ranks symbols by percent change over a lookback window.
pub struct Ranker {
    sampler: PriceSampler,
}

impl Ranker {
    pub fn new(sampler: PriceSampler) -> Self {
        Self { sampler }
    }

    /// Score every symbol concurrently and sort ascending (worst momentum first).
    ///
    /// Failed fetches score zero. The sort is stable, so equal scores keep
    /// universe order.
    pub async fn rank(&self, universe: &[String], lookback_bars: u32) -> Vec<SymbolScore> {
        debug!(symbols = universe.len(), lookback_bars, "Ranking stocks");

        let mut scores = join_all(universe.iter().map(|symbol| async move {
            let percent_change = match self.sampler.percent_change(symbol, lookback_bars).await {
                Ok(pc) => pc,
                Err(e) => {
                    error!(%symbol, error = %e, "Error while getting percent change");
                    Decimal::ZERO
                }
            };
            SymbolScore {
                symbol: symbol.clone(),
                percent_change,
            }
        }))
        .await;

        scores.sort_by(|a, b| a.percent_change.cmp(&b.percent_change));
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PaperGateway;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn ranker_for(gateway: &PaperGateway) -> Ranker {
        Ranker::new(PriceSampler::new(Arc::new(gateway.clone())))
    }

    #[tokio::test]
    async fn test_rank_sorts_ascending() {
        let gateway = PaperGateway::default();
        gateway.set_trend("A", dec!(100), dec!(95), 10).await;
        gateway.set_trend("B", dec!(100), dec!(99), 10).await;
        gateway.set_trend("C", dec!(100), dec!(102), 10).await;
        gateway.set_trend("D", dec!(100), dec!(108), 10).await;

        let ranked = ranker_for(&gateway)
            .rank(&symbols(&["D", "B", "A", "C"]), 10)
            .await;

        let order: Vec<&str> = ranked.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "C", "D"]);
        assert_eq!(ranked[0].percent_change, dec!(-0.05));
        assert_eq!(ranked[3].percent_change, dec!(0.08));
    }

    #[tokio::test]
    async fn test_ties_keep_universe_order() {
        let gateway = PaperGateway::default();
        // No bars at all: every symbol scores zero
        let universe = symbols(&["MSFT", "AAPL", "TSLA", "AMZN"]);

        let ranked = ranker_for(&gateway).rank(&universe, 10).await;

        let order: Vec<String> = ranked.into_iter().map(|s| s.symbol).collect();
        assert_eq!(order, universe);
    }

    #[tokio::test]
    async fn test_fetch_failure_scores_zero() {
        let gateway = PaperGateway::default();
        gateway.set_trend("UP", dec!(100), dec!(101), 10).await;
        gateway.set_trend("DOWN", dec!(100), dec!(99), 10).await;
        gateway.set_trend("BROKEN", dec!(100), dec!(150), 10).await;
        gateway
            .update(|s| {
                s.failing_bars.insert("BROKEN".to_string());
            })
            .await;

        let ranked = ranker_for(&gateway)
            .rank(&symbols(&["UP", "BROKEN", "DOWN"]), 10)
            .await;

        let order: Vec<&str> = ranked.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(order, vec!["DOWN", "BROKEN", "UP"]);
        assert_eq!(ranked[1].percent_change, Decimal::ZERO);
    }
}
