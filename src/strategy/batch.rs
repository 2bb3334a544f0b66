//! Batch ordering for a bucket, with compensation for partial failures.

use crate::gateway::OrderSide;
use crate::strategy::bucketizer::Bucket;
use crate::strategy::sampler::PriceSampler;
use crate::strategy::submitter::{OrderSubmitter, PendingOrder};
use crate::utils::{signed_delta, whole_shares};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Which symbols of a batch were accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub executed: Vec<String>,
    pub incomplete: Vec<String>,
}

impl BatchOutcome {
    /// Compensation only makes sense when some orders landed and some did not.
    pub fn needs_compensation(&self) -> bool {
        !self.incomplete.is_empty() && !self.executed.is_empty()
    }
}

/// Second-round top-up (or truncation) over the executed symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compensation {
    pub adjusted_quantity: u64,
    /// `adjusted_quantity - target_quantity`
    pub delta: i64,
    /// Symbols whose top-up order failed; not retried this cycle
    pub failed: Vec<String>,
}

/// Full result for one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketExecution {
    pub outcome: BatchOutcome,
    pub compensation: Option<Compensation>,
}

/// Sends a bucket's target quantity to every symbol and redistributes
/// unspent dollars when some orders fail.
pub struct BatchOrderEngine {
    submitter: OrderSubmitter,
    sampler: PriceSampler,
}

impl BatchOrderEngine {
    pub fn new(submitter: OrderSubmitter, sampler: PriceSampler) -> Self {
        Self { submitter, sampler }
    }

    /// Submit `target_qty` on `side` for every symbol not in `blacklist`.
    ///
    /// Blacklisted symbols appear in neither list. Output keeps input order.
    pub async fn send_batch(
        &self,
        target_qty: u64,
        symbols: &[String],
        side: OrderSide,
        blacklist: &HashSet<String>,
    ) -> BatchOutcome {
        let orders: Vec<PendingOrder> = symbols
            .iter()
            .filter(|s| !blacklist.contains(*s))
            .map(|s| PendingOrder::new(s.clone(), target_qty, side))
            .collect();
        debug!(quantity = target_qty, %side, count = orders.len(), "Sending batch order");

        let results = self.submitter.submit_all(&orders).await;

        let mut outcome = BatchOutcome::default();
        for (order, ok) in orders.into_iter().zip(results) {
            if ok {
                outcome.executed.push(order.symbol);
            } else {
                outcome.incomplete.push(order.symbol);
            }
        }
        outcome
    }

    /// Spread `bucket_amount` across the executed symbols only.
    ///
    /// Returns `None` when no pass was needed or possible. This pass ignores the
    /// blacklist and does not retry its own failures.
    pub async fn compensate(
        &self,
        bucket_amount: Decimal,
        target_qty: u64,
        side: OrderSide,
        outcome: &BatchOutcome,
    ) -> Option<Compensation> {
        if !outcome.needs_compensation() {
            return None;
        }

        let total = self.sampler.total_price(&outcome.executed).await;
        let adjusted_quantity = match whole_shares(bucket_amount, total) {
            Some(qty) if qty > 0 => qty,
            _ => {
                warn!(%side, %total, "Cannot compute adjusted quantity, skipping compensation");
                return None;
            }
        };
        let delta = signed_delta(target_qty, adjusted_quantity);
        info!(
            %side,
            incomplete = outcome.incomplete.len(),
            adjusted_quantity,
            delta,
            "Orders incomplete. Adjusting quantity for executed symbols"
        );

        let orders: Vec<PendingOrder> = outcome
            .executed
            .iter()
            .map(|s| PendingOrder::from_delta(s.clone(), delta, side))
            .collect();
        let results = self.submitter.submit_all(&orders).await;

        let failed = orders
            .into_iter()
            .zip(results)
            .filter(|(_, ok)| !ok)
            .map(|(order, _)| order.symbol)
            .collect();

        Some(Compensation {
            adjusted_quantity,
            delta,
            failed,
        })
    }

    /// Send a bucket and compensate any partial failure.
    pub async fn execute_bucket(
        &self,
        bucket: &Bucket,
        blacklist: &HashSet<String>,
    ) -> BucketExecution {
        let side = bucket.side.entry_side();
        let target_qty = bucket.target_quantity_per_symbol;

        let outcome = self
            .send_batch(target_qty, &bucket.symbols, side, blacklist)
            .await;
        let compensation = self
            .compensate(bucket.target_dollar_amount, target_qty, side, &outcome)
            .await;

        BucketExecution {
            outcome,
            compensation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MockBrokerGateway, PaperGateway};
    use crate::strategy::bucketizer::BucketSide;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn engine_for(gateway: &PaperGateway) -> BatchOrderEngine {
        let gateway = Arc::new(gateway.clone());
        BatchOrderEngine::new(
            OrderSubmitter::new(gateway.clone()),
            PriceSampler::new(gateway),
        )
    }

    async fn priced_gateway(prices: &[(&str, Decimal)]) -> PaperGateway {
        let gateway = PaperGateway::default();
        for (symbol, price) in prices {
            gateway.set_trend(symbol, *price, *price, 2).await;
        }
        gateway
    }

    #[tokio::test]
    async fn test_zero_quantity_batch_makes_no_calls() {
        let mut mock = MockBrokerGateway::new();
        mock.expect_create_order().times(0);
        mock.expect_get_bars().times(0);
        let gateway = Arc::new(mock);
        let engine = BatchOrderEngine::new(
            OrderSubmitter::new(gateway.clone()),
            PriceSampler::new(gateway),
        );
        let batch = symbols(&["A", "B", "C"]);

        let outcome = engine
            .send_batch(0, &batch, OrderSide::Buy, &HashSet::new())
            .await;

        assert_eq!(outcome.executed, batch);
        assert!(outcome.incomplete.is_empty());
        let compensation = engine
            .compensate(dec!(1000), 0, OrderSide::Buy, &outcome)
            .await;
        assert!(compensation.is_none());
    }

    #[tokio::test]
    async fn test_blacklisted_symbols_skipped() {
        let gateway = priced_gateway(&[("A", dec!(10)), ("B", dec!(10))]).await;
        let engine = engine_for(&gateway);
        let blacklist: HashSet<String> = ["A".to_string()].into_iter().collect();

        let outcome = engine
            .send_batch(5, &symbols(&["A", "B"]), OrderSide::Sell, &blacklist)
            .await;

        assert_eq!(outcome.executed, vec!["B"]);
        assert!(outcome.incomplete.is_empty());
        assert_eq!(gateway.holding("A").await, 0);
        assert_eq!(gateway.holding("B").await, -5);
    }

    #[tokio::test]
    async fn test_partial_failure_tops_up_executed_symbols() {
        let gateway =
            priced_gateway(&[("A", dec!(100)), ("B", dec!(150)), ("C", dec!(250))]).await;
        gateway
            .update(|s| {
                s.reject_symbols.insert("C".to_string());
            })
            .await;
        let engine = engine_for(&gateway);
        // 10000 / (100 + 150 + 250) = 20 shares each
        let bucket = Bucket {
            side: BucketSide::Long,
            symbols: symbols(&["A", "B", "C"]),
            target_quantity_per_symbol: 20,
            target_dollar_amount: dec!(10000),
        };

        let execution = engine.execute_bucket(&bucket, &HashSet::new()).await;

        assert_eq!(execution.outcome.executed, vec!["A", "B"]);
        assert_eq!(execution.outcome.incomplete, vec!["C"]);
        // Only A and B prices: 10000 / 250 = 40
        let compensation = execution.compensation.unwrap();
        assert_eq!(compensation.adjusted_quantity, 40);
        assert_eq!(compensation.delta, 20);
        assert!(compensation.failed.is_empty());
        assert_eq!(gateway.holding("A").await, 40);
        assert_eq!(gateway.holding("B").await, 40);
        assert_eq!(gateway.holding("C").await, 0);
    }

    #[tokio::test]
    async fn test_negative_delta_truncates_short_bucket() {
        let gateway = priced_gateway(&[("A", dec!(50)), ("B", dec!(50))]).await;
        gateway
            .update(|s| {
                s.reject_symbols.insert("B".to_string());
            })
            .await;
        let engine = engine_for(&gateway);
        // Prices moved up since sizing: 1000 / 50 = 20 < target 30
        let bucket = Bucket {
            side: BucketSide::Short,
            symbols: symbols(&["A", "B"]),
            target_quantity_per_symbol: 30,
            target_dollar_amount: dec!(1000),
        };

        let execution = engine.execute_bucket(&bucket, &HashSet::new()).await;

        let compensation = execution.compensation.unwrap();
        assert_eq!(compensation.delta, -10);
        assert_eq!(gateway.holding("A").await, -20);
    }

    #[tokio::test]
    async fn test_no_compensation_when_all_execute() {
        let gateway = priced_gateway(&[("A", dec!(10)), ("B", dec!(20))]).await;
        let engine = engine_for(&gateway);
        let bucket = Bucket {
            side: BucketSide::Long,
            symbols: symbols(&["A", "B"]),
            target_quantity_per_symbol: 3,
            target_dollar_amount: dec!(100),
        };

        let execution = engine.execute_bucket(&bucket, &HashSet::new()).await;

        assert!(execution.compensation.is_none());
        assert_eq!(gateway.snapshot().await.order_log.len(), 2);
    }

    #[tokio::test]
    async fn test_no_compensation_when_all_fail() {
        let gateway = priced_gateway(&[("A", dec!(10))]).await;
        gateway
            .update(|s| {
                s.reject_symbols.insert("A".to_string());
            })
            .await;
        let engine = engine_for(&gateway);

        let outcome = engine
            .send_batch(3, &symbols(&["A"]), OrderSide::Buy, &HashSet::new())
            .await;

        assert_eq!(outcome.incomplete, vec!["A"]);
        assert!(!outcome.needs_compensation());
        assert!(engine
            .compensate(dec!(100), 3, OrderSide::Buy, &outcome)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_unpriced_executed_symbols_skip_compensation() {
        let gateway = PaperGateway::default();
        gateway
            .update(|s| {
                s.reject_symbols.insert("B".to_string());
            })
            .await;
        let engine = engine_for(&gateway);

        let outcome = engine
            .send_batch(1, &symbols(&["A", "B"]), OrderSide::Buy, &HashSet::new())
            .await;
        let compensation = engine
            .compensate(dec!(100), 1, OrderSide::Buy, &outcome)
            .await;

        assert!(outcome.needs_compensation());
        assert!(compensation.is_none());
        assert_eq!(gateway.holding("A").await, 1);
    }
}
