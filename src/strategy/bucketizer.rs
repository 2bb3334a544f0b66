//! Long/short bucket selection and 130/30 sizing.

use crate::gateway::{BrokerGateway, OrderSide};
use crate::strategy::ranker::SymbolScore;
use crate::strategy::sampler::PriceSampler;
use crate::utils::whole_shares;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Direction of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketSide {
    Long,
    Short,
}

impl BucketSide {
    /// Order side that builds a position in this bucket.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            BucketSide::Long => OrderSide::Buy,
            BucketSide::Short => OrderSide::Sell,
        }
    }
}

/// Symbols selected for one direction in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub side: BucketSide,
    pub symbols: Vec<String>,
    /// Shares per symbol (shared across the bucket)
    pub target_quantity_per_symbol: u64,
    /// Dollars committed to the whole bucket
    pub target_dollar_amount: Decimal,
}

impl Bucket {
    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| s == symbol)
    }
}

/// Both buckets for a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Buckets {
    pub short: Bucket,
    pub long: Bucket,
}

/// Dollar split between the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub short_amount: Decimal,
    pub long_amount: Decimal,
}

impl Allocation {
    /// Short `short_ratio` of equity and go long equity plus the short proceeds.
    pub fn for_equity(equity: Decimal, short_ratio: Decimal) -> Self {
        let short_amount = short_ratio * equity;
        Self {
            short_amount,
            long_amount: equity + short_amount,
        }
    }
}

/// Number of symbols per bucket, clamped so the two buckets never overlap.
pub fn bucket_size(universe_len: usize, fraction: Decimal) -> usize {
    let size = (Decimal::from(universe_len as u64) * fraction)
        .floor()
        .to_usize()
        .unwrap_or(0);
    let max = universe_len / 2;
    if size > max {
        warn!(size, max, "Bucket fraction would overlap buckets, clamping");
        return max;
    }
    size
}

/// Split an ascending ranking into (short, long) symbol lists.
pub fn select(ranked: &[SymbolScore], fraction: Decimal) -> (Vec<String>, Vec<String>) {
    let size = bucket_size(ranked.len(), fraction);
    let short = ranked[..size].iter().map(|s| s.symbol.clone()).collect();
    let long = ranked[ranked.len() - size..]
        .iter()
        .map(|s| s.symbol.clone())
        .collect();
    (short, long)
}

/// Computes buckets and target sizes, remembering the last good values.
pub struct Bucketizer {
    gateway: Arc<dyn BrokerGateway>,
    sampler: PriceSampler,
    short_ratio: Decimal,
    allocation: Allocation,
    long_quantity: u64,
    short_quantity: u64,
}

impl Bucketizer {
    pub fn new(gateway: Arc<dyn BrokerGateway>, sampler: PriceSampler, short_ratio: Decimal) -> Self {
        Self {
            gateway,
            sampler,
            short_ratio,
            allocation: Allocation {
                short_amount: Decimal::ZERO,
                long_amount: Decimal::ZERO,
            },
            long_quantity: 0,
            short_quantity: 0,
        }
    }

    /// Last computed dollar allocation.
    pub fn allocation(&self) -> Allocation {
        self.allocation
    }

    /// Select buckets from an ascending ranking and size them from equity.
    ///
    /// Every symbol in a bucket gets the same share count,
    /// `floor(bucket_dollars / sum(latest closes))`. This only approximates an
    /// equal-dollar split. When equity or prices are unavailable the previous
    /// cycle's figures are kept.
    pub async fn bucketize(&mut self, ranked: &[SymbolScore], fraction: Decimal) -> Buckets {
        let (short, long) = select(ranked, fraction);
        debug!(bucket_size = short.len(), "Bucket size");

        match self.gateway.get_account().await {
            Ok(account) => {
                self.allocation = Allocation::for_equity(account.equity, self.short_ratio);
                debug!(
                    equity = %account.equity,
                    short_amount = %self.allocation.short_amount,
                    long_amount = %self.allocation.long_amount,
                    "Computed 130/30 allocation"
                );
            }
            Err(e) => {
                error!(error = %e, "Error while getting the account, keeping previous amounts");
            }
        }

        let (long_total, short_total) = tokio::join!(
            self.sampler.total_price(&long),
            self.sampler.total_price(&short),
        );

        match whole_shares(self.allocation.long_amount, long_total) {
            Some(qty) => self.long_quantity = qty,
            None if !long.is_empty() => {
                warn!(keep = self.long_quantity, "No long prices, keeping previous quantity")
            }
            None => {}
        }
        match whole_shares(self.allocation.short_amount, short_total) {
            Some(qty) => self.short_quantity = qty,
            None if !short.is_empty() => {
                warn!(keep = self.short_quantity, "No short prices, keeping previous quantity")
            }
            None => {}
        }
        debug!(
            long_quantity = self.long_quantity,
            short_quantity = self.short_quantity,
            "Target quantity per symbol"
        );

        Buckets {
            short: Bucket {
                side: BucketSide::Short,
                symbols: short,
                target_quantity_per_symbol: self.short_quantity,
                target_dollar_amount: self.allocation.short_amount,
            },
            long: Bucket {
                side: BucketSide::Long,
                symbols: long,
                target_quantity_per_symbol: self.long_quantity,
                target_dollar_amount: self.allocation.long_amount,
            },
        }
    }
}
