//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Momentum ranking of the symbol universe
//! - Long/short bucket selection and 130/30 sizing
//! - Reconciliation of held positions against the buckets
//! - Batch ordering with compensation for partial failures
//! - The market-clock driven rebalance loop
//! - A mean-reversion loop sharing the same session plumbing

mod batch;
mod bucketizer;
mod clock;
mod mean_reversion;
mod ranker;
mod rebalance_loop;
mod reconciler;
mod sampler;
mod session;
mod submitter;

pub use batch::{BatchOrderEngine, BatchOutcome, BucketExecution, Compensation};
pub use bucketizer::{bucket_size, select, Allocation, Bucket, BucketSide, Bucketizer, Buckets};
pub use clock::MarketClock;
pub use mean_reversion::{
    decide, Holding, MeanReversionLoop, MeanReversionSettings, ReversionAction, ReversionReport,
    ReversionTick, Sizing,
};
pub use ranker::{Ranker, SymbolScore};
pub use rebalance_loop::{
    CycleReport, LoopMetrics, LoopSettings, LoopState, RebalanceLoop, TickOutcome,
};
pub use reconciler::{analyze, PositionReconciler, ReconcileAction, Reconciliation};
pub use sampler::{PriceSampler, PriceSignal};
pub use session::{liquidate_all, CloseCheck, PreCloseGuard};
pub use submitter::{OrderSubmitter, PendingOrder};
