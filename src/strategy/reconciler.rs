//! Reconciliation of held positions against the current buckets.

use crate::gateway::Position;
use crate::strategy::bucketizer::Buckets;
use crate::strategy::submitter::{OrderSubmitter, PendingOrder};
use crate::utils::signed_delta;
use futures_util::future::join_all;
use std::collections::HashSet;
use tracing::{debug, error, info};

/// Corrective step for a single held position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Symbol left both buckets: close the whole position
    Liquidate(PendingOrder),
    /// Held on the opposite side of its bucket: close it, the batch re-enters
    Flip(PendingOrder),
    /// Held on the right side: move toward target (may be zero quantity)
    Adjust(PendingOrder),
}

impl ReconcileAction {
    pub fn order(&self) -> &PendingOrder {
        match self {
            ReconcileAction::Liquidate(order)
            | ReconcileAction::Flip(order)
            | ReconcileAction::Adjust(order) => order,
        }
    }

    /// Whether the symbol counts as already at target for this cycle.
    pub fn reconciles(&self) -> bool {
        matches!(self, ReconcileAction::Adjust(_))
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Symbols the batch engine must skip this cycle
    pub blacklist: HashSet<String>,
    pub actions: Vec<ReconcileAction>,
    pub failed: Vec<String>,
}

/// Decide the corrective action for one position.
pub fn analyze(position: &Position, buckets: &Buckets) -> ReconcileAction {
    let symbol = position.symbol.clone();
    let held = position.quantity;
    let close = PendingOrder::new(symbol.clone(), held, position.side.closing_side());

    let in_long = buckets.long.contains(&symbol);
    let in_short = buckets.short.contains(&symbol);

    let target = match (in_long, in_short) {
        (false, false) => return ReconcileAction::Liquidate(close),
        (true, _) => &buckets.long,
        (false, true) => &buckets.short,
    };

    if target.side.entry_side() == position.side.closing_side() {
        return ReconcileAction::Flip(close);
    }

    let delta = signed_delta(held, target.target_quantity_per_symbol);
    ReconcileAction::Adjust(PendingOrder::from_delta(
        symbol,
        delta,
        target.side.entry_side(),
    ))
}

/// Issues corrective orders for drifted positions.
pub struct PositionReconciler {
    submitter: OrderSubmitter,
}

impl PositionReconciler {
    pub fn new(submitter: OrderSubmitter) -> Self {
        Self { submitter }
    }

    /// Reconcile every position concurrently.
    ///
    /// Adjusted symbols join the blacklist even if their order fails, so the
    /// batch engine never stacks a full-size order on an existing holding.
    pub async fn reconcile(&self, positions: &[Position], buckets: &Buckets) -> Reconciliation {
        let actions: Vec<ReconcileAction> =
            positions.iter().map(|p| analyze(p, buckets)).collect();

        let results = join_all(actions.iter().map(|action| async move {
            let order = action.order();
            match action {
                ReconcileAction::Liquidate(_) => {
                    debug!(symbol = %order.symbol, "Position is not in long or short list. Clearing position")
                }
                ReconcileAction::Flip(_) => {
                    info!(symbol = %order.symbol, side = %order.side, quantity = order.quantity, "Position changed sides. Clearing before re-entry")
                }
                ReconcileAction::Adjust(_) if order.quantity > 0 => {
                    info!(symbol = %order.symbol, side = %order.side, quantity = order.quantity, "Adjusting position toward target")
                }
                ReconcileAction::Adjust(_) => {}
            }
            self.submitter.submit(order).await
        }))
        .await;

        let mut reconciliation = Reconciliation::default();
        for (action, ok) in actions.into_iter().zip(results) {
            let symbol = action.order().symbol.clone();
            if !ok {
                error!(%symbol, action = ?action, "Reconciliation order failed");
                reconciliation.failed.push(symbol.clone());
            }
            if action.reconciles() {
                reconciliation.blacklist.insert(symbol);
            }
            reconciliation.actions.push(action);
        }
        reconciliation
    }
}
