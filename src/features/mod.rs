// =============================================================================
// Feature Engines
// =============================================================================
//
// Per-symbol incremental feature computation: volume-weighted price with
// rolling standard deviation, order-book imbalance, and trade-direction
// imbalance. Each engine owns its window and is safe to share via `Arc`.

pub mod depth_imbalance;
pub mod tick_imbalance;
pub mod vwap;

pub use depth_imbalance::depth_imbalance;
pub use tick_imbalance::TickImbalanceState;
pub use vwap::VwapState;
