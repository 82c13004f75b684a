// 8.0: the clob keeper. order entry, fill state, liquidations, deleveraging,
// proposer-operations replay and the block hooks all hang off one struct, split
// across the files below. the consensus path only touches the store handle it is
// given; the local books and the operations queue never leave the node.

mod block;
mod clob_pairs;
mod core;
mod deleveraging;
mod fill_state;
mod liquidations;
mod matches;
mod orders;
mod process;
mod results;
mod stateful_orders;

pub use core::{ClobKeeper, OPERATIONS_TX_INDEX};
pub use fill_state::{OrderFillState, PotentiallyPrunableOrders, STATEFUL_PRUNABLE_BLOCK_HEIGHT};
pub use results::{ClobError, LiquidationResult, OrderStatus, PlaceOrderResult, ProcessProposerMatchesEvents};
pub use stateful_orders::{StatefulOrderPlacement, STATEFUL_ORDER_TIME_WINDOW_SECS};
