//! Core execution model: points, batches, bounded edges, the node runtime,
//! and the alert state machine.

pub mod alert;
pub mod edge;
pub mod error;
pub mod eval;
pub mod node;
pub mod point;

pub use edge::{EdgeRx, EdgeTx, edge};
pub use error::{CoreError, CoreReason, CoreResult};
pub use point::{Batch, FieldValue, GroupKey, Message, Point};
