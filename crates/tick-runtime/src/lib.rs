//! Server runtime: durable store, task manager, alert service, replay, and
//! the TCP point receiver, tied together by the [`server::Server`]
//! lifecycle.

#[macro_use]
pub mod log_macros;

pub mod alert_service;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod model;
pub mod receiver;
pub mod replay;
pub mod server;
pub mod store;
pub mod task;
pub mod tracing_init;

pub use error::{RuntimeError, RuntimeReason, RuntimeResult};
pub use server::{Server, wait_for_signal};
