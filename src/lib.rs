//! Abandoned-sale recovery server.
//!
//! Each tenant pairs one chat account. Once the session is ready, pending
//! contacts get a recovery message, replies are answered and the contact's
//! status advances. A reconciliation loop keeps flushing contacts that
//! arrive later or failed earlier.

pub mod answer;
pub mod app;
pub mod client;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod machine;
pub mod manager;
pub mod prompting;
pub mod reconcile;
pub mod registry;
pub mod routes;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod types;

pub use error::AppError;
