//! Storage backends for jobs, observations and alerts.
//!
//! [`memory`] keeps everything in process and backs tests and local runs.
//! The `postgres` feature adds [`postgres::PostgresStore`], which serves
//! all three stores from one pool.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{InMemoryAlertStore, InMemoryJobQueue, InMemoryObservationStore};

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
