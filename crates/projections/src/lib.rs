//! Journal projections for the query side.
//!
//! This crate provides:
//! - [`EventProjection`] trait for consuming journal events per tenant
//! - [`ProjectionPoller`] for feeding batches to projections from a stored
//!   offset cursor, with periodic polling and full rebuilds

pub mod error;
pub mod poller;
pub mod projection;

pub use error::{ProjectionError, Result};
pub use poller::ProjectionPoller;
pub use projection::EventProjection;
