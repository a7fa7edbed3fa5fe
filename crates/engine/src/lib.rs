//! Aggregate command-processing engine.
//!
//! This crate provides:
//! - Aggregate, command and domain event traits
//! - A registry of behaviours and aggregators with tenant overrides
//! - The per-instance state container and its cache
//! - The engine: load, process, conflict retry, background snapshots
//! - A type-erased submission gateway and the deployment directory

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod state;
pub mod telemetry;

pub use aggregate::{Aggregate, Command, DomainEvent, PendingEvent};
pub use cache::{AggregateCache, CacheStats, InMemoryAggregateCache};
pub use config::{AggregateConfiguration, EngineConfig, PersistenceMode};
pub use engine::{AggregateEngine, Consistency, Infrastructure};
pub use error::{EngineError, ErrorResponse, Rejection, Result};
pub use gateway::{CommandGateway, CommandRequest, Deployment};
pub use registry::{AggregateRegistry, AggregateRegistryBuilder, RegistryError};
pub use state::AggregateInstanceState;
