//! Behaviour and aggregator registries with tenant overrides.
//!
//! A registry is built once per aggregate type at startup. Every accepted
//! spelling of a command or event type (full Rust path, short name,
//! snake_case, lowercase) resolves to one canonical name, and handlers are
//! looked up by canonical name and tenant, falling back to the default tenant.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use event_store::{EventEnvelope, TenantId};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::aggregate::{Aggregate, Command, DomainEvent, PendingEvent, short_type_name};
use crate::error::{EngineError, Rejection, Result};

pub(crate) type BehaviourFn<A> =
    Arc<dyn Fn(&A, &Value) -> Result<Vec<PendingEvent>> + Send + Sync>;
pub(crate) type AggregatorFn<A> = Arc<dyn Fn(&A, &EventEnvelope) -> Result<A> + Send + Sync>;

/// Startup configuration errors of a registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two different types share a spelling.
    #[error("alias '{alias}' is claimed by both {first} and {second}")]
    AliasCollision {
        alias: String,
        first: String,
        second: String,
    },

    #[error("{kind} for {type_name} registered twice for tenant {tenant}")]
    DuplicateRegistration {
        kind: &'static str,
        type_name: String,
        tenant: TenantId,
    },

    #[error("no behaviours registered for aggregate {0}")]
    NoBehaviours(String),

    #[error("no aggregators registered for aggregate {0}")]
    NoAggregators(String),

    /// Two engines claim the same aggregate type in one deployment.
    #[error("aggregate type {0} deployed twice")]
    DuplicateAggregate(String),
}

struct Registration<H> {
    full_name: &'static str,
    canonical: &'static str,
    tenant: TenantId,
    handler: H,
}

/// Converts a CamelCase identifier to snake_case.
///
/// An underscore is inserted only where a lowercase letter is followed by a
/// run of uppercase letters, so `HTTPRequest` becomes `httprequest` and
/// `CreateData` becomes `create_data`.
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = c.is_ascii_lowercase();
        out.push(c.to_ascii_lowercase());
    }
    out
}

fn aliases_of(full_name: &'static str, canonical: &'static str) -> [String; 4] {
    [
        full_name.to_string(),
        canonical.to_string(),
        camel_to_snake(canonical),
        canonical.to_lowercase(),
    ]
}

fn build_alias_table<H>(
    registrations: &[Registration<H>],
) -> std::result::Result<HashMap<String, &'static str>, RegistryError> {
    let mut owners: HashMap<String, &'static str> = HashMap::new();
    let mut table = HashMap::new();

    for registration in registrations {
        for alias in aliases_of(registration.full_name, registration.canonical) {
            match owners.get(&alias) {
                Some(owner) if *owner != registration.full_name => {
                    return Err(RegistryError::AliasCollision {
                        alias,
                        first: owner.to_string(),
                        second: registration.full_name.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    owners.insert(alias.clone(), registration.full_name);
                    table.insert(alias, registration.canonical);
                }
            }
        }
    }

    Ok(table)
}

fn index_handlers<H>(
    kind: &'static str,
    registrations: Vec<Registration<H>>,
) -> std::result::Result<HashMap<(&'static str, TenantId), H>, RegistryError> {
    let mut handlers = HashMap::with_capacity(registrations.len());
    for registration in registrations {
        let key = (registration.canonical, registration.tenant);
        if handlers.contains_key(&key) {
            return Err(RegistryError::DuplicateRegistration {
                kind,
                type_name: registration.full_name.to_string(),
                tenant: key.1,
            });
        }
        handlers.insert(key, registration.handler);
    }
    Ok(handlers)
}

fn lookup(table: &HashMap<String, &'static str>, name: &str) -> Option<&'static str> {
    table
        .get(name)
        .or_else(|| table.get(&name.to_lowercase()))
        .copied()
}

/// Decodes an event payload, upcasting it from an older schema if needed.
fn read_event<E: DomainEvent>(envelope: &EventEnvelope) -> Result<E> {
    let current = E::schema_version();
    if envelope.schema_version == current {
        return Ok(E::deserialize(&envelope.payload)?);
    }
    if envelope.schema_version > current {
        return Err(EngineError::UnknownEvent(format!(
            "{} schema {} is newer than supported schema {current}",
            envelope.event_type, envelope.schema_version
        )));
    }

    let upcast = E::upcast(envelope.schema_version, envelope.payload.clone()).ok_or_else(|| {
        EngineError::UnknownEvent(format!(
            "{} schema {} cannot be upcast to {current}",
            envelope.event_type, envelope.schema_version
        ))
    })?;
    Ok(serde_json::from_value(upcast)?)
}

/// Builder collecting the behaviours and aggregators of one aggregate type.
pub struct AggregateRegistryBuilder<A: Aggregate> {
    behaviours: Vec<Registration<BehaviourFn<A>>>,
    aggregators: Vec<Registration<AggregatorFn<A>>>,
}

impl<A: Aggregate> AggregateRegistryBuilder<A> {
    fn new() -> Self {
        Self {
            behaviours: Vec::new(),
            aggregators: Vec::new(),
        }
    }

    /// Registers the behaviour handling command `C` for a tenant.
    ///
    /// The behaviour is a pure function of the current state and the command.
    pub fn behaviour<C, F>(mut self, tenant: impl Into<TenantId>, behaviour: F) -> Self
    where
        C: Command,
        F: Fn(&A, &C) -> std::result::Result<Vec<PendingEvent>, Rejection>
            + Send
            + Sync
            + 'static,
    {
        let handler: BehaviourFn<A> = Arc::new(move |state: &A, payload: &Value| {
            let command = C::deserialize(payload)
                .map_err(|e| EngineError::CommandRejected(Rejection::malformed(e)))?;
            behaviour(state, &command).map_err(EngineError::CommandRejected)
        });

        self.behaviours.push(Registration {
            full_name: std::any::type_name::<C>(),
            canonical: short_type_name::<C>(),
            tenant: tenant.into(),
            handler,
        });
        self
    }

    /// Registers the behaviour for command `C` under the default tenant.
    pub fn default_behaviour<C, F>(self, behaviour: F) -> Self
    where
        C: Command,
        F: Fn(&A, &C) -> std::result::Result<Vec<PendingEvent>, Rejection>
            + Send
            + Sync
            + 'static,
    {
        self.behaviour::<C, F>(TenantId::default_tenant(), behaviour)
    }

    /// Registers the aggregator folding event `E` for a tenant.
    pub fn aggregator<E, F>(mut self, tenant: impl Into<TenantId>, aggregator: F) -> Self
    where
        E: DomainEvent,
        F: Fn(&A, &E) -> A + Send + Sync + 'static,
    {
        let handler: AggregatorFn<A> = Arc::new(move |state: &A, envelope: &EventEnvelope| {
            let event = read_event::<E>(envelope)?;
            Ok(aggregator(state, &event))
        });

        self.aggregators.push(Registration {
            full_name: std::any::type_name::<E>(),
            canonical: short_type_name::<E>(),
            tenant: tenant.into(),
            handler,
        });
        self
    }

    /// Registers the aggregator for event `E` under the default tenant.
    pub fn default_aggregator<E, F>(self, aggregator: F) -> Self
    where
        E: DomainEvent,
        F: Fn(&A, &E) -> A + Send + Sync + 'static,
    {
        self.aggregator::<E, F>(TenantId::default_tenant(), aggregator)
    }

    /// Validates the registrations and builds the lookup tables.
    pub fn build(self) -> std::result::Result<AggregateRegistry<A>, RegistryError> {
        if self.behaviours.is_empty() {
            return Err(RegistryError::NoBehaviours(A::aggregate_type().to_string()));
        }
        if self.aggregators.is_empty() {
            return Err(RegistryError::NoAggregators(A::aggregate_type().to_string()));
        }

        let command_aliases = build_alias_table(&self.behaviours)?;
        let event_aliases = build_alias_table(&self.aggregators)?;

        Ok(AggregateRegistry {
            command_aliases,
            event_aliases,
            behaviours: index_handlers("behaviour", self.behaviours)?,
            aggregators: index_handlers("aggregator", self.aggregators)?,
            _aggregate: PhantomData,
        })
    }
}

/// Validated behaviour and aggregator tables for aggregate `A`.
pub struct AggregateRegistry<A: Aggregate> {
    command_aliases: HashMap<String, &'static str>,
    event_aliases: HashMap<String, &'static str>,
    behaviours: HashMap<(&'static str, TenantId), BehaviourFn<A>>,
    aggregators: HashMap<(&'static str, TenantId), AggregatorFn<A>>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> AggregateRegistry<A> {
    pub fn builder() -> AggregateRegistryBuilder<A> {
        AggregateRegistryBuilder::new()
    }

    /// Resolves any accepted spelling of a command type to its canonical name.
    pub fn resolve_command(&self, name: &str) -> Result<&'static str> {
        lookup(&self.command_aliases, name)
            .ok_or_else(|| EngineError::UnknownCommand(name.to_string()))
    }

    /// Resolves any accepted spelling of an event type to its canonical name.
    pub fn resolve_event(&self, name: &str) -> Result<&'static str> {
        lookup(&self.event_aliases, name).ok_or_else(|| EngineError::UnknownEvent(name.to_string()))
    }

    /// Canonical names of all registered command types.
    pub fn command_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.behaviours.keys().map(|(name, _)| *name).collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    /// Runs the behaviour for a resolved command type.
    pub fn handle(
        &self,
        state: &A,
        command_type: &'static str,
        tenant: &TenantId,
        payload: &Value,
    ) -> Result<Vec<PendingEvent>> {
        let behaviour = self
            .behaviours
            .get(&(command_type, tenant.clone()))
            .or_else(|| {
                self.behaviours
                    .get(&(command_type, TenantId::default_tenant()))
            })
            .ok_or_else(|| {
                EngineError::UnknownCommand(format!("{command_type} for tenant {tenant}"))
            })?;
        behaviour(state, payload)
    }

    /// Folds one event into the state with the tenant's aggregator.
    pub fn apply(&self, state: &A, envelope: &EventEnvelope) -> Result<A> {
        let event_type = self.resolve_event(&envelope.event_type)?;
        let aggregator = self
            .aggregators
            .get(&(event_type, envelope.tenant_id.clone()))
            .or_else(|| {
                self.aggregators
                    .get(&(event_type, TenantId::default_tenant()))
            })
            .ok_or_else(|| {
                EngineError::UnknownEvent(format!(
                    "{event_type} for tenant {}",
                    envelope.tenant_id
                ))
            })?;
        aggregator(state, envelope)
    }
}

impl<A: Aggregate> std::fmt::Debug for AggregateRegistry<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRegistry")
            .field("aggregate_type", &A::aggregate_type())
            .field("commands", &self.command_types())
            .field("events", &self.aggregators.len())
            .finish()
    }
}
