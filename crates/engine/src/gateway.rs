//! Command submission boundary.
//!
//! Transports hand a [`CommandRequest`] to a [`Deployment`], which routes it
//! to the engine of the addressed aggregate type without knowing its Rust
//! type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use event_store::{AggregateId, CommandId, ErrorSource, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::Aggregate;
use crate::engine::AggregateEngine;
use crate::error::{EngineError, ErrorResponse};
use crate::registry::{RegistryError, camel_to_snake};

/// A command as received from a transport.
///
/// The payload carries `aggregateId`, an optional `commandId` used as the
/// idempotency key, and the command's own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command_type: String,
    #[serde(default)]
    pub tenant_id: TenantId,
    pub payload: Value,
}

impl CommandRequest {
    pub fn new(
        command_type: impl Into<String>,
        tenant_id: impl Into<TenantId>,
        payload: Value,
    ) -> Self {
        Self {
            command_type: command_type.into(),
            tenant_id: tenant_id.into(),
            payload,
        }
    }

    /// The addressed instance, if the payload names one.
    pub fn aggregate_id(&self) -> Option<AggregateId> {
        self.payload
            .get("aggregateId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(AggregateId::new)
    }

    /// The idempotency key, if the caller supplied one.
    pub fn command_id(&self) -> Option<CommandId> {
        self.payload
            .get("commandId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(CommandId::new)
    }
}

/// Type-erased entry point of one aggregate type.
#[async_trait]
pub trait CommandGateway: Send + Sync {
    fn aggregate_type(&self) -> &'static str;

    /// Processes the command and returns the new state as JSON.
    async fn submit(&self, request: CommandRequest) -> Result<Value, ErrorResponse>;
}

#[async_trait]
impl<A: Aggregate> CommandGateway for AggregateEngine<A> {
    fn aggregate_type(&self) -> &'static str {
        A::aggregate_type()
    }

    async fn submit(&self, request: CommandRequest) -> Result<Value, ErrorResponse> {
        let state = self.process(request).await?;
        serde_json::to_value(state).map_err(|e| ErrorResponse::from(EngineError::from(e)))
    }
}

/// Directory of the engines running in one process, keyed by aggregate type.
#[derive(Clone, Default)]
pub struct Deployment {
    gateways: HashMap<String, Arc<dyn CommandGateway>>,
    aliases: HashMap<String, String>,
}

impl Deployment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an engine; fails if its aggregate type is already deployed.
    pub fn deploy<A: Aggregate>(self, engine: AggregateEngine<A>) -> Result<Self, RegistryError> {
        self.deploy_gateway(Arc::new(engine))
    }

    pub fn deploy_gateway(mut self, gateway: Arc<dyn CommandGateway>) -> Result<Self, RegistryError> {
        let name = gateway.aggregate_type().to_string();
        if self.gateways.contains_key(&name) {
            return Err(RegistryError::DuplicateAggregate(name));
        }

        for alias in [name.clone(), camel_to_snake(&name), name.to_lowercase()] {
            self.aliases.entry(alias).or_insert_with(|| name.clone());
        }
        self.gateways.insert(name, gateway);
        Ok(self)
    }

    /// Names of the deployed aggregate types.
    pub fn aggregate_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.gateways.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn gateway(&self, aggregate_type: &str) -> Option<&Arc<dyn CommandGateway>> {
        let canonical = self
            .aliases
            .get(aggregate_type)
            .or_else(|| self.aliases.get(&aggregate_type.to_lowercase()))?;
        self.gateways.get(canonical)
    }

    /// Routes a command to the engine of `aggregate_type`.
    #[tracing::instrument(skip(self, request), fields(command_type = %request.command_type))]
    pub async fn submit(
        &self,
        aggregate_type: &str,
        request: CommandRequest,
    ) -> Result<Value, ErrorResponse> {
        match self.gateway(aggregate_type) {
            Some(gateway) => gateway.submit(request).await,
            None => Err(ErrorResponse {
                message: "Unknown aggregate type".to_string(),
                hint: Some(format!("No engine is deployed for {aggregate_type}")),
                code: 404,
                source: ErrorSource::Logic,
            }),
        }
    }
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("aggregate_types", &self.aggregate_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_reads_ids_from_payload() {
        let request = CommandRequest::new(
            "Create",
            "T1",
            serde_json::json!({"aggregateId": "A1", "commandId": "c1", "data": {}}),
        );

        assert_eq!(request.aggregate_id(), Some(AggregateId::new("A1")));
        assert_eq!(request.command_id(), Some(CommandId::new("c1")));
    }

    #[test]
    fn request_without_ids() {
        let request = CommandRequest::new("Create", "T1", serde_json::json!({"aggregateId": ""}));

        assert_eq!(request.aggregate_id(), None);
        assert_eq!(request.command_id(), None);
    }

    #[test]
    fn request_tenant_defaults_when_absent() {
        let request: CommandRequest = serde_json::from_value(serde_json::json!({
            "commandType": "Create",
            "payload": {"aggregateId": "A1"}
        }))
        .unwrap();

        assert!(request.tenant_id.is_default());
    }

    #[tokio::test]
    async fn unknown_aggregate_type_is_not_found() {
        let deployment = Deployment::new();
        let err = deployment
            .submit("Missing", CommandRequest::new("Create", "T1", serde_json::json!({})))
            .await
            .unwrap_err();

        assert_eq!(err.code, 404);
        assert_eq!(err.source, ErrorSource::Logic);
    }
}
