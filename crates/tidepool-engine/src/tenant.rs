//! Credential/tenant resolution

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{IngestError, Result};
use crate::secrets::SecretStore;
use crate::state::StateStore;

/// Everything needed to call one tenant's SaaS service
#[derive(Debug, Clone)]
pub struct TenantCredentials {
    pub tenant_id: String,
    pub service: String,
    pub source_system: String,
    pub credentials: Value,
    pub enabled_endpoints: Vec<String>,
}

impl TenantCredentials {
    pub fn is_enabled(&self, table: &str) -> bool {
        self.enabled_endpoints.iter().any(|e| e.eq_ignore_ascii_case(table))
    }

    pub fn ensure_endpoint_enabled(&self, table: &str) -> Result<()> {
        if self.is_enabled(table) {
            Ok(())
        } else {
            Err(IngestError::Config(format!(
                "endpoint '{}' is not enabled for tenant {} on {}",
                table, self.tenant_id, self.service
            )))
        }
    }
}

pub struct TenantResolver {
    state: Arc<dyn StateStore>,
    secrets: Arc<dyn SecretStore>,
}

impl TenantResolver {
    pub fn new(state: Arc<dyn StateStore>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { state, secrets }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, tenant_id: &str, service: &str) -> Result<TenantCredentials> {
        let record = self.state.get_tenant_service(tenant_id, service).await?.ok_or_else(|| {
            IngestError::Config(format!("tenant {} has no {} configuration", tenant_id, service))
        })?;

        let credentials = self.secrets.get_secret(&record.secret_ref).await?.ok_or_else(|| {
            IngestError::Config(format!(
                "secret '{}' for tenant {} not found",
                record.secret_ref, tenant_id
            ))
        })?;

        debug!(endpoints = record.enabled_endpoints.len(), "Resolved tenant credentials");

        Ok(TenantCredentials {
            tenant_id: record.tenant_id,
            service: record.service,
            source_system: record.source_system,
            credentials,
            enabled_endpoints: record.enabled_endpoints,
        })
    }
}
