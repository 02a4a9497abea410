//! Secret store: secret reference -> JSON credential blob

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{IngestError, Result};

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `None` when the reference does not resolve
    async fn get_secret(&self, reference: &str) -> Result<Option<Value>>;
}

/// Reads secrets from environment variables.
///
/// The reference `tenants/acme/psa` maps to `TIDEPOOL_SECRET_TENANTS_ACME_PSA`.
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_for(&self, reference: &str) -> String {
        let suffix: String = reference
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new("TIDEPOOL_SECRET_")
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_secret(&self, reference: &str) -> Result<Option<Value>> {
        let variable = self.variable_for(reference);
        match std::env::var(&variable) {
            Ok(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                IngestError::Config(format!("secret {} is not valid JSON: {}", variable, e))
            }),
            Err(_) => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, Value>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: &str, value: Value) {
        if let Ok(mut secrets) = self.secrets.lock() {
            secrets.insert(reference.to_string(), value);
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, reference: &str) -> Result<Option<Value>> {
        let secrets = self
            .secrets
            .lock()
            .map_err(|_| IngestError::Internal("secret store lock poisoned".into()))?;
        Ok(secrets.get(reference).cloned())
    }
}
