//! Process-wide HTTP clients, one per service
//!
//! Clients hold connection pools, so they are built lazily on first use and
//! reused for the rest of the process.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::error::{IngestError, Result};

pub struct ClientRegistry {
    timeout: Duration,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl ClientRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Client for `service`, created on first request
    pub fn get(&self, service: &str) -> Result<reqwest::Client> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| IngestError::Internal("client registry lock poisoned".into()))?;

        if let Some(client) = clients.get(service) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("tidepool/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Internal(format!("building HTTP client: {}", e)))?;

        debug!(service, "Created HTTP client");
        clients.insert(service.to_string(), client.clone());

        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::config::DEFAULT_HTTP_TIMEOUT_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_client_per_service() {
        let registry = ClientRegistry::default();
        assert!(registry.is_empty());

        registry.get("psa").unwrap();
        registry.get("psa").unwrap();
        registry.get("rmm").unwrap();

        assert_eq!(registry.len(), 2);
    }
}
