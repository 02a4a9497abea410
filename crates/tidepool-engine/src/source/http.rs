//! Generic JSON-over-HTTP source adapter
//!
//! Talks to any API that pages by `offset`/`limit` query parameters. The
//! tenant's credential blob supplies the connection details:
//!
//! ```json
//! {
//!   "base_url": "https://psa.example.com/api/v1",
//!   "api_token": "...",
//!   "records_field": "data",
//!   "headers": { "clientId": "..." }
//! }
//! ```
//!
//! `username`/`password` may replace `api_token` for basic auth.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{PageRequest, SourceApi};
use crate::clients::ClientRegistry;
use crate::error::{IngestError, Result};
use crate::state::DateWindow;
use crate::tenant::TenantCredentials;

/// Fields tried, in order, when a response wraps its records in an object
const RECORD_FIELDS: &[&str] = &["data", "records", "items", "results"];

#[derive(Debug, Deserialize)]
struct HttpCredentials {
    base_url: String,
    #[serde(default)]
    api_token: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    records_field: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

impl HttpCredentials {
    fn parse(creds: &TenantCredentials) -> Result<Self> {
        serde_json::from_value(creds.credentials.clone()).map_err(|e| {
            IngestError::Config(format!(
                "credentials for tenant {} on {} are malformed: {}",
                creds.tenant_id, creds.service, e
            ))
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

pub struct HttpSource {
    clients: Arc<ClientRegistry>,
}

impl HttpSource {
    pub fn new(clients: Arc<ClientRegistry>) -> Self {
        Self { clients }
    }

    fn request(
        &self,
        creds: &TenantCredentials,
        http: &HttpCredentials,
        path: &str,
    ) -> Result<reqwest::RequestBuilder> {
        let client = self.clients.get(&creds.service)?;
        let mut request = client.get(http.url(path));

        if let Some(token) = &http.api_token {
            request = request.bearer_auth(token);
        } else if let Some(user) = &http.username {
            request = request.basic_auth(user, http.password.as_deref());
        }
        for (name, value) in &http.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        Ok(request)
    }

    async fn send_json(request: reqwest::RequestBuilder, context: &str) -> Result<Value> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::from_status(status, context, &body));
        }
        Ok(response.json::<Value>().await?)
    }
}

fn window_params(window: Option<&DateWindow>) -> Vec<(&'static str, String)> {
    window
        .map(|w| {
            vec![
                ("updated_since", w.start.to_rfc3339()),
                ("updated_before", w.end.to_rfc3339()),
            ]
        })
        .unwrap_or_default()
}

/// Pull the record array out of a page response
fn extract_records(body: Value, records_field: Option<&str>) -> Result<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => {
            let fields = records_field.into_iter().chain(RECORD_FIELDS.iter().copied());
            for field in fields {
                if let Some(Value::Array(items)) = obj.remove(field) {
                    return Ok(items);
                }
            }
            Err(IngestError::Source(format!(
                "page response has no record array (keys: {})",
                obj.keys().cloned().collect::<Vec<_>>().join(", ")
            )))
        },
        other => Err(IngestError::Source(format!("unexpected page response: {}", other))),
    }
}

#[async_trait]
impl SourceApi for HttpSource {
    #[instrument(skip(self, creds), fields(tenant_id = %creds.tenant_id))]
    async fn count(
        &self,
        creds: &TenantCredentials,
        table: &str,
        window: Option<&DateWindow>,
    ) -> Result<Option<u64>> {
        let http = HttpCredentials::parse(creds)?;
        let request = self
            .request(creds, &http, &format!("{}/count", table))?
            .query(&window_params(window));

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND
            || status == reqwest::StatusCode::NOT_IMPLEMENTED
        {
            debug!(table, "Source cannot count records");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::from_status(status, &format!("count {}", table), &body));
        }

        let body: Value = response.json().await?;
        Ok(body.get("count").and_then(Value::as_u64).or_else(|| body.as_u64()))
    }

    #[instrument(skip(self, creds), fields(tenant_id = %creds.tenant_id, table = %request.table))]
    async fn fetch_page(
        &self,
        creds: &TenantCredentials,
        request: &PageRequest,
    ) -> Result<Vec<Value>> {
        let http = HttpCredentials::parse(creds)?;
        let mut params = vec![
            ("offset", request.offset.to_string()),
            ("limit", request.limit.to_string()),
        ];
        params.extend(window_params(request.window.as_ref()));

        let builder = self.request(creds, &http, &request.table)?.query(&params);
        let context = format!("GET {} offset {}", request.table, request.offset);
        let body = Self::send_json(builder, &context).await?;
        let records = extract_records(body, http.records_field.as_deref())?;

        debug!(offset = request.offset, count = records.len(), "Fetched page");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn creds(base_url: &str) -> TenantCredentials {
        TenantCredentials {
            tenant_id: "acme".into(),
            service: "psa".into(),
            source_system: "connectwise".into(),
            credentials: json!({ "base_url": base_url, "api_token": "secret" }),
            enabled_endpoints: vec!["companies".into()],
        }
    }

    fn page(offset: u64, limit: u64) -> PageRequest {
        PageRequest {
            table: "companies".into(),
            offset,
            limit,
            window: None,
        }
    }

    #[test]
    fn test_extract_records_shapes() {
        assert_eq!(extract_records(json!([1, 2]), None).unwrap().len(), 2);
        assert_eq!(extract_records(json!({ "items": [1] }), None).unwrap().len(), 1);
        assert_eq!(extract_records(json!({ "rows": [1, 2, 3] }), Some("rows")).unwrap().len(), 3);
        assert!(extract_records(json!({ "total": 3 }), None).is_err());
    }

    #[tokio::test]
    async fn test_fetch_page_sends_offset_and_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/companies"))
            .and(query_param("offset", "1000"))
            .and(query_param("limit", "1000"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "id": 1001 }, { "id": 1002 }]
            })))
            .mount(&server)
            .await;

        let source = HttpSource::new(Arc::new(ClientRegistry::default()));
        let records = source.fetch_page(&creds(&server.uri()), &page(1000, 1000)).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = HttpSource::new(Arc::new(ClientRegistry::default()));
        let err = source.fetch_page(&creds(&server.uri()), &page(0, 1000)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_count_missing_endpoint_is_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/companies/count"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = HttpSource::new(Arc::new(ClientRegistry::default()));
        let count = source.count(&creds(&server.uri()), "companies", None).await.unwrap();
        assert_eq!(count, None);
    }

    #[tokio::test]
    async fn test_count_reads_count_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/companies/count"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": 12345 })))
            .mount(&server)
            .await;

        let source = HttpSource::new(Arc::new(ClientRegistry::default()));
        let count = source.count(&creds(&server.uri()), "companies", None).await.unwrap();
        assert_eq!(count, Some(12345));
    }
}
