//! ClickHouse over its HTTP interface
//!
//! Statements are POSTed as the request body; rows are loaded as
//! `JSONEachRow`. Tenant ids and timestamps travel as query parameters, never
//! interpolated. Mutations wait for completion (`mutations_sync=2`) so the
//! next merge step sees their effect.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use super::store::{
    format_datetime, validate_identifier, AnalyticalStore, InsertMode, TargetRow, TARGET_METADATA_COLUMNS,
};
use crate::config::AnalyticalConfig;
use crate::error::{IngestError, Result};
use crate::mapping::ScdType;

const DATETIME: &str = "DateTime64(6, 'UTC')";

pub struct ClickHouseStore {
    client: reqwest::Client,
    url: String,
    database: String,
    user: String,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Summary {
    #[serde(default)]
    written_rows: Option<String>,
}

impl ClickHouseStore {
    pub fn new(config: &AnalyticalConfig) -> Result<Self> {
        validate_identifier(&config.database)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IngestError::Config(format!("failed to build ClickHouse client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    fn qualified(&self, table: &str) -> Result<String> {
        Ok(format!("`{}`.`{}`", self.database, validate_identifier(table)?))
    }

    /// POST one statement; returns rows written when the server reports them
    async fn execute(
        &self,
        sql: String,
        params: &[(&str, String)],
        body_rows: Option<String>,
    ) -> Result<Option<u64>> {
        let mut query: Vec<(String, String)> =
            vec![("database".to_string(), self.database.clone())];
        query.extend(params.iter().map(|(k, v)| (k.to_string(), v.clone())));

        // With a row payload the statement moves to the URL
        let body = match body_rows {
            Some(rows) => {
                query.push(("query".to_string(), sql.clone()));
                rows
            },
            None => sql.clone(),
        };

        let mut request = self
            .client
            .post(&self.url)
            .query(&query)
            .header("X-ClickHouse-User", &self.user)
            .body(body);
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        debug!(sql = %sql, "ClickHouse statement");
        let response = request.send().await?;
        let status = response.status();
        let written = response
            .headers()
            .get("X-ClickHouse-Summary")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| serde_json::from_str::<Summary>(s).ok())
            .and_then(|s| s.written_rows)
            .and_then(|n| n.parse().ok());

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(512).collect();
            return Err(if status.is_server_error() {
                IngestError::Transient(format!("ClickHouse returned {}: {}", status, snippet))
            } else {
                IngestError::Merge(format!("ClickHouse rejected statement ({}): {}", status, snippet))
            });
        }

        Ok(written)
    }

    fn mutation_params(tenant_id: &str) -> Vec<(&'static str, String)> {
        vec![
            ("param_tenant", tenant_id.to_string()),
            ("mutations_sync", "2".to_string()),
            ("allow_nondeterministic_mutations", "1".to_string()),
        ]
    }
}

/// `CREATE TABLE` statement for a target table
pub fn create_table_sql(qualified: &str, business_columns: &[String], scd_type: ScdType) -> Result<String> {
    let mut columns = vec!["`tenant_id` String".to_string(), "`id` String".to_string()];
    for column in business_columns {
        if TARGET_METADATA_COLUMNS.contains(&column.as_str()) {
            return Err(IngestError::Config(format!(
                "business column '{}' collides with a target metadata column",
                column
            )));
        }
        columns.push(format!("`{}` Nullable(String)", validate_identifier(column)?));
    }
    columns.extend([
        "`source_system` String".to_string(),
        "`source_id` String".to_string(),
        format!("`last_updated` {}", DATETIME),
        format!("`created_date` {}", DATETIME),
        "`data_hash` String".to_string(),
        "`record_version` UInt64".to_string(),
    ]);

    let order_by = match scd_type {
        ScdType::Type1 => "(tenant_id, id)",
        ScdType::Type2 => {
            columns.extend([
                format!("`effective_date` {}", DATETIME),
                format!("`expiration_date` Nullable({})", DATETIME),
                "`is_current` UInt8".to_string(),
            ]);
            "(tenant_id, id, effective_date)"
        },
    };

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = MergeTree ORDER BY {}",
        qualified,
        columns.join(", "),
        order_by
    ))
}

#[async_trait]
impl AnalyticalStore for ClickHouseStore {
    #[instrument(skip(self, business_columns))]
    async fn ensure_target_table(
        &self,
        table: &str,
        business_columns: &[String],
        scd_type: ScdType,
    ) -> Result<()> {
        let qualified = self.qualified(table)?;
        self.execute(create_table_sql(&qualified, business_columns, scd_type)?, &[], None)
            .await?;

        if !business_columns.is_empty() {
            let additions: Vec<String> = business_columns
                .iter()
                .map(|c| format!("ADD COLUMN IF NOT EXISTS `{}` Nullable(String)", c))
                .collect();
            self.execute(format!("ALTER TABLE {} {}", qualified, additions.join(", ")), &[], None)
                .await?;
        }
        Ok(())
    }

    async fn create_staging(&self, staging: &str, table: &str) -> Result<()> {
        let sql = format!(
            "CREATE TABLE {} AS {} ENGINE = Memory",
            self.qualified(staging)?,
            self.qualified(table)?
        );
        self.execute(sql, &[], None).await.map(|_| ())
    }

    async fn load_staging(&self, staging: &str, rows: &[TargetRow], scd_type: ScdType) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut payload = String::with_capacity(rows.len() * 256);
        for row in rows {
            payload.push_str(&serde_json::to_string(&row.to_json(scd_type))?);
            payload.push('\n');
        }
        let sql = format!("INSERT INTO {} FORMAT JSONEachRow", self.qualified(staging)?);
        self.execute(sql, &[("input_format_skip_unknown_fields", "1".to_string())], Some(payload))
            .await
            .map(|_| ())
    }

    async fn delete_matching(&self, table: &str, staging: &str, tenant_id: &str) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} DELETE WHERE tenant_id = {{tenant:String}} AND id IN (SELECT id FROM {})",
            self.qualified(table)?,
            self.qualified(staging)?
        );
        self.execute(sql, &Self::mutation_params(tenant_id), None).await.map(|_| ())
    }

    async fn expire_changed(
        &self,
        table: &str,
        staging: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let staging = self.qualified(staging)?;
        let sql = format!(
            "ALTER TABLE {} UPDATE is_current = 0, expiration_date = {{now:{}}} \
             WHERE tenant_id = {{tenant:String}} AND is_current = 1 \
             AND id IN (SELECT id FROM {staging}) \
             AND (id, data_hash) NOT IN (SELECT id, data_hash FROM {staging})",
            self.qualified(table)?,
            DATETIME,
            staging = staging
        );
        let mut params = Self::mutation_params(tenant_id);
        params.push(("param_now", format_datetime(now)));
        self.execute(sql, &params, None).await.map(|_| ())
    }

    async fn insert_staged(
        &self,
        table: &str,
        staging: &str,
        tenant_id: &str,
        mode: InsertMode,
    ) -> Result<Option<u64>> {
        let target = self.qualified(table)?;
        let staging = self.qualified(staging)?;
        let sql = match mode {
            InsertMode::All => format!(
                "INSERT INTO {target} SELECT * FROM {staging} WHERE tenant_id = {{tenant:String}}",
                target = target,
                staging = staging
            ),
            InsertMode::MissingOrChanged => format!(
                "INSERT INTO {target} \
                 SELECT s.* REPLACE (ifNull(v.max_version, 0) + 1 AS record_version) \
                 FROM {staging} AS s \
                 LEFT JOIN (SELECT id, max(record_version) AS max_version FROM {target} \
                 WHERE tenant_id = {{tenant:String}} GROUP BY id) AS v ON s.id = v.id \
                 WHERE s.tenant_id = {{tenant:String}} \
                 AND (s.id, s.data_hash) NOT IN \
                 (SELECT id, data_hash FROM {target} WHERE tenant_id = {{tenant:String}} AND is_current = 1)",
                target = target,
                staging = staging
            ),
        };
        self.execute(sql, &[("param_tenant", tenant_id.to_string())], None).await
    }

    async fn drop_staging(&self, staging: &str) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.qualified(staging)?);
        self.execute(sql, &[], None).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_string_contains, header, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(url: &str) -> ClickHouseStore {
        ClickHouseStore::new(&AnalyticalConfig {
            url: url.to_string(),
            database: "tidepool".into(),
            user: "loader".into(),
            password: Some("pw".into()),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_type2_table_is_sorted_by_effective_date() {
        let sql = create_table_sql("`db`.`companies`", &["name".to_string()], ScdType::Type2).unwrap();
        assert!(sql.contains("ORDER BY (tenant_id, id, effective_date)"));
        assert!(sql.contains("`is_current` UInt8"));
        assert!(sql.contains("`name` Nullable(String)"));

        let sql = create_table_sql("`db`.`tickets`", &[], ScdType::Type1).unwrap();
        assert!(sql.ends_with("ORDER BY (tenant_id, id)"));
        assert!(!sql.contains("is_current"));
    }

    #[test]
    fn test_bad_column_name_is_rejected() {
        assert!(create_table_sql("`db`.`t`", &["x` String, `y".to_string()], ScdType::Type1).is_err());
    }

    #[test]
    fn test_business_column_cannot_shadow_metadata() {
        let err = create_table_sql("`db`.`t`", &["last_updated".to_string()], ScdType::Type1).unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_staging_rows_sent_as_json_each_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("query", "INSERT INTO `tidepool`.`companies_stage` FORMAT JSONEachRow"))
            .and(header("X-ClickHouse-User", "loader"))
            .and(body_string_contains("\"tenant_id\":\"acme\""))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let now = Utc::now();
        let row = TargetRow {
            tenant_id: "acme".into(),
            id: "1".into(),
            fields: BTreeMap::new(),
            source_system: "connectwise".into(),
            source_id: "1".into(),
            last_updated: now,
            created_date: now,
            data_hash: "h".into(),
            record_version: 1,
            effective_date: None,
            expiration_date: None,
            is_current: true,
        };
        store(&server.uri())
            .load_staging("companies_stage", &[row], ScdType::Type1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mutations_wait_and_bind_tenant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("mutations_sync", "2"))
            .and(query_param("param_tenant", "acme"))
            .and(body_string_contains("ALTER TABLE `tidepool`.`companies` DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        store(&server.uri())
            .delete_matching("companies", "companies_stage", "acme")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_insert_reports_written_rows() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("NOT IN"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-ClickHouse-Summary", r#"{"read_rows":"3","written_rows":"2"}"#),
            )
            .mount(&server)
            .await;

        let written = store(&server.uri())
            .insert_staged("companies", "companies_stage", "acme", InsertMode::MissingOrChanged)
            .await
            .unwrap();
        assert_eq!(written, Some(2));
    }

    #[tokio::test]
    async fn test_error_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("DROP TABLE"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("CREATE TABLE"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Code: 62. Syntax error"))
            .mount(&server)
            .await;

        let store = store(&server.uri());
        assert!(store.drop_staging("s").await.unwrap_err().is_retryable());
        let err = store.create_staging("s", "t").await.unwrap_err();
        assert!(matches!(err, IngestError::Merge(_)));
    }
}
