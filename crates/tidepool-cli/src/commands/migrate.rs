//! `tidepool migrate` command implementation

use serde_json::json;
use tidepool_engine::config::EngineConfig;
use tidepool_engine::state::PgStateStore;

use super::print_json;
use crate::error::Result;

/// Apply state store migrations; needs only the database
pub async fn run(config: &EngineConfig) -> Result<()> {
    let store = PgStateStore::connect(&config.database).await?;
    store.migrate().await?;
    print_json(&json!({ "migrated": true }))
}
