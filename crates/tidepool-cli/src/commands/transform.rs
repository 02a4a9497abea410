//! `tidepool transform` command implementation

use tidepool_engine::dispatch::TransformRequest;

use super::{print_json, Services};
use crate::error::Result;

pub async fn run(services: &Services, request: TransformRequest) -> Result<()> {
    let outcome = services.transformer.transform(request).await?;
    print_json(&outcome)
}
