//! `tidepool run-request` command implementation
//!
//! Executes one request file written to the outbox by a dispatcher.

use std::path::Path;
use tidepool_engine::dispatch::{DispatchRequest, QueueDispatcher};
use tracing::info;

use super::{merge, transform, Services};
use crate::error::Result;

pub async fn run(services: &Services, path: &Path) -> Result<()> {
    match QueueDispatcher::read_request(path).await? {
        DispatchRequest::Transform(request) => {
            info!(table = %request.table_name, "Running dispatched transform");
            transform::run(services, request).await
        },
        DispatchRequest::Merge(request) => {
            info!(table = %request.canonical_table, "Running dispatched merge");
            merge::run(services, request).await
        },
    }
}
