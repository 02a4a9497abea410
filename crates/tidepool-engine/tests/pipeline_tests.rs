//! End-to-end pipeline tests
//!
//! Source records go through planning, chunk processing, aggregation, the
//! canonical transform and the SCD merge, all against in-memory stores.

mod helpers;

use anyhow::Result;
use helpers::{company, companies_mapping, init_tracing, PipelineBuilder, SlowSource, TENANT};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tidepool_engine::config::ChunkingConfig;
use tidepool_engine::deadline::Deadline;
use tidepool_engine::mapping::ScdType;
use tidepool_engine::merge::MergeOutcome;
use tidepool_engine::planner::PlanRequest;
use tidepool_engine::source::MemorySource;
use tidepool_engine::state::{ChunkStatus, JobStatus, StateStore};
use tidepool_engine::storage::{jsonl, ObjectStore};

fn companies_v1() -> Vec<Value> {
    vec![company("A", "Alpha"), company("B", "Beta"), company("C", "Gamma")]
}

fn companies_v2() -> Vec<Value> {
    vec![company("A", "Alpha"), company("B", "Beta Holdings"), company("C", "Gamma")]
}

#[tokio::test]
async fn test_type1_latest_value_wins() -> Result<()> {
    init_tracing();
    let source = Arc::new(MemorySource::new().with_table("companies", companies_v1()));
    let pipeline = PipelineBuilder::new(source.clone())
        .mapping("companies", companies_mapping(ScdType::Type1))
        .build()
        .await;

    let first = pipeline.run("companies").await?;
    assert_eq!(first.status, JobStatus::Completed);
    assert_eq!(first.total_records, 3);
    assert_eq!(first.transforms.len(), 1);

    source.set_table("companies", companies_v2());
    pipeline.run("companies").await?;

    let rows = pipeline.analytical.rows("companies");
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.tenant_id == TENANT && r.record_version == 1));

    let b = rows.iter().find(|r| r.id == "B").expect("row B");
    assert_eq!(b.fields["name"].as_deref(), Some("Beta Holdings"));
    assert_eq!(b.fields["city"].as_deref(), Some("Springfield"));
    assert_eq!(b.source_id, "B");
    assert_eq!(pipeline.analytical.staging_tables(), 0);

    let mut columns = pipeline.analytical.columns("companies");
    columns.sort();
    assert_eq!(columns, vec!["city", "name"]);
    Ok(())
}

#[tokio::test]
async fn test_type2_keeps_history_for_changed_rows_only() -> Result<()> {
    init_tracing();
    let source = Arc::new(MemorySource::new().with_table("companies", companies_v1()));
    let pipeline = PipelineBuilder::new(source.clone())
        .mapping("companies", companies_mapping(ScdType::Type2))
        .build()
        .await;

    pipeline.run("companies").await?;
    source.set_table("companies", companies_v2());
    pipeline.run("companies").await?;

    let rows = pipeline.analytical.rows("companies");
    assert_eq!(rows.len(), 4);

    for id in ["A", "C"] {
        let versions: Vec<_> = rows.iter().filter(|r| r.id == id).collect();
        assert_eq!(versions.len(), 1, "{} must not be duplicated", id);
        assert!(versions[0].is_current);
    }

    let b: Vec<_> = rows.iter().filter(|r| r.id == "B").collect();
    assert_eq!(b.len(), 2);
    let current: Vec<_> = b.iter().filter(|r| r.is_current).collect();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].fields["name"].as_deref(), Some("Beta Holdings"));
    assert_eq!(current[0].record_version, 2);

    let expired = b.iter().find(|r| !r.is_current).expect("expired version");
    assert_eq!(expired.fields["name"].as_deref(), Some("Beta"));
    assert!(expired.expiration_date.is_some());
    Ok(())
}

#[tokio::test]
async fn test_records_missing_required_fields_never_reach_the_target() -> Result<()> {
    let records = vec![
        company("A", "Alpha"),
        json!({ "id": "B", "companyName": "   " }),
        json!({ "companyName": "No id" }),
        json!({ "id": "D" }),
    ];
    let source = Arc::new(MemorySource::new().with_table("companies", records));
    let pipeline = PipelineBuilder::new(source)
        .mapping("companies", companies_mapping(ScdType::Type1))
        .build()
        .await;

    let aggregate = pipeline.ingest("companies").await?;
    let (transformed, merged) = pipeline.transform_and_merge(aggregate.transforms[0].clone()).await?;
    assert_eq!(transformed.records_in, 4);
    assert_eq!(transformed.records_out, 1);
    assert_eq!(transformed.records_dropped, 3);
    assert!(matches!(merged, Some(MergeOutcome::Completed { files_processed: 1, .. })));

    let rows = pipeline.analytical.rows("companies");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "A");
    Ok(())
}

#[tokio::test]
async fn test_repeated_merge_of_same_files_is_a_no_op() -> Result<()> {
    let source = Arc::new(MemorySource::new().with_table("companies", companies_v1()));
    let pipeline = PipelineBuilder::new(source)
        .mapping("companies", companies_mapping(ScdType::Type2))
        .build()
        .await;

    pipeline.run("companies").await?;
    let before = pipeline.analytical.rows("companies");

    let request = pipeline.dispatcher.merges().last().cloned().expect("dispatched merge");
    let again = pipeline.merger.merge(request.clone()).await?;
    match again {
        MergeOutcome::Completed {
            files_processed,
            files_skipped,
            ..
        } => {
            assert_eq!(files_processed, 0);
            assert_eq!(files_skipped, request.files.len());
        },
        MergeOutcome::Busy { .. } => panic!("no other merge is running"),
    }
    assert_eq!(pipeline.analytical.rows("companies"), before);
    Ok(())
}

#[tokio::test]
async fn test_transform_discovery_only_picks_up_new_raw_files() -> Result<()> {
    let source = Arc::new(MemorySource::new().with_table("companies", companies_v1()));
    let pipeline = PipelineBuilder::new(source)
        .mapping("companies", companies_mapping(ScdType::Type1))
        .build()
        .await;

    pipeline.ingest("companies").await?;
    let discover = tidepool_engine::dispatch::TransformRequest {
        tenant_id: TENANT.into(),
        service: helpers::SERVICE.into(),
        table_name: "companies".into(),
        files: None,
        force_reprocess: false,
    };

    let (first, _) = pipeline.transform_and_merge(discover.clone()).await?;
    assert_eq!(first.input_files.len(), 1);

    let (second, merged) = pipeline.transform_and_merge(discover.clone()).await?;
    assert!(second.input_files.is_empty());
    assert!(merged.is_none());

    let forced = tidepool_engine::dispatch::TransformRequest {
        force_reprocess: true,
        ..discover
    };
    let (third, _) = pipeline.transform_and_merge(forced).await?;
    assert_eq!(third.input_files, first.input_files);
    assert_eq!(pipeline.analytical.rows("companies").len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_uncountable_source_larger_than_the_chunk_cap_is_read_whole() -> Result<()> {
    let records: Vec<Value> = (0..4_500).map(|i| company(&i.to_string(), &format!("company {}", i))).collect();
    let source = Arc::new(MemorySource::uncountable().with_table("companies", records));
    let pipeline = PipelineBuilder::new(source)
        .chunking(ChunkingConfig {
            max_records_per_chunk: 2_000,
            ..ChunkingConfig::default()
        })
        .mapping("companies", companies_mapping(ScdType::Type1))
        .build()
        .await;

    let aggregate = pipeline.run("companies").await?;
    assert_eq!(aggregate.status, JobStatus::Completed);
    assert_eq!(aggregate.chunks_succeeded, 1);
    assert_eq!(aggregate.total_records, 4_500);
    assert_eq!(pipeline.analytical.rows("companies").len(), 4_500);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_continuations_read_every_record_exactly_once() -> Result<()> {
    let records: Vec<Value> = (0..10_000)
        .map(|i| json!({ "id": i.to_string(), "companyName": format!("company {}", i) }))
        .collect();
    let inner = Arc::new(MemorySource::new().with_table("companies", records));
    let slow = Arc::new(SlowSource {
        inner,
        per_page: Duration::from_secs(10),
    });
    let pipeline = PipelineBuilder::new(slow)
        .chunking(ChunkingConfig {
            master_chunk_records: 10_000,
            ..ChunkingConfig::default()
        })
        .mapping("companies", companies_mapping(ScdType::Type1))
        .build()
        .await;

    let plan = pipeline
        .planner
        .plan(&PlanRequest {
            tenant_id: TENANT.into(),
            service: helpers::SERVICE.into(),
            table_name: "companies".into(),
            start_date: None,
            end_date: None,
            chunk_size_days: None,
        })
        .await?;
    assert_eq!(plan.chunks.len(), 1);
    let job_id = plan.job.job_id;

    let mut invocations = 0;
    let outcome = loop {
        invocations += 1;
        let outcome = pipeline
            .processor
            .process(job_id, 0, &Deadline::after(Duration::from_secs(25)))
            .await?;
        if outcome.status != ChunkStatus::TimeoutContinuation {
            break outcome;
        }
        let continuation = outcome.continuation.expect("continuation state");
        assert_eq!(continuation.current_offset + continuation.remaining_records, 10_000);
    };
    assert!(invocations > 1);
    assert_eq!(outcome.status, ChunkStatus::Completed);
    assert_eq!(outcome.records_fetched, 10_000);

    let mut seen = BTreeSet::new();
    let mut total = 0;
    for key in &outcome.files {
        let data = pipeline.objects.get(key).await?;
        for record in jsonl::decode(&data)? {
            total += 1;
            seen.insert(record["id"].as_str().map(str::to_string).expect("id"));
        }
    }
    assert_eq!(total, 10_000);
    assert_eq!(seen.len(), 10_000);
    Ok(())
}

#[tokio::test]
async fn test_partial_chunk_failure_reports_completed_with_errors() -> Result<()> {
    let tickets: Vec<Value> = (0..20)
        .map(|i| {
            json!({
                "id": i,
                "summary": format!("ticket {}", i),
                "updated_at": format!("2024-01-{:02}T08:00:00Z", i % 10 + 1),
            })
        })
        .collect();
    let source = Arc::new(MemorySource::new().with_table("tickets", tickets));
    // The first window fails on its first page; the second window is empty
    source.fail_at(0);
    let pipeline = PipelineBuilder::new(source.clone())
        .chunking(ChunkingConfig {
            chunk_size_days: 15,
            ..ChunkingConfig::default()
        })
        .build()
        .await;

    let partial = pipeline.ingest("tickets").await?;
    assert_eq!(partial.status, JobStatus::CompletedWithErrors);
    assert_eq!(partial.chunks_succeeded, 1);
    assert_eq!(partial.chunks_failed, 1);
    assert_eq!(partial.errors[0].chunk_id, Some(0));
    assert!(partial.transforms.is_empty());

    let job = pipeline.state.get_job(partial.job_id).await?.expect("job");
    assert_eq!(job.status, JobStatus::CompletedWithErrors);
    assert!(job.completed_at.is_some());

    // A second aggregation of a finalized job changes nothing
    let again = pipeline.aggregator.aggregate_job(partial.job_id, Vec::new(), true).await?;
    assert!(!again.finalized);
    assert_eq!(again.status, JobStatus::CompletedWithErrors);
    assert!(pipeline.dispatcher.transforms().is_empty());
    Ok(())
}
