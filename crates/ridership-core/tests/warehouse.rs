use std::collections::HashMap;
use std::env;
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use once_cell::sync::Lazy;
use ridership_core::aggregates::{self, AggregateDefinition, IndexDefinition};
use ridership_core::db::{self, DbPool};
use ridership_core::events::{MemorySink, PipelineEvent};
use ridership_core::pipeline::{self, RunOptions, StageStatus};
use ridership_core::schema::Year;
use ridership_core::source::RidershipSource;
use ridership_core::{admin, ErrorKind, ExecutionContext, PipelineError};
use tokio::sync::{Mutex, MutexGuard};

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serves fixed gzip archives from memory.
#[derive(Default)]
struct StaticSource {
    archives: HashMap<i32, Bytes>,
}

impl StaticSource {
    fn with(mut self, year: i32, csv: &str) -> Self {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(csv.as_bytes()).expect("write gzip");
        self.archives
            .insert(year, Bytes::from(encoder.finish().expect("finish gzip")));
        self
    }
}

#[async_trait]
impl RidershipSource for StaticSource {
    async fn fetch(&self, year: Year) -> ridership_core::Result<Bytes> {
        self.archives
            .get(&year.value())
            .cloned()
            .ok_or_else(|| PipelineError::SourceFile {
                path: format!("memory/{year}").into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no archive"),
            })
    }
}

fn year(value: i32) -> Year {
    Year::new(value).expect("valid year")
}

async fn setup() -> Result<Option<(MutexGuard<'static, ()>, DbPool)>> {
    let database_url = match env::var("RIDERSHIP_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping warehouse test because RIDERSHIP_TEST_DATABASE_URL is not set");
            return Ok(None);
        }
    };

    let guard = DB_LOCK.lock().await;
    let pool = db::connect_url(&database_url).await?;

    sqlx::raw_sql(
        r#"
        CREATE SCHEMA IF NOT EXISTS bart;
        CREATE TABLE IF NOT EXISTS bart.dim_date (
            date_id INT PRIMARY KEY,
            date DATE NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS bart.dim_station (
            id INT PRIMARY KEY,
            abbreviation TEXT NOT NULL UNIQUE,
            latitude DOUBLE PRECISION,
            longitude DOUBLE PRECISION
        );
        INSERT INTO bart.dim_date (date_id, date)
        SELECT to_char(d, 'YYYYMMDD')::int, d::date
        FROM generate_series('2021-01-01'::date, '2023-12-31'::date, '1 day') d
        ON CONFLICT DO NOTHING;
        INSERT INTO bart.dim_station (id, abbreviation, latitude, longitude) VALUES
            (5, '12TH', 37.803768, -122.271450),
            (9, 'MONT', 37.789405, -122.401066),
            (11, 'EMBR', 37.792874, -122.397020)
        ON CONFLICT DO NOTHING;
        "#,
    )
    .execute(&pool)
    .await?;

    admin::teardown(&pool).await?;
    Ok(Some((guard, pool)))
}

type StagedRow = (NaiveDate, i32, String, String, i32);
type FactRow = (i32, i32, i32, i32, i32);

async fn staged_rows(pool: &DbPool, relation: &str) -> Result<Vec<StagedRow>> {
    let sql = format!(
        "SELECT day, hour, origin::text, destination::text, trip_count FROM {relation} \
         ORDER BY day, hour, origin, destination, trip_count"
    );
    Ok(sqlx::query_as(&sql).fetch_all(pool).await?)
}

async fn fact_rows(pool: &DbPool, relation: &str) -> Result<Vec<FactRow>> {
    let sql = format!(
        "SELECT date_id, hour, origin_station_id, destination_station_id, trip_count \
         FROM {relation} \
         ORDER BY date_id, hour, origin_station_id, destination_station_id, trip_count"
    );
    Ok(sqlx::query_as(&sql).fetch_all(pool).await?)
}

async fn count(pool: &DbPool, relation: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {relation}");
    Ok(sqlx::query_scalar::<_, i64>(&sql).fetch_one(pool).await?)
}

#[tokio::test]
async fn staged_row_becomes_fact_row_with_surrogate_keys() -> Result<()> {
    let Some((_guard, pool)) = setup().await? else {
        return Ok(());
    };
    let ctx = ExecutionContext::new(pool.clone());
    let source = StaticSource::default().with(2023, "2023-01-01,8,12TH,MONT,42\n");

    let (staged, transformed) = pipeline::load_year(&ctx, &source, year(2023)).await?;
    assert_eq!(staged.rows, 1);
    assert_eq!(transformed.inserted_rows, 1);
    assert_eq!(transformed.excluded_rows, 0);

    let row: (i32, i32, i32, i32, i32) = sqlx::query_as(
        "SELECT date_id, hour, origin_station_id, destination_station_id, trip_count \
         FROM bart.fact_ridership",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(row, (20230101, 8, 5, 9, 42));
    Ok(())
}

#[tokio::test]
async fn reloading_a_year_replaces_rather_than_appends() -> Result<()> {
    let Some((_guard, pool)) = setup().await? else {
        return Ok(());
    };
    let ctx = ExecutionContext::new(pool.clone());
    let source = StaticSource::default().with(
        2023,
        "2023-01-01,8,12TH,MONT,42\n2023-06-30,17,MONT,EMBR,3\n",
    );

    pipeline::load_year(&ctx, &source, year(2023)).await?;
    let first_staged = staged_rows(&pool, "source.ridership_2023").await?;
    let first_fact = fact_rows(&pool, "bart.fact_ridership_2023").await?;

    pipeline::load_year(&ctx, &source, year(2023)).await?;
    let second_staged = staged_rows(&pool, "source.ridership_2023").await?;
    let second_fact = fact_rows(&pool, "bart.fact_ridership_2023").await?;

    assert_eq!(first_staged.len(), 2);
    assert_eq!(second_staged, first_staged);
    assert_eq!(
        first_fact,
        vec![(20230101, 8, 5, 9, 42), (20230630, 17, 9, 11, 3)]
    );
    assert_eq!(second_fact, first_fact);
    Ok(())
}

#[tokio::test]
async fn reloading_one_year_leaves_other_partitions_alone() -> Result<()> {
    let Some((_guard, pool)) = setup().await? else {
        return Ok(());
    };
    let ctx = ExecutionContext::new(pool.clone());
    let first = StaticSource::default()
        .with(2022, "2022-03-01,7,12TH,MONT,1\n2022-03-02,7,MONT,12TH,2\n")
        .with(2023, "2023-01-01,8,12TH,MONT,42\n");
    pipeline::load_year(&ctx, &first, year(2022)).await?;
    pipeline::load_year(&ctx, &first, year(2023)).await?;

    let second = StaticSource::default().with(
        2023,
        "2023-01-01,8,12TH,MONT,42\n2023-01-02,9,EMBR,MONT,5\n2023-01-03,10,MONT,EMBR,6\n",
    );
    pipeline::load_year(&ctx, &second, year(2023)).await?;

    assert_eq!(count(&pool, "bart.fact_ridership_2022").await?, 2);
    assert_eq!(count(&pool, "bart.fact_ridership_2023").await?, 3);
    assert_eq!(count(&pool, "source.ridership_2022").await?, 2);
    Ok(())
}

#[tokio::test]
async fn rows_with_unknown_stations_are_counted_and_excluded() -> Result<()> {
    let Some((_guard, pool)) = setup().await? else {
        return Ok(());
    };
    let sink = Arc::new(MemorySink::new());
    let ctx = ExecutionContext::with_sink(pool.clone(), sink.clone());
    let source = StaticSource::default().with(
        2023,
        "2023-01-01,8,12TH,MONT,42\n2023-01-01,9,XXXX,MONT,4\n",
    );

    let (staged, transformed) = pipeline::load_year(&ctx, &source, year(2023)).await?;
    assert_eq!(staged.rows, 2);
    assert_eq!(transformed.staged_rows, 2);
    assert_eq!(transformed.inserted_rows, 1);
    assert_eq!(transformed.excluded_rows, 1);
    assert_eq!(transformed.gaps.missing_origin, 1);
    assert_eq!(transformed.gaps.missing_destination, 0);
    assert_eq!(count(&pool, "bart.fact_ridership_2023").await?, 1);

    assert!(sink.events().iter().any(|event| matches!(
        event,
        PipelineEvent::ReferentialGap { excluded_rows: 1, .. }
    )));
    Ok(())
}

#[tokio::test]
async fn rerun_restores_a_deleted_fact_row() -> Result<()> {
    let Some((_guard, pool)) = setup().await? else {
        return Ok(());
    };
    let ctx = ExecutionContext::new(pool.clone());
    let source = StaticSource::default().with(
        2023,
        "2023-01-01,8,12TH,MONT,42\n2023-01-01,9,MONT,12TH,7\n",
    );
    pipeline::load_year(&ctx, &source, year(2023)).await?;

    sqlx::query("DELETE FROM bart.fact_ridership WHERE hour = 9")
        .execute(&pool)
        .await?;
    assert_eq!(count(&pool, "bart.fact_ridership").await?, 1);

    pipeline::load_year(&ctx, &source, year(2023)).await?;
    assert_eq!(count(&pool, "bart.fact_ridership").await?, 2);
    Ok(())
}

#[tokio::test]
async fn malformed_archive_keeps_previous_partition_contents() -> Result<()> {
    let Some((_guard, pool)) = setup().await? else {
        return Ok(());
    };
    let ctx = ExecutionContext::new(pool.clone());
    let good = StaticSource::default().with(
        2023,
        "2023-01-01,8,12TH,MONT,42\n2023-01-01,9,MONT,12TH,7\n",
    );
    pipeline::load_year(&ctx, &good, year(2023)).await?;

    let bad = StaticSource::default().with(2023, "2023-01-02,8,12TH,MONT,1\n2023-01-02,oops\n");
    let err = pipeline::load_year(&ctx, &bad, year(2023))
        .await
        .expect_err("malformed archive must fail");
    assert_eq!(err.kind(), ErrorKind::Load);

    assert_eq!(count(&pool, "source.ridership_2023").await?, 2);
    assert_eq!(count(&pool, "bart.fact_ridership_2023").await?, 2);
    Ok(())
}

#[tokio::test]
async fn multi_year_run_builds_partitions_and_consistent_aggregates() -> Result<()> {
    let Some((_guard, pool)) = setup().await? else {
        return Ok(());
    };
    let sink = Arc::new(MemorySink::new());
    let ctx = ExecutionContext::with_sink(pool.clone(), sink.clone());
    let source = StaticSource::default()
        .with(
            2021,
            "2021-05-01,8,12TH,MONT,10\n2021-05-01,8,MONT,EMBR,3\n2021-05-01,18,EMBR,12TH,1\n",
        )
        .with(2022, "2022-07-04,12,12TH,EMBR,2\n2022-07-04,13,12TH,EMBR,4\n");

    let report = pipeline::run(
        &ctx,
        &source,
        &Year::range(2021, 2022)?,
        RunOptions::default(),
    )
    .await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.refresh.status, StageStatus::Success);

    let fact_partitions: Vec<_> = admin::partition_status(&pool)
        .await?
        .into_iter()
        .filter(|status| status.table == "bart.fact_ridership")
        .collect();
    assert_eq!(fact_partitions.len(), 2);
    assert_eq!(fact_partitions[0].partition, "fact_ridership_2021");
    assert_eq!(fact_partitions[0].rows, Some(3));

    let staging_partitions: Vec<_> = admin::partition_status(&pool)
        .await?
        .into_iter()
        .filter(|status| status.table == "source.ridership")
        .collect();
    assert_eq!(staging_partitions.len(), 2);
    assert_eq!(staging_partitions[0].partition, "ridership_2021");
    assert_eq!(staging_partitions[0].rows, Some(3));
    assert_eq!(staging_partitions[1].partition, "ridership_2022");
    assert_eq!(staging_partitions[1].rows, Some(2));

    let refreshes = sink
        .events()
        .iter()
        .filter(|event| matches!(event, PipelineEvent::AggregatesPublished { .. }))
        .count();
    assert_eq!(refreshes, 1);

    let mismatched: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM (
            SELECT date_id, COUNT(*) AS cnt
            FROM bart.fact_ridership
            GROUP BY date_id
        ) fact
        FULL OUTER JOIN bart.fact_ridership_count_by_date agg USING (date_id)
        WHERE fact.cnt IS DISTINCT FROM agg.cnt
        "#,
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(mismatched, 0);

    let (origin_total, destination_total): (i64, i64) = sqlx::query_as(
        "SELECT SUM(origin_ridership_total)::bigint, SUM(destination_ridership_total)::bigint \
         FROM bart.fact_ridership_by_hour_by_station_by_date WHERE date_id = 20210501",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(origin_total, 3);
    assert_eq!(destination_total, 3);

    let (origins, destinations): (i64, i64) = sqlx::query_as(
        "SELECT origin_count, destination_count FROM bart.fact_ridership_by_station_by_date \
         WHERE date_id = 20220704 AND abbreviation = 'EMBR'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!((origins, destinations), (0, 2));
    Ok(())
}

fn sources_without_2022() -> StaticSource {
    StaticSource::default()
        .with(2021, "2021-05-01,8,12TH,MONT,10\n")
        .with(2023, "2023-01-01,8,12TH,MONT,42\n2023-01-02,9,MONT,EMBR,1\n")
}

fn statuses(report: &pipeline::RunReport) -> Vec<StageStatus> {
    report.years.iter().map(|summary| summary.status.clone()).collect()
}

#[tokio::test]
async fn failed_year_is_recorded_and_later_years_still_load() -> Result<()> {
    let Some((_guard, pool)) = setup().await? else {
        return Ok(());
    };
    let ctx = ExecutionContext::new(pool.clone());
    let source = sources_without_2022();

    let report = pipeline::run(
        &ctx,
        &source,
        &Year::range(2021, 2023)?,
        RunOptions::default(),
    )
    .await;

    assert_eq!(
        statuses(&report),
        vec![StageStatus::Success, StageStatus::Failed, StageStatus::Success]
    );
    assert_eq!(report.failed_years(), vec![year(2022)]);
    let failure = report.years[1].error.as_ref().expect("failure recorded");
    assert_eq!(failure.kind, ErrorKind::Fetch);
    assert!(!report.is_success());

    assert_eq!(report.refresh.status, StageStatus::Success);
    assert_eq!(count(&pool, "bart.fact_ridership_2023").await?, 2);
    assert_eq!(count(&pool, "bart.fact_ridership_count_by_date").await?, 3);
    Ok(())
}

#[tokio::test]
async fn fail_fast_stops_at_failed_year_and_skips_refresh() -> Result<()> {
    let Some((_guard, pool)) = setup().await? else {
        return Ok(());
    };
    let ctx = ExecutionContext::new(pool.clone());
    let source = sources_without_2022();

    let report = pipeline::run(
        &ctx,
        &source,
        &Year::range(2021, 2023)?,
        RunOptions {
            refresh: true,
            fail_fast: true,
        },
    )
    .await;

    assert_eq!(
        statuses(&report),
        vec![StageStatus::Success, StageStatus::Failed]
    );
    assert_eq!(report.refresh.status, StageStatus::Skipped);
    assert!(report.refresh.report.is_none());

    let fact_2023: Vec<_> = admin::partition_status(&pool)
        .await?
        .into_iter()
        .filter(|status| status.partition == "fact_ridership_2023")
        .collect();
    assert!(fact_2023.is_empty());

    let published: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM pg_matviews \
         WHERE schemaname = 'bart' AND matviewname = 'fact_ridership_count_by_date')",
    )
    .fetch_one(&pool)
    .await?;
    assert!(!published);
    Ok(())
}

static BROKEN: &[AggregateDefinition] = &[
    AggregateDefinition {
        name: "fact_ridership_count_by_date",
        select: "SELECT date_id, COUNT(*) AS cnt FROM bart.fact_ridership GROUP BY date_id",
        depends_on: &[],
        indexes: &[IndexDefinition {
            name: "idx_date_id_frcbd",
            columns: &["date_id"],
        }],
    },
    AggregateDefinition {
        name: "fact_ridership_unpublishable",
        select: "SELECT * FROM bart.relation_that_does_not_exist",
        depends_on: &["fact_ridership_count_by_date"],
        indexes: &[],
    },
];

#[tokio::test]
async fn failed_refresh_keeps_previous_generation_published() -> Result<()> {
    let Some((_guard, pool)) = setup().await? else {
        return Ok(());
    };
    let ctx = ExecutionContext::new(pool.clone());
    let source = StaticSource::default()
        .with(2022, "2022-03-01,7,12TH,MONT,1\n")
        .with(2023, "2023-01-01,8,12TH,MONT,42\n");

    pipeline::load_year(&ctx, &source, year(2022)).await?;
    aggregates::refresh_all(&ctx).await?;
    assert_eq!(count(&pool, "bart.fact_ridership_count_by_date").await?, 1);

    pipeline::load_year(&ctx, &source, year(2023)).await?;
    let err = aggregates::refresh_catalog(&ctx, BROKEN)
        .await
        .expect_err("refresh must fail");
    assert_eq!(err.kind(), ErrorKind::Refresh);

    assert_eq!(count(&pool, "bart.fact_ridership_count_by_date").await?, 1);
    assert_eq!(count(&pool, "bart.fact_ridership_by_station_by_date").await?, 2);

    aggregates::refresh_all(&ctx).await?;
    assert_eq!(count(&pool, "bart.fact_ridership_count_by_date").await?, 2);
    Ok(())
}
