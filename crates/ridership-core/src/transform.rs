//! Dimensional transform: rebuilds one year's partition of
//! `bart.fact_ridership` from the staging partition and the date and station
//! dimensions.
//!
//! Staged rows whose day or station has no dimension entry are dropped by the
//! inner join rather than failing the year. The drop is counted and reported
//! through [`ReferentialGaps`] so it never goes unnoticed.

use serde::Serialize;
use sqlx::{PgConnection, Row};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::events::PipelineEvent;
use crate::schema::{self, Year, DIM_DATE, DIM_STATION, FACT_RIDERSHIP, STAGING_RIDERSHIP};

/// Staged rows of one year with no matching dimension entry. A row missing
/// several lookups is counted once per missing lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReferentialGaps {
    pub missing_date: u64,
    pub missing_origin: u64,
    pub missing_destination: u64,
}

impl ReferentialGaps {
    pub fn is_empty(&self) -> bool {
        self.missing_date == 0 && self.missing_origin == 0 && self.missing_destination == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransformReport {
    pub year: Year,
    pub staged_rows: u64,
    pub inserted_rows: u64,
    pub excluded_rows: u64,
    pub gaps: ReferentialGaps,
}

fn insert_sql(year: Year) -> String {
    format!(
        r#"
        INSERT INTO {fact} ({columns})
        SELECT
            dim_date.date_id,
            ridership.hour,
            origin.id,
            destination.id,
            ridership.trip_count
        FROM {staging} ridership
        JOIN {dim_date} dim_date
            ON ridership.day = dim_date.date
        JOIN {dim_station} origin
            ON ridership.origin = origin.abbreviation
        JOIN {dim_station} destination
            ON ridership.destination = destination.abbreviation
        WHERE ridership.day >= $1 AND ridership.day < $2
        "#,
        fact = FACT_RIDERSHIP.partition_name(year),
        columns = FACT_RIDERSHIP.column_list(),
        staging = STAGING_RIDERSHIP.qualified(),
        dim_date = DIM_DATE,
        dim_station = DIM_STATION,
    )
}

fn gap_sql() -> String {
    format!(
        r#"
        SELECT
            COUNT(*) AS staged_rows,
            COUNT(*) FILTER (WHERE dim_date.date_id IS NULL) AS missing_date,
            COUNT(*) FILTER (WHERE origin.id IS NULL) AS missing_origin,
            COUNT(*) FILTER (WHERE destination.id IS NULL) AS missing_destination
        FROM {staging} ridership
        LEFT JOIN {dim_date} dim_date
            ON ridership.day = dim_date.date
        LEFT JOIN {dim_station} origin
            ON ridership.origin = origin.abbreviation
        LEFT JOIN {dim_station} destination
            ON ridership.destination = destination.abbreviation
        WHERE ridership.day >= $1 AND ridership.day < $2
        "#,
        staging = STAGING_RIDERSHIP.qualified(),
        dim_date = DIM_DATE,
        dim_station = DIM_STATION,
    )
}

/// Rebuilds the fact partition for `year` inside a single transaction.
pub async fn transform_year(ctx: &ExecutionContext, year: Year) -> Result<TransformReport> {
    let transform_err = |source: sqlx::Error| PipelineError::Transform {
        year: year.value(),
        source,
    };

    let mut tx = ctx.pool().begin().await.map_err(transform_err)?;
    schema::apply(&mut *tx, &schema::fact_setup(year))
        .await
        .map_err(transform_err)?;

    let (staged_rows, gaps) = measure_gaps(&mut *tx, year).await.map_err(transform_err)?;

    let sql = insert_sql(year);
    debug!(%year, sql = %sql, "Populating fact partition");
    let inserted_rows = sqlx::query(&sql)
        .bind(year.first_day())
        .bind(year.next_first_day())
        .persistent(false)
        .execute(&mut *tx)
        .await
        .map_err(transform_err)?
        .rows_affected();

    tx.commit().await.map_err(transform_err)?;

    let excluded_rows = staged_rows.saturating_sub(inserted_rows);
    ctx.emit(PipelineEvent::FactPopulated {
        year,
        inserted_rows,
    });
    if excluded_rows > 0 || !gaps.is_empty() {
        ctx.emit(PipelineEvent::ReferentialGap {
            year,
            excluded_rows,
            gaps,
        });
    }

    Ok(TransformReport {
        year,
        staged_rows,
        inserted_rows,
        excluded_rows,
        gaps,
    })
}

async fn measure_gaps(conn: &mut PgConnection, year: Year) -> sqlx::Result<(u64, ReferentialGaps)> {
    let row = sqlx::query(&gap_sql())
        .bind(year.first_day())
        .bind(year.next_first_day())
        .persistent(false)
        .fetch_one(&mut *conn)
        .await?;

    let count = |column: &str| -> sqlx::Result<u64> {
        let value: i64 = row.try_get(column)?;
        Ok(value.max(0) as u64)
    };

    Ok((
        count("staged_rows")?,
        ReferentialGaps {
            missing_date: count("missing_date")?,
            missing_origin: count("missing_origin")?,
            missing_destination: count("missing_destination")?,
        },
    ))
}
