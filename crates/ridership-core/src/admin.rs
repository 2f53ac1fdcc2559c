//! Administrative operations that sit outside the load path.

use serde::Serialize;
use sqlx::Row;
use tracing::{debug, info};

use crate::aggregates::{self, RefreshPlan, CATALOG};
use crate::db::DbPool;
use crate::error::Result;
use crate::schema::{Ddl, PartitionedTable, Year, FACT_RIDERSHIP, STAGING_RIDERSHIP};

/// Every statement [`teardown`] executes, in order: aggregates (dependents
/// first, published and shadow), then the fact and staging tables with all
/// their partitions.
pub fn teardown_statements() -> Result<Vec<String>> {
    let plan = RefreshPlan::new(CATALOG)?;
    let mut statements: Vec<String> = plan
        .swap_order()
        .flat_map(aggregates::drop_statements)
        .collect();
    statements.push(Ddl::DropTable(FACT_RIDERSHIP.qualified()).to_string());
    statements.push(Ddl::DropTable(STAGING_RIDERSHIP.qualified()).to_string());
    Ok(statements)
}

/// Drops the aggregates, the fact relation and the staging relation in one
/// transaction. The dimensions are left alone.
pub async fn teardown(pool: &DbPool) -> Result<Vec<String>> {
    let statements = teardown_statements()?;
    let mut tx = pool.begin().await?;
    for statement in &statements {
        info!(sql = %statement, "Teardown");
        sqlx::raw_sql(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(statements)
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
    pub table: String,
    pub partition: String,
    pub year: Option<Year>,
    pub rows: Option<i64>,
}

/// Lists the partitions of the staging and fact tables with their row
/// counts. Partitions that do not follow the yearly naming scheme are listed
/// without a count.
pub async fn partition_status(pool: &DbPool) -> Result<Vec<PartitionStatus>> {
    let mut statuses = Vec::new();
    for table in [&STAGING_RIDERSHIP, &FACT_RIDERSHIP] {
        statuses.extend(table_partitions(pool, table).await?);
    }
    Ok(statuses)
}

async fn table_partitions(
    pool: &DbPool,
    table: &'static PartitionedTable,
) -> Result<Vec<PartitionStatus>> {
    let rows = sqlx::query(
        r#"
            SELECT child.relname::text AS partition
            FROM pg_inherits
            JOIN pg_class parent ON parent.oid = pg_inherits.inhparent
            JOIN pg_class child ON child.oid = pg_inherits.inhrelid
            JOIN pg_namespace ns ON ns.oid = parent.relnamespace
            WHERE ns.nspname = $1 AND parent.relname = $2
            ORDER BY child.relname
        "#,
    )
    .bind(table.schema)
    .bind(table.name)
    .fetch_all(pool)
    .await?;

    let mut statuses = Vec::with_capacity(rows.len());
    for row in rows {
        let partition: String = row.try_get("partition")?;
        let year = table.partition_year(&partition);
        let count = match year {
            Some(year) => {
                let sql = format!("SELECT COUNT(*) FROM {}", table.partition_name(year));
                debug!(sql = %sql, "Counting partition rows");
                let count: i64 = sqlx::query_scalar(&sql)
                    .persistent(false)
                    .fetch_one(pool)
                    .await?;
                Some(count)
            }
            None => None,
        };
        statuses.push(PartitionStatus {
            table: table.qualified().to_string(),
            partition,
            year,
            rows: count,
        });
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_passes_every_statement_explicitly_and_drops_dependents_first() {
        let statements = teardown_statements().expect("statements");

        let combined = statements
            .iter()
            .position(|s| s.ends_with("bart.fact_ridership_by_hour_by_station_by_date"))
            .expect("combined aggregate dropped");
        let origin = statements
            .iter()
            .position(|s| s.ends_with("bart.fact_ridership_by_hour_by_origin_station_by_date"))
            .expect("origin aggregate dropped");
        assert!(combined < origin);

        let n = statements.len();
        assert_eq!(statements[n - 2], "DROP TABLE IF EXISTS bart.fact_ridership");
        assert_eq!(statements[n - 1], "DROP TABLE IF EXISTS source.ridership");
        assert!(statements.iter().all(|s| !s.trim().is_empty()));
        assert!(!statements.iter().any(|s| s.contains("dim_")));
    }
}
