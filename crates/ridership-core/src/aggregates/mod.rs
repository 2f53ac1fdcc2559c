//! Aggregate view manager.
//!
//! Every aggregate is rebuilt beside its published relation under a `_tmp`
//! name, refreshed there, and only then swapped in. All swaps run in one
//! transaction, so a reader sees either the complete previous generation or
//! the complete new one. A failed refresh stops the run before any published
//! aggregate is touched.

mod catalog;

pub use catalog::{AggregateDefinition, IndexDefinition, RefreshPlan, CATALOG, SHADOW_SUFFIX};

use serde::Serialize;
use sqlx::PgConnection;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::events::PipelineEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub published: Vec<String>,
}

/// Statements that create the empty shadow of `definition` and its indexes.
pub fn shadow_statements(definition: &AggregateDefinition) -> Vec<String> {
    let mut statements = vec![format!(
        "CREATE MATERIALIZED VIEW IF NOT EXISTS {} AS {} WITH NO DATA",
        definition.shadow(),
        definition.select.trim()
    )];
    for index in definition.indexes {
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {}{} ON {} ({})",
            index.name,
            SHADOW_SUFFIX,
            definition.shadow(),
            index.columns.join(", ")
        ));
    }
    statements
}

pub fn refresh_statement(definition: &AggregateDefinition) -> String {
    format!("REFRESH MATERIALIZED VIEW {}", definition.shadow())
}

/// Statements that retire the published relation and move the refreshed
/// shadow, indexes included, into its place.
pub fn swap_statements(definition: &AggregateDefinition) -> Vec<String> {
    let mut statements = vec![
        format!("DROP MATERIALIZED VIEW IF EXISTS {}", definition.published()),
        format!(
            "ALTER MATERIALIZED VIEW {} RENAME TO {}",
            definition.shadow(),
            definition.name
        ),
    ];
    for index in definition.indexes {
        statements.push(format!(
            "ALTER INDEX bart.{}{} RENAME TO {}",
            index.name, SHADOW_SUFFIX, index.name
        ));
    }
    statements
}

/// Statements that remove both the published relation and its shadow.
pub fn drop_statements(definition: &AggregateDefinition) -> Vec<String> {
    vec![
        format!("DROP MATERIALIZED VIEW IF EXISTS {}", definition.published()),
        format!("DROP MATERIALIZED VIEW IF EXISTS {}", definition.shadow()),
    ]
}

async fn run(conn: &mut PgConnection, sql: &str) -> sqlx::Result<()> {
    debug!(sql = %sql, "Executing aggregate statement");
    sqlx::raw_sql(sql).execute(&mut *conn).await?;
    Ok(())
}

/// Rebuilds and publishes every aggregate in [`CATALOG`].
pub async fn refresh_all(ctx: &ExecutionContext) -> Result<RefreshReport> {
    refresh_catalog(ctx, CATALOG).await
}

pub async fn refresh_catalog(
    ctx: &ExecutionContext,
    catalog: &'static [AggregateDefinition],
) -> Result<RefreshReport> {
    let plan = RefreshPlan::new(catalog)?;
    let mut conn = ctx.pool().acquire().await?;

    for definition in plan.refresh_order() {
        let refresh_err = |source: sqlx::Error| PipelineError::Refresh {
            view: definition.shadow(),
            source,
        };
        for statement in shadow_statements(definition) {
            run(&mut *conn, &statement).await.map_err(refresh_err)?;
        }
    }

    for definition in plan.refresh_order() {
        run(&mut *conn, &refresh_statement(definition))
            .await
            .map_err(|source| PipelineError::Refresh {
                view: definition.shadow(),
                source,
            })?;
        ctx.emit(PipelineEvent::ShadowRefreshed {
            view: definition.shadow(),
        });
    }

    let published = publish(&mut *conn, &plan)
        .await
        .map_err(|source| PipelineError::Publish { source })?;

    ctx.emit(PipelineEvent::AggregatesPublished {
        views: published.clone(),
    });
    Ok(RefreshReport { published })
}

async fn publish(conn: &mut PgConnection, plan: &RefreshPlan) -> sqlx::Result<Vec<String>> {
    let mut tx = sqlx::Connection::begin(&mut *conn).await?;
    let mut published = Vec::new();
    for definition in plan.swap_order() {
        for statement in swap_statements(definition) {
            run(&mut *tx, &statement).await?;
        }
        published.push(definition.published());
    }
    tx.commit().await?;
    published.reverse();
    Ok(published)
}
