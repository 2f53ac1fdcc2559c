use serde::Serialize;
use tracing::info;

use crate::aggregates::{self, RefreshReport};
use crate::context::ExecutionContext;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::events::PipelineEvent;
use crate::schema::Year;
use crate::source::RidershipSource;
use crate::staging::{self, StagingReport};
use crate::transform::{self, TransformReport};

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Rebuild the aggregates after the last year.
    pub refresh: bool,
    /// Stop at the first year that fails instead of moving on to the next.
    pub fail_fast: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            refresh: true,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for StageFailure {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct YearSummary {
    pub year: Year,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging: Option<StagingReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RefreshReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageFailure>,
}

impl RefreshSummary {
    fn skipped() -> Self {
        Self {
            status: StageStatus::Skipped,
            report: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub years: Vec<YearSummary>,
    pub refresh: RefreshSummary,
}

impl RunReport {
    pub fn failed_years(&self) -> Vec<Year> {
        self.years
            .iter()
            .filter(|summary| summary.status == StageStatus::Failed)
            .map(|summary| summary.year)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed_years().is_empty() && self.refresh.status != StageStatus::Failed
    }
}

/// Stages then transforms one year. Stops at the first failing stage.
pub async fn load_year(
    ctx: &ExecutionContext,
    source: &dyn RidershipSource,
    year: Year,
) -> Result<(StagingReport, TransformReport)> {
    ctx.emit(PipelineEvent::YearStarted { year });
    let staged = staging::load_year(ctx, source, year).await?;
    let transformed = transform::transform_year(ctx, year).await?;
    Ok((staged, transformed))
}

/// Loads every year in order, then refreshes the aggregates once.
///
/// A failing year is recorded and the remaining years are still attempted.
/// The refresh runs even after failures, reflecting whatever the fact
/// relation holds at that point. With `fail_fast` the run halts at the first
/// failed year and skips the refresh.
pub async fn run(
    ctx: &ExecutionContext,
    source: &dyn RidershipSource,
    years: &[Year],
    options: RunOptions,
) -> RunReport {
    let mut summaries = Vec::with_capacity(years.len());
    let mut halted = false;

    for &year in years {
        match load_year(ctx, source, year).await {
            Ok((staged, transformed)) => summaries.push(YearSummary {
                year,
                status: StageStatus::Success,
                staging: Some(staged),
                transform: Some(transformed),
                error: None,
            }),
            Err(err) => {
                ctx.emit(PipelineEvent::YearFailed {
                    year,
                    kind: err.kind(),
                    message: err.to_string(),
                });
                summaries.push(YearSummary {
                    year,
                    status: StageStatus::Failed,
                    staging: None,
                    transform: None,
                    error: Some(StageFailure::from(&err)),
                });
                if options.fail_fast {
                    info!(%year, "Stopping after failed year");
                    halted = true;
                    break;
                }
            }
        }
    }

    let refresh_summary = if options.refresh && !halted {
        refresh(ctx).await
    } else {
        RefreshSummary::skipped()
    };

    RunReport {
        years: summaries,
        refresh: refresh_summary,
    }
}

/// Runs the aggregate view manager and folds its outcome into a summary.
pub async fn refresh(ctx: &ExecutionContext) -> RefreshSummary {
    match aggregates::refresh_all(ctx).await {
        Ok(report) => RefreshSummary {
            status: StageStatus::Success,
            report: Some(report),
            error: None,
        },
        Err(err) => {
            ctx.emit(PipelineEvent::RefreshFailed {
                kind: err.kind(),
                message: err.to_string(),
            });
            RefreshSummary {
                status: StageStatus::Failed,
                report: None,
                error: Some(StageFailure::from(&err)),
            }
        }
    }
}
