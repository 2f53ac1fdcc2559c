use std::sync::Mutex;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::ErrorKind;
use crate::schema::Year;
use crate::transform::ReferentialGaps;

/// Structured progress and anomaly notifications emitted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    YearStarted {
        year: Year,
    },
    StagingLoaded {
        year: Year,
        rows: u64,
    },
    FactPopulated {
        year: Year,
        inserted_rows: u64,
    },
    /// Staged rows that found no matching dimension entry and were left out
    /// of the fact partition.
    ReferentialGap {
        year: Year,
        excluded_rows: u64,
        gaps: ReferentialGaps,
    },
    YearFailed {
        year: Year,
        kind: ErrorKind,
        message: String,
    },
    ShadowRefreshed {
        view: String,
    },
    AggregatesPublished {
        views: Vec<String>,
    },
    RefreshFailed {
        kind: ErrorKind,
        message: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::YearStarted { year } => {
                info!(%year, "Loading ridership year into the warehouse")
            }
            PipelineEvent::StagingLoaded { year, rows } => {
                info!(%year, rows, "Staging partition loaded")
            }
            PipelineEvent::FactPopulated {
                year,
                inserted_rows,
            } => info!(%year, inserted_rows, "Fact partition populated"),
            PipelineEvent::ReferentialGap {
                year,
                excluded_rows,
                gaps,
            } => warn!(
                %year,
                excluded_rows,
                missing_date = gaps.missing_date,
                missing_origin = gaps.missing_origin,
                missing_destination = gaps.missing_destination,
                "Staged rows without matching dimension entries were excluded"
            ),
            PipelineEvent::YearFailed {
                year,
                kind,
                message,
            } => error!(%year, ?kind, error = %message, "Year failed"),
            PipelineEvent::ShadowRefreshed { view } => info!(%view, "Shadow aggregate refreshed"),
            PipelineEvent::AggregatesPublished { views } => {
                info!(count = views.len(), "Refreshed all materialized views")
            }
            PipelineEvent::RefreshFailed { kind, message } => {
                error!(?kind, error = %message, "Aggregate refresh failed")
            }
        }
    }
}

/// Keeps events in memory, for callers that inspect a run afterwards.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: PipelineEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
