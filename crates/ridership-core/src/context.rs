use std::sync::Arc;

use crate::db::DbPool;
use crate::events::{EventSink, PipelineEvent, TracingSink};

/// Everything a pipeline stage needs from its surroundings: the warehouse
/// connection and where to report what happened. Created once per run.
#[derive(Clone)]
pub struct ExecutionContext {
    pool: DbPool,
    events: Arc<dyn EventSink>,
}

impl ExecutionContext {
    pub fn new(pool: DbPool) -> Self {
        Self::with_sink(pool, Arc::new(TracingSink))
    }

    pub fn with_sink(pool: DbPool, events: Arc<dyn EventSink>) -> Self {
        Self { pool, events }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn emit(&self, event: PipelineEvent) {
        self.events.emit(event);
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}
