use thiserror::Error;
use tracing_error::{ExtractSpanTrace, SpanTrace};

use super::client::ResolveError;
use super::executor::CallFailure;
use super::waiter::WaitError;
use crate::error::SpannedErr;
use crate::kubernetes_objects::store::StoreError;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Wait for healthy target failed: {0}")]
    Wait(SpannedErr<WaitError>),

    #[error("Failed to get Elasticsearch client: {0}")]
    Resolve(SpannedErr<ResolveError>),

    #[error("{0}")]
    Call(SpannedErr<CallFailure>),

    #[error("Failed to mark target as complete: {0}")]
    Annotate(SpannedErr<StoreError>),
}

impl ExtractSpanTrace for JobError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            JobError::Wait(e) => e.span_trace(),
            JobError::Resolve(e) => e.span_trace(),
            JobError::Call(e) => e.span_trace(),
            JobError::Annotate(e) => e.span_trace(),
        }
    }
}
