use std::error::Error;
use std::fmt::{self, Display};

use tracing_error::{ExtractSpanTrace, SpanTrace};

/// An error together with the spans that were active where it was raised.
#[derive(Debug)]
pub struct SpannedErr<T> {
    pub err: T,
    pub span_trace: SpanTrace,
}

pub trait SpannedExt<T, E> {
    /// Captures the current span trace alongside the error.
    fn with_span_trace(self) -> Result<T, SpannedErr<E>>;
}

impl<T, E> SpannedExt<T, E> for Result<T, E> {
    fn with_span_trace(self) -> Result<T, SpannedErr<E>> {
        self.map_err(|err| SpannedErr {
            err,
            span_trace: SpanTrace::capture(),
        })
    }
}

impl<E> ExtractSpanTrace for SpannedErr<E> {
    fn span_trace(&self) -> Option<&SpanTrace> {
        Some(&self.span_trace)
    }
}

impl<T: Display> Display for SpannedErr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.err, f)
    }
}

impl<U: Error> Error for SpannedErr<U> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.err.source()
    }
}
