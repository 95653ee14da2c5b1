//! Explicit operation context passed to every long-running call.

use std::future::Future;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use outpost_core::{Error, Result};

/// Database handle, cancellation signal and logging span for one operation.
///
/// Cloning is cheap. Derived contexts made with [`OpContext::child`] are
/// cancelled with their parent but can also be cancelled on their own.
#[derive(Clone, Debug)]
pub struct OpContext {
    pool: PgPool,
    cancel: CancellationToken,
    span: Span,
}

impl OpContext {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cancel: CancellationToken::new(),
            span: Span::current(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// A context sharing the pool whose token is a child of this one.
    pub fn child(&self, span: Span) -> Self {
        Self {
            pool: self.pool.clone(),
            cancel: self.cancel.child_token(),
            span,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Drive `fut` inside this context's span, returning
    /// [`Error::Cancelled`] as soon as the token fires. The future is dropped
    /// on cancellation, which aborts HTTP requests and rolls back open
    /// transactions.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = fut.instrument(self.span.clone()) => result,
        }
    }
}
