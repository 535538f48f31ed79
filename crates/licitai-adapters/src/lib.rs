//! Adapters around the external collaborators of the sync pipeline: the tender listing
//! API, the browser-automation extraction capability and the hosted scoring model.
//!
//! Retry, backoff, timeout and cancellation policy live here, outside the collaborators,
//! so every policy can be exercised with scripted fakes.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

pub mod extract;
pub mod score;
pub mod source;

pub use extract::{
    BrowserlessBackend, DeepExtractor, ExtractionBackend, ExtractionSession, ExtractorConfig,
};
pub use score::{
    BusinessProfile, GeminiScorer, ScorerConfig, ScoringAdapter, ScoringBackend, ScoringRequest,
};
pub use source::{
    ConnectorConfig, FixtureSource, MercadoPublicoApi, PageCursor, PolledPage, SourceApi,
    SourceConnector, SourceError, SourcePage, SummaryPages, SyncWindow,
};

pub const CRATE_NAME: &str = "licitai-adapters";

/// Sending half of a run-level cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Cooperative cancellation observed by every in-flight worker of a run.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if the handle is dropped first.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Result of driving a retried external call.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome<T, E> {
    Succeeded { value: T, attempts: u32 },
    Failed { error: E, attempts: u32 },
    /// The run was cancelled; the in-flight call (if any) was abandoned.
    Cancelled { attempts: u32 },
    /// The ledger refused to charge the next attempt; nothing further was called.
    Abandoned { attempts: u32 },
}

impl<T, E> AttemptOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            AttemptOutcome::Succeeded { attempts, .. }
            | AttemptOutcome::Failed { attempts, .. }
            | AttemptOutcome::Cancelled { attempts }
            | AttemptOutcome::Abandoned { attempts } => *attempts,
        }
    }
}

/// Durable accounting for retried calls. Each attempt is charged before it starts, so an
/// attempt lost to a crash or a cancellation still counts against the caller's cap.
#[async_trait]
pub trait AttemptLedger: Send + Sync {
    /// Charges attempt number `attempt`. Returning `false` abandons the work before the call.
    async fn charge(&self, attempt: u32) -> bool;
}

/// Calls `attempt` up to `budget` times, charging `ledger` before each call. After a
/// failure, `retry_delay` decides whether the error is retryable and how long to wait;
/// `None` ends the loop with that error. Cancellation is observed both during a call
/// and during the backoff sleep.
pub(crate) async fn run_attempts<T, E, F, Fut, D>(
    budget: u32,
    cancel: &CancelToken,
    ledger: &dyn AttemptLedger,
    mut attempt: F,
    mut retry_delay: D,
) -> AttemptOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    D: FnMut(&E, u32) -> Option<Duration>,
{
    let budget = budget.max(1);
    let mut attempts = 0u32;
    loop {
        if cancel.is_cancelled() {
            return AttemptOutcome::Cancelled { attempts };
        }
        if !ledger.charge(attempts + 1).await {
            return AttemptOutcome::Abandoned { attempts };
        }
        attempts += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return AttemptOutcome::Cancelled { attempts },
            result = attempt(attempts) => result,
        };
        let error = match result {
            Ok(value) => return AttemptOutcome::Succeeded { value, attempts },
            Err(error) => error,
        };
        let delay = if attempts < budget {
            retry_delay(&error, attempts)
        } else {
            None
        };
        let Some(delay) = delay else {
            return AttemptOutcome::Failed { error, attempts };
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return AttemptOutcome::Cancelled { attempts },
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Ledger that charges every attempt.
    pub(crate) struct Unmetered;

    #[async_trait]
    impl AttemptLedger for Unmetered {
        async fn charge(&self, _attempt: u32) -> bool {
            true
        }
    }

    /// Ledger that allows `limit` charges and remembers every attempt number it saw.
    struct Capped {
        limit: u32,
        seen: std::sync::Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl AttemptLedger for Capped {
        async fn charge(&self, attempt: u32) -> bool {
            self.seen.lock().unwrap().push(attempt);
            attempt <= self.limit
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_stop_at_budget() {
        let calls = AtomicU32::new(0);
        let outcome: AttemptOutcome<(), &str> = run_attempts(
            3,
            &CancelToken::never(),
            &Unmetered,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            },
            |_, _| Some(Duration::from_secs(1)),
        )
        .await;
        assert_eq!(outcome, AttemptOutcome::Failed { error: "boom", attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        let outcome: AttemptOutcome<(), &str> = run_attempts(
            5,
            &CancelToken::never(),
            &Unmetered,
            |_| async { Err("gone") },
            |_, _| None,
        )
        .await;
        assert_eq!(outcome.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_in_flight_call() {
        let (handle, token) = cancellation();
        let worker = tokio::spawn(async move {
            run_attempts::<(), &str, _, _, _>(
                3,
                &token,
                &Unmetered,
                |_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                },
                |_, _| None,
            )
            .await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        let outcome = worker.await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Cancelled { attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn refused_charge_stops_before_the_call() {
        let calls = AtomicU32::new(0);
        let ledger = Capped {
            limit: 2,
            seen: std::sync::Mutex::new(Vec::new()),
        };
        let outcome: AttemptOutcome<(), &str> = run_attempts(
            5,
            &CancelToken::never(),
            &ledger,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("busy") }
            },
            |_, _| Some(Duration::from_secs(1)),
        )
        .await;
        assert_eq!(outcome, AttemptOutcome::Abandoned { attempts: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*ledger.seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn never_token_is_not_cancelled() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        let (handle, token) = cancellation();
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(handle.token().is_cancelled());
    }
}
