#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **drylab-reactor** – The reactor contract and its driving loop.
//!
//! A [`Reactor`] is a long-lived subscriber: it declares a [`HeaderPattern`]
//! of interest, transforms matched rows via [`Reactor::handle`], and the
//! rest is handled by [`ReactorTask`] — subscribing to a run, filtering,
//! dispatching, and republishing outputs into the same run.

use std::sync::Arc;

use async_trait::async_trait;
use drylab_ledger::{Ledger, LedgerError};
use drylab_types::{Blob, EventRow, HeaderPattern, PublishRequest, RejectReason, SchemaId};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Errors that can terminate a [`ReactorTask`].
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// The ledger itself failed (storage error or corruption on read).
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    /// The reactor's own `handle` implementation failed.
    #[error("handler failed: {0}")]
    Handler(String),
    /// An output produced by `handle` was rejected by the ledger — this
    /// indicates a bug in the reactor's own business logic, not a
    /// transient condition.
    #[error("output rejected by the ledger: schema {schema}, reason {reason:?}")]
    RejectedOutput {
        /// The schema the rejected output was published under.
        schema: SchemaId,
        /// Why the ledger rejected it.
        reason: RejectReason,
    },
}

/// A single-purpose subscriber that reacts to a filtered subset of a run's
/// events and emits new events in response.
///
/// Implementors declare their interest via [`Reactor::pattern`] and their
/// logic via [`Reactor::handle`]; everything else — subscribing, matching,
/// dispatching, republishing — is handled uniformly by [`ReactorTask`].
#[async_trait]
pub trait Reactor: Send + Sync {
    /// The header pattern this reactor is interested in. Evaluated once per
    /// row; a non-matching row is skipped without invoking `handle`.
    fn pattern(&self) -> HeaderPattern;

    /// Transform one matched row into zero or more `(schema, blob)` outputs.
    ///
    /// Returning `Err` terminates the owning [`ReactorTask`] without
    /// publishing any of this call's outputs; it does not affect other
    /// reactors or the ledger itself.
    async fn handle(&self, row: &EventRow) -> Result<Vec<(SchemaId, Blob)>, ReactorError>;
}

/// Drives one [`Reactor`] against one run: subscribes, matches, dispatches,
/// republishes, and reports activity.
///
/// Mirrors the shape of an executor wrapping a unit of business logic —
/// the reactor owns *what* to do with a row, the task owns the mechanics of
/// getting rows to it and outputs back out.
pub struct ReactorTask {
    reactor: Arc<dyn Reactor>,
    ledger: Ledger,
    run_id: String,
    activity: Option<Arc<Notify>>,
}

impl ReactorTask {
    /// Bind `reactor` to `run_id` on `ledger`.
    pub fn new(reactor: Arc<dyn Reactor>, ledger: Ledger, run_id: impl Into<String>) -> Self {
        Self {
            reactor,
            ledger,
            run_id: run_id.into(),
            activity: None,
        }
    }

    /// Report activity (a completed handler call, or stream drain) on
    /// `activity`, so a pipeline watchdog can observe liveness across all
    /// of its reactors.
    pub fn with_activity_signal(mut self, activity: Arc<Notify>) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Run until the subscription goes idle or a handler/ledger error
    /// terminates the task.
    ///
    /// Processes events strictly in `seq` order; each publish completes
    /// before the next handler call begins.
    pub async fn run(mut self) -> Result<(), ReactorError> {
        let pattern = self.reactor.pattern();
        let mut sub = self.ledger.subscribe(self.run_id.clone(), 0);

        loop {
            match sub.recv().await {
                Some(Ok(row)) => {
                    if !pattern.matches(&row.header) {
                        continue;
                    }

                    debug!(run_id = %self.run_id, seq = row.seq, schema = %row.header.schema, "dispatching to handler");
                    let outputs = self.reactor.handle(&row).await?;

                    for (schema, blob) in outputs {
                        let outcome = self
                            .ledger
                            .publish(PublishRequest::new(self.run_id.clone(), schema.clone(), blob))
                            .await?;
                        if let drylab_types::PublishOutcome::Rejected(reason) = outcome {
                            return Err(ReactorError::RejectedOutput { schema, reason });
                        }
                    }

                    self.report_activity();
                }
                Some(Err(err)) => return Err(ReactorError::Ledger(err)),
                None => {
                    info!(run_id = %self.run_id, "subscription drained, reactor finished");
                    self.report_activity();
                    return Ok(());
                }
            }
        }
    }

    fn report_activity(&self) {
        if let Some(activity) = &self.activity {
            activity.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drylab_schema::SchemaRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo {
        pattern: HeaderPattern,
        out_schema: SchemaId,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Reactor for Echo {
        fn pattern(&self) -> HeaderPattern {
            self.pattern.clone()
        }

        async fn handle(&self, row: &EventRow) -> Result<Vec<(SchemaId, Blob)>, ReactorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![(self.out_schema.clone(), row.blob.clone())])
        }
    }

    struct Failing;

    #[async_trait]
    impl Reactor for Failing {
        fn pattern(&self) -> HeaderPattern {
            HeaderPattern::default()
        }

        async fn handle(&self, _row: &EventRow) -> Result<Vec<(SchemaId, Blob)>, ReactorError> {
            Err(ReactorError::Handler("always fails".to_string()))
        }
    }

    async fn test_ledger() -> (Ledger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("IN.v1.json"), r#"{}"#).unwrap();
        std::fs::write(dir.path().join("OUT.v1.json"), r#"{}"#).unwrap();
        let registry = SchemaRegistry::new(dir.path());
        let ledger = Ledger::open_in_memory_with_idle_timeout(registry, Duration::from_millis(150))
            .await
            .unwrap();
        (ledger, dir)
    }

    #[tokio::test]
    async fn matching_row_is_dispatched_and_output_published() {
        let (ledger, _dir) = test_ledger().await;
        ledger
            .publish(PublishRequest::new("r1", "IN@1", b"hello".to_vec()))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let reactor = Arc::new(Echo {
            pattern: HeaderPattern::for_schema("IN@1"),
            out_schema: "OUT@1".to_string(),
            calls: calls.clone(),
        });

        let task = ReactorTask::new(reactor, ledger.clone(), "r1");
        task.run().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let rows = ledger.replay("r1", 0).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].header.schema, "OUT@1");
    }

    #[tokio::test]
    async fn non_matching_row_is_skipped() {
        let (ledger, _dir) = test_ledger().await;
        ledger
            .publish(PublishRequest::new("r1", "OUT@1", b"ignored".to_vec()))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let reactor = Arc::new(Echo {
            pattern: HeaderPattern::for_schema("IN@1"),
            out_schema: "OUT@1".to_string(),
            calls: calls.clone(),
        });

        ReactorTask::new(reactor, ledger, "r1").run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_error_terminates_the_task() {
        let (ledger, _dir) = test_ledger().await;
        ledger
            .publish(PublishRequest::new("r1", "IN@1", b"hello".to_vec()))
            .await
            .unwrap();

        let task = ReactorTask::new(Arc::new(Failing), ledger, "r1");
        let err = task.run().await.unwrap_err();
        assert!(matches!(err, ReactorError::Handler(_)));
    }

    #[tokio::test]
    async fn activity_signal_fires_on_drain() {
        let (ledger, _dir) = test_ledger().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let reactor = Arc::new(Echo {
            pattern: HeaderPattern::default(),
            out_schema: "OUT@1".to_string(),
            calls,
        });
        let activity = Arc::new(Notify::new());
        let task = ReactorTask::new(reactor, ledger, "r1").with_activity_signal(activity.clone());

        tokio::select! {
            result = task.run() => { result.unwrap(); }
            _ = activity.notified() => {}
        }
    }
}
