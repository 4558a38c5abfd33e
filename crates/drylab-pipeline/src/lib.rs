#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **drylab-pipeline** – Composes a [`Ledger`] and its reactors into a
//! self-terminating runtime.
//!
//! Reactors are spawned as independent tasks sharing one activity signal.
//! An optional watchdog cancels every reactor once that signal has gone
//! quiet for `idle_timeout`; without one, the pipeline simply waits for
//! every reactor's own subscription to drain.

use std::sync::Arc;
use std::time::Duration;

use drylab_ledger::{idle_timeout_from_env, Ledger, LedgerError};
use drylab_reactor::{Reactor, ReactorError, ReactorTask};
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info};

/// Errors that can cause [`Pipeline::run_forever`] to return early.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A reactor lost the ledger itself (storage failure or corruption).
    /// Since every reactor shares the same ledger, this is fatal to the
    /// whole pipeline rather than isolated to one reactor.
    #[error("ledger failure, pipeline shut down: {0}")]
    Ledger(#[from] LedgerError),
}

/// Composes one [`Ledger`] and N [`Reactor`]s into a runtime that
/// terminates either when every reactor drains naturally, or when an
/// optional idle watchdog decides the system has gone quiet.
pub struct Pipeline {
    ledger: Ledger,
    idle_timeout: Option<Duration>,
    activity: Arc<Notify>,
    tasks: Vec<(String, JoinHandle<Result<(), ReactorError>>)>,
}

impl Pipeline {
    /// Start an empty pipeline over `ledger` with no watchdog — it will run
    /// until every added reactor's subscription drains on its own.
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            idle_timeout: None,
            activity: Arc::new(Notify::new()),
            tasks: Vec::new(),
        }
    }

    /// Start an empty pipeline with the watchdog timeout read from
    /// `IDLE_TIMEOUT_MS` (see [`idle_timeout_from_env`]).
    pub fn from_env(ledger: Ledger) -> Self {
        Self::new(ledger).with_idle_timeout(idle_timeout_from_env())
    }

    /// Arm the idle watchdog: if no reactor reports activity for
    /// `idle_timeout`, every reactor task is cancelled and `run_forever`
    /// returns.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    /// Bind `reactor` to `run_id` on this pipeline's ledger and schedule it
    /// as an independent concurrent task.
    pub fn add(&mut self, reactor: Arc<dyn Reactor>, run_id: impl Into<String>) {
        let run_id = run_id.into();
        let task = ReactorTask::new(reactor, self.ledger.clone(), run_id.clone())
            .with_activity_signal(self.activity.clone());
        let handle = tokio::spawn(task.run());
        info!(run_id = %run_id, "reactor added to pipeline");
        self.tasks.push((run_id, handle));
    }

    /// Supervise every reactor task plus the watchdog (if armed) until the
    /// pipeline terminates.
    pub async fn run_forever(self) -> Result<(), PipelineError> {
        let Pipeline {
            ledger: _ledger,
            idle_timeout,
            activity,
            tasks,
        } = self;

        let abort_handles: Vec<AbortHandle> =
            tasks.iter().map(|(_, handle)| handle.abort_handle()).collect();

        let watchdog = idle_timeout.map(|timeout| {
            let activity = activity.clone();
            let abort_handles = abort_handles.clone();
            tokio::spawn(async move {
                loop {
                    match tokio::time::timeout(timeout, activity.notified()).await {
                        Ok(()) => continue,
                        Err(_) => {
                            info!(?timeout, "pipeline idle, shutting down");
                            for handle in &abort_handles {
                                handle.abort();
                            }
                            return;
                        }
                    }
                }
            })
        });

        let mut storage_lost: Option<LedgerError> = None;

        for (run_id, handle) in tasks {
            match handle.await {
                Ok(Ok(())) => debug!(run_id = %run_id, "reactor finished"),
                Ok(Err(ReactorError::Ledger(err))) => {
                    error!(run_id = %run_id, error = %err, "ledger failure, shutting down pipeline");
                    for handle in &abort_handles {
                        handle.abort();
                    }
                    storage_lost.get_or_insert(err);
                }
                Ok(Err(err)) => error!(run_id = %run_id, error = %err, "reactor failed"),
                Err(join_err) if join_err.is_cancelled() => {
                    debug!(run_id = %run_id, "reactor cancelled by watchdog")
                }
                Err(join_err) => error!(run_id = %run_id, error = %join_err, "reactor task panicked"),
            }
        }

        if let Some(watchdog) = watchdog {
            let _ = watchdog.await;
        }

        match storage_lost {
            Some(err) => Err(PipelineError::from(err)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use drylab_schema::SchemaRegistry;
    use drylab_types::{Blob, EventRow, HeaderPattern, PublishRequest, SchemaId};

    struct Forward {
        pattern: HeaderPattern,
        out_schema: SchemaId,
    }

    #[async_trait]
    impl Reactor for Forward {
        fn pattern(&self) -> HeaderPattern {
            self.pattern.clone()
        }

        async fn handle(&self, row: &EventRow) -> Result<Vec<(SchemaId, Blob)>, ReactorError> {
            Ok(vec![(self.out_schema.clone(), row.blob.clone())])
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Reactor for AlwaysFails {
        fn pattern(&self) -> HeaderPattern {
            HeaderPattern::default()
        }

        async fn handle(&self, _row: &EventRow) -> Result<Vec<(SchemaId, Blob)>, ReactorError> {
            Err(ReactorError::Handler("boom".to_string()))
        }
    }

    async fn test_ledger() -> (Ledger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        for name in ["IN.v1.json", "MID.v1.json", "OUT.v1.json"] {
            std::fs::write(dir.path().join(name), r#"{}"#).unwrap();
        }
        let registry = SchemaRegistry::new(dir.path());
        let ledger = Ledger::open_in_memory_with_idle_timeout(registry, Duration::from_millis(150))
            .await
            .unwrap();
        (ledger, dir)
    }

    #[tokio::test]
    async fn idle_pipeline_with_no_reactors_shuts_down_promptly() {
        let (ledger, _dir) = test_ledger().await;
        let pipeline = Pipeline::new(ledger).with_idle_timeout(Duration::from_millis(100));

        let started = tokio::time::Instant::now();
        pipeline.run_forever().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn fan_out_dag_runs_to_completion_in_seq_order() {
        let (ledger, _dir) = test_ledger().await;
        let mut pipeline = Pipeline::new(ledger.clone()).with_idle_timeout(Duration::from_millis(200));

        pipeline.add(
            Arc::new(Forward {
                pattern: HeaderPattern::for_schema("IN@1"),
                out_schema: "MID@1".to_string(),
            }),
            "r1",
        );
        pipeline.add(
            Arc::new(Forward {
                pattern: HeaderPattern::for_schema("MID@1"),
                out_schema: "OUT@1".to_string(),
            }),
            "r1",
        );

        ledger
            .publish(PublishRequest::new("r1", "IN@1", b"seed".to_vec()))
            .await
            .unwrap();

        pipeline.run_forever().await.unwrap();

        let rows = ledger.replay("r1", 0).await.unwrap();
        let schemas: Vec<&str> = rows.iter().map(|r| r.header.schema.as_str()).collect();
        assert_eq!(schemas, vec!["IN@1", "MID@1", "OUT@1"]);
    }

    #[tokio::test]
    async fn one_reactor_failing_does_not_abort_its_siblings() {
        let (ledger, _dir) = test_ledger().await;
        let mut pipeline = Pipeline::new(ledger.clone()).with_idle_timeout(Duration::from_millis(200));

        pipeline.add(Arc::new(AlwaysFails), "r1");
        pipeline.add(
            Arc::new(Forward {
                pattern: HeaderPattern::for_schema("IN@1"),
                out_schema: "OUT@1".to_string(),
            }),
            "r1",
        );

        ledger
            .publish(PublishRequest::new("r1", "IN@1", b"seed".to_vec()))
            .await
            .unwrap();

        pipeline.run_forever().await.unwrap();

        let rows = ledger.replay("r1", 0).await.unwrap();
        assert!(rows.iter().any(|r| r.header.schema == "OUT@1"));
    }
}
