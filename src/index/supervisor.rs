//! Single-flight supervisor for background index builds.
//!
//! State machine: `Idle -> Building -> (Idle | Failed)`. The transition into
//! `Building` is a compare-and-set on the watch channel, so two concurrent
//! triggers can never both start a build.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use super::builder::{BuildReport, IndexBuilder};
use super::IndexHandle;
use crate::config::DeletionPolicy;
use crate::error::{Error, Result};

/// Kind of build an admin can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildKind {
    Update,
    Rebuild,
}

impl std::fmt::Display for BuildKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildKind::Update => write!(f, "update"),
            BuildKind::Rebuild => write!(f, "rebuild"),
        }
    }
}

/// Current supervisor state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildState {
    #[default]
    Idle,
    Building {
        job_id: String,
        kind: BuildKind,
        started_at: DateTime<Utc>,
    },
    Failed {
        job_id: String,
        kind: BuildKind,
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl BuildState {
    pub fn is_building(&self) -> bool {
        matches!(self, BuildState::Building { .. })
    }
}

/// A successfully finished build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedBuild {
    pub job_id: String,
    pub kind: BuildKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report: BuildReport,
}

/// State plus the last successful build, as published on the watch channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BuildStatus {
    #[serde(flatten)]
    pub state: BuildState,
    pub last_build: Option<CompletedBuild>,
}

/// Receipt for an accepted build request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTicket {
    pub job_id: String,
    pub kind: BuildKind,
}

/// Runs at most one build at a time and publishes its result.
pub struct BuildSupervisor {
    builder: IndexBuilder,
    handle: Arc<IndexHandle>,
    directory: PathBuf,
    policy: DeletionPolicy,
    status: watch::Sender<BuildStatus>,
}

impl BuildSupervisor {
    pub fn new(
        builder: IndexBuilder,
        handle: Arc<IndexHandle>,
        directory: impl Into<PathBuf>,
        policy: DeletionPolicy,
    ) -> Self {
        let (status, _) = watch::channel(BuildStatus::default());
        Self {
            builder,
            handle,
            directory: directory.into(),
            policy,
            status,
        }
    }

    pub fn builder(&self) -> &IndexBuilder {
        &self.builder
    }

    pub fn status(&self) -> BuildStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BuildStatus> {
        self.status.subscribe()
    }

    /// Start a build in the background. Fails with `BuildInProgress` while
    /// another build runs; the request is not queued.
    pub fn trigger(self: &Arc<Self>, kind: BuildKind) -> Result<BuildTicket> {
        let (ticket, started_at) = self.claim(kind)?;
        let this = Arc::clone(self);
        let job = ticket.clone();
        tokio::spawn(async move {
            // Outcome is recorded in the status channel.
            let _ = this.execute(job, started_at).await;
        });
        Ok(ticket)
    }

    /// Run a build on the current task and wait for it.
    pub async fn run(&self, kind: BuildKind) -> Result<BuildReport> {
        let (ticket, started_at) = self.claim(kind)?;
        self.execute(ticket, started_at).await
    }

    /// Wait until no build is running.
    pub async fn wait_idle(&self) -> BuildStatus {
        let mut rx = self.subscribe();
        let status = match rx.wait_for(|s| !s.state.is_building()).await {
            Ok(status) => status.clone(),
            // Unreachable while `self` holds the sender.
            Err(_) => self.status(),
        };
        status
    }

    fn claim(&self, kind: BuildKind) -> Result<(BuildTicket, DateTime<Utc>)> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let mut running = None;
        self.status.send_if_modified(|status| {
            if let BuildState::Building { job_id, .. } = &status.state {
                running = Some(job_id.clone());
                return false;
            }
            status.state = BuildState::Building {
                job_id: job_id.clone(),
                kind,
                started_at,
            };
            true
        });
        if let Some(job_id) = running {
            metrics::counter!("index_build_rejected_total").increment(1);
            return Err(Error::BuildInProgress { job_id });
        }
        info!(%job_id, %kind, "Index build started");
        Ok((BuildTicket { job_id, kind }, started_at))
    }

    async fn execute(&self, ticket: BuildTicket, started_at: DateTime<Utc>) -> Result<BuildReport> {
        // A panicking adapter must still release the build slot.
        let outcome = match AssertUnwindSafe(self.build_and_publish(ticket.kind))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => Err(Error::Internal(format!(
                "index build panicked: {}",
                panic_message(&*payload)
            ))),
        };
        let finished_at = Utc::now();
        let elapsed = (finished_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let kind_label = ticket.kind.to_string();

        match &outcome {
            Ok(report) => {
                info!(
                    job_id = %ticket.job_id,
                    kind = %ticket.kind,
                    listings = report.listing_count,
                    fetched = report.fetched,
                    "Index build finished"
                );
                metrics::counter!("index_builds_total", "kind" => kind_label.clone(), "outcome" => "success")
                    .increment(1);
                metrics::histogram!("index_build_duration_seconds", "kind" => kind_label).record(elapsed);
                let completed = CompletedBuild {
                    job_id: ticket.job_id,
                    kind: ticket.kind,
                    started_at,
                    finished_at,
                    report: report.clone(),
                };
                self.status.send_modify(|status| {
                    status.state = BuildState::Idle;
                    status.last_build = Some(completed);
                });
            }
            Err(e) => {
                error!(job_id = %ticket.job_id, kind = %ticket.kind, "Index build failed: {}", e);
                metrics::counter!("index_builds_total", "kind" => kind_label, "outcome" => "failure")
                    .increment(1);
                let failed = BuildState::Failed {
                    job_id: ticket.job_id,
                    kind: ticket.kind,
                    error: e.to_string(),
                    failed_at: finished_at,
                };
                self.status.send_modify(|status| status.state = failed);
            }
        }
        outcome
    }

    async fn build_and_publish(&self, kind: BuildKind) -> Result<BuildReport> {
        let (snapshot, report) = match kind {
            BuildKind::Rebuild => self.builder.rebuild().await?,
            BuildKind::Update => {
                let current = self.handle.try_current().await;
                self.builder.update(current.as_deref(), self.policy).await?
            }
        };

        let snapshot = Arc::new(snapshot);
        let to_save = Arc::clone(&snapshot);
        let directory = self.directory.clone();
        tokio::task::spawn_blocking(move || to_save.save(&directory))
            .await
            .map_err(|e| Error::Internal(format!("snapshot save task failed: {}", e)))??;

        let snapshot = Arc::try_unwrap(snapshot).unwrap_or_else(|shared| (*shared).clone());
        self.handle.publish(snapshot).await;
        metrics::gauge!("index_listings").set(report.listing_count as f64);
        Ok(report)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::model::fixtures::listing;
    use crate::source::InMemorySource;
    use std::time::Duration;

    fn supervisor(source: Arc<InMemorySource>, dir: &std::path::Path) -> Arc<BuildSupervisor> {
        let builder = IndexBuilder::new(source, Arc::new(HashEmbedder::new(16)), 8);
        Arc::new(BuildSupervisor::new(
            builder,
            Arc::new(IndexHandle::empty()),
            dir,
            DeletionPolicy::Retain,
        ))
    }

    #[tokio::test]
    async fn test_run_publishes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(InMemorySource::with_listings(vec![listing("a", "A", "")]));
        let sup = supervisor(source, dir.path());

        let report = sup.run(BuildKind::Rebuild).await.unwrap();
        assert_eq!(report.listing_count, 1);
        assert!(sup.handle.is_ready().await);
        assert!(crate::index::IndexSnapshot::exists(dir.path()));

        let status = sup.status();
        assert_eq!(status.state, BuildState::Idle);
        assert_eq!(status.last_build.unwrap().kind, BuildKind::Rebuild);
    }

    #[tokio::test]
    async fn test_second_trigger_while_building_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(
            InMemorySource::with_listings(vec![listing("a", "A", "")])
                .with_delay(Duration::from_millis(200)),
        );
        let sup = supervisor(source.clone(), dir.path());

        let ticket = sup.trigger(BuildKind::Rebuild).unwrap();
        let err = sup.trigger(BuildKind::Update).unwrap_err();
        match err {
            Error::BuildInProgress { job_id } => assert_eq!(job_id, ticket.job_id),
            other => panic!("unexpected error: {:?}", other),
        }

        let status = sup.wait_idle().await;
        assert_eq!(status.state, BuildState::Idle);
        assert_eq!(source.fetch_count(), 1, "only one build may run");
    }

    #[tokio::test]
    async fn test_failed_build_keeps_serving_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(InMemorySource::with_listings(vec![listing("a", "Villa", "")]));
        let sup = supervisor(source.clone(), dir.path());
        sup.run(BuildKind::Rebuild).await.unwrap();
        let before = sup.handle.current().await.unwrap();

        source.set_failing(true).await;
        assert!(sup.run(BuildKind::Rebuild).await.is_err());

        let after = sup.handle.current().await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(matches!(sup.status().state, BuildState::Failed { .. }));
        assert!(sup.status().last_build.is_some());

        // A failed build does not block the next one.
        source.set_failing(false).await;
        assert!(sup.run(BuildKind::Update).await.is_ok());
    }

    struct PanickingEmbedder;

    #[async_trait::async_trait]
    impl crate::embedding::EmbeddingProvider for PanickingEmbedder {
        fn model_id(&self) -> &str {
            "panicking"
        }

        fn dimension(&self) -> usize {
            16
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<crate::Embedding>> {
            panic!("embedding backend crashed");
        }
    }

    #[tokio::test]
    async fn test_panicking_build_releases_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(InMemorySource::with_listings(vec![listing("a", "A", "")]));
        let builder = IndexBuilder::new(source, Arc::new(PanickingEmbedder), 8);
        let sup = Arc::new(BuildSupervisor::new(
            builder,
            Arc::new(IndexHandle::empty()),
            dir.path(),
            DeletionPolicy::Retain,
        ));

        let first = sup.trigger(BuildKind::Rebuild).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), sup.wait_idle())
            .await
            .unwrap();
        match status.state {
            BuildState::Failed { job_id, error, .. } => {
                assert_eq!(job_id, first.job_id);
                assert!(error.contains("embedding backend crashed"), "{}", error);
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert!(!sup.handle.is_ready().await);

        let second = sup.trigger(BuildKind::Rebuild).unwrap();
        assert_ne!(second.job_id, first.job_id);
        sup.wait_idle().await;
        assert!(sup.run(BuildKind::Rebuild).await.is_err());
    }

    #[test]
    fn test_status_serializes_with_state_tag() {
        let status = BuildStatus::default();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "idle");
        assert!(json["last_build"].is_null());
    }
}
