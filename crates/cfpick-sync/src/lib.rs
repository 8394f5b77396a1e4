//! Catalog synchronization: fetch the remote problemset, then replace the local
//! catalog wholesale inside one transaction. Also hosts the env configuration
//! and the cron wiring that triggers the job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cfpick_adapters::{
    normalize_catalog, CatalogSource, CodeforcesApiSource, FetchContext, NormalizedCatalog,
    SourceError, CODEFORCES_PROBLEMSET_URL,
};
use cfpick_storage::{
    create_problem_in, link_tag_in, reset_schema_in, CatalogStore, HttpClientConfig, HttpFetcher,
    StoreError,
};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cfpick-sync";

pub const DEFAULT_DATABASE_URL: &str = "sqlite://cfpick.db";

/// 03:00 every day; six fields, seconds first.
pub const DEFAULT_SYNC_CRON: &str = "0 0 3 * * *";

/// Europe/Moscow has stayed on UTC+3 without DST since 2014.
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 3;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub catalog_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub utc_offset_hours: i32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            catalog_url: CODEFORCES_PROBLEMSET_URL.to_string(),
            user_agent: "cfpick/0.1".to_string(),
            http_timeout_secs: 60,
            scheduler_enabled: false,
            sync_cron: DEFAULT_SYNC_CRON.to_string(),
            utc_offset_hours: DEFAULT_UTC_OFFSET_HOURS,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            catalog_url: std::env::var("CFPICK_CATALOG_URL").unwrap_or(defaults.catalog_url),
            user_agent: std::env::var("CFPICK_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("CFPICK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            scheduler_enabled: std::env::var("CFPICK_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("CFPICK_SYNC_CRON").unwrap_or(defaults.sync_cron),
            utc_offset_hours: std::env::var("CFPICK_SYNC_UTC_OFFSET_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.utc_offset_hours),
        }
    }

    pub fn schedule_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .with_context(|| format!("utc offset {}h is out of range", self.utc_offset_hours))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub source_id: String,
    pub origin: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_problems: usize,
    pub inserted_problems: usize,
    pub distinct_tags: usize,
    pub skipped_incomplete: usize,
    pub skipped_duplicates: usize,
}

impl SyncReport {
    pub fn summary(&self) -> String {
        format!(
            "catalog sync {} finished: {} problems, {} tags from {} ({} incomplete, {} duplicate entries skipped) in {}ms",
            self.run_id,
            self.inserted_problems,
            self.distinct_tags,
            self.origin,
            self.skipped_incomplete,
            self.skipped_duplicates,
            (self.finished_at - self.started_at).num_milliseconds()
        )
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching catalog: {0}")]
    Source(#[from] SourceError),
    #[error("writing catalog: {0}")]
    Store(#[from] StoreError),
    #[error("remote catalog contained no usable problems; keeping the current catalog")]
    EmptyCatalog,
    #[error("a synchronization cycle is already running")]
    AlreadyRunning,
}

impl SyncError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Source(err) if err.is_timeout())
    }
}

/// What the scheduler sees: the cycle ended, one way or another.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Failed(String),
    Skipped,
}

impl SyncOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// One full-replacement ingestion per call. Cheap to clone; clones share the
/// exclusion guard, so at most one cycle runs at a time across all of them.
#[derive(Clone)]
pub struct SyncJob {
    store: CatalogStore,
    source: Arc<dyn CatalogSource>,
    running: Arc<Mutex<()>>,
}

impl SyncJob {
    pub fn new(store: CatalogStore, source: Arc<dyn CatalogSource>) -> Self {
        Self {
            store,
            source,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Builds the HTTP-backed job described by `config` on top of an open store.
    pub fn from_config(config: &SyncConfig, store: CatalogStore) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            deadline: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let source = CodeforcesApiSource::new(http, config.catalog_url.clone());
        Ok(Self::new(store, Arc::new(source)))
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    /// Runs one cycle. The remote catalog must be fetched and status-checked
    /// before anything local is touched; the reset and every insert then share
    /// one transaction, so any failure leaves the previous catalog in place.
    pub async fn run_once(&self) -> Result<SyncReport, SyncError> {
        let _running = self.running.try_lock().map_err(|_| SyncError::AlreadyRunning)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %run_id, source = self.source.source_id());
        self.run_cycle(run_id).instrument(span).await
    }

    /// [`SyncJob::run_once`] with every error logged and folded into the outcome.
    pub async fn run_logged(&self) -> SyncOutcome {
        match self.run_once().await {
            Ok(report) => {
                info!("{}", report.summary());
                SyncOutcome::Completed(report)
            }
            Err(SyncError::AlreadyRunning) => {
                warn!("catalog sync still running; skipping this trigger");
                SyncOutcome::Skipped
            }
            Err(err) => {
                error!(error = %err, timed_out = err.is_timeout(), "catalog sync failed; existing catalog kept");
                SyncOutcome::Failed(err.to_string())
            }
        }
    }

    /// Runs the cycle on its own task so the caller's executor thread is not held.
    pub fn spawn_logged(&self) -> JoinHandle<SyncOutcome> {
        let job = self.clone();
        tokio::spawn(async move { job.run_logged().await })
    }

    async fn run_cycle(&self, run_id: Uuid) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let ctx = FetchContext {
            run_id,
            fetched_at: started_at,
        };

        let fetched = self.source.fetch_catalog(&ctx).await?;

        let normalized = normalize_catalog(&fetched.result);
        if normalized.descriptors.is_empty() {
            return Err(SyncError::EmptyCatalog);
        }

        let distinct_tags = self.replace_catalog(&normalized).await?;

        Ok(SyncReport {
            run_id,
            source_id: self.source.source_id().to_string(),
            origin: fetched.origin,
            started_at,
            finished_at: Utc::now(),
            fetched_problems: fetched.result.problems.len(),
            inserted_problems: normalized.descriptors.len(),
            distinct_tags,
            skipped_incomplete: normalized.skipped_incomplete,
            skipped_duplicates: normalized.skipped_duplicates,
        })
    }

    async fn replace_catalog(&self, catalog: &NormalizedCatalog) -> Result<usize, StoreError> {
        let resolver = self.store.tag_resolver();
        let mut tx = self.store.begin().await?;
        reset_schema_in(&mut tx).await?;

        let mut tag_ids: HashMap<&str, i64> = HashMap::new();
        for descriptor in &catalog.descriptors {
            let problem = create_problem_in(&mut tx, &descriptor.problem).await?;
            for name in &descriptor.tags {
                let tag_id = match tag_ids.get(name.as_str()) {
                    Some(id) => *id,
                    None => {
                        let tag = resolver.get_or_create(&mut tx, name).await?;
                        tag_ids.insert(name.as_str(), tag.id);
                        tag.id
                    }
                };
                link_tag_in(&mut tx, problem.id, tag_id).await?;
            }
        }

        tx.commit().await?;
        Ok(tag_ids.len())
    }
}

/// Registers `job` on `cron` in the given fixed-offset zone. Each trigger runs
/// on a spawned task; overlapping triggers are skipped by the job itself.
pub async fn build_scheduler(job: SyncJob, cron: &str, offset: FixedOffset) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let scheduled = Job::new_async_tz(cron, offset, move |_uuid, _l| {
        let job = job.clone();
        Box::pin(async move {
            if let Err(err) = job.spawn_logged().await {
                error!(error = %err, "catalog sync task panicked");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(scheduled).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Scheduler for `config`, or `None` when scheduling is switched off.
pub async fn maybe_build_scheduler(config: &SyncConfig, job: SyncJob) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let offset = config.schedule_offset()?;
    info!(cron = %config.sync_cron, %offset, "catalog sync scheduled");
    build_scheduler(job, &config.sync_cron, offset).await.map(Some)
}

pub async fn run_sync_once_from_env() -> Result<SyncReport> {
    let config = SyncConfig::from_env();
    let store = CatalogStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening catalog store {}", config.database_url))?;
    let job = SyncJob::from_config(&config, store)?;
    Ok(job.run_once().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cfpick_adapters::FetchedCatalog;
    use cfpick_core::NewProblem;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Notify;

    struct StaticSource {
        body: Vec<u8>,
    }

    impl StaticSource {
        fn new(body: serde_json::Value) -> Self {
            Self {
                body: serde_json::to_vec(&body).expect("json"),
            }
        }
    }

    #[async_trait]
    impl CatalogSource for StaticSource {
        fn source_id(&self) -> &str {
            "static"
        }

        async fn fetch_catalog(&self, ctx: &FetchContext) -> Result<FetchedCatalog, SourceError> {
            FetchedCatalog::from_bytes("static", ctx.fetched_at, self.body.clone())
        }
    }

    struct GatedSource {
        entered: Arc<Notify>,
        release: Arc<Notify>,
        inner: StaticSource,
    }

    #[async_trait]
    impl CatalogSource for GatedSource {
        fn source_id(&self) -> &str {
            "gated"
        }

        async fn fetch_catalog(&self, ctx: &FetchContext) -> Result<FetchedCatalog, SourceError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.fetch_catalog(ctx).await
        }
    }

    fn two_problem_payload() -> serde_json::Value {
        json!({
            "status": "OK",
            "result": {
                "problems": [
                    {"contestId": 4, "index": "A", "name": "Watermelon", "type": "PROGRAMMING", "points": 800.0, "tags": ["dp", "greedy"]},
                    {"contestId": 4, "index": "B", "name": "Before an Exam", "type": "PROGRAMMING", "points": 1500.0, "tags": ["dp"]}
                ],
                "problemStatistics": [
                    {"contestId": 4, "index": "A", "solvedCount": 170000}
                ]
            }
        })
    }

    async fn file_store(dir: &TempDir) -> CatalogStore {
        let url = format!("sqlite://{}", dir.path().join("sync.db").display());
        CatalogStore::connect(&url).await.expect("connect")
    }

    #[tokio::test]
    async fn cycle_replaces_catalog_and_shares_tags() {
        let dir = tempdir().expect("tempdir");
        let store = file_store(&dir).await;
        store
            .create_problem(&NewProblem::new(1, "A", "Stale"))
            .await
            .expect("seed");

        let job = SyncJob::new(store.clone(), Arc::new(StaticSource::new(two_problem_payload())));
        let report = job.run_once().await.expect("sync");
        assert_eq!(report.inserted_problems, 2);
        assert_eq!(report.distinct_tags, 2);

        assert!(store.get_problem(1, "A").await.expect("get").is_none());
        let tags = store.list_tags().await.expect("tags");
        assert_eq!(tags.iter().filter(|t| t.name == "dp").count(), 1);

        let a = store.get_problem(4, "A").await.expect("get").expect("4A");
        let b = store.get_problem(4, "B").await.expect("get").expect("4B");
        assert_eq!(a.solved_count, 170_000);
        assert_eq!(b.solved_count, 0);
        let dp_id = tags.iter().find(|t| t.name == "dp").expect("dp").id;
        for problem in [&a, &b] {
            let linked = store.tags_for_problem(problem.id).await.expect("links");
            assert!(linked.iter().any(|t| t.id == dp_id));
        }
    }

    #[tokio::test]
    async fn failed_status_leaves_catalog_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = file_store(&dir).await;
        store
            .create_problem(&NewProblem::new(1, "A", "Theatre Square"))
            .await
            .expect("seed");

        let job = SyncJob::new(
            store.clone(),
            Arc::new(StaticSource::new(json!({"status": "FAILED", "comment": "Internal error"}))),
        );
        let outcome = job.run_logged().await;
        assert!(matches!(outcome, SyncOutcome::Failed(_)));

        let all = store.list_all_problems().await.expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Theatre Square");
    }

    #[tokio::test]
    async fn empty_remote_catalog_is_refused() {
        let dir = tempdir().expect("tempdir");
        let store = file_store(&dir).await;
        store
            .create_problem(&NewProblem::new(1, "A", "Theatre Square"))
            .await
            .expect("seed");

        let job = SyncJob::new(
            store.clone(),
            Arc::new(StaticSource::new(json!({
                "status": "OK",
                "result": {"problems": [], "problemStatistics": []}
            }))),
        );
        let err = job.run_once().await.expect_err("empty");
        assert!(matches!(err, SyncError::EmptyCatalog));
        assert_eq!(store.count_problems().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn overlapping_runs_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let store = file_store(&dir).await;
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let job = SyncJob::new(
            store,
            Arc::new(GatedSource {
                entered: entered.clone(),
                release: release.clone(),
                inner: StaticSource::new(two_problem_payload()),
            }),
        );

        let first = job.spawn_logged();
        entered.notified().await;
        assert!(matches!(job.run_logged().await, SyncOutcome::Skipped));

        release.notify_one();
        assert!(first.await.expect("join").is_completed());
    }

    #[test]
    fn default_schedule_is_moscow_three_am() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_cron, "0 0 3 * * *");
        assert_eq!(
            config.schedule_offset().expect("offset"),
            FixedOffset::east_opt(3 * 3600).expect("offset")
        );
    }
}
