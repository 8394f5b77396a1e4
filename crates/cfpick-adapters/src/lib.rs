//! Remote catalog sources: the Codeforces `problemset.problems` payload, its
//! decoding into insertable descriptors, and the HTTP / snapshot-file sources
//! that produce it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use cfpick_core::{NewProblem, ProblemKey, UNKNOWN_CATEGORY};
use cfpick_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cfpick-adapters";

pub const CODEFORCES_PROBLEMSET_URL: &str = "https://codeforces.com/api/problemset.problems";

/// Envelope returned by every Codeforces API method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: String,
    #[serde(default)]
    pub comment: Option<String>,
    pub result: Option<T>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemsetResult {
    pub problems: Vec<RemoteProblem>,
    #[serde(default)]
    pub problem_statistics: Vec<RemoteProblemStatistics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProblem {
    /// Absent for a handful of problemset entries that belong to no contest.
    #[serde(default)]
    pub contest_id: Option<i64>,
    pub index: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub points: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProblemStatistics {
    #[serde(default)]
    pub contest_id: Option<i64>,
    pub index: String,
    pub solved_count: i64,
}

/// One problem ready for insertion, with its tag set already deduplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct ProblemDescriptor {
    pub problem: NewProblem,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedCatalog {
    pub descriptors: Vec<ProblemDescriptor>,
    pub skipped_incomplete: usize,
    pub skipped_duplicates: usize,
}

/// Folds the statistics into the problem list. Entries without a contest id are
/// dropped, a repeated `(contestId, index)` keeps its first occurrence, tag order
/// and multiplicity are discarded.
pub fn normalize_catalog(result: &ProblemsetResult) -> NormalizedCatalog {
    let solved: HashMap<ProblemKey, i64> = result
        .problem_statistics
        .iter()
        .filter_map(|s| {
            s.contest_id
                .map(|contest_id| (ProblemKey::new(contest_id, s.index.clone()), s.solved_count))
        })
        .collect();

    let mut seen = HashSet::with_capacity(result.problems.len());
    let mut out = NormalizedCatalog::default();

    for remote in &result.problems {
        let Some(contest_id) = remote.contest_id else {
            out.skipped_incomplete += 1;
            continue;
        };
        let key = ProblemKey::new(contest_id, remote.index.clone());
        if !seen.insert(key.clone()) {
            debug!(problem = %key, "duplicate problem key in payload");
            out.skipped_duplicates += 1;
            continue;
        }

        let problem = NewProblem::new(contest_id, remote.index.clone(), remote.name.clone())
            .with_category(remote.kind.as_deref().unwrap_or(UNKNOWN_CATEGORY))
            .with_points(remote.points)
            .with_solved_count(solved.get(&key).copied().unwrap_or(0));
        let tags = remote
            .tags
            .iter()
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .collect();

        out.descriptors.push(ProblemDescriptor { problem, tags });
    }

    out
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed catalog payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("catalog api returned status {status}: {}", .comment.as_deref().unwrap_or("no comment"))]
    Status {
        status: String,
        comment: Option<String>,
    },
    #[error("catalog api reported OK without a result")]
    MissingResult,
    #[error("reading catalog snapshot {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SourceError {
    /// The fetch ran into its deadline; such failures are not retried.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Fetch(err) if err.is_timeout())
    }
}

/// Decodes a raw payload and applies the application-level status check.
pub fn parse_problemset(bytes: &[u8]) -> Result<ProblemsetResult, SourceError> {
    let envelope: ApiEnvelope<ProblemsetResult> = serde_json::from_slice(bytes)?;
    if envelope.status != "OK" {
        return Err(SourceError::Status {
            status: envelope.status,
            comment: envelope.comment,
        });
    }
    envelope.result.ok_or(SourceError::MissingResult)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl FetchContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedCatalog {
    pub origin: String,
    pub fetched_at: DateTime<Utc>,
    pub raw: Vec<u8>,
    pub result: ProblemsetResult,
}

impl FetchedCatalog {
    pub fn from_bytes(origin: impl Into<String>, fetched_at: DateTime<Utc>, raw: Vec<u8>) -> Result<Self, SourceError> {
        let result = parse_problemset(&raw)?;
        Ok(Self {
            origin: origin.into(),
            fetched_at,
            raw,
            result,
        })
    }
}

/// Anything that can hand the sync job a full, status-checked catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_catalog(&self, ctx: &FetchContext) -> Result<FetchedCatalog, SourceError>;
}

pub struct CodeforcesApiSource {
    http: HttpFetcher,
    url: String,
}

impl CodeforcesApiSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CatalogSource for CodeforcesApiSource {
    fn source_id(&self) -> &str {
        "codeforces-api"
    }

    async fn fetch_catalog(&self, ctx: &FetchContext) -> Result<FetchedCatalog, SourceError> {
        let response = self.http.fetch_bytes(ctx.run_id, &self.url).await?;
        debug!(bytes = response.body.len(), url = %response.final_url, "catalog payload received");
        FetchedCatalog::from_bytes(response.final_url, ctx.fetched_at, response.body)
    }
}

/// Replays a saved payload file instead of calling the API.
pub struct SnapshotFileSource {
    path: PathBuf,
}

impl SnapshotFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CatalogSource for SnapshotFileSource {
    fn source_id(&self) -> &str {
        "snapshot-file"
    }

    async fn fetch_catalog(&self, ctx: &FetchContext) -> Result<FetchedCatalog, SourceError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|source| SourceError::Io {
            path: self.path.clone(),
            source,
        })?;
        FetchedCatalog::from_bytes(self.path.display().to_string(), ctx.fetched_at, raw)
    }
}
