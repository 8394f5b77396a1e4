//! Read-side access to the catalog for the conversational front-end.

use cfpick_core::{Problem, RangeQuery, Tag, DEFAULT_SAMPLE_LIMIT};
use cfpick_storage::{problem_from_row, CatalogStore, StoreResult, PROBLEM_COLUMNS};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

pub const CRATE_NAME: &str = "cfpick-query";

/// Each call borrows one pooled connection for its own duration, so sessions
/// never wait on each other and read the last committed catalog even while a
/// sync transaction is open.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    store: CatalogStore,
}

impl QueryEngine {
    pub fn new(store: CatalogStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub async fn get_by_key(&self, contest_id: i64, index: &str) -> StoreResult<Option<Problem>> {
        self.store.get_problem(contest_id, index).await
    }

    pub async fn list_all(&self) -> StoreResult<Vec<Problem>> {
        self.store.list_all_problems().await
    }

    pub async fn list_tags(&self) -> StoreResult<Vec<Tag>> {
        self.store.list_tags().await
    }

    /// Problems carrying `tag`; unknown tags yield an empty list.
    pub async fn list_by_tag(&self, tag: &str) -> StoreResult<Vec<Problem>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PROBLEM_COLUMNS}
              FROM problems p
              JOIN problem_tags pt ON pt.problem_id = p.id
              JOIN tags t ON t.id = pt.tag_id
             WHERE t.name = ?
             ORDER BY p.id
            "#
        ))
        .bind(tag)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows
            .iter()
            .map(problem_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Up to `limit` random problems tagged `tag` whose points lie in
    /// `[min_points, max_points]` (or `>= min_points` without an upper bound).
    pub async fn sample_by_tag_and_range(
        &self,
        tag: &str,
        min_points: f64,
        max_points: Option<f64>,
        limit: usize,
    ) -> StoreResult<Vec<Problem>> {
        self.sample(&RangeQuery::new(tag, min_points, max_points).with_limit(limit))
            .await
    }

    pub async fn sample(&self, query: &RangeQuery) -> StoreResult<Vec<Problem>> {
        let candidates = self.range_candidates(query).await?;
        let mut rng = rand::rng();
        Ok(pick_random(candidates, query.limit, &mut rng))
    }

    /// [`QueryEngine::sample`] with caller-provided randomness.
    pub async fn sample_with_rng<R>(&self, query: &RangeQuery, rng: &mut R) -> StoreResult<Vec<Problem>>
    where
        R: Rng + Send + ?Sized,
    {
        let candidates = self.range_candidates(query).await?;
        Ok(pick_random(candidates, query.limit, rng))
    }

    /// Every match of the tag and window, in id order. Null points never match.
    async fn range_candidates(&self, query: &RangeQuery) -> StoreResult<Vec<Problem>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PROBLEM_COLUMNS}
              FROM problems p
              JOIN problem_tags pt ON pt.problem_id = p.id
              JOIN tags t ON t.id = pt.tag_id
             WHERE t.name = ?
               AND p.points IS NOT NULL
               AND p.points >= ?
               AND (? IS NULL OR p.points <= ?)
             ORDER BY p.id
            "#
        ))
        .bind(query.tag.as_str())
        .bind(query.min_points)
        .bind(query.max_points)
        .bind(query.max_points)
        .fetch_all(self.store.pool())
        .await?;

        let mut candidates = rows
            .iter()
            .map(problem_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // The window check in `RangeQuery` is the source of truth.
        candidates.retain(|p| query.admits(p.points));
        debug!(tag = %query.tag, candidates = candidates.len(), limit = query.limit, "range candidates");
        Ok(candidates)
    }
}

/// Sample size as accepted from untrusted callers: zero falls back to the
/// default and anything above `max` is clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeLimit(pub usize);

impl RangeLimit {
    pub fn clamp(requested: Option<usize>, max: usize) -> Self {
        match requested {
            Some(0) | None => Self::default(),
            Some(n) => Self(n.min(max.max(1))),
        }
    }
}

impl Default for RangeLimit {
    fn default() -> Self {
        Self(DEFAULT_SAMPLE_LIMIT)
    }
}

/// Uniform shuffle over the whole filtered set, then truncation, so low ids are
/// not favoured.
fn pick_random<R: Rng + ?Sized>(mut candidates: Vec<Problem>, limit: usize, rng: &mut R) -> Vec<Problem> {
    candidates.shuffle(rng);
    candidates.truncate(limit);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfpick_core::NewProblem;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;
    use tempfile::{tempdir, TempDir};

    async fn engine() -> (TempDir, QueryEngine) {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("query.db").display());
        let store = CatalogStore::connect(&url).await.expect("connect");
        (dir, QueryEngine::new(store))
    }

    async fn seed(engine: &QueryEngine, contest_id: i64, index: &str, points: Option<f64>, tags: &[&str]) {
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        engine
            .store()
            .ingest_problem(
                &NewProblem::new(contest_id, index, format!("Problem {contest_id}{index}")).with_points(points),
                &tags,
            )
            .await
            .expect("seed");
    }

    fn keys(problems: &[Problem]) -> BTreeSet<String> {
        problems.iter().map(|p| p.key().to_string()).collect()
    }

    #[tokio::test]
    async fn window_picks_only_the_easy_dp_problem() {
        let (_dir, engine) = engine().await;
        seed(&engine, 4, "A", Some(800.0), &["dp", "greedy"]).await;
        seed(&engine, 4, "B", Some(1500.0), &["dp"]).await;

        let picked = engine
            .sample_by_tag_and_range("dp", 500.0, Some(1000.0), 10)
            .await
            .expect("sample");
        assert_eq!(picked.len(), 1);
        assert_eq!((picked[0].contest_id, picked[0].index.as_str()), (4, "A"));
    }

    #[tokio::test]
    async fn null_and_out_of_range_points_never_match() {
        let (_dir, engine) = engine().await;
        seed(&engine, 1, "A", None, &["math"]).await;
        seed(&engine, 1, "B", Some(499.0), &["math"]).await;
        seed(&engine, 1, "C", Some(500.0), &["math"]).await;
        seed(&engine, 1, "D", Some(1000.0), &["math"]).await;
        seed(&engine, 1, "E", Some(1000.5), &["math"]).await;

        let closed = engine
            .sample_by_tag_and_range("math", 500.0, Some(1000.0), 10)
            .await
            .expect("closed");
        assert_eq!(keys(&closed), BTreeSet::from(["1C".to_string(), "1D".to_string()]));

        let open = engine
            .sample_by_tag_and_range("math", 500.0, None, 10)
            .await
            .expect("open");
        assert_eq!(open.len(), 3);
        assert!(open.iter().all(|p| p.points.is_some_and(|pts| pts >= 500.0)));
    }

    #[tokio::test]
    async fn limit_caps_result_and_zero_means_nothing() {
        let (_dir, engine) = engine().await;
        for i in 0..12 {
            seed(&engine, 100 + i, "A", Some(1200.0), &["graphs"]).await;
        }
        let picked = engine
            .sample_by_tag_and_range("graphs", 0.0, None, 5)
            .await
            .expect("sample");
        assert_eq!(picked.len(), 5);
        assert_eq!(keys(&picked).len(), 5);

        let none = engine
            .sample_by_tag_and_range("graphs", 0.0, None, 0)
            .await
            .expect("sample");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn seeded_sampling_is_reproducible() {
        let (_dir, engine) = engine().await;
        for i in 0..20 {
            seed(&engine, 200 + i, "A", Some(1600.0), &["dp"]).await;
        }
        let query = RangeQuery::new("dp", 1000.0, Some(2000.0)).with_limit(4);

        let first = engine
            .sample_with_rng(&query, &mut StdRng::seed_from_u64(7))
            .await
            .expect("first");
        let second = engine
            .sample_with_rng(&query, &mut StdRng::seed_from_u64(7))
            .await
            .expect("second");
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    #[tokio::test]
    async fn unseeded_sampling_varies() {
        let (_dir, engine) = engine().await;
        for i in 0..30 {
            seed(&engine, 300 + i, "A", Some(1100.0), &["implementation"]).await;
        }
        let mut distinct = BTreeSet::new();
        for _ in 0..20 {
            let picked = engine
                .sample_by_tag_and_range("implementation", 1000.0, Some(1200.0), 3)
                .await
                .expect("sample");
            distinct.insert(keys(&picked).into_iter().collect::<Vec<_>>());
        }
        assert!(distinct.len() > 1);
    }

    #[tokio::test]
    async fn unknown_tag_yields_empty_lists() {
        let (_dir, engine) = engine().await;
        seed(&engine, 5, "A", Some(900.0), &["strings"]).await;

        assert!(engine.list_by_tag("geometry").await.expect("list").is_empty());
        assert!(engine
            .sample_by_tag_and_range("geometry", 0.0, None, 10)
            .await
            .expect("sample")
            .is_empty());
        assert_eq!(engine.list_by_tag("strings").await.expect("list").len(), 1);
        assert_eq!(engine.list_all().await.expect("all").len(), 1);
        assert!(engine.get_by_key(5, "B").await.expect("key").is_none());
    }

    #[test]
    fn range_limit_clamps_untrusted_input() {
        assert_eq!(RangeLimit::clamp(None, 50), RangeLimit(DEFAULT_SAMPLE_LIMIT));
        assert_eq!(RangeLimit::clamp(Some(0), 50), RangeLimit(DEFAULT_SAMPLE_LIMIT));
        assert_eq!(RangeLimit::clamp(Some(3), 50), RangeLimit(3));
        assert_eq!(RangeLimit::clamp(Some(500), 50), RangeLimit(50));
    }
}
