//! Core domain model for cfpick: catalog records, range queries and the
//! topic/difficulty selection dialogue.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cfpick-core";

/// Number of problems handed back by a range query when the caller does not ask
/// for a specific amount.
pub const DEFAULT_SAMPLE_LIMIT: usize = 10;

/// Category stored when the remote descriptor carries no `type`.
pub const UNKNOWN_CATEGORY: &str = "unknown";

/// Natural key of a problem: contest id plus the in-contest index (`A`, `B`, `C1`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemKey {
    pub contest_id: i64,
    pub index: String,
}

impl ProblemKey {
    pub fn new(contest_id: i64, index: impl Into<String>) -> Self {
        Self {
            contest_id,
            index: index.into(),
        }
    }
}

impl fmt::Display for ProblemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.contest_id, self.index)
    }
}

/// Persisted problem row as read back from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: i64,
    pub contest_id: i64,
    pub index: String,
    pub name: String,
    pub category: String,
    pub points: Option<f64>,
    pub solved_count: i64,
}

impl Problem {
    pub fn key(&self) -> ProblemKey {
        ProblemKey::new(self.contest_id, self.index.clone())
    }

    /// Public problemset URL for this problem.
    pub fn url(&self) -> String {
        format!(
            "https://codeforces.com/problemset/problem/{}/{}",
            self.contest_id, self.index
        )
    }
}

/// Insert payload for a problem; the surrogate id is assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProblem {
    pub contest_id: i64,
    pub index: String,
    pub name: String,
    pub category: String,
    pub points: Option<f64>,
    #[serde(default)]
    pub solved_count: i64,
}

impl NewProblem {
    pub fn new(contest_id: i64, index: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            contest_id,
            index: index.into(),
            name: name.into(),
            category: UNKNOWN_CATEGORY.to_string(),
            points: None,
            solved_count: 0,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_points(mut self, points: Option<f64>) -> Self {
        self.points = points;
        self
    }

    pub fn with_solved_count(mut self, solved_count: i64) -> Self {
        self.solved_count = solved_count;
        self
    }

    pub fn key(&self) -> ProblemKey {
        ProblemKey::new(self.contest_id, self.index.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
}

/// Tag-plus-difficulty-window request driven by the conversational front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeQuery {
    pub tag: String,
    pub min_points: f64,
    pub max_points: Option<f64>,
    pub limit: usize,
}

impl RangeQuery {
    pub fn new(tag: impl Into<String>, min_points: f64, max_points: Option<f64>) -> Self {
        Self {
            tag: tag.into(),
            min_points,
            max_points,
            limit: DEFAULT_SAMPLE_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Whether `points` falls inside the window. Absent points never match.
    pub fn admits(&self, points: Option<f64>) -> bool {
        match points {
            Some(p) => p >= self.min_points && self.max_points.map_or(true, |max| p <= max),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SelectionError {
    #[error("difficulty `{0}` is not a number")]
    MalformedDifficulty(String),
    #[error("maximum difficulty {max} is below minimum {min}")]
    InvertedRange { min: f64, max: f64 },
    #[error("topic must not be empty")]
    EmptyTopic,
    #[error("expected {expected}, dialogue is {actual}")]
    OutOfOrder {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Parses a caller-supplied difficulty value such as `"800"` or `"1500.0"`.
pub fn parse_difficulty(raw: &str) -> Result<f64, SelectionError> {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(SelectionError::MalformedDifficulty(trimmed.to_string())),
    }
}

/// Where a selection dialogue currently stands, with the context gathered so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SelectionState {
    AwaitingTopic,
    AwaitingMin { topic: String },
    AwaitingMax { topic: String, min_points: f64 },
}

impl SelectionState {
    fn label(&self) -> &'static str {
        match self {
            Self::AwaitingTopic => "awaiting topic",
            Self::AwaitingMin { .. } => "awaiting minimum difficulty",
            Self::AwaitingMax { .. } => "awaiting maximum difficulty",
        }
    }
}

/// One per chat session. The front-end feeds user choices in; the final step
/// yields the [`RangeQuery`] to run and rewinds to [`SelectionState::AwaitingTopic`].
/// A rejected step never changes the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionFlow {
    state: SelectionState,
    limit: usize,
}

impl Default for SelectionFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionFlow {
    pub fn new() -> Self {
        Self {
            state: SelectionState::AwaitingTopic,
            limit: DEFAULT_SAMPLE_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn state(&self) -> &SelectionState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state = SelectionState::AwaitingTopic;
    }

    /// Topics may be chosen again at any point; doing so restarts the dialogue.
    pub fn choose_topic(&mut self, topic: &str) -> Result<(), SelectionError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(SelectionError::EmptyTopic);
        }
        self.state = SelectionState::AwaitingMin {
            topic: topic.to_string(),
        };
        Ok(())
    }

    pub fn choose_min(&mut self, raw: &str) -> Result<(), SelectionError> {
        let SelectionState::AwaitingMin { topic } = &self.state else {
            return Err(self.out_of_order("minimum difficulty"));
        };
        let min_points = parse_difficulty(raw)?;
        self.state = SelectionState::AwaitingMax {
            topic: topic.clone(),
            min_points,
        };
        Ok(())
    }

    pub fn choose_max(&mut self, raw: &str) -> Result<RangeQuery, SelectionError> {
        let SelectionState::AwaitingMax { topic, min_points } = &self.state else {
            return Err(self.out_of_order("maximum difficulty"));
        };
        let max_points = parse_difficulty(raw)?;
        if max_points < *min_points {
            return Err(SelectionError::InvertedRange {
                min: *min_points,
                max: max_points,
            });
        }
        let query = RangeQuery::new(topic.clone(), *min_points, Some(max_points)).with_limit(self.limit);
        self.state = SelectionState::AwaitingTopic;
        Ok(query)
    }

    /// Final step when the user declines an upper bound: the window stays open.
    pub fn finish_without_max(&mut self) -> Result<RangeQuery, SelectionError> {
        let SelectionState::AwaitingMax { topic, min_points } = &self.state else {
            return Err(self.out_of_order("maximum difficulty"));
        };
        let query = RangeQuery::new(topic.clone(), *min_points, None).with_limit(self.limit);
        self.state = SelectionState::AwaitingTopic;
        Ok(query)
    }

    fn out_of_order(&self, expected: &'static str) -> SelectionError {
        SelectionError::OutOfOrder {
            expected,
            actual: self.state.label(),
        }
    }
}
