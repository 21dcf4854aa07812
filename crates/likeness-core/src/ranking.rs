//! Similarity ranking over the active embedding space.
//!
//! Euclidean distance is the only score computed. Similarity mode reports
//! `1 / (1 + d)`, which lies in (0, 1], equals 1 exactly at d = 0 and falls
//! strictly as distance grows. The order is computed once on the raw
//! distance and only then mapped to scores, so both metrics rank the pool
//! identically. Sorting is stable, so equal scores keep the pool's
//! insertion order.

use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{FaceId, FaceRecord, FaceStore, StoreError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RankError {
    #[error("face {0} has no active embedding")]
    NoActiveEmbedding(FaceId),
    #[error("face {other} is in space {actual:?}, query {query} is in {expected:?}")]
    SpaceMismatch {
        query: FaceId,
        other: FaceId,
        expected: String,
        actual: String,
    },
    #[error("query {query} has {expected}-dim embedding, face {other} has {actual}")]
    DimensionMismatch {
        query: FaceId,
        other: FaceId,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown metric {0:?}, expected \"distance\" or \"similarity\"")]
pub struct ParseMetricError(String);

/// Scoring mode for a ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Euclidean distance, ascending. Lower is more similar.
    #[default]
    Distance,
    /// `1 / (1 + distance)`, descending. Higher is more similar.
    Similarity,
}

impl Metric {
    /// Convert a Euclidean distance into this metric's score.
    pub fn score(self, distance: f32) -> f32 {
        match self {
            Metric::Distance => distance,
            Metric::Similarity => 1.0 / (1.0 + distance),
        }
    }

    /// Score of a face compared with itself.
    pub fn best(self) -> f32 {
        self.score(0.0)
    }
}

impl FromStr for Metric {
    type Err = ParseMetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "distance" => Ok(Metric::Distance),
            "similarity" => Ok(Metric::Similarity),
            _ => Err(ParseMetricError(s.to_string())),
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Metric::Distance => "distance",
            Metric::Similarity => "similarity",
        })
    }
}

/// Euclidean distance over two vectors of equal length, `None` otherwise.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f32>()
            .sqrt(),
    )
}

/// Ascending distance. NaN sorts after every number whatever its sign bit.
fn by_distance(a: f32, b: f32) -> Ordering {
    a.is_nan().cmp(&b.is_nan()).then_with(|| a.total_cmp(&b))
}

/// A pool member with its score against the query.
#[derive(Debug, Clone, Copy)]
pub struct Ranked<'a> {
    pub record: &'a FaceRecord,
    pub score: f32,
}

impl Ranked<'_> {
    pub fn id(&self) -> FaceId {
        self.record.id()
    }
}

/// Rank every face of `pool` against `query`, best first.
///
/// Reads active embeddings only. The query is not excluded if it is part
/// of the pool.
pub fn rank<'a, I>(
    query: &FaceRecord,
    pool: I,
    metric: Metric,
) -> Result<Vec<Ranked<'a>>, RankError>
where
    I: IntoIterator<Item = &'a FaceRecord>,
{
    let query_id = query.id();
    let space = query.active_space().ok_or(RankError::NoActiveEmbedding(query_id))?;
    let q = query
        .active_embedding()
        .ok_or(RankError::NoActiveEmbedding(query_id))?;

    let mut distances = Vec::new();
    for record in pool {
        let other = record.id();
        let p = record
            .active_embedding()
            .ok_or(RankError::NoActiveEmbedding(other))?;
        if record.active_space() != Some(space) {
            return Err(RankError::SpaceMismatch {
                query: query_id,
                other,
                expected: space.to_string(),
                actual: record.active_space().unwrap_or_default().to_string(),
            });
        }

        let distance = euclidean_distance(q, p).ok_or(RankError::DimensionMismatch {
            query: query_id,
            other,
            expected: q.len(),
            actual: p.len(),
        })?;
        distances.push((record, distance));
    }

    distances.sort_by(|a, b| by_distance(a.1, b.1));
    Ok(distances
        .into_iter()
        .map(|(record, distance)| Ranked {
            record,
            score: metric.score(distance),
        })
        .collect())
}

/// Rank every stored face against the face `query`.
pub fn rank_store(
    store: &FaceStore,
    query: FaceId,
    metric: Metric,
) -> Result<Vec<Ranked<'_>>, RankError> {
    let query = store.get(query)?;
    rank(query, store.faces(), metric)
}
