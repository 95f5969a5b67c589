//! Cosine similarity and top-k ranking over the in-memory catalog.
//!
//! The dot product uses 8-wide `wide` lanes when the `simd` feature is on and
//! falls back to scalar math otherwise. Ranking is a full linear scan.

use std::cmp::Ordering;

#[cfg(feature = "simd")]
use wide::f32x8;

/// Dot product of two equally sized f32 slices.
#[cfg(feature = "simd")]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vectors must have same length");

    let len = a.len().min(b.len());
    let chunks = len / 8;

    let mut sum = f32x8::ZERO;
    for i in 0..chunks {
        let offset = i * 8;
        let mut a_lane = [0.0_f32; 8];
        let mut b_lane = [0.0_f32; 8];
        a_lane.copy_from_slice(&a[offset..offset + 8]);
        b_lane.copy_from_slice(&b[offset..offset + 8]);
        sum += f32x8::new(a_lane) * f32x8::new(b_lane);
    }

    let lanes: [f32; 8] = sum.into();
    let mut total: f32 = lanes.iter().sum();
    for i in chunks * 8..len {
        total += a[i] * b[i];
    }
    total
}

/// Dot product using scalar math.
#[cfg(not(feature = "simd"))]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vectors must have same length");
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Euclidean norm.
#[must_use]
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Cosine similarity in [-1, 1] against a query whose norm is already known.
/// Zero-length vectors score 0.
fn cosine_with_norm(query: &[f32], query_norm: f32, row: &[f32]) -> f32 {
    let denom = query_norm * norm(row);
    if denom <= f32::EPSILON || !denom.is_finite() {
        return 0.0;
    }
    (dot(query, row) / denom).clamp(-1.0, 1.0)
}

/// A scored catalog row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedRow {
    /// Position in the catalog.
    pub index: usize,
    pub score: f32,
}

/// Score every row against `query` and return the best `top_k`, highest first.
///
/// Ties are broken by catalog order (lower index first) and non-finite scores
/// sort after every finite one.
pub fn rank<'a, I>(query: &[f32], rows: I, top_k: usize) -> Vec<RankedRow>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    if top_k == 0 {
        return Vec::new();
    }

    let query_norm = norm(query);
    let mut scored: Vec<RankedRow> = rows
        .into_iter()
        .enumerate()
        .map(|(index, row)| RankedRow {
            index,
            score: cosine_with_norm(query, query_norm, row),
        })
        .collect();

    scored.sort_by(compare_ranked);
    scored.truncate(top_k);
    scored
}

fn compare_ranked(a: &RankedRow, b: &RankedRow) -> Ordering {
    match (a.score.is_finite(), b.score.is_finite()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.index.cmp(&b.index),
        (true, true) => b
            .score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.index.cmp(&b.index)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        cosine_with_norm(a, norm(a), b)
    }

    #[test]
    fn dot_handles_remainder_lanes() {
        let a: Vec<f32> = (1..=11).map(|v| v as f32).collect();
        let b = vec![1.0_f32; 11];
        assert!((dot(&a, &b) - 66.0).abs() < 1e-4);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3, 0.1, 0.9, 0.0, 2.0, 1.5, 0.2, 0.7, 0.4];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_is_scale_invariant_and_signed() {
        let a = [1.0, 2.0, 3.0];
        let b = [2.0, 4.0, 6.0];
        let c = [-1.0, -2.0, -3.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&a, &c) + 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_scores_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn rank_orders_descending_and_truncates() {
        let rows: Vec<Vec<f32>> = vec![
            vec![0.0, 1.0],
            vec![1.0, 0.0],
            vec![1.0, 1.0],
        ];
        let hits = rank(&[1.0, 0.1], rows.iter().map(Vec::as_slice), 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].index, 1);
        assert_eq!(hits[1].index, 2);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn rank_breaks_ties_by_catalog_order() {
        let rows: Vec<Vec<f32>> = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![2.0, 0.0], vec![1.0, 0.0]];
        let hits = rank(&[1.0, 0.0], rows.iter().map(Vec::as_slice), 4);
        let order: Vec<usize> = hits.iter().map(|h| h.index).collect();
        assert_eq!(order, vec![0, 2, 3, 1]);
    }

    #[test]
    fn rank_returns_min_of_k_and_rows() {
        let rows: Vec<Vec<f32>> = vec![vec![1.0], vec![0.5]];
        assert_eq!(rank(&[1.0], rows.iter().map(Vec::as_slice), 10).len(), 2);
        assert!(rank(&[1.0], rows.iter().map(Vec::as_slice), 0).is_empty());
        assert!(rank(&[1.0], std::iter::empty::<&[f32]>(), 5).is_empty());
    }

    #[test]
    fn non_finite_scores_sort_last() {
        let a = RankedRow { index: 0, score: f32::NAN };
        let b = RankedRow { index: 1, score: -0.9 };
        assert_eq!(compare_ranked(&a, &b), Ordering::Greater);
        assert_eq!(compare_ranked(&b, &a), Ordering::Less);
    }
}
