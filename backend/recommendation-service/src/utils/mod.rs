// Vector helpers shared by the content scorer, the diversity pass and
// "more like this" lookups.

use ndarray::ArrayView1;

/// Dot product of two equally sized vectors; `None` on a dimension mismatch.
pub fn dot(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() {
        return None;
    }

    Some(ArrayView1::from(a).dot(&ArrayView1::from(b)))
}

/// Cosine similarity between two vectors.
///
/// Returns `None` when the dimensions differ or either vector is empty or zero,
/// since no meaningful similarity exists.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }

    let a = ArrayView1::from(a);
    let b = ArrayView1::from(b);

    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }

    Some(a.dot(&b) / (norm_a * norm_b))
}

/// Similarity clamped to `[0, 1]`, with unknown similarity treated as unrelated.
pub fn bounded_similarity(a: &[f64], b: &[f64]) -> f64 {
    cosine_similarity(a, b)
        .map(|similarity| similarity.clamp(0.0, 1.0))
        .unwrap_or(0.0)
}

pub fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|value| value.is_finite())
}
