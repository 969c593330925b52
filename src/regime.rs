//! Regime distance between two early layers
//!
//! `regime_distance = (1 - cos(pooled_a, pooled_b)) * 100`, so the value
//! lies in `[0, 200]`. Turns below the threshold are `PRESERVED`, the rest
//! `TRANSFORMED`.
//!
//! The default threshold of 50 comes from an observed bimodal split, not
//! from theory, and the distance has been found not to discriminate
//! confabulation. It is recorded and reported; it never feeds the
//! ground-truth label.

use serde::{Deserialize, Serialize};

/// Default PRESERVED/TRANSFORMED boundary.
pub const DEFAULT_REGIME_THRESHOLD: f64 = 50.0;

/// Informational classification of a regime distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegimeLabel {
    Preserved,
    Transformed,
}

impl std::fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preserved => write!(f, "PRESERVED"),
            Self::Transformed => write!(f, "TRANSFORMED"),
        }
    }
}

/// Cosine similarity accumulated in f64.
///
/// Returns 0.0 when either vector has (near-)zero norm or the lengths differ,
/// so the caller never sees NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 1e-10 {
        (dot / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Scaled cosine distance between two pooled activations.
pub fn regime_distance(pooled_a: &[f32], pooled_b: &[f32]) -> f64 {
    (1.0 - cosine_similarity(pooled_a, pooled_b)) * 100.0
}

/// `PRESERVED` if `distance < threshold`, otherwise `TRANSFORMED`.
pub fn classify(distance: f64, threshold: f64) -> RegimeLabel {
    if distance < threshold {
        RegimeLabel::Preserved
    } else {
        RegimeLabel::Transformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_vectors_distance_zero() {
        let v = [0.5f32, -1.0, 2.0];
        assert!(regime_distance(&v, &v).abs() < 1e-9);
        assert_eq!(classify(regime_distance(&v, &v), 50.0), RegimeLabel::Preserved);
    }

    #[test]
    fn test_orthogonal_and_opposite() {
        assert!((regime_distance(&[1.0, 0.0], &[0.0, 1.0]) - 100.0).abs() < 1e-9);
        assert!((regime_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_norm_is_not_nan() {
        let d = regime_distance(&[0.0, 0.0], &[1.0, 2.0]);
        assert!(d.is_finite());
        assert_eq!(classify(d, DEFAULT_REGIME_THRESHOLD), RegimeLabel::Transformed);
    }

    #[test]
    fn test_threshold_boundary_is_transformed() {
        assert_eq!(classify(49.999, 50.0), RegimeLabel::Preserved);
        assert_eq!(classify(50.0, 50.0), RegimeLabel::Transformed);
    }

    #[test]
    fn test_label_serializes_uppercase() {
        let json = serde_json::to_string(&RegimeLabel::Transformed).unwrap();
        assert_eq!(json, "\"TRANSFORMED\"");
    }
}
