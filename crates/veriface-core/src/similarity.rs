//! Cosine similarity between face descriptors.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SimilarityError {
    #[error("descriptor dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Guards against an all-zero descriptor producing a zero denominator.
const NORM_EPSILON: f32 = 1e-9;

/// Normalized dot product in `[-1, 1]`.
///
/// The codec guarantees matching dimensions on its own paths, but probe and
/// gallery descriptors arrive from different pipelines, so the check stays.
pub fn cosine(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    // Rounding can push the quotient a hair past ±1 for (anti)parallel
    // vectors; the bound is part of the contract.
    Ok((dot / (norm_a.sqrt() * norm_b.sqrt() + NORM_EPSILON)).clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Descriptor;

    fn descriptor(seed: f32) -> Descriptor {
        Descriptor::new((0..128).map(|i| (i as f32 * seed).sin()).collect()).unwrap()
    }

    #[test]
    fn self_similarity_is_one() {
        let d = descriptor(0.37);
        let sim = cosine(&d, &d).unwrap();
        assert!((sim - 1.0).abs() < 1e-4);
    }

    #[test]
    fn symmetric() {
        let a = descriptor(0.37);
        let b = descriptor(1.13);
        assert_eq!(cosine(&a, &b).unwrap(), cosine(&b, &a).unwrap());
    }

    #[test]
    fn bounded() {
        let a = descriptor(0.7);
        let mut opposite: Vec<f32> = a.values().to_vec();
        for v in &mut opposite {
            *v = -*v;
        }
        let sim = cosine(&a, &opposite).unwrap();
        assert!((-1.0..=1.0).contains(&sim));
        assert!((sim + 1.0).abs() < 1e-4);

        // Parallel vectors must not exceed the upper bound either.
        let scaled: Vec<f32> = a.values().iter().map(|v| v * 3.0).collect();
        let sim = cosine(&a, &scaled).unwrap();
        assert!((-1.0..=1.0).contains(&sim));
    }

    #[test]
    fn zero_vector_yields_finite_zero() {
        let zero = vec![0.0f32; 128];
        let d = descriptor(0.5);
        let sim = cosine(&zero, &d).unwrap();
        assert!(sim.is_finite());
        assert_eq!(sim, 0.0);
    }

    #[test]
    fn dimension_mismatch_is_reported() {
        let a = vec![1.0f32; 128];
        let b = vec![1.0f32; 512];
        let err = cosine(&a, &b).unwrap_err();
        assert_eq!(
            err,
            SimilarityError::DimensionMismatch {
                left: 128,
                right: 512
            }
        );
    }
}
