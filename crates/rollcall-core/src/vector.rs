//! Vector math shared by matching, clustering and liveness.
//!
//! Every comparison checks dimensions first. A length mismatch is an input
//! error, never a "large distance": reporting it as a distance would make a
//! malformed descriptor look like a confident non-match.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error("dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("cannot average an empty set of vectors")]
    Empty,
    #[error("vector contains a NaN or infinite value")]
    NonFinite,
}

/// Euclidean (L2) distance between two equal-length vectors.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32, VectorError> {
    if a.len() != b.len() {
        return Err(VectorError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt())
}

/// Similarity as used by clustering: `1 - distance`.
pub fn similarity(a: &[f32], b: &[f32]) -> Result<f32, VectorError> {
    euclidean_distance(a, b).map(|d| 1.0 - d)
}

/// Element-wise mean (centroid) of a set of equal-length vectors.
pub fn mean<V: AsRef<[f32]>>(vectors: &[V]) -> Result<Vec<f32>, VectorError> {
    let first = vectors.first().ok_or(VectorError::Empty)?.as_ref();
    let dim = first.len();
    let mut acc = vec![0.0f32; dim];

    for v in vectors {
        let v = v.as_ref();
        if v.len() != dim {
            return Err(VectorError::DimensionMismatch {
                left: dim,
                right: v.len(),
            });
        }
        for (slot, x) in acc.iter_mut().zip(v) {
            *slot += x;
        }
    }

    let n = vectors.len() as f32;
    acc.iter_mut().for_each(|x| *x /= n);
    Ok(acc)
}

/// Arithmetic mean of a slice of scalars; `None` when empty.
pub fn mean_scalar(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f32>() / values.len() as f32)
}

/// Population variance of a slice of scalars; `None` when empty.
pub fn variance(values: &[f32]) -> Option<f32> {
    let m = mean_scalar(values)?;
    Some(values.iter().map(|v| (v - m).powi(2)).sum::<f32>() / values.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_identity_is_zero() {
        let a = [0.3, -1.2, 4.0];
        assert_eq!(euclidean_distance(&a, &a).unwrap(), 0.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = [0.1, 0.2, 0.3, 0.4];
        let b = [0.9, -0.2, 0.0, 1.5];
        let ab = euclidean_distance(&a, &b).unwrap();
        let ba = euclidean_distance(&b, &a).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_distance_known_value() {
        // 3-4-5 triangle
        let d = euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]).unwrap();
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let err = euclidean_distance(&[1.0, 2.0], &[1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(err, VectorError::DimensionMismatch { left: 2, right: 3 });
    }

    #[test]
    fn test_mean_of_vectors() {
        let m = mean(&[vec![1.0, 2.0], vec![3.0, 6.0]]).unwrap();
        assert_eq!(m, vec![2.0, 4.0]);
    }

    #[test]
    fn test_mean_empty() {
        let empty: [Vec<f32>; 0] = [];
        assert_eq!(mean(&empty).unwrap_err(), VectorError::Empty);
    }

    #[test]
    fn test_mean_rejects_ragged() {
        let err = mean(&[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert!(matches!(err, VectorError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_variance() {
        assert_eq!(variance(&[]), None);
        assert_eq!(variance(&[2.0, 2.0, 2.0]), Some(0.0));
        let v = variance(&[1.0, 3.0]).unwrap();
        assert!((v - 1.0).abs() < 1e-6);
    }
}
