// src/kernel.rs

use ndarray::{Array2, ArrayView1, ArrayView2, Zip};

/// Euclidean distance between two points of equal dimension.
#[inline]
pub fn euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Distances between every row of `left` and every row of `right`.
/// Shape: (left rows, right rows).
pub fn cross_distances(left: ArrayView2<f64>, right: ArrayView2<f64>) -> Array2<f64> {
    Array2::from_shape_fn((left.nrows(), right.nrows()), |(i, j)| {
        euclidean(left.row(i), right.row(j))
    })
}

/// Symmetric distance matrix between the rows of `points`.
pub fn pairwise_distances(points: ArrayView2<f64>) -> Array2<f64> {
    let n = points.nrows();
    let mut out = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let d = euclidean(points.row(i), points.row(j));
            out[[i, j]] = d;
            out[[j, i]] = d;
        }
    }
    out
}

/// Exponential (Ornstein-Uhlenbeck) correlation `exp(-d / length_scale)`.
///
/// Only called with a strictly positive length scale; the non-positive
/// sentinel is handled by the callers as "no spatial correlation".
#[inline]
pub fn exponential_correlation(distance: f64, length_scale: f64) -> f64 {
    (-distance / length_scale).exp()
}

/// Applies the exponential kernel element-wise to a distance matrix.
pub fn exponential_kernel(distances: ArrayView2<f64>, length_scale: f64) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros(distances.raw_dim());
    Zip::from(&mut out)
        .and(&distances)
        .for_each(|k, &d| *k = exponential_correlation(d, length_scale));
    out
}
