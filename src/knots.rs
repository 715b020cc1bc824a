// src/knots.rs

use crate::error::PredictError;
use crate::kernel::euclidean;
use log::{debug, warn};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// Grid knots above this count make the knot-space Cholesky the dominant cost.
const LARGE_KNOT_GRID: usize = 10_000;
/// Candidate grids larger than this are rejected before any allocation.
const MAX_KNOT_GRID: usize = 1_000_000;

/// How the spacing of the knot grid is chosen.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KnotSpacing {
    /// Number of grid steps along the narrowest non-zero coordinate range.
    Count(usize),
    /// Explicit distance between neighbouring knots.
    Distance(f64),
}

impl Default for KnotSpacing {
    fn default() -> Self {
        KnotSpacing::Count(10)
    }
}

/// Builds a regular grid of knots over the bounding box of `points` and keeps
/// the knots strictly closer than `min_knot_distance` to at least one point.
///
/// * `points` - unit coordinates, shape (n_units, dimension).
/// * `spacing` - grid spacing, see [`KnotSpacing`].
/// * `min_knot_distance` - pruning radius; defaults to twice the grid spacing.
///
/// Returns the knots as a (n_knots, dimension) matrix, ordered with the first
/// coordinate varying fastest.
pub fn construct_knots(
    points: ArrayView2<f64>,
    spacing: KnotSpacing,
    min_knot_distance: Option<f64>,
) -> Result<Array2<f64>, PredictError> {
    let dimension = points.ncols();
    if points.nrows() == 0 || dimension == 0 {
        return Err(PredictError::Configuration(
            "knots need at least one point with at least one coordinate".to_string(),
        ));
    }
    if points.iter().any(|v| !v.is_finite()) {
        return Err(PredictError::Configuration(
            "knot construction needs finite coordinates".to_string(),
        ));
    }

    let minima: Vec<f64> = points
        .axis_iter(Axis(1))
        .map(|c| c.fold(f64::INFINITY, |a, &b| a.min(b)))
        .collect();
    let maxima: Vec<f64> = points
        .axis_iter(Axis(1))
        .map(|c| c.fold(f64::NEG_INFINITY, |a, &b| a.max(b)))
        .collect();
    let narrowest = minima
        .iter()
        .zip(&maxima)
        .map(|(lo, hi)| hi - lo)
        .filter(|range| *range > 0.0)
        .fold(f64::INFINITY, f64::min);

    let step = match spacing {
        KnotSpacing::Count(0) => {
            return Err(PredictError::Configuration(
                "knot count must be at least 1".to_string(),
            ))
        }
        KnotSpacing::Count(n) => {
            if !narrowest.is_finite() {
                // All points coincide: a single knot on top of them.
                return Array2::from_shape_vec((1, dimension), minima)
                    .map_err(|e| PredictError::Configuration(e.to_string()));
            }
            narrowest / n as f64
        }
        KnotSpacing::Distance(d) if d.is_finite() && d > 0.0 => d,
        KnotSpacing::Distance(d) => {
            return Err(PredictError::Configuration(format!(
                "knot distance must be positive and finite, got {}",
                d
            )))
        }
    };
    let radius = match min_knot_distance {
        Some(r) if r.is_finite() && r > 0.0 => r,
        Some(r) => {
            return Err(PredictError::Configuration(format!(
                "minimum knot distance must be positive and finite, got {}",
                r
            )))
        }
        None => 2.0 * step,
    };

    // Inclusive of the maximum when it falls on the grid, up to rounding.
    let axis_lengths = minima
        .iter()
        .zip(&maxima)
        .map(|(&lo, &hi)| {
            let steps = ((hi - lo) / step + 1e-9).floor();
            if steps < MAX_KNOT_GRID as f64 {
                Some(steps as usize + 1)
            } else {
                None
            }
        })
        .collect::<Option<Vec<usize>>>();
    let grid_size = axis_lengths.as_ref().and_then(|lengths| {
        lengths
            .iter()
            .try_fold(1usize, |acc, &len| acc.checked_mul(len))
            .filter(|&size| size <= MAX_KNOT_GRID)
    });
    let (axis_lengths, grid_size) = match (axis_lengths, grid_size) {
        (Some(lengths), Some(size)) => (lengths, size),
        _ => {
            return Err(PredictError::Configuration(format!(
                "knot spacing {:e} gives more than {} grid knots over the coordinate range",
                step, MAX_KNOT_GRID
            )))
        }
    };
    if grid_size > LARGE_KNOT_GRID {
        warn!(
            "Knot grid has {} candidate knots before pruning; consider a coarser spacing.",
            grid_size
        );
    }
    let axes: Vec<Vec<f64>> = minima
        .iter()
        .zip(&axis_lengths)
        .map(|(&lo, &count)| (0..count).map(|i| lo + i as f64 * step).collect())
        .collect();

    let mut kept: Vec<f64> = Vec::new();
    let mut candidate = vec![0.0; dimension];
    let mut counters = vec![0usize; dimension];
    for _ in 0..grid_size {
        for (d, &c) in counters.iter().enumerate() {
            candidate[d] = axes[d][c];
        }
        if nearest_point_distance(ArrayView1::from(&candidate[..]), points) < radius {
            kept.extend_from_slice(&candidate);
        }
        // Odometer increment, first coordinate fastest.
        for d in 0..dimension {
            counters[d] += 1;
            if counters[d] < axes[d].len() {
                break;
            }
            counters[d] = 0;
        }
    }

    let n_knots = kept.len() / dimension;
    debug!(
        "Constructed {} knots from a grid of {} (spacing {:.4}, pruning radius {:.4}).",
        n_knots, grid_size, step, radius
    );
    Array2::from_shape_vec((n_knots, dimension), kept)
        .map_err(|e| PredictError::Configuration(e.to_string()))
}

fn nearest_point_distance(knot: ArrayView1<f64>, points: ArrayView2<f64>) -> f64 {
    points
        .rows()
        .into_iter()
        .map(|p| euclidean(knot, p))
        .fold(f64::INFINITY, f64::min)
}
