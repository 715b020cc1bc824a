// src/full_rank.rs

use crate::cholesky::CholeskyFactor;
use crate::conditioning::{standard_normals, ExactGeometry};
use crate::error::FactorFailure;
use crate::kernel::exponential_kernel;
use crate::random_level::SpatialData;
use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;

/// Exact joint sampling of all new units at once.
///
/// The conditional covariance `W = K22 − K12ᵀK11⁻¹K12` is formed densely and
/// factorized, so each factor costs O((old + new)³).
#[derive(Debug, Clone)]
pub(crate) struct FullRankSampler {
    exact: ExactGeometry,
    new_new: Array2<f64>,
}

impl FullRankSampler {
    pub(crate) fn new(spatial: &SpatialData, old_rows: &[usize], new_rows: &[usize]) -> Self {
        Self {
            exact: ExactGeometry::new(spatial, old_rows, new_rows),
            new_new: spatial.distances_between(new_rows, new_rows),
        }
    }

    pub(crate) fn sample<R: Rng + ?Sized>(
        &self,
        values: ArrayView1<f64>,
        length_scale: f64,
        jitter: f64,
        rng: &mut R,
    ) -> Result<Array1<f64>, FactorFailure> {
        let whitened = self.exact.whiten(values, length_scale, jitter)?;
        let mean = whitened.mean();

        let mut covariance = exponential_kernel(self.new_new.view(), length_scale);
        covariance -= &whitened.cross.t().dot(&whitened.cross);
        let chol = CholeskyFactor::new(
            covariance.view(),
            jitter,
            "Cholesky of new-unit conditional covariance",
        )?;

        let z = standard_normals(rng, mean.len());
        Ok(mean + chol.correlate(z.view()))
    }
}
