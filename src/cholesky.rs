// src/cholesky.rs

use crate::error::FactorFailure;
use crate::linalg_backends::{BackendCholesky, BackendTriangularSolve, LinAlgBackendProvider};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Lower Cholesky factor of a kernel matrix, kept so several right-hand sides
/// can be solved without refactorizing.
#[derive(Debug, Clone)]
pub(crate) struct CholeskyFactor {
    lower: Array2<f64>,
    backend: LinAlgBackendProvider<f64>,
}

impl CholeskyFactor {
    /// Factorizes `matrix + jitter·I`. `stage` names the matrix in failures.
    pub(crate) fn new(
        matrix: ArrayView2<f64>,
        jitter: f64,
        stage: &'static str,
    ) -> Result<Self, FactorFailure> {
        let backend = LinAlgBackendProvider::<f64>::new();
        let factorized = if jitter > 0.0 {
            let mut shifted = matrix.to_owned();
            shifted.diag_mut().mapv_inplace(|v| v + jitter);
            backend.cholesky_lower(shifted.view())
        } else {
            backend.cholesky_lower(matrix)
        };
        let lower = factorized.map_err(|e| FactorFailure::new(stage, e))?;
        Ok(Self { lower, backend })
    }

    #[cfg(test)]
    pub(crate) fn lower(&self) -> ArrayView2<'_, f64> {
        self.lower.view()
    }

    /// `L⁻¹ B`
    pub(crate) fn whiten(&self, rhs: ArrayView2<f64>) -> Result<Array2<f64>, FactorFailure> {
        self.backend
            .solve_lower(self.lower.view(), rhs)
            .map_err(|e| FactorFailure::new("triangular solve", e))
    }

    /// `L⁻¹ b`
    pub(crate) fn whiten_vec(&self, rhs: ArrayView1<f64>) -> Result<Array1<f64>, FactorFailure> {
        self.backend
            .solve_lower_vec(self.lower.view(), rhs)
            .map_err(|e| FactorFailure::new("triangular solve", e))
    }

    /// `L⁻ᵀ b`
    pub(crate) fn unwhiten_vec(&self, rhs: ArrayView1<f64>) -> Result<Array1<f64>, FactorFailure> {
        self.backend
            .solve_lower_transposed_vec(self.lower.view(), rhs)
            .map_err(|e| FactorFailure::new("triangular solve", e))
    }

    /// `A⁻¹ b` for the factorized `A`.
    pub(crate) fn solve_vec(&self, rhs: ArrayView1<f64>) -> Result<Array1<f64>, FactorFailure> {
        let half = self.whiten_vec(rhs)?;
        self.unwhiten_vec(half.view())
    }

    /// `L z`, turning independent standard normals into a draw with covariance `A`.
    pub(crate) fn correlate(&self, z: ArrayView1<f64>) -> Array1<f64> {
        self.lower.dot(&z)
    }
}
