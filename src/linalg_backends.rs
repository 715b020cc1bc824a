// src/linalg_backends.rs

#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

// --- Common imports needed by multiple sections ---
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::error::Error;
use std::marker::PhantomData;

// --- Trait Definitions ---

/// Trait for the Cholesky factorization of a symmetric positive-definite matrix
/// (similar to LAPACK's DPOTRF). Only the lower triangle of the input is read.
pub trait BackendCholesky<F: 'static + Copy + Send + Sync> {
    /// Returns `L` with `matrix = L Lᵀ`; the strict upper triangle of `L` is zero.
    fn cholesky_lower(&self, matrix: ArrayView2<F>) -> Result<Array2<F>, Box<dyn Error + Send + Sync>>;
}

/// Trait for triangular solves against a lower Cholesky factor (similar to LAPACK's DTRTRS).
pub trait BackendTriangularSolve<F: 'static + Copy + Send + Sync> {
    /// Solves `L X = B` for `X`.
    fn solve_lower(&self, lower: ArrayView2<F>, rhs: ArrayView2<F>) -> Result<Array2<F>, Box<dyn Error + Send + Sync>>;

    /// Solves `Lᵀ X = B` for `X`, where `lower` holds `L`.
    fn solve_lower_transposed(&self, lower: ArrayView2<F>, rhs: ArrayView2<F>) -> Result<Array2<F>, Box<dyn Error + Send + Sync>>;

    /// Vector form of `solve_lower`.
    fn solve_lower_vec(&self, lower: ArrayView2<F>, rhs: ArrayView1<F>) -> Result<Array1<F>, Box<dyn Error + Send + Sync>>;

    /// Vector form of `solve_lower_transposed`.
    fn solve_lower_transposed_vec(&self, lower: ArrayView2<F>, rhs: ArrayView1<F>) -> Result<Array1<F>, Box<dyn Error + Send + Sync>>;
}

// --- NdarrayLinAlgBackend Implementation ---
// Specific imports for ndarray-linalg backend
use ndarray_linalg::{Cholesky as NdLinalgCholesky, Diag, SolveTriangular as NdLinalgSolveTriangular, UPLO};

// Define a concrete type for ndarray-linalg backend
#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

// Helper to convert ndarray-linalg's error to Box<dyn Error + Send + Sync>
fn to_dyn_error<E: Error + Send + Sync + 'static>(e: E) -> Box<dyn Error + Send + Sync> {
    Box::new(e)
}

fn check_square(rows: usize, cols: usize, what: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
    if rows != cols {
        return Err(format!("{} must be square, got {}x{}", what, rows, cols).into());
    }
    Ok(())
}

// --- Implementations for f64 ---
impl BackendCholesky<f64> for NdarrayLinAlgBackend {
    fn cholesky_lower(&self, matrix: ArrayView2<f64>) -> Result<Array2<f64>, Box<dyn Error + Send + Sync>> {
        check_square(matrix.nrows(), matrix.ncols(), "Cholesky input")?;
        if matrix.is_empty() {
            return Ok(Array2::zeros((0, 0)));
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err("Cholesky input contains non-finite values".into());
        }
        matrix.cholesky(UPLO::Lower).map_err(to_dyn_error)
    }
}

impl BackendTriangularSolve<f64> for NdarrayLinAlgBackend {
    fn solve_lower(&self, lower: ArrayView2<f64>, rhs: ArrayView2<f64>) -> Result<Array2<f64>, Box<dyn Error + Send + Sync>> {
        if rhs.ncols() == 0 || lower.nrows() == 0 {
            return Ok(Array2::zeros(rhs.raw_dim()));
        }
        lower
            .solve_triangular(UPLO::Lower, Diag::NonUnit, &rhs.to_owned())
            .map_err(to_dyn_error)
    }

    fn solve_lower_transposed(&self, lower: ArrayView2<f64>, rhs: ArrayView2<f64>) -> Result<Array2<f64>, Box<dyn Error + Send + Sync>> {
        if rhs.ncols() == 0 || lower.nrows() == 0 {
            return Ok(Array2::zeros(rhs.raw_dim()));
        }
        // Lᵀ of a C-ordered L is an F-ordered upper-triangular view; LAPACK accepts it as is.
        lower
            .t()
            .solve_triangular(UPLO::Upper, Diag::NonUnit, &rhs.to_owned())
            .map_err(to_dyn_error)
    }

    fn solve_lower_vec(&self, lower: ArrayView2<f64>, rhs: ArrayView1<f64>) -> Result<Array1<f64>, Box<dyn Error + Send + Sync>> {
        if lower.nrows() == 0 {
            return Ok(Array1::zeros(rhs.len()));
        }
        lower
            .solve_triangular(UPLO::Lower, Diag::NonUnit, &rhs.to_owned())
            .map_err(to_dyn_error)
    }

    fn solve_lower_transposed_vec(&self, lower: ArrayView2<f64>, rhs: ArrayView1<f64>) -> Result<Array1<f64>, Box<dyn Error + Send + Sync>> {
        if lower.nrows() == 0 {
            return Ok(Array1::zeros(rhs.len()));
        }
        lower
            .t()
            .solve_triangular(UPLO::Upper, Diag::NonUnit, &rhs.to_owned())
            .map_err(to_dyn_error)
    }
}

// --- LinAlgBackendProvider Dispatch ---

// --- Implement BackendCholesky for Provider ---
impl<F> BackendCholesky<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendCholesky<F>,
{
    fn cholesky_lower(&self, matrix: ArrayView2<F>) -> Result<Array2<F>, Box<dyn Error + Send + Sync>> {
        NdarrayLinAlgBackend.cholesky_lower(matrix)
    }
}

// --- Implement BackendTriangularSolve for Provider ---
impl<F> BackendTriangularSolve<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendTriangularSolve<F>,
{
    fn solve_lower(&self, lower: ArrayView2<F>, rhs: ArrayView2<F>) -> Result<Array2<F>, Box<dyn Error + Send + Sync>> {
        NdarrayLinAlgBackend.solve_lower(lower, rhs)
    }

    fn solve_lower_transposed(&self, lower: ArrayView2<F>, rhs: ArrayView2<F>) -> Result<Array2<F>, Box<dyn Error + Send + Sync>> {
        NdarrayLinAlgBackend.solve_lower_transposed(lower, rhs)
    }

    fn solve_lower_vec(&self, lower: ArrayView2<F>, rhs: ArrayView1<F>) -> Result<Array1<F>, Box<dyn Error + Send + Sync>> {
        NdarrayLinAlgBackend.solve_lower_vec(lower, rhs)
    }

    fn solve_lower_transposed_vec(&self, lower: ArrayView2<F>, rhs: ArrayView1<F>) -> Result<Array1<F>, Box<dyn Error + Send + Sync>> {
        NdarrayLinAlgBackend.solve_lower_transposed_vec(lower, rhs)
    }
}
