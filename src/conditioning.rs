// src/conditioning.rs

//! Exact Gaussian-process conditioning of new units on all old units.
//!
//! With `K11` the kernel over old units, `K12` the old-by-new cross kernel and
//! `L` the lower Cholesky factor of `K11`, everything is expressed through the
//! whitened quantities `A = L⁻¹K12` and `y = L⁻¹η`:
//!
//! * conditional mean `m = K12ᵀK11⁻¹η = Aᵀy`
//! * marginal conditional variance `v = 1 − colSums(A²)`

use crate::cholesky::CholeskyFactor;
use crate::error::FactorFailure;
use crate::kernel::exponential_kernel;
use crate::random_level::SpatialData;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::Rng;
use rand_distr::StandardNormal;

/// Length-scale-independent distances for conditioning on every old unit.
#[derive(Debug, Clone)]
pub(crate) struct ExactGeometry {
    old_old: Array2<f64>,
    old_new: Array2<f64>,
}

/// `A = L⁻¹K12` and `y = L⁻¹η` for one factor.
#[derive(Debug, Clone)]
pub(crate) struct Whitened {
    pub cross: Array2<f64>,
    pub values: Array1<f64>,
}

impl Whitened {
    pub(crate) fn mean(&self) -> Array1<f64> {
        self.cross.t().dot(&self.values)
    }

    /// Unclamped `1 − colSums(A²)`.
    pub(crate) fn marginal_variance(&self) -> Array1<f64> {
        self.cross
            .map_axis(Axis(0), |col| 1.0 - col.dot(&col))
    }
}

impl ExactGeometry {
    pub(crate) fn new(spatial: &SpatialData, old_rows: &[usize], new_rows: &[usize]) -> Self {
        Self {
            old_old: spatial.distances_between(old_rows, old_rows),
            old_new: spatial.distances_between(old_rows, new_rows),
        }
    }

    /// Factorizes the old-unit kernel for `length_scale` and whitens the cross
    /// kernel and the old-unit values of one factor.
    pub(crate) fn whiten(
        &self,
        values: ArrayView1<f64>,
        length_scale: f64,
        jitter: f64,
    ) -> Result<Whitened, FactorFailure> {
        let k11 = exponential_kernel(self.old_old.view(), length_scale);
        let k12 = exponential_kernel(self.old_new.view(), length_scale);
        let chol = CholeskyFactor::new(k11.view(), jitter, "Cholesky of old-unit kernel")?;
        let cross = chol.whiten(k12.view())?;
        let values = chol.whiten_vec(values)?;
        Ok(Whitened { cross, values })
    }
}

/// Clamps variances at zero in place. Returns how many entries were below
/// `-tolerance` before clamping.
pub(crate) fn clamp_variances(variances: &mut Array1<f64>, tolerance: f64) -> usize {
    let mut clearly_negative = 0;
    variances.mapv_inplace(|v| {
        if v < -tolerance {
            clearly_negative += 1;
        }
        v.max(0.0)
    });
    clearly_negative
}

/// `n` independent standard normal values.
pub(crate) fn standard_normals<R: Rng + ?Sized>(rng: &mut R, n: usize) -> Array1<f64> {
    Array1::from_shape_fn(n, |_| rng.sample::<f64, _>(StandardNormal))
}
