// src/gpp.rs

use crate::cholesky::CholeskyFactor;
use crate::conditioning::standard_normals;
use crate::error::FactorFailure;
use crate::kernel::{cross_distances, exponential_kernel, pairwise_distances};
use log::trace;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;

/// Smallest residual ("nugget") variance allowed for an old unit. An old unit
/// lying on a knot has a nugget of exactly zero, whose inverse enters the
/// knot-space precision.
pub const GPP_NUGGET_FLOOR: f64 = 1e-10;

/// Gaussian predictive process on a fixed set of knots.
///
/// Latent values are `η(x) = W_xs Wss⁻¹ η_s + ε(x)` with `η_s` the values at
/// the knots and `ε` independent with variance `dD(x) = 1 − W_xs Wss⁻¹ W_sx`.
/// Conditioning on old units happens in knot space, so a factor costs
/// O(units · knots² + knots³).
#[derive(Debug, Clone)]
pub(crate) struct PredictiveProcessSampler {
    knot_knot: Array2<f64>,
    old_knot: Array2<f64>,
    new_knot: Array2<f64>,
}

/// Knot-space posterior of `u = Wss⁻¹ η_s` given the old-unit values of one
/// factor, with what is needed to project it to the new units.
#[derive(Debug)]
pub(crate) struct KnotPosterior {
    knot_mean: Array1<f64>,
    precision: CholeskyFactor,
    new_cross: Array2<f64>,
    new_nugget: Array1<f64>,
}

impl KnotPosterior {
    /// Mean at the new units, `W_n μ`.
    #[cfg(test)]
    pub(crate) fn mean(&self) -> Array1<f64> {
        self.new_cross.dot(&self.knot_mean)
    }

    /// Draws `u ~ N(μ, F⁻¹)` and returns `W_n u + sqrt(dD_n)·z`.
    pub(crate) fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Array1<f64>, FactorFailure> {
        let z_knots = standard_normals(rng, self.knot_mean.len());
        let knot_draw = &self.knot_mean + &self.precision.unwhiten_vec(z_knots.view())?;
        let z_units = standard_normals(rng, self.new_nugget.len());
        Ok(self.new_cross.dot(&knot_draw) + &(self.new_nugget.mapv(f64::sqrt) * z_units))
    }
}

impl PredictiveProcessSampler {
    /// `old_points` and `new_points` hold unit coordinates row by row; `knots`
    /// has one row per knot.
    pub(crate) fn new(old_points: ArrayView2<f64>, new_points: ArrayView2<f64>, knots: ArrayView2<f64>) -> Self {
        Self {
            knot_knot: pairwise_distances(knots),
            old_knot: cross_distances(old_points, knots),
            new_knot: cross_distances(new_points, knots),
        }
    }

    pub(crate) fn knot_count(&self) -> usize {
        self.knot_knot.nrows()
    }

    pub(crate) fn posterior(
        &self,
        values: ArrayView1<f64>,
        length_scale: f64,
        jitter: f64,
        variance_tolerance: f64,
    ) -> Result<KnotPosterior, FactorFailure> {
        let wss = exponential_kernel(self.knot_knot.view(), length_scale);
        let w_old = exponential_kernel(self.old_knot.view(), length_scale);
        let w_new = exponential_kernel(self.new_knot.view(), length_scale);
        let knot_chol = CholeskyFactor::new(wss.view(), jitter, "Cholesky of knot kernel")?;

        let mut old_nugget = residual_variances(&knot_chol.whiten(w_old.t())?);
        if let Some(row) = first_clearly_negative(&old_nugget, variance_tolerance) {
            return Err(FactorFailure::new(
                "old-unit predictive-process nugget",
                negative_nugget(old_nugget[row]),
            )
            .at_old_unit(row));
        }
        old_nugget.mapv_inplace(|v| v.max(GPP_NUGGET_FLOOR));

        let mut new_nugget = residual_variances(&knot_chol.whiten(w_new.t())?);
        if let Some(row) = first_clearly_negative(&new_nugget, variance_tolerance) {
            return Err(FactorFailure::new(
                "new-unit predictive-process nugget",
                negative_nugget(new_nugget[row]),
            )
            .at_unit(row));
        }
        new_nugget.mapv_inplace(|v| v.max(0.0));

        // F = Wss + W_oᵀ diag(1/dD_o) W_o
        let scaled_old = &w_old / &old_nugget.view().insert_axis(Axis(1));
        let mut precision = w_old.t().dot(&scaled_old);
        precision += &wss;
        let precision = CholeskyFactor::new(precision.view(), jitter, "Cholesky of knot-space precision")?;

        let rhs = w_old.t().dot(&(&values / &old_nugget));
        let knot_mean = precision.solve_vec(rhs.view())?;
        trace!(
            "GPP posterior with {} knots, min old nugget {:.3e}",
            self.knot_count(),
            old_nugget.fold(f64::INFINITY, |a, &b| a.min(b))
        );

        Ok(KnotPosterior {
            knot_mean,
            precision,
            new_cross: w_new,
            new_nugget,
        })
    }

    pub(crate) fn sample<R: Rng + ?Sized>(
        &self,
        values: ArrayView1<f64>,
        length_scale: f64,
        jitter: f64,
        variance_tolerance: f64,
        rng: &mut R,
    ) -> Result<Array1<f64>, FactorFailure> {
        self.posterior(values, length_scale, jitter, variance_tolerance)?
            .sample(rng)
    }
}

/// `1 − colSums(Q²)` with `Q = L⁻¹ Wᵀ`, i.e. `1 − rowSums((W L⁻ᵀ)²)`.
fn residual_variances(whitened: &Array2<f64>) -> Array1<f64> {
    whitened.map_axis(Axis(0), |col| 1.0 - col.dot(&col))
}

fn first_clearly_negative(variances: &Array1<f64>, tolerance: f64) -> Option<usize> {
    variances.iter().position(|v| *v < -tolerance)
}

fn negative_nugget(v: f64) -> String {
    format!("residual variance {:e} is negative", v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditioning::ExactGeometry;
    use crate::random_level::SpatialData;
    use crate::units::UnitId;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, s};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn points() -> Array2<f64> {
        array![
            [0.0, 0.0],
            [1.0, 0.0],
            [0.0, 1.0],
            [1.0, 1.0],
            [0.3, 0.6],
            [0.7, 0.2]
        ]
    }

    #[test]
    fn knots_on_old_units_recover_exact_conditioning() {
        let pts = points();
        let old = pts.slice(s![..4, ..]);
        let new = pts.slice(s![4.., ..]);
        let eta = array![0.4, -0.3, 1.2, 0.8];
        let sampler = PredictiveProcessSampler::new(old, new, old);
        let posterior = sampler.posterior(eta.view(), 1.0, 0.0, 1e-8).unwrap();

        let units = (0..6).map(UnitId::from).collect();
        let data = SpatialData::coordinates(units, pts.clone()).unwrap();
        let exact = ExactGeometry::new(&data, &[0, 1, 2, 3], &[4, 5])
            .whiten(eta.view(), 1.0, 0.0)
            .unwrap();
        let gpp_mean = posterior.mean();
        let exact_mean = exact.mean();
        for i in 0..2 {
            assert_abs_diff_eq!(gpp_mean[i], exact_mean[i], epsilon = 1e-5);
        }
    }

    #[test]
    fn single_far_knot_shrinks_mean_towards_zero() {
        let pts = points();
        let old = pts.slice(s![..4, ..]);
        let new = pts.slice(s![4.., ..]);
        let knots = array![[50.0, 50.0]];
        let sampler = PredictiveProcessSampler::new(old, new, knots.view());
        let posterior = sampler.posterior(array![1.0, 1.0, 1.0, 1.0].view(), 1.0, 0.0, 1e-8).unwrap();
        for m in posterior.mean().iter() {
            assert!(m.abs() < 1e-6);
        }
        // nearly all variance is in the nugget
        for v in posterior.new_nugget.iter() {
            assert!(*v > 0.999);
        }
    }

    #[test]
    fn clearly_negative_nuggets_name_the_unit_that_produced_them() {
        let pts = points();
        let old = pts.slice(s![..4, ..]);
        let new = pts.slice(s![4.., ..]);
        // old unit 2 sits on the only knot, so its nugget is zero; a tolerance
        // of -1e-3 treats anything below 1e-3 as negative
        let knots = array![[0.0, 1.0]];
        let sampler = PredictiveProcessSampler::new(old, new, knots.view());
        let err = sampler
            .posterior(array![0.1, 0.2, 0.3, 0.4].view(), 1.0, 0.0, -1e-3)
            .unwrap_err();
        assert_eq!(err.stage, "old-unit predictive-process nugget");
        assert_eq!(err.old_unit, Some(2));
        assert_eq!(err.new_unit, None);

        // with the knot on new unit 1 instead, old nuggets are all large
        let knots = array![[0.7, 0.2]];
        let sampler = PredictiveProcessSampler::new(old, new, knots.view());
        let err = sampler
            .posterior(array![0.1, 0.2, 0.3, 0.4].view(), 1.0, 0.0, -1e-3)
            .unwrap_err();
        assert_eq!(err.stage, "new-unit predictive-process nugget");
        assert_eq!(err.new_unit, Some(1));
        assert_eq!(err.old_unit, None);
    }

    #[test]
    fn sample_mean_converges_to_posterior_mean() {
        let pts = points();
        let old = pts.slice(s![..4, ..]);
        let new = pts.slice(s![4.., ..]);
        let knots = array![[0.25, 0.25], [0.75, 0.75], [0.25, 0.75]];
        let sampler = PredictiveProcessSampler::new(old, new, knots.view());
        let eta = array![0.4, -0.3, 1.2, 0.8];
        let posterior = sampler.posterior(eta.view(), 0.8, 0.0, 1e-8).unwrap();
        let mean = posterior.mean();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let n = 20_000;
        let mut acc = Array1::<f64>::zeros(2);
        for _ in 0..n {
            acc += &sampler.sample(eta.view(), 0.8, 0.0, 1e-8, &mut rng).unwrap();
        }
        acc /= n as f64;
        for i in 0..2 {
            assert_abs_diff_eq!(acc[i], mean[i], epsilon = 0.03);
        }
    }
}
