// src/predictor.rs

use crate::conditioning::{clamp_variances, standard_normals, ExactGeometry};
use crate::error::{FactorFailure, PredictError};
use crate::full_rank::FullRankSampler;
use crate::gpp::PredictiveProcessSampler;
use crate::nngp::NngpSampler;
use crate::random_level::{RandomLevel, RangeParameterSupport, SpatialMethod};
use crate::units::{RowSource, UnitId, UnitIndex, UnitPartition};
use log::{debug, info, trace, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What to return for the genuinely new units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredictionMode {
    /// One coherent draw from the joint conditional distribution, using the
    /// level's spatial method.
    JointSample,
    /// The conditional expectation only; no randomness.
    ConditionalMean,
    /// Conditional expectation plus independent noise with the marginal
    /// conditional variance of each unit.
    MeanField,
}

impl PredictionMode {
    /// Maps the two-flag interface (`predictMean`, `predictMeanField`) onto a mode.
    pub fn from_flags(conditional_mean: bool, mean_field: bool) -> Result<Self, PredictError> {
        match (conditional_mean, mean_field) {
            (true, true) => Err(PredictError::InvalidMode),
            (true, false) => Ok(PredictionMode::ConditionalMean),
            (false, true) => Ok(PredictionMode::MeanField),
            (false, false) => Ok(PredictionMode::JointSample),
        }
    }
}

impl fmt::Display for PredictionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PredictionMode::JointSample => "joint sample",
            PredictionMode::ConditionalMean => "conditional mean",
            PredictionMode::MeanField => "mean field",
        })
    }
}

/// One retained MCMC draw of a random level.
#[derive(Clone, Debug, PartialEq)]
pub struct PosteriorDraw {
    /// Latent factors at the old units. Shape: (n_old_units, n_factors).
    pub loadings: Array2<f64>,
    /// 0-based index into the range-parameter support, one per factor.
    pub range_assignment: Vec<usize>,
}

impl PosteriorDraw {
    pub fn new(loadings: Array2<f64>, range_assignment: Vec<usize>) -> Self {
        Self {
            loadings,
            range_assignment,
        }
    }

    pub fn factor_count(&self) -> usize {
        self.loadings.ncols()
    }
}

/// Predicted latent factors of one draw, rows labelled by the requested units.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadingMatrix {
    pub units: Vec<UnitId>,
    /// Shape: (n_new_units, n_factors).
    pub values: Array2<f64>,
}

impl LoadingMatrix {
    /// Row of the first occurrence of `unit`.
    pub fn row(&self, unit: &UnitId) -> Option<ArrayView1<'_, f64>> {
        self.units
            .iter()
            .position(|u| u == unit)
            .map(|i| self.values.row(i))
    }
}

/// Parameters of the prediction engine itself. Missing fields take their
/// default when deserialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Seed of the ChaCha generator. Draw `d` uses stream `d` of this seed.
    pub random_seed: u64,
    /// Process posterior draws on the rayon thread pool. Output does not
    /// depend on this setting.
    pub parallel_draws: bool,
    /// Added to the diagonal of every kernel matrix before factorization.
    /// Zero reproduces exact conditioning; a small positive value lets the
    /// caller retry after a `NumericalInstability` error.
    pub cholesky_jitter: f64,
    /// Computed variances in `[-variance_tolerance, 0)` are rounding noise and
    /// are clamped silently; lower values are clamped with a warning (mean
    /// field, NNGP) or rejected (predictive-process nuggets).
    pub variance_tolerance: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        PredictorConfig {
            random_seed: 2025,
            parallel_draws: true,
            cholesky_jitter: 0.0,
            variance_tolerance: 1e-8,
        }
    }
}

/// Draws latent factors at new units from their conditional distribution
/// given posterior draws at old units.
#[derive(Debug, Clone)]
pub struct LatentFactorPredictor {
    config: PredictorConfig,
}

/// Joint-sampling strategy, selected once per call.
enum JointSampler {
    Full(FullRankSampler),
    Nngp(NngpSampler),
    Gpp(PredictiveProcessSampler),
}

/// How factors of the genuinely new units are produced in this call.
enum FactorModel {
    /// No unit needs prediction.
    CopyOnly,
    /// No spatial structure: i.i.d. standard normal factors.
    Unstructured,
    /// Exact conditioning for the conditional-mean and mean-field modes.
    Exact(ExactGeometry),
    Joint(JointSampler),
}

/// Everything a single draw needs, shared read-only across draws.
struct DrawContext<'a> {
    config: &'a PredictorConfig,
    mode: PredictionMode,
    partition: &'a UnitPartition,
    model: &'a FactorModel,
    support: &'a RangeParameterSupport,
    new_units: &'a [UnitId],
    old_units: &'a [UnitId],
}

impl LatentFactorPredictor {
    pub fn new(config: PredictorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    /// Like [`predict`](Self::predict), with the mode given as the two
    /// booleans of the HMSC interface. Both flags set fails with
    /// `InvalidMode` before any input is inspected.
    pub fn predict_with_flags(
        &self,
        new_units: &[UnitId],
        old_units: &[UnitId],
        draws: &[PosteriorDraw],
        random_level: &RandomLevel,
        conditional_mean: bool,
        mean_field: bool,
    ) -> Result<Vec<LoadingMatrix>, PredictError> {
        let mode = PredictionMode::from_flags(conditional_mean, mean_field)?;
        self.predict(new_units, old_units, draws, random_level, mode)
    }

    /// Predicts latent factors at `new_units` for every posterior draw.
    ///
    /// * `new_units` - units to predict, in output row order. Units that are
    ///   also in `old_units` are copied from the draw unchanged.
    /// * `old_units` - labels of the rows of every draw's `loadings`.
    /// * `draws` - posterior draws; the output has one matrix per draw, in order.
    /// * `random_level` - structure of the latent factors.
    /// * `mode` - see [`PredictionMode`].
    ///
    /// # Errors
    /// Fails as a whole when any draw fails; see [`PredictError`].
    pub fn predict(
        &self,
        new_units: &[UnitId],
        old_units: &[UnitId],
        draws: &[PosteriorDraw],
        random_level: &RandomLevel,
        mode: PredictionMode,
    ) -> Result<Vec<LoadingMatrix>, PredictError> {
        let overall_start_time = std::time::Instant::now();
        random_level.validate()?;
        let old_index = UnitIndex::new(old_units.to_vec())?;
        validate_draws(draws, &old_index, random_level)?;

        let partition = UnitPartition::new(new_units, &old_index);
        info!(
            "Predicting latent factors: {} draws, {} requested units ({} to predict, {} copied), {} old units, mode={}, spatial dimension={}, method={}",
            draws.len(),
            new_units.len(),
            partition.novel_count(),
            partition
                .sources
                .iter()
                .filter(|s| matches!(s, RowSource::Old(_)))
                .count(),
            old_index.len(),
            mode,
            random_level.spatial_dimension,
            random_level.spatial_method
        );

        let setup_start_time = std::time::Instant::now();
        let model = self.build_factor_model(&partition, &old_index, random_level, mode)?;
        debug!("Prepared conditioning geometry in {:?}", setup_start_time.elapsed());

        let context = DrawContext {
            config: &self.config,
            mode,
            partition: &partition,
            model: &model,
            support: &random_level.range_support,
            new_units,
            old_units: old_index.ids(),
        };

        let predictions: Vec<LoadingMatrix> = if self.config.parallel_draws {
            draws
                .par_iter()
                .enumerate()
                .map(|(draw_idx, draw)| context.predict_draw(draw_idx, draw))
                .collect::<Result<Vec<_>, PredictError>>()?
        } else {
            draws
                .iter()
                .enumerate()
                .map(|(draw_idx, draw)| context.predict_draw(draw_idx, draw))
                .collect::<Result<Vec<_>, PredictError>>()?
        };

        info!(
            "Latent-factor prediction for {} draws completed in {:?}",
            predictions.len(),
            overall_start_time.elapsed()
        );
        Ok(predictions)
    }

    fn build_factor_model(
        &self,
        partition: &UnitPartition,
        old_index: &UnitIndex,
        random_level: &RandomLevel,
        mode: PredictionMode,
    ) -> Result<FactorModel, PredictError> {
        if partition.novel_count() == 0 {
            return Ok(FactorModel::CopyOnly);
        }
        let spatial = match (&random_level.spatial_data, random_level.is_spatial()) {
            (Some(spatial), true) => spatial,
            _ => return Ok(FactorModel::Unstructured),
        };
        let old_rows = spatial.resolve(old_index.ids())?;
        let new_rows = spatial.resolve(&partition.novel)?;

        if mode != PredictionMode::JointSample {
            return Ok(FactorModel::Exact(ExactGeometry::new(spatial, &old_rows, &new_rows)));
        }

        let sampler = match random_level.spatial_method {
            SpatialMethod::Full => JointSampler::Full(FullRankSampler::new(spatial, &old_rows, &new_rows)),
            SpatialMethod::Nngp => {
                let requested = random_level.neighbor_count.ok_or_else(|| {
                    PredictError::Configuration("NNGP requires a neighbour count".to_string())
                })?;
                let k = requested.min(old_rows.len());
                if k < requested {
                    warn!(
                        "NNGP neighbour count {} exceeds the {} old units; using {}.",
                        requested,
                        old_rows.len(),
                        k
                    );
                }
                JointSampler::Nngp(NngpSampler::new(spatial, &old_rows, &new_rows, k))
            }
            SpatialMethod::Gpp => {
                let points = spatial.points().ok_or_else(|| {
                    PredictError::Configuration("GPP requires unit coordinates".to_string())
                })?;
                let knots = random_level.knots.as_ref().ok_or_else(|| {
                    PredictError::Configuration("GPP requires knot coordinates".to_string())
                })?;
                let old_points = points.select(Axis(0), &old_rows);
                let new_points = points.select(Axis(0), &new_rows);
                JointSampler::Gpp(PredictiveProcessSampler::new(
                    old_points.view(),
                    new_points.view(),
                    knots.view(),
                ))
            }
        };
        Ok(FactorModel::Joint(sampler))
    }
}

fn validate_draws(
    draws: &[PosteriorDraw],
    old_index: &UnitIndex,
    random_level: &RandomLevel,
) -> Result<(), PredictError> {
    for (draw_idx, draw) in draws.iter().enumerate() {
        if draw.loadings.nrows() != old_index.len() {
            return Err(PredictError::DimensionMismatch {
                draw: Some(draw_idx),
                what: "loadings row count",
                expected: old_index.len(),
                found: draw.loadings.nrows(),
            });
        }
        if draw.range_assignment.len() != draw.factor_count() {
            return Err(PredictError::DimensionMismatch {
                draw: Some(draw_idx),
                what: "range assignment length",
                expected: draw.factor_count(),
                found: draw.range_assignment.len(),
            });
        }
        if random_level.is_spatial() {
            let support_len = random_level.range_support.len();
            if let Some((factor, &index)) = draw
                .range_assignment
                .iter()
                .enumerate()
                .find(|(_, &index)| index >= support_len)
            {
                return Err(PredictError::RangeIndexOutOfBounds {
                    draw: draw_idx,
                    factor,
                    index,
                    support_len,
                });
            }
        }
    }
    Ok(())
}

impl DrawContext<'_> {
    fn predict_draw(&self, draw_idx: usize, draw: &PosteriorDraw) -> Result<LoadingMatrix, PredictError> {
        let draw_start_time = std::time::Instant::now();
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.random_seed);
        rng.set_stream(draw_idx as u64);

        let n_factors = draw.factor_count();
        let n_novel = self.partition.novel_count();
        let mut novel_values = Array2::<f64>::zeros((n_novel, n_factors));
        if n_novel > 0 {
            for factor in 0..n_factors {
                let column = self
                    .predict_factor(draw, factor, &mut rng)
                    .map_err(|failure| self.instability(draw_idx, factor, failure))?;
                novel_values.column_mut(factor).assign(&column);
            }
        }

        let values = Array2::from_shape_fn((self.new_units.len(), n_factors), |(i, h)| {
            match self.partition.sources[i] {
                RowSource::Old(row) => draw.loadings[[row, h]],
                RowSource::Predicted(row) => novel_values[[row, h]],
            }
        });
        debug!(
            "Draw {}: {} factors for {} units in {:?}",
            draw_idx,
            n_factors,
            self.new_units.len(),
            draw_start_time.elapsed()
        );
        Ok(LoadingMatrix {
            units: self.new_units.to_vec(),
            values,
        })
    }

    fn predict_factor(
        &self,
        draw: &PosteriorDraw,
        factor: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<Array1<f64>, FactorFailure> {
        let n_novel = self.partition.novel_count();
        let values = draw.loadings.column(factor);
        let length_scale = match self.model {
            FactorModel::CopyOnly => return Ok(Array1::zeros(0)),
            FactorModel::Unstructured => return Ok(self.prior_column(n_novel, rng)),
            FactorModel::Exact(_) | FactorModel::Joint(_) => {
                // Bounds were checked in `validate_draws`.
                self.support
                    .length_scale(draw.range_assignment[factor])
                    .unwrap_or(0.0)
            }
        };
        if length_scale <= 0.0 {
            trace!("Factor {} has no spatial correlation in this draw.", factor);
            return Ok(self.prior_column(n_novel, rng));
        }
        trace!("Factor {} with length scale {:.4}", factor, length_scale);

        let jitter = self.config.cholesky_jitter;
        let tolerance = self.config.variance_tolerance;
        match self.model {
            FactorModel::Exact(exact) => {
                let whitened = exact.whiten(values, length_scale, jitter)?;
                let mean = whitened.mean();
                if self.mode == PredictionMode::ConditionalMean {
                    return Ok(mean);
                }
                let mut variance = whitened.marginal_variance();
                let clamped = clamp_variances(&mut variance, tolerance);
                if clamped > 0 {
                    warn!(
                        "Mean-field: {} conditional variances for factor {} were below -{:e} and were clamped to zero.",
                        clamped, factor, tolerance
                    );
                }
                let z = standard_normals(rng, n_novel);
                Ok(mean + &(variance.mapv(f64::sqrt) * z))
            }
            FactorModel::Joint(JointSampler::Full(sampler)) => {
                sampler.sample(values, length_scale, jitter, rng)
            }
            FactorModel::Joint(JointSampler::Nngp(sampler)) => {
                sampler.sample(values, length_scale, jitter, tolerance, rng)
            }
            FactorModel::Joint(JointSampler::Gpp(sampler)) => {
                sampler.sample(values, length_scale, jitter, tolerance, rng)
            }
            FactorModel::CopyOnly | FactorModel::Unstructured => Ok(self.prior_column(n_novel, rng)),
        }
    }

    /// Prior of a factor without spatial correlation: zero mean, unit variance.
    fn prior_column(&self, n: usize, rng: &mut ChaCha8Rng) -> Array1<f64> {
        match self.mode {
            PredictionMode::ConditionalMean => Array1::zeros(n),
            PredictionMode::MeanField | PredictionMode::JointSample => standard_normals(rng, n),
        }
    }

    fn instability(&self, draw: usize, factor: usize, failure: FactorFailure) -> PredictError {
        let units = match (failure.new_unit, failure.old_unit) {
            (Some(i), _) => vec![self.partition.novel[i].clone()],
            (None, Some(i)) => vec![self.old_units[i].clone()],
            (None, None) => self.partition.novel.clone(),
        };
        PredictError::NumericalInstability {
            draw,
            factor,
            stage: failure.stage,
            units,
            reason: failure.reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<UnitId> {
        names.iter().map(|n| UnitId::from(*n)).collect()
    }

    #[test]
    fn failures_are_attributed_to_the_unit_that_caused_them() {
        let config = PredictorConfig::default();
        let old_index = UnitIndex::new(labels(&["a", "b", "c"])).unwrap();
        let requested = labels(&["b", "x", "y"]);
        let partition = UnitPartition::new(&requested, &old_index);
        let support = RangeParameterSupport::from_length_scales(&[1.0]);
        let context = DrawContext {
            config: &config,
            mode: PredictionMode::JointSample,
            partition: &partition,
            model: &FactorModel::Unstructured,
            support: &support,
            new_units: &requested,
            old_units: old_index.ids(),
        };

        let units_of = |failure: FactorFailure| match context.instability(4, 2, failure) {
            PredictError::NumericalInstability { draw, factor, units, .. } => {
                assert_eq!((draw, factor), (4, 2));
                units
            }
            other => panic!("unexpected error {:?}", other),
        };
        assert_eq!(
            units_of(FactorFailure::new("old-unit predictive-process nugget", "negative").at_old_unit(2)),
            labels(&["c"])
        );
        assert_eq!(
            units_of(FactorFailure::new("Cholesky of neighbour kernel", "singular").at_unit(1)),
            labels(&["y"])
        );
        assert_eq!(
            units_of(FactorFailure::new("Cholesky of old-unit kernel", "singular")),
            labels(&["x", "y"])
        );
    }
}
