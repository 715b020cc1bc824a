// src/nngp.rs

use crate::cholesky::CholeskyFactor;
use crate::conditioning::{clamp_variances, standard_normals};
use crate::error::FactorFailure;
use crate::kernel::{exponential_correlation, exponential_kernel};
use crate::neighbors::NeighborIndex;
use crate::random_level::SpatialData;
use log::warn;
use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;

/// Nearest-neighbour Gaussian-process sampler.
///
/// Each new unit is conditioned only on its `k` nearest old units, so a
/// factor costs O(new · k³) and correlations between new units are dropped.
#[derive(Debug, Clone)]
pub(crate) struct NngpSampler {
    index: NeighborIndex,
    /// Distances among the neighbours of each new unit (k × k).
    blocks: Vec<Array2<f64>>,
}

/// Sparse (new × old) operator `B` and per-unit conditional variances `F`
/// for one length scale.
#[derive(Debug, Clone)]
pub(crate) struct NeighborWeights {
    /// Row `i` of `B`, aligned with the neighbour list of new unit `i`.
    weights: Vec<Array1<f64>>,
    /// `F`, clamped at zero.
    pub variances: Array1<f64>,
    /// Entries of `F` that were below `-tolerance` before clamping.
    pub clamped: usize,
}

impl NngpSampler {
    pub(crate) fn new(spatial: &SpatialData, old_rows: &[usize], new_rows: &[usize], k: usize) -> Self {
        let index = NeighborIndex::build(spatial, old_rows, new_rows, k);
        let blocks = (0..index.len())
            .map(|i| {
                let rows: Vec<usize> = index.neighbors_of(i).iter().map(|&p| old_rows[p]).collect();
                spatial.distances_between(&rows, &rows)
            })
            .collect();
        Self { index, blocks }
    }

    /// Builds `B` and `F` for `length_scale`.
    pub(crate) fn weights(
        &self,
        length_scale: f64,
        jitter: f64,
        variance_tolerance: f64,
    ) -> Result<NeighborWeights, FactorFailure> {
        let mut weights = Vec::with_capacity(self.blocks.len());
        let mut variances = Array1::<f64>::zeros(self.blocks.len());
        for (i, block) in self.blocks.iter().enumerate() {
            let k11 = exponential_kernel(block.view(), length_scale);
            let k12: Array1<f64> = self
                .index
                .distances_of(i)
                .iter()
                .map(|&d| exponential_correlation(d, length_scale))
                .collect();
            let chol = CholeskyFactor::new(k11.view(), jitter, "Cholesky of neighbour kernel")
                .map_err(|e| e.at_unit(i))?;
            let b = chol.solve_vec(k12.view()).map_err(|e| e.at_unit(i))?;
            variances[i] = 1.0 - b.dot(&k12);
            weights.push(b);
        }
        let clamped = clamp_variances(&mut variances, variance_tolerance);
        Ok(NeighborWeights {
            weights,
            variances,
            clamped,
        })
    }

    /// `B η`
    pub(crate) fn apply(&self, weights: &NeighborWeights, values: ArrayView1<f64>) -> Array1<f64> {
        Array1::from_shape_fn(weights.weights.len(), |i| {
            self.index
                .neighbors_of(i)
                .iter()
                .zip(weights.weights[i].iter())
                .map(|(&pos, &w)| w * values[pos])
                .sum()
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
        let weights = self.weights(length_scale, jitter, variance_tolerance)?;
        if weights.clamped > 0 {
            warn!(
                "NNGP: {} neighbourhood conditional variances were below -{:e} and were clamped to zero.",
                weights.clamped, variance_tolerance
            );
        }
        let mean = self.apply(&weights, values);
        let z = standard_normals(rng, mean.len());
        Ok(mean + &(weights.variances.mapv(f64::sqrt) * z))
    }
}
