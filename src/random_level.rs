// src/random_level.rs

use crate::error::PredictError;
use crate::kernel::euclidean;
use crate::units::{UnitId, UnitIndex};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Asymmetry allowed between `d[i,j]` and `d[j,i]` in a supplied distance matrix.
const DISTANCE_SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Approximation used when drawing joint samples at new units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpatialMethod {
    /// Exact conditioning on all old units.
    Full,
    /// Nearest-neighbour Gaussian process.
    #[serde(rename = "NNGP")]
    Nngp,
    /// Knot-based Gaussian predictive process.
    #[serde(rename = "GPP")]
    Gpp,
}

impl FromStr for SpatialMethod {
    type Err = PredictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(SpatialMethod::Full),
            "nngp" => Ok(SpatialMethod::Nngp),
            "gpp" => Ok(SpatialMethod::Gpp),
            _ => Err(PredictError::Configuration(format!(
                "unknown spatial method '{}', expected one of Full, NNGP, GPP",
                s
            ))),
        }
    }
}

impl fmt::Display for SpatialMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SpatialMethod::Full => "Full",
            SpatialMethod::Nngp => "NNGP",
            SpatialMethod::Gpp => "GPP",
        })
    }
}

/// One grid point of the range-parameter prior.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeParameter {
    /// Length scale of the exponential kernel. Values `<= 0` mean the factor
    /// carries no spatial correlation.
    pub length_scale: f64,
    /// Prior probability of this grid point. Not used for prediction.
    pub prior_weight: f64,
}

/// Enumerated support of the range parameter. Posterior draws refer to its
/// entries by 0-based index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeParameterSupport {
    entries: Vec<RangeParameter>,
}

impl RangeParameterSupport {
    pub fn new(entries: Vec<RangeParameter>) -> Self {
        Self { entries }
    }

    /// Support with equal prior weight on every length scale.
    pub fn from_length_scales(length_scales: &[f64]) -> Self {
        let weight = if length_scales.is_empty() {
            0.0
        } else {
            1.0 / length_scales.len() as f64
        };
        Self {
            entries: length_scales
                .iter()
                .map(|&length_scale| RangeParameter {
                    length_scale,
                    prior_weight: weight,
                })
                .collect(),
        }
    }

    /// The default HMSC grid: length scales `max_distance * i / steps` for
    /// `i = 0..=steps`, half of the prior mass on the zero (non-spatial) entry
    /// and the rest spread evenly.
    pub fn default_grid(max_distance: f64, steps: usize) -> Result<Self, PredictError> {
        if steps == 0 {
            return Err(PredictError::Configuration(
                "range-parameter grid needs at least one step".to_string(),
            ));
        }
        if !max_distance.is_finite() || max_distance <= 0.0 {
            return Err(PredictError::Configuration(format!(
                "range-parameter grid needs a positive finite maximum distance, got {}",
                max_distance
            )));
        }
        let entries = (0..=steps)
            .map(|i| RangeParameter {
                length_scale: max_distance * i as f64 / steps as f64,
                prior_weight: if i == 0 { 0.5 } else { 0.5 / steps as f64 },
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RangeParameter] {
        &self.entries
    }

    pub fn length_scale(&self, index: usize) -> Option<f64> {
        self.entries.get(index).map(|e| e.length_scale)
    }
}

/// Geometry of the units of a random level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SpatialData {
    /// One row of coordinates per unit.
    Coordinates { units: UnitIndex, points: Array2<f64> },
    /// Precomputed distances, for structures that are not Euclidean.
    DistanceMatrix { units: UnitIndex, distances: Array2<f64> },
}

impl SpatialData {
    pub fn coordinates(units: Vec<UnitId>, points: Array2<f64>) -> Result<Self, PredictError> {
        Ok(SpatialData::Coordinates {
            units: UnitIndex::new(units)?,
            points,
        })
    }

    pub fn distance_matrix(units: Vec<UnitId>, distances: Array2<f64>) -> Result<Self, PredictError> {
        Ok(SpatialData::DistanceMatrix {
            units: UnitIndex::new(units)?,
            distances,
        })
    }

    pub fn units(&self) -> &UnitIndex {
        match self {
            SpatialData::Coordinates { units, .. } | SpatialData::DistanceMatrix { units, .. } => units,
        }
    }

    /// Name used in `MissingCoordinate` errors.
    pub(crate) fn source_kind(&self) -> &'static str {
        match self {
            SpatialData::Coordinates { .. } => "coordinate table",
            SpatialData::DistanceMatrix { .. } => "distance matrix",
        }
    }

    pub fn points(&self) -> Option<ArrayView2<'_, f64>> {
        match self {
            SpatialData::Coordinates { points, .. } => Some(points.view()),
            SpatialData::DistanceMatrix { .. } => None,
        }
    }

    /// Resolves unit labels to rows of this table.
    pub(crate) fn resolve(&self, ids: &[UnitId]) -> Result<Vec<usize>, PredictError> {
        self.units().resolve_all(ids, self.source_kind())
    }

    /// Distance between two resolved rows.
    #[inline]
    pub(crate) fn distance(&self, a: usize, b: usize) -> f64 {
        match self {
            SpatialData::Coordinates { points, .. } => euclidean(points.row(a), points.row(b)),
            SpatialData::DistanceMatrix { distances, .. } => distances[[a, b]],
        }
    }

    /// Distances between resolved rows. Shape: (rows, cols).
    pub(crate) fn distances_between(&self, rows: &[usize], cols: &[usize]) -> Array2<f64> {
        Array2::from_shape_fn((rows.len(), cols.len()), |(i, j)| {
            self.distance(rows[i], cols[j])
        })
    }

    fn validate(&self, spatial_dimension: usize) -> Result<(), PredictError> {
        match self {
            SpatialData::Coordinates { units, points } => {
                if points.nrows() != units.len() {
                    return Err(PredictError::DimensionMismatch {
                        draw: None,
                        what: "coordinate row count",
                        expected: units.len(),
                        found: points.nrows(),
                    });
                }
                if points.ncols() != spatial_dimension {
                    return Err(PredictError::DimensionMismatch {
                        draw: None,
                        what: "coordinate dimension",
                        expected: spatial_dimension,
                        found: points.ncols(),
                    });
                }
                if let Some((row, _)) = points
                    .rows()
                    .into_iter()
                    .enumerate()
                    .find(|(_, r)| r.iter().any(|v| !v.is_finite()))
                {
                    return Err(PredictError::Configuration(format!(
                        "coordinates of unit '{}' are not finite",
                        units.ids()[row]
                    )));
                }
            }
            SpatialData::DistanceMatrix { units, distances } => {
                let n = units.len();
                if distances.nrows() != n || distances.ncols() != n {
                    return Err(PredictError::Configuration(format!(
                        "distance matrix must be {}x{} to match its unit list, got {}x{}",
                        n,
                        n,
                        distances.nrows(),
                        distances.ncols()
                    )));
                }
                for i in 0..n {
                    for j in 0..n {
                        let d = distances[[i, j]];
                        if !d.is_finite() || d < 0.0 {
                            return Err(PredictError::Configuration(format!(
                                "distance between '{}' and '{}' must be finite and non-negative, got {}",
                                units.ids()[i],
                                units.ids()[j],
                                d
                            )));
                        }
                        if (d - distances[[j, i]]).abs() > DISTANCE_SYMMETRY_TOLERANCE {
                            return Err(PredictError::Configuration(format!(
                                "distance matrix is not symmetric at ('{}', '{}')",
                                units.ids()[i],
                                units.ids()[j]
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Structure of one random level of latent factors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RandomLevel {
    /// 0 for unstructured (i.i.d.) factors.
    pub spatial_dimension: usize,
    pub spatial_data: Option<SpatialData>,
    pub spatial_method: SpatialMethod,
    pub range_support: RangeParameterSupport,
    /// Neighbours per new unit, `Nngp` only.
    pub neighbor_count: Option<usize>,
    /// Knot coordinates (knots × spatial dimension), `Gpp` only.
    pub knots: Option<Array2<f64>>,
}

impl RandomLevel {
    /// A level without spatial or temporal structure.
    pub fn unstructured() -> Self {
        Self {
            spatial_dimension: 0,
            spatial_data: None,
            spatial_method: SpatialMethod::Full,
            range_support: RangeParameterSupport::new(Vec::new()),
            neighbor_count: None,
            knots: None,
        }
    }

    /// A spatial level. The spatial dimension is taken from the coordinates,
    /// or is 1 for a distance matrix.
    pub fn spatial(
        spatial_data: SpatialData,
        spatial_method: SpatialMethod,
        range_support: RangeParameterSupport,
    ) -> Self {
        let spatial_dimension = match &spatial_data {
            SpatialData::Coordinates { points, .. } => points.ncols().max(1),
            SpatialData::DistanceMatrix { .. } => 1,
        };
        Self {
            spatial_dimension,
            spatial_data: Some(spatial_data),
            spatial_method,
            range_support,
            neighbor_count: None,
            knots: None,
        }
    }

    pub fn with_neighbor_count(mut self, neighbor_count: usize) -> Self {
        self.neighbor_count = Some(neighbor_count);
        self
    }

    pub fn with_knots(mut self, knots: Array2<f64>) -> Self {
        self.knots = Some(knots);
        self
    }

    pub fn is_spatial(&self) -> bool {
        self.spatial_dimension > 0
    }

    /// Checks internal consistency. `predict` calls this before any draw is
    /// touched, so configurations arriving through serde are covered too.
    pub fn validate(&self) -> Result<(), PredictError> {
        if !self.is_spatial() {
            return Ok(());
        }
        let spatial_data = self.spatial_data.as_ref().ok_or_else(|| {
            PredictError::Configuration(format!(
                "spatial dimension is {} but neither coordinates nor a distance matrix were given",
                self.spatial_dimension
            ))
        })?;
        spatial_data.validate(self.spatial_dimension)?;

        if self.range_support.is_empty() {
            return Err(PredictError::Configuration(
                "range-parameter support is empty".to_string(),
            ));
        }
        if let Some(bad) = self
            .range_support
            .entries()
            .iter()
            .find(|e| !e.length_scale.is_finite())
        {
            return Err(PredictError::Configuration(format!(
                "range-parameter length scale {} is not finite",
                bad.length_scale
            )));
        }

        match self.spatial_method {
            SpatialMethod::Full => {}
            SpatialMethod::Nngp => match self.neighbor_count {
                None => {
                    return Err(PredictError::Configuration(
                        "NNGP requires a neighbour count".to_string(),
                    ))
                }
                Some(0) => {
                    return Err(PredictError::Configuration(
                        "NNGP neighbour count must be at least 1".to_string(),
                    ))
                }
                Some(_) => {}
            },
            SpatialMethod::Gpp => {
                if spatial_data.points().is_none() {
                    return Err(PredictError::Configuration(
                        "GPP requires unit coordinates; a distance matrix cannot be related to knots"
                            .to_string(),
                    ));
                }
                let knots = self.knots.as_ref().ok_or_else(|| {
                    PredictError::Configuration("GPP requires knot coordinates".to_string())
                })?;
                if knots.nrows() == 0 {
                    return Err(PredictError::Configuration(
                        "GPP requires at least one knot".to_string(),
                    ));
                }
                if knots.ncols() != self.spatial_dimension {
                    return Err(PredictError::DimensionMismatch {
                        draw: None,
                        what: "knot dimension",
                        expected: self.spatial_dimension,
                        found: knots.ncols(),
                    });
                }
                if knots.iter().any(|v| !v.is_finite()) {
                    return Err(PredictError::Configuration(
                        "knot coordinates must be finite".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn line_units(n: usize) -> Vec<UnitId> {
        (0..n).map(UnitId::from).collect()
    }

    #[test]
    fn spatial_method_parses_case_insensitively() {
        assert_eq!("NNGP".parse::<SpatialMethod>().unwrap(), SpatialMethod::Nngp);
        assert_eq!(" gpp ".parse::<SpatialMethod>().unwrap(), SpatialMethod::Gpp);
        assert_eq!("Full".parse::<SpatialMethod>().unwrap(), SpatialMethod::Full);
        assert!(matches!(
            "kriging".parse::<SpatialMethod>(),
            Err(PredictError::Configuration(_))
        ));
    }

    #[test]
    fn default_grid_matches_hmsc_layout() {
        let grid = RangeParameterSupport::default_grid(10.0, 100).unwrap();
        assert_eq!(grid.len(), 101);
        assert_eq!(grid.length_scale(0), Some(0.0));
        assert!((grid.length_scale(100).unwrap() - 10.0).abs() < 1e-12);
        assert!((grid.length_scale(50).unwrap() - 5.0).abs() < 1e-12);
        let total: f64 = grid.entries().iter().map(|e| e.prior_weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(grid.entries()[0].prior_weight, 0.5);
        assert!(RangeParameterSupport::default_grid(0.0, 10).is_err());
        assert!(RangeParameterSupport::default_grid(1.0, 0).is_err());
    }

    #[test]
    fn coordinates_with_wrong_dimension_are_rejected() {
        let data = SpatialData::coordinates(line_units(2), array![[0.0, 1.0], [1.0, 2.0]]).unwrap();
        let mut level = RandomLevel::spatial(
            data,
            SpatialMethod::Full,
            RangeParameterSupport::from_length_scales(&[1.0]),
        );
        assert!(level.validate().is_ok());
        level.spatial_dimension = 3;
        assert!(matches!(
            level.validate(),
            Err(PredictError::DimensionMismatch { what: "coordinate dimension", .. })
        ));
    }

    #[test]
    fn nngp_without_neighbours_and_gpp_without_knots_fail() {
        let data = SpatialData::coordinates(line_units(3), array![[0.0], [1.0], [2.0]]).unwrap();
        let support = RangeParameterSupport::from_length_scales(&[1.0]);
        let nngp = RandomLevel::spatial(data.clone(), SpatialMethod::Nngp, support.clone());
        assert!(matches!(nngp.validate(), Err(PredictError::Configuration(_))));
        assert!(nngp.clone().with_neighbor_count(0).validate().is_err());
        assert!(nngp.with_neighbor_count(2).validate().is_ok());

        let gpp = RandomLevel::spatial(data, SpatialMethod::Gpp, support);
        assert!(matches!(gpp.validate(), Err(PredictError::Configuration(_))));
        assert!(gpp.clone().with_knots(array![[0.5, 0.5]]).validate().is_err());
        assert!(gpp.with_knots(array![[0.5], [1.5]]).validate().is_ok());
    }

    #[test]
    fn gpp_on_distance_matrix_is_a_configuration_error() {
        let d = array![[0.0, 1.0], [1.0, 0.0]];
        let data = SpatialData::distance_matrix(line_units(2), d).unwrap();
        let level = RandomLevel::spatial(
            data,
            SpatialMethod::Gpp,
            RangeParameterSupport::from_length_scales(&[1.0]),
        )
        .with_knots(array![[0.0]]);
        assert!(matches!(level.validate(), Err(PredictError::Configuration(_))));
    }

    #[test]
    fn asymmetric_distance_matrix_is_rejected() {
        let d = array![[0.0, 1.0], [2.0, 0.0]];
        let data = SpatialData::distance_matrix(line_units(2), d).unwrap();
        let level = RandomLevel::spatial(
            data,
            SpatialMethod::Full,
            RangeParameterSupport::from_length_scales(&[1.0]),
        );
        assert!(matches!(level.validate(), Err(PredictError::Configuration(_))));
    }

    #[test]
    fn spatial_level_without_geometry_is_rejected() {
        let mut level = RandomLevel::unstructured();
        assert!(level.validate().is_ok());
        level.spatial_dimension = 2;
        assert!(matches!(level.validate(), Err(PredictError::Configuration(_))));
    }

    #[test]
    fn distances_between_use_resolved_rows() {
        let data = SpatialData::coordinates(
            vec![UnitId::from("a"), UnitId::from("b"), UnitId::from("c")],
            array![[0.0, 0.0], [3.0, 4.0], [6.0, 8.0]],
        )
        .unwrap();
        let rows = data.resolve(&[UnitId::from("c"), UnitId::from("a")]).unwrap();
        assert_eq!(rows, vec![2, 0]);
        let d = data.distances_between(&rows, &[1]);
        assert!((d[[0, 0]] - 5.0).abs() < 1e-12);
        assert!((d[[1, 0]] - 5.0).abs() < 1e-12);
        assert!(matches!(
            data.resolve(&[UnitId::from("zz")]),
            Err(PredictError::MissingCoordinate { .. })
        ));
    }

    #[test]
    fn random_level_round_trips_through_json() {
        let data = SpatialData::coordinates(line_units(2), array![[0.0], [1.0]]).unwrap();
        let level = RandomLevel::spatial(
            data,
            SpatialMethod::Nngp,
            RangeParameterSupport::default_grid(1.0, 4).unwrap(),
        )
        .with_neighbor_count(1);
        let json = serde_json::to_string(&level).unwrap();
        assert!(json.contains("\"NNGP\""));
        let back: RandomLevel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, level);
    }
}
