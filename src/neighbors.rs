// src/neighbors.rs

use crate::random_level::SpatialData;
use rayon::prelude::*;
use std::cmp::Ordering;

/// The `k` nearest old units of every new unit.
///
/// Ties in distance are broken by the position of the old unit in the
/// old-unit list, so the index is deterministic.
#[derive(Debug, Clone)]
pub(crate) struct NeighborIndex {
    /// `neighbors[i]`: positions (into the old-unit list) of the neighbours of
    /// new unit `i`, nearest first.
    neighbors: Vec<Vec<usize>>,
    /// `distances[i][j]`: distance from new unit `i` to `neighbors[i][j]`.
    distances: Vec<Vec<f64>>,
}

impl NeighborIndex {
    /// `old_rows` and `new_rows` are rows of `spatial`, already resolved from
    /// unit labels. `k` must not exceed `old_rows.len()`.
    pub(crate) fn build(spatial: &SpatialData, old_rows: &[usize], new_rows: &[usize], k: usize) -> Self {
        let (neighbors, distances) = new_rows
            .par_iter()
            .map(|&new_row| {
                let mut candidates: Vec<(f64, usize)> = old_rows
                    .iter()
                    .enumerate()
                    .map(|(pos, &old_row)| (spatial.distance(new_row, old_row), pos))
                    .collect();
                if k < candidates.len() {
                    candidates.select_nth_unstable_by(k, compare_candidates);
                    candidates.truncate(k);
                }
                candidates.sort_unstable_by(compare_candidates);
                candidates.into_iter().map(|(d, pos)| (pos, d)).unzip::<_, _, Vec<_>, Vec<_>>()
            })
            .unzip();
        Self { neighbors, distances }
    }

    pub(crate) fn neighbors_of(&self, new_unit: usize) -> &[usize] {
        &self.neighbors[new_unit]
    }

    pub(crate) fn distances_of(&self, new_unit: usize) -> &[f64] {
        &self.distances[new_unit]
    }

    pub(crate) fn len(&self) -> usize {
        self.neighbors.len()
    }
}

fn compare_candidates(a: &(f64, usize), b: &(f64, usize)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::UnitId;
    use ndarray::array;

    fn line(points: &[f64]) -> SpatialData {
        let units = (0..points.len()).map(UnitId::from).collect();
        let coords = ndarray::Array2::from_shape_vec((points.len(), 1), points.to_vec()).unwrap();
        SpatialData::coordinates(units, coords).unwrap()
    }

    #[test]
    fn finds_nearest_in_order() {
        // old units at rows 0..4, new unit at row 5 (x = 2.4)
        let data = line(&[0.0, 1.0, 2.0, 3.0, 10.0, 2.4]);
        let index = NeighborIndex::build(&data, &[0, 1, 2, 3, 4], &[5], 3);
        assert_eq!(index.len(), 1);
        assert_eq!(index.neighbors_of(0), &[2, 3, 1]);
        let d = index.distances_of(0);
        assert!((d[0] - 0.4).abs() < 1e-12);
        assert!((d[1] - 0.6).abs() < 1e-12);
        assert!((d[2] - 1.4).abs() < 1e-12);
    }

    #[test]
    fn ties_prefer_earlier_old_units() {
        let data = line(&[-1.0, 1.0, 5.0, 0.0]);
        let index = NeighborIndex::build(&data, &[0, 1, 2], &[3], 1);
        assert_eq!(index.neighbors_of(0), &[0]);
        // Reordering the old units flips the winner.
        let index = NeighborIndex::build(&data, &[1, 0, 2], &[3], 1);
        assert_eq!(index.neighbors_of(0), &[0]);
        assert_eq!(index.distances_of(0), &[1.0]);
    }

    #[test]
    fn full_neighbourhood_returns_every_old_unit() {
        let data = line(&[0.0, 1.0, 2.0, 0.7]);
        let index = NeighborIndex::build(&data, &[0, 1, 2], &[3], 3);
        let mut all = index.neighbors_of(0).to_vec();
        all.sort();
        assert_eq!(all, vec![0, 1, 2]);
    }

    #[test]
    fn works_on_distance_matrix() {
        let units = (0..3).map(UnitId::from).collect();
        let d = array![[0.0, 4.0, 1.0], [4.0, 0.0, 2.0], [1.0, 2.0, 0.0]];
        let data = SpatialData::distance_matrix(units, d).unwrap();
        let index = NeighborIndex::build(&data, &[0, 1], &[2], 1);
        assert_eq!(index.neighbors_of(0), &[0]);
        assert_eq!(index.distances_of(0), &[1.0]);
    }
}
