// src/units.rs

use crate::error::PredictError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Opaque label of a sampling unit (a site, a plot, a time point or a group).
///
/// Serialized untagged, so JSON carries plain numbers or strings.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnitId {
    Index(i64),
    Name(String),
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitId::Index(i) => write!(f, "{}", i),
            UnitId::Name(s) => f.write_str(s),
        }
    }
}

impl From<&str> for UnitId {
    fn from(value: &str) -> Self {
        UnitId::Name(value.to_owned())
    }
}

impl From<String> for UnitId {
    fn from(value: String) -> Self {
        UnitId::Name(value)
    }
}

impl From<i64> for UnitId {
    fn from(value: i64) -> Self {
        UnitId::Index(value)
    }
}

impl From<i32> for UnitId {
    fn from(value: i32) -> Self {
        UnitId::Index(value as i64)
    }
}

impl From<usize> for UnitId {
    fn from(value: usize) -> Self {
        UnitId::Index(value as i64)
    }
}

/// Ordered list of unique unit labels with a label-to-row lookup.
///
/// Row `i` of any matrix aligned with this index belongs to `ids()[i]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<UnitId>", into = "Vec<UnitId>")]
pub struct UnitIndex {
    ids: Vec<UnitId>,
    rows: HashMap<UnitId, usize>,
}

impl UnitIndex {
    /// Builds the index, rejecting duplicate labels.
    pub fn new(ids: Vec<UnitId>) -> Result<Self, PredictError> {
        let mut rows = HashMap::with_capacity(ids.len());
        for (row, id) in ids.iter().enumerate() {
            if rows.insert(id.clone(), row).is_some() {
                return Err(PredictError::Configuration(format!(
                    "unit '{}' appears more than once in a unit table",
                    id
                )));
            }
        }
        Ok(Self { ids, rows })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[UnitId] {
        &self.ids
    }

    pub fn row_of(&self, id: &UnitId) -> Option<usize> {
        self.rows.get(id).copied()
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.rows.contains_key(id)
    }

    /// Resolves every label to its row, naming `source_kind` in the error of
    /// the first label that is absent.
    pub(crate) fn resolve_all(
        &self,
        ids: &[UnitId],
        source_kind: &'static str,
    ) -> Result<Vec<usize>, PredictError> {
        ids.iter()
            .map(|id| {
                self.row_of(id).ok_or_else(|| PredictError::MissingCoordinate {
                    unit: id.clone(),
                    source_kind,
                })
            })
            .collect()
    }
}

impl TryFrom<Vec<UnitId>> for UnitIndex {
    type Error = PredictError;

    fn try_from(ids: Vec<UnitId>) -> Result<Self, Self::Error> {
        UnitIndex::new(ids)
    }
}

impl From<UnitIndex> for Vec<UnitId> {
    fn from(index: UnitIndex) -> Self {
        index.ids
    }
}

/// Where each requested new unit gets its value from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RowSource {
    /// Copy row `r` of the draw's loadings.
    Old(usize),
    /// Take row `r` of the prediction for the distinct genuinely-new units.
    Predicted(usize),
}

/// Split of the requested new units into copies of old units and units that
/// need prediction. Repeated new labels share one predicted row.
#[derive(Clone, Debug)]
pub(crate) struct UnitPartition {
    pub sources: Vec<RowSource>,
    /// Distinct genuinely-new labels, in order of first appearance.
    pub novel: Vec<UnitId>,
}

impl UnitPartition {
    pub(crate) fn new(new_units: &[UnitId], old_units: &UnitIndex) -> Self {
        let mut novel = Vec::new();
        let mut novel_rows: HashMap<&UnitId, usize> = HashMap::new();
        let sources = new_units
            .iter()
            .map(|id| match old_units.row_of(id) {
                Some(row) => RowSource::Old(row),
                None => {
                    let next = novel_rows.len();
                    let row = *novel_rows.entry(id).or_insert_with(|| {
                        novel.push(id.clone());
                        next
                    });
                    RowSource::Predicted(row)
                }
            })
            .collect();
        Self { sources, novel }
    }

    pub(crate) fn novel_count(&self) -> usize {
        self.novel.len()
    }
}
