// src/error.rs

use crate::units::UnitId;
use thiserror::Error;

/// Errors surfaced by a prediction call.
///
/// A failing draw fails the whole call; no partial output is returned.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("conditional-mean and mean-field prediction cannot be requested at the same time")]
    InvalidMode,

    #[error("unit '{unit}' has no entry in the {source_kind}")]
    MissingCoordinate {
        unit: UnitId,
        source_kind: &'static str,
    },

    #[error(
        "numerical instability in draw {draw}, factor {factor} during {stage} (units: {}): {reason}",
        format_units(.units)
    )]
    NumericalInstability {
        draw: usize,
        factor: usize,
        stage: &'static str,
        units: Vec<UnitId>,
        reason: String,
    },

    #[error("invalid random-level configuration: {0}")]
    Configuration(String),

    #[error("{what} mismatch{}: expected {expected}, found {found}", draw_suffix(.draw))]
    DimensionMismatch {
        draw: Option<usize>,
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "draw {draw}, factor {factor}: range-parameter index {index} is outside the support table of length {support_len}"
    )]
    RangeIndexOutOfBounds {
        draw: usize,
        factor: usize,
        index: usize,
        support_len: usize,
    },
}

/// Failure of a single factor computation before the predictor attaches the
/// draw, factor and unit labels.
#[derive(Debug, Clone)]
pub(crate) struct FactorFailure {
    pub stage: &'static str,
    /// Position of the offending unit among the genuinely-new units, when the
    /// failure is local to one unit (NNGP neighbourhoods).
    pub new_unit: Option<usize>,
    /// Position of the offending unit among the old units.
    pub old_unit: Option<usize>,
    pub reason: String,
}

impl FactorFailure {
    pub(crate) fn new(stage: &'static str, reason: impl ToString) -> Self {
        Self {
            stage,
            new_unit: None,
            old_unit: None,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn at_unit(mut self, new_unit: usize) -> Self {
        self.new_unit = Some(new_unit);
        self
    }

    pub(crate) fn at_old_unit(mut self, old_unit: usize) -> Self {
        self.old_unit = Some(old_unit);
        self
    }
}

const MAX_LISTED_UNITS: usize = 8;

fn format_units(units: &[UnitId]) -> String {
    let listed: Vec<String> = units
        .iter()
        .take(MAX_LISTED_UNITS)
        .map(|u| u.to_string())
        .collect();
    if units.len() > MAX_LISTED_UNITS {
        format!(
            "{}, ... ({} in total)",
            listed.join(", "),
            units.len()
        )
    } else {
        listed.join(", ")
    }
}

fn draw_suffix(draw: &Option<usize>) -> String {
    match draw {
        Some(d) => format!(" in draw {}", d),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instability_message_names_draw_factor_and_units() {
        let err = PredictError::NumericalInstability {
            draw: 3,
            factor: 1,
            stage: "Cholesky of old-unit kernel",
            units: vec![UnitId::from("plot_7"), UnitId::from(12)],
            reason: "matrix is not positive definite".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("draw 3"));
        assert!(msg.contains("factor 1"));
        assert!(msg.contains("plot_7, 12"));
    }

    #[test]
    fn long_unit_lists_are_truncated() {
        let units: Vec<UnitId> = (0..20).map(UnitId::from).collect();
        let rendered = format_units(&units);
        assert!(rendered.ends_with("(20 in total)"));
        assert!(!rendered.contains("19"));
    }

    #[test]
    fn dimension_mismatch_without_draw_has_no_suffix() {
        let err = PredictError::DimensionMismatch {
            draw: None,
            what: "coordinate dimension",
            expected: 2,
            found: 3,
        };
        assert_eq!(
            err.to_string(),
            "coordinate dimension mismatch: expected 2, found 3"
        );
    }
}
