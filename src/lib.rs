// Latent-factor prediction for HMSC random levels

#![doc = include_str!("../README.md")]

mod cholesky;
mod conditioning;
pub mod error;
mod full_rank;
pub mod gpp;
pub mod kernel;
pub mod knots;
pub mod linalg_backends;
mod neighbors;
mod nngp;
pub mod predictor;
pub mod random_level;
pub mod units;


pub use error::PredictError;
pub use gpp::GPP_NUGGET_FLOOR;
pub use knots::{construct_knots, KnotSpacing};
pub use predictor::{
    LatentFactorPredictor, LoadingMatrix, PosteriorDraw, PredictionMode, PredictorConfig,
};
pub use random_level::{
    RandomLevel, RangeParameter, RangeParameterSupport, SpatialData, SpatialMethod,
};
pub use units::{UnitId, UnitIndex};
