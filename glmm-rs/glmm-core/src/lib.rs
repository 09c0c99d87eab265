//! glmm-core: Statistical algorithms for glmm-rs
//!
//! Fits generalized linear mixed models, with optional zero-inflation,
//! hurdle and dispersion sub-models, by maximum likelihood under the
//! Laplace approximation. Derivatives come from forward-mode automatic
//! differentiation; the outer gradient differentiates through the inner
//! mode-finding implicitly. Also covers priors as penalties, prediction,
//! simulation and model persistence.

pub mod error;
pub mod glmm;
pub mod model;
pub mod util;

pub use error::FitError;
pub use glmm::fit::{fit, fit_many, fit_with_start, FitControl, LineSearch, OptimizerChoice};
pub use glmm::laplace::LaplaceConfig;
pub use model::fitted::{aic_table, FitWarning, FittedModel, ResidualKind};
pub use model::predict::{predict, PredictType, Prediction, ReForm};
pub use model::serialization::{load_model, save_model};
pub use model::simulate::{simulate, simulate_par};
pub use model::spec::{ModelFormulas, ModelSpec};
