//! Generalized linear model fitting for count data

mod irls;
mod negative_binomial;

pub use irls::{fit_irls, least_squares, weighted_least_squares, GlmFamily, IrlsFit, IrlsParams};
pub use negative_binomial::{
    mean_from_eta, nb_log_likelihood, nb_total_log_likelihood, nb_unit_deviance, nb_variance, nb_weight,
    poisson_unit_deviance, MAX_ETA,
};
