//! Model fitting: families and links, covariance structures, priors, the
//! joint objective, the Laplace inner solver and the outer optimizer.

pub mod covariance;
pub mod family;
pub mod fit;
pub mod laplace;
pub mod link;
pub mod objective;
pub mod outer;
pub mod prior;
pub mod start;
