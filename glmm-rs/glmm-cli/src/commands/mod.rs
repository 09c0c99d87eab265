pub mod compare;
pub mod fit;
pub mod predict;
pub mod simulate;
pub mod summary;

use anyhow::{anyhow, Result};

use glmm_core::glmm::family::Family;
use glmm_core::glmm::link::Link;
use glmm_core::{FitControl, LineSearch, OptimizerChoice};

pub(crate) fn parse_family(name: &str) -> Result<Family> {
    Family::parse(name).ok_or_else(|| anyhow!("Unknown family: {}", name))
}

pub(crate) fn parse_link(name: Option<&str>) -> Result<Option<Link>> {
    name.map(|n| Link::parse(n).ok_or_else(|| anyhow!("Unknown link: {}", n)))
        .transpose()
}

/// Fit options from the shared optimizer flags.
pub(crate) fn fit_control(max_iter: usize, grad_tol: f64, line_search: &str) -> Result<FitControl> {
    let line_search =
        LineSearch::parse(line_search).ok_or_else(|| anyhow!("Unknown line search: {}", line_search))?;
    Ok(FitControl {
        max_outer_iter: max_iter,
        grad_tol,
        optimizer: OptimizerChoice::Lbfgs {
            memory: 10,
            line_search,
        },
        ..Default::default()
    })
}
