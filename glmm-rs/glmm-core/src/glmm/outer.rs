//! Outer optimization of the Laplace objective with argmin's L-BFGS.
//!
//! The argmin problem is a thin adapter over a shared [`OuterState`]
//! holding the Laplace evaluator behind a `RefCell`: argmin only hands
//! out `&self`, while every evaluation updates the inner warm start. The
//! state caches the last evaluation (argmin asks for cost and gradient at
//! the same point) and remembers the best successful point, which is what
//! a fit falls back to when the solver stops with an error.

use std::cell::RefCell;

use argmin::core::{CostFunction, Error, Executor, Gradient, IterState, Solver, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::{HagerZhangLineSearch, MoreThuenteLineSearch};
use argmin::solver::quasinewton::LBFGS;
use tracing::{debug, warn};

use glmm_linalg::DenseMatrix;

use super::fit::{FitControl, LineSearch, OptimizerChoice};
use super::laplace::{Laplace, LaplaceEval};
use crate::error::{FitError, FitResult};
use crate::util::math::max_abs;

type Param = Vec<f64>;
type MoreThuenteLs = MoreThuenteLineSearch<Param, Param, f64>;
type HagerZhangLs = HagerZhangLineSearch<Param, Param, f64>;
type LbfgsMoreThuente = LBFGS<MoreThuenteLs, Param, Param, f64>;
type LbfgsHagerZhang = LBFGS<HagerZhangLs, Param, Param, f64>;
type OuterIterState = IterState<Param, Param, (), (), (), f64>;

/// Evaluator state shared by the argmin adapter and the caller.
pub struct OuterState<'a> {
    laplace: RefCell<Laplace<'a>>,
    last: RefCell<Option<(Param, LaplaceEval)>>,
    best: RefCell<Option<(Param, LaplaceEval)>>,
    evaluations: RefCell<usize>,
}

impl<'a> OuterState<'a> {
    pub fn new(laplace: Laplace<'a>) -> Self {
        OuterState {
            laplace: RefCell::new(laplace),
            last: RefCell::new(None),
            best: RefCell::new(None),
            evaluations: RefCell::new(0),
        }
    }

    /// Evaluate at phi, reusing the cached evaluation when it matches.
    pub fn evaluate(&self, phi: &[f64], with_gradient: bool) -> LaplaceEval {
        if let Some((p, eval)) = self.last.borrow().as_ref() {
            if p.as_slice() == phi && (!with_gradient || !eval.gradient.is_empty()) {
                return eval.clone();
            }
        }
        let eval = self.laplace.borrow_mut().evaluate(phi, with_gradient);
        *self.evaluations.borrow_mut() += 1;
        if !eval.failed {
            let mut best = self.best.borrow_mut();
            let improves = best.as_ref().map_or(true, |(_, b)| eval.value < b.value);
            let adds_gradient = best
                .as_ref()
                .is_some_and(|(p, b)| p.as_slice() == phi && b.gradient.is_empty());
            if improves || adds_gradient {
                *best = Some((phi.to_vec(), eval.clone()));
            }
        }
        *self.last.borrow_mut() = Some((phi.to_vec(), eval.clone()));
        eval
    }

    pub fn best(&self) -> Option<(Param, LaplaceEval)> {
        self.best.borrow().clone()
    }

    pub fn evaluations(&self) -> usize {
        *self.evaluations.borrow()
    }

    pub fn inner_failures(&self) -> usize {
        self.laplace.borrow().failures
    }

    pub fn set_modes(&self, b: &[f64]) {
        self.laplace.borrow_mut().set_modes(b);
    }

    pub fn into_laplace(self) -> Laplace<'a> {
        self.laplace.into_inner()
    }
}

/// argmin view of an [`OuterState`].
pub struct LaplaceProblem<'p, 'a> {
    state: &'p OuterState<'a>,
}

impl CostFunction for LaplaceProblem<'_, '_> {
    type Param = Param;
    type Output = f64;

    fn cost(&self, phi: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.state.evaluate(phi, false).value)
    }
}

impl Gradient for LaplaceProblem<'_, '_> {
    type Param = Param;
    type Gradient = Param;

    fn gradient(&self, phi: &Self::Param) -> Result<Self::Gradient, Error> {
        let eval = self.state.evaluate(phi, true);
        debug!(
            "outer eval {}: objective = {:.8}, max|grad| = {:.3e}",
            self.state.evaluations(),
            eval.value,
            max_abs(&eval.gradient)
        );
        Ok(eval.gradient)
    }
}

/// Result of the outer optimization.
#[derive(Debug, Clone)]
pub struct OuterOutcome {
    pub phi: Vec<f64>,
    pub eval: LaplaceEval,
    pub iterations: u64,
    pub converged: bool,
    pub evaluations: usize,
    pub inner_failures: usize,
}

fn build_more_thuente(memory: usize, control: &FitControl) -> FitResult<LbfgsMoreThuente> {
    configure_lbfgs(LBFGS::new(MoreThuenteLineSearch::new(), memory), control)
}

fn build_hager_zhang(memory: usize, control: &FitControl) -> FitResult<LbfgsHagerZhang> {
    configure_lbfgs(LBFGS::new(HagerZhangLineSearch::new(), memory), control)
}

fn configure_lbfgs<L>(mut lbfgs: LBFGS<L, Param, Param, f64>, control: &FitControl) -> FitResult<LBFGS<L, Param, Param, f64>> {
    lbfgs = lbfgs
        .with_tolerance_grad(control.grad_tol)
        .map_err(|e| FitError::Optimizer(e.to_string()))?;
    if let Some(tol) = control.cost_tol {
        lbfgs = lbfgs
            .with_tolerance_cost(tol)
            .map_err(|e| FitError::Optimizer(e.to_string()))?;
    }
    Ok(lbfgs)
}

/// Run the solver; `Ok(None)` when argmin stopped with an error, in
/// which case the caller falls back to the best point seen.
fn run_lbfgs<'p, 'a, S>(
    problem: LaplaceProblem<'p, 'a>,
    solver: S,
    phi0: Param,
    max_iter: u64,
) -> Option<(Param, u64, bool)>
where
    S: Solver<LaplaceProblem<'p, 'a>, OuterIterState>,
{
    let result = Executor::new(problem, solver)
        .configure(|state| state.param(phi0).max_iters(max_iter))
        .run();
    match result {
        Ok(res) => {
            let mut state = res.state().clone();
            let iterations = state.get_iter();
            let converged = matches!(
                state.get_termination_status(),
                TerminationStatus::Terminated(TerminationReason::SolverConverged)
            );
            state.take_best_param().map(|p| (p, iterations, converged))
        }
        Err(e) => {
            warn!("Outer optimizer stopped early: {}", e);
            None
        }
    }
}

/// Iterations reported when argmin stopped with an error: the number of
/// distinct points evaluated, capped at the budget.
fn fallback_iterations(evaluations: usize, max_iter: u64) -> u64 {
    (evaluations as u64).min(max_iter)
}

/// Minimize the Laplace objective from `phi0`.
pub fn minimize<'a>(laplace: Laplace<'a>, phi0: Vec<f64>, control: &FitControl) -> FitResult<(OuterOutcome, Laplace<'a>)> {
    let state = OuterState::new(laplace);

    let finished = if phi0.is_empty() {
        state.evaluate(&phi0, true);
        Some((phi0.clone(), 0, true))
    } else {
        let problem = LaplaceProblem { state: &state };
        let max_iter = control.max_outer_iter as u64;
        match control.optimizer {
            OptimizerChoice::Lbfgs {
                memory,
                line_search: LineSearch::MoreThuente,
            } => run_lbfgs(problem, build_more_thuente(memory, control)?, phi0.clone(), max_iter),
            OptimizerChoice::Lbfgs {
                memory,
                line_search: LineSearch::HagerZhang,
            } => run_lbfgs(problem, build_hager_zhang(memory, control)?, phi0.clone(), max_iter),
        }
    };

    let (phi, iterations, solver_converged) = match finished {
        Some(done) => done,
        None => match state.best() {
            Some((p, _)) => {
                let iterations = fallback_iterations(state.evaluations(), control.max_outer_iter as u64);
                (p, iterations, false)
            }
            None => {
                return Err(FitError::Optimizer(
                    "no outer evaluation succeeded; the starting point is infeasible".into(),
                ))
            }
        },
    };

    // Final evaluation at the reported point, restarting the inner
    // search from the best modes seen.
    if let Some((_, best)) = state.best() {
        state.set_modes(&best.b);
    }
    let eval = state.evaluate(&phi, true);
    if eval.failed {
        return Err(FitError::Optimizer(
            "the Laplace approximation failed at the reported optimum".into(),
        ));
    }
    let converged = solver_converged || max_abs(&eval.gradient) < control.grad_tol;
    let outcome = OuterOutcome {
        phi,
        iterations,
        converged,
        evaluations: state.evaluations(),
        inner_failures: state.inner_failures(),
        eval,
    };
    Ok((outcome, state.into_laplace()))
}

/// Hessian of the Laplace objective by central differences of the exact
/// gradient, symmetrized. `None` when an evaluation fails.
pub fn fd_hessian(laplace: &mut Laplace<'_>, phi: &[f64], step: f64) -> Option<DenseMatrix> {
    let p = phi.len();
    let b0 = laplace.modes().to_vec();
    let mut hess = DenseMatrix::zeros(p, p);
    for k in 0..p {
        let h = step * (1.0 + phi[k].abs());
        let mut up = phi.to_vec();
        up[k] += h;
        let mut dn = phi.to_vec();
        dn[k] -= h;
        laplace.set_modes(&b0);
        let g_up = laplace.evaluate(&up, true);
        laplace.set_modes(&b0);
        let g_dn = laplace.evaluate(&dn, true);
        if g_up.failed || g_dn.failed {
            laplace.set_modes(&b0);
            return None;
        }
        for j in 0..p {
            hess.set(j, k, (g_up.gradient[j] - g_dn.gradient[j]) / (2.0 * h));
        }
    }
    laplace.set_modes(&b0);
    hess.symmetrize();
    Some(hess)
}
