//! Joint negative log-likelihood over the outer parameters and the
//! random effects.
//!
//! `J(phi, b) = -sum_i log f(y_i | eta_i) + sum_k sum_l (u_kl' Sigma_k^-1 u_kl + log|Sigma_k|) / 2 + penalty(phi)`
//!
//! Every observation depends on the parameters only through its four
//! linear predictors `eta_i = [cond, zi, disp, psi]`, so derivatives are
//! taken per observation in those coordinates and mapped back through
//! the design rows: `A_i` (4 x P, outer parameters) and `B_i` (4 x q,
//! random effects; only the cond and zi rows are non-zero). The 2 pi
//! constants of the random-effect densities cancel against those of the
//! Laplace normalisation and are left out.

use glmm_linalg::{DenseMatrix, LinalgError, SparseMatrix};

use crate::error::FitResult;
use crate::glmm::family::Family;
use crate::glmm::link::Link;
use crate::glmm::prior::PriorPenalty;
use crate::model::parameters::{Block, ParameterLayout};
use crate::model::spec::{LinearPredictor, ModelSpec};
use crate::util::ad::{self, Real, ScalarFn};

pub const COND: usize = 0;
pub const ZI: usize = 1;
pub const DISP: usize = 2;
pub const PSI: usize = 3;

/// Linear predictors of one observation.
pub type Eta = [f64; 4];

/// Negative log-likelihood of one observation as a function of the eta
/// coordinates listed in `active`; the others are held at `eta`.
pub struct ObsFn<'a> {
    pub family: Family,
    pub link: Link,
    pub zero_inflated: bool,
    pub y: f64,
    pub w: f64,
    pub eta: Eta,
    pub active: &'a [usize],
}

impl ScalarFn for ObsFn<'_> {
    fn eval<T: Real>(&self, x: &[T]) -> T {
        let mut e = self.eta.map(T::cst);
        for (k, &c) in self.active.iter().enumerate() {
            e[c] = x[k];
        }
        -self
            .family
            .obs_log_lik(self.link, self.zero_inflated, self.y, self.w, &e)
    }
}

/// Per-observation derivatives scattered to full eta coordinates.
#[derive(Debug, Clone, Copy)]
pub struct ObsDerivatives {
    pub value: f64,
    pub grad: [f64; 4],
    pub hess: [[f64; 4]; 4],
}

/// Random-effect precision and covariance log-determinant per term.
pub type Precisions = Vec<(DenseMatrix, f64)>;

pub struct JointObjective<'a> {
    pub spec: &'a ModelSpec,
    pub layout: ParameterLayout,
    pub penalty: PriorPenalty,
    /// n x q designs of the cond and zi random effects in global b columns.
    z_cond: SparseMatrix,
    z_zi: SparseMatrix,
    /// Eta coordinates that vary for this model.
    coords: Vec<usize>,
    /// Eta coordinates that random effects enter.
    b_coords: Vec<usize>,
}

impl<'a> JointObjective<'a> {
    pub fn new(spec: &'a ModelSpec) -> FitResult<Self> {
        let layout = spec.layout();
        let penalty = PriorPenalty::resolve(&spec.priors, &layout)?;
        let n = spec.nobs();
        let z_cond = stack_random(n, layout.n_b, &spec.cond, 0);
        let z_zi = match &spec.zi {
            Some(zi) => stack_random(n, layout.n_b, zi, layout.n_b_cond),
            None => SparseMatrix::empty(n),
        };

        let mut coords = vec![COND];
        if spec.zero_inflated() {
            coords.push(ZI);
        }
        if spec.family.has_dispersion() {
            coords.push(DISP);
        }
        if spec.family.has_power() {
            coords.push(PSI);
        }
        let mut b_coords = Vec::new();
        if layout.n_b_cond > 0 {
            b_coords.push(COND);
        }
        if layout.n_b > layout.n_b_cond {
            b_coords.push(ZI);
        }
        Ok(JointObjective {
            spec,
            layout,
            penalty,
            z_cond,
            z_zi,
            coords,
            b_coords,
        })
    }

    pub fn nobs(&self) -> usize {
        self.spec.nobs()
    }

    pub fn n_b(&self) -> usize {
        self.layout.n_b
    }

    pub fn coords(&self) -> &[usize] {
        &self.coords
    }

    pub fn b_coords(&self) -> &[usize] {
        &self.b_coords
    }

    /// Random-effect design row of observation i for eta coordinate
    /// `coord` (empty for disp and psi).
    pub fn b_row(&self, i: usize, coord: usize) -> (&[usize], &[f64]) {
        match coord {
            COND if self.z_cond.ncols() > 0 => self.z_cond.row(i),
            ZI if self.z_zi.ncols() > 0 => self.z_zi.row(i),
            _ => (&[], &[]),
        }
    }

    /// Linear predictors at b = 0.
    pub fn fixed_eta(&self, phi: &[f64]) -> Vec<Eta> {
        let spec = self.spec;
        let beta = &phi[self.layout.range(Block::Beta)];
        let beta_zi = &phi[self.layout.range(Block::BetaZi)];
        let beta_disp = &phi[self.layout.range(Block::BetaDisp)];
        let psi = self.layout.psi_index().map_or(0.0, |k| phi[k]);
        (0..spec.nobs())
            .map(|i| {
                let zi = spec.zi.as_ref().map_or(0.0, |z| z.fixed_eta(i, beta_zi));
                [
                    spec.cond.fixed_eta(i, beta),
                    zi,
                    spec.disp.fixed_eta(i, beta_disp),
                    psi,
                ]
            })
            .collect()
    }

    /// Linear predictors with random effects b added.
    pub fn eta(&self, fixed: &[Eta], b: &[f64]) -> Vec<Eta> {
        fixed
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let mut e = *e;
                for &c in &self.b_coords {
                    let (cols, vals) = self.b_row(i, c);
                    e[c] += cols.iter().zip(vals).map(|(&j, &v)| v * b[j]).sum::<f64>();
                }
                e
            })
            .collect()
    }

    pub fn obs_fn<'s>(&self, i: usize, eta: Eta, active: &'s [usize]) -> ObsFn<'s> {
        ObsFn {
            family: self.spec.family,
            link: self.spec.link,
            zero_inflated: self.spec.zero_inflated(),
            y: self.spec.y[i],
            w: self.spec.weights[i],
            eta,
            active,
        }
    }

    /// Negative log-likelihood of the data at the given predictors.
    pub fn data_nll(&self, etas: &[Eta]) -> f64 {
        let spec = self.spec;
        etas.iter()
            .enumerate()
            .map(|(i, e)| {
                -spec
                    .family
                    .obs_log_lik(spec.link, spec.zero_inflated(), spec.y[i], spec.weights[i], e)
            })
            .sum()
    }

    /// Value, gradient and Hessian of observation i's negative
    /// log-likelihood in the eta coordinates `active`.
    pub fn obs_derivatives(&self, i: usize, eta: &Eta, active: &[usize]) -> ObsDerivatives {
        let f = self.obs_fn(i, *eta, active);
        let x: Vec<f64> = active.iter().map(|&c| eta[c]).collect();
        let (value, g, h) = ad::hessian(&f, &x);
        let m = active.len();
        let mut out = ObsDerivatives {
            value,
            grad: [0.0; 4],
            hess: [[0.0; 4]; 4],
        };
        for (a, &ca) in active.iter().enumerate() {
            out.grad[ca] = g[a];
            for (b, &cb) in active.iter().enumerate() {
                out.hess[ca][cb] = h[a * m + b];
            }
        }
        out
    }

    /// `t[c] = sum_{a,b} w[a][b] d^3 f_i / (d eta_a d eta_b d eta_c)` over
    /// all varying coordinates c.
    pub fn obs_third(&self, i: usize, eta: &Eta, w: &[[f64; 4]; 4]) -> [f64; 4] {
        let active = self.coords.as_slice();
        let f = self.obs_fn(i, *eta, active);
        let x: Vec<f64> = active.iter().map(|&c| eta[c]).collect();
        let m = active.len();
        let mut wm = vec![0.0; m * m];
        for (a, &ca) in active.iter().enumerate() {
            for (b, &cb) in active.iter().enumerate() {
                wm[a * m + b] = w[ca][cb];
            }
        }
        let t = ad::third_contraction(&f, &x, &wm);
        let mut out = [0.0; 4];
        for (a, &ca) in active.iter().enumerate() {
            out[ca] = t[a];
        }
        out
    }

    /// Add `A_i' e` to an outer-parameter gradient.
    pub fn scatter_outer(&self, i: usize, e: &[f64; 4], grad: &mut [f64]) {
        let spec = self.spec;
        add_row(&spec.cond, i, e[COND], &mut grad[self.layout.range(Block::Beta)]);
        if let Some(zi) = &spec.zi {
            add_row(zi, i, e[ZI], &mut grad[self.layout.range(Block::BetaZi)]);
        }
        add_row(&spec.disp, i, e[DISP], &mut grad[self.layout.range(Block::BetaDisp)]);
        if let Some(k) = self.layout.psi_index() {
            grad[k] += e[PSI];
        }
    }

    /// Precision matrix and covariance log-determinant of every term.
    pub fn precisions(&self, phi: &[f64]) -> Result<Precisions, LinalgError> {
        self.layout
            .re
            .iter()
            .map(|re| re.structure.precision_matrix(re.dim, &phi[re.theta_range()]))
            .collect()
    }

    /// Negative log-density of b (without 2 pi constants).
    pub fn re_nll(&self, b: &[f64], precisions: &Precisions) -> f64 {
        let mut total = 0.0;
        for (re, (prec, logdet)) in self.layout.re.iter().zip(precisions) {
            for l in 0..re.n_levels {
                let u = &b[re.level_range(l)];
                total += 0.5 * prec.quad_form(u, u);
            }
            total += 0.5 * re.n_levels as f64 * logdet;
        }
        total
    }

    /// `J(phi, b)` including the prior penalty; infinite when a
    /// covariance is numerically singular.
    pub fn joint(&self, phi: &[f64], b: &[f64]) -> f64 {
        let Ok(precisions) = self.precisions(phi) else {
            return f64::INFINITY;
        };
        let etas = self.eta(&self.fixed_eta(phi), b);
        self.data_nll(&etas) + self.re_nll(b, &precisions) + self.penalty_value(phi)
    }

    pub fn penalty_value(&self, phi: &[f64]) -> f64 {
        if self.penalty.is_empty() {
            0.0
        } else {
            ad::value(&self.penalty, phi)
        }
    }

    pub fn penalty_gradient(&self, phi: &[f64]) -> Vec<f64> {
        if self.penalty.is_empty() {
            vec![0.0; phi.len()]
        } else {
            ad::gradient(&self.penalty, phi).1
        }
    }
}

fn add_row(lp: &LinearPredictor, i: usize, e: f64, grad: &mut [f64]) {
    if e == 0.0 {
        return;
    }
    for (j, g) in grad.iter_mut().enumerate() {
        *g += e * lp.x.get(i, j);
    }
}

/// Place the random-effect designs of `lp` side by side in an n x q
/// matrix, starting at column `offset`.
fn stack_random(n: usize, n_b: usize, lp: &LinearPredictor, offset: usize) -> SparseMatrix {
    if lp.re_terms.is_empty() {
        return SparseMatrix::empty(n);
    }
    let (mut rows, mut cols, mut vals) = (Vec::new(), Vec::new(), Vec::new());
    let mut start = offset;
    for term in &lp.re_terms {
        for i in 0..n {
            let (c, v) = term.z.row(i);
            for (&j, &x) in c.iter().zip(v) {
                rows.push(i);
                cols.push(start + j);
                vals.push(x);
            }
        }
        start += term.z.ncols();
    }
    SparseMatrix::from_triplets(n, n_b, &rows, &cols, &vals)
}
