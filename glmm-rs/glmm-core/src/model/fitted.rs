//! FittedModel: the frozen result of one fit.
//!
//! Owns the ModelSpec it was fitted to, which prediction and simulation
//! read after a save/load round trip. Also holds the outer parameters with
//! their layout, the conditional modes, the outer Hessian with its inverse
//! and the convergence diagnostics.

use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use glmm_linalg::DenseMatrix;

use super::parameters::{Block, ParameterVector, ReBlock};
use super::predict::{predict, row_components, PredictType, ReForm};
use super::spec::ModelSpec;
use crate::error::FitResult;
use crate::glmm::covariance::CovStructure;
use crate::glmm::fit::{fit_with_start, FitControl};
use crate::util::ad::{self, Real, ScalarFn};
use crate::util::math::two_sided_p;

/// Diagnostics attached to a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitWarning {
    /// The outer optimizer stopped before meeting its tolerances.
    OuterNotConverged,
    /// The outer Hessian could not be inverted; standard errors are unreliable.
    NonPositiveDefiniteHessian,
    /// Number of outer evaluations at which the inner mode search failed.
    InnerFailures(usize),
    /// A covariance term sits at a variance of zero or a correlation of +-1.
    SingularCovariance { term: String },
    /// The final gradient is large despite convergence.
    LargeGradient,
}

impl fmt::Display for FitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitWarning::OuterNotConverged => write!(f, "outer optimizer did not converge"),
            FitWarning::NonPositiveDefiniteHessian => {
                write!(f, "Hessian is not positive definite; standard errors are unreliable")
            }
            FitWarning::InnerFailures(n) => {
                write!(f, "random-effect mode search failed at {} evaluations", n)
            }
            FitWarning::SingularCovariance { term } => {
                write!(f, "covariance of ({}) is near singular", term)
            }
            FitWarning::LargeGradient => write!(f, "large gradient at the reported optimum"),
        }
    }
}

/// Optimizer statistics handed over by the fitter.
#[derive(Debug, Clone)]
pub struct FitStatistics {
    pub objective: f64,
    pub penalty: f64,
    pub max_grad: f64,
    pub iterations: u64,
    pub evaluations: usize,
    pub converged: bool,
}

/// The fitted model, serialized to .glmm.model files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedModel {
    /// Magic bytes for validation.
    pub magic: [u8; 4],
    /// Version number for forward compatibility.
    pub version: u32,
    pub spec: ModelSpec,
    pub parameters: ParameterVector,
    /// Conditional modes of the random effects.
    pub b: Vec<f64>,
    /// Outer Hessian of the penalized Laplace objective.
    pub hessian: Option<DenseMatrix>,
    /// Inverse Hessian; `None` when it does not exist.
    pub covariance: Option<DenseMatrix>,
    pub se_reliable: bool,
    /// Laplace log-likelihood (penalty excluded).
    pub log_lik: f64,
    /// Penalized objective that was minimized.
    pub objective: f64,
    pub penalty: f64,
    pub aic: f64,
    pub bic: f64,
    /// Number of estimated outer parameters.
    pub df: usize,
    pub nobs: usize,
    pub max_grad: f64,
    pub iterations: u64,
    pub evaluations: usize,
    pub converged: bool,
    pub warnings: Vec<FitWarning>,
}

/// One row of a coefficient table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoefRow {
    pub name: String,
    pub estimate: f64,
    pub se: f64,
    pub z: f64,
    pub p: f64,
}

/// Standard deviations and correlations of one random-effect term.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VarCorr {
    pub label: String,
    pub group: String,
    pub zi: bool,
    pub structure: CovStructure,
    pub columns: Vec<String>,
    pub sd: Vec<f64>,
    /// Correlation matrix, row-major.
    pub corr: Vec<f64>,
    /// Delta-method standard errors of log(sd).
    pub log_sd_se: Vec<f64>,
    /// Delta-method standard errors of sd.
    pub sd_se: Vec<f64>,
    /// Delta-method standard errors of the correlations, row-major with
    /// zeros on the diagonal.
    pub corr_se: Vec<f64>,
}

/// Conditional modes of one term, one row per level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranef {
    pub label: String,
    pub group: String,
    pub zi: bool,
    pub columns: Vec<String>,
    pub levels: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualKind {
    Response,
    Pearson,
}

/// One row of an information-criterion comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AicRow {
    pub name: String,
    pub df: usize,
    pub log_lik: f64,
    pub aic: f64,
    pub delta_aic: f64,
    pub converged: bool,
}

/// A derived variance-component quantity as a function of a term's theta.
struct TermQuantity {
    structure: CovStructure,
    dim: usize,
    quantity: Quantity,
}

#[derive(Clone, Copy)]
enum Quantity {
    LogSd(usize),
    Corr(usize, usize),
}

impl ScalarFn for TermQuantity {
    fn eval<T: Real>(&self, theta: &[T]) -> T {
        let (sds, corr) = self.structure.sd_and_correlation(self.dim, theta);
        match self.quantity {
            Quantity::LogSd(j) => sds[j].ln(),
            Quantity::Corr(j, k) => corr[j * self.dim + k],
        }
    }
}

impl FittedModel {
    /// Magic bytes: "GLMM".
    pub const MAGIC: [u8; 4] = *b"GLMM";
    /// Current model version.
    pub const VERSION: u32 = 1;

    pub fn new(
        spec: ModelSpec,
        parameters: ParameterVector,
        b: Vec<f64>,
        hessian: Option<DenseMatrix>,
        covariance: Option<DenseMatrix>,
        stats: FitStatistics,
        warnings: Vec<FitWarning>,
    ) -> Self {
        let nobs = spec.nobs();
        let df = parameters.values.len();
        let log_lik = -(stats.objective - stats.penalty);
        let se_reliable = covariance.is_some();
        FittedModel {
            magic: Self::MAGIC,
            version: Self::VERSION,
            spec,
            parameters,
            b,
            hessian,
            covariance,
            se_reliable,
            log_lik,
            objective: stats.objective,
            penalty: stats.penalty,
            aic: -2.0 * log_lik + 2.0 * df as f64,
            bic: -2.0 * log_lik + df as f64 * (nobs as f64).ln(),
            df,
            nobs,
            max_grad: stats.max_grad,
            iterations: stats.iterations,
            evaluations: stats.evaluations,
            converged: stats.converged,
            warnings,
        }
    }

    /// Validate magic bytes and version.
    pub fn is_valid(&self) -> bool {
        self.magic == Self::MAGIC && self.version == Self::VERSION
    }

    /// Standard errors of all outer parameters (NaN when unreliable).
    pub fn standard_errors(&self) -> Vec<f64> {
        let p = self.parameters.values.len();
        match (&self.covariance, self.se_reliable) {
            (Some(cov), true) => (0..p).map(|i| cov.get(i, i).sqrt()).collect(),
            _ => vec![f64::NAN; p],
        }
    }

    /// Estimates, standard errors, z statistics and two-sided p-values of
    /// one parameter block.
    pub fn coef_table(&self, block: Block) -> Vec<CoefRow> {
        let se = self.standard_errors();
        let layout = &self.parameters.layout;
        layout
            .range(block)
            .map(|i| {
                let estimate = self.parameters.values[i];
                let z = estimate / se[i];
                CoefRow {
                    name: layout.names[i].clone(),
                    estimate,
                    se: se[i],
                    z,
                    p: two_sided_p(z),
                }
            })
            .collect()
    }

    pub fn var_corr(&self) -> Vec<VarCorr> {
        self.parameters
            .layout
            .re
            .iter()
            .map(|re| {
                let theta = &self.parameters.values[re.theta_range()];
                let (sd, corr) = re.structure.sd_and_correlation(re.dim, theta);
                let d = re.dim;
                let log_sd_se: Vec<f64> = (0..d).map(|j| self.delta_se(re, Quantity::LogSd(j))).collect();
                let sd_se = sd.iter().zip(&log_sd_se).map(|(s, se)| s * se).collect();
                let mut corr_se = vec![0.0; d * d];
                for j in 0..d {
                    for k in 0..j {
                        let se = self.delta_se(re, Quantity::Corr(j, k));
                        corr_se[j * d + k] = se;
                        corr_se[k * d + j] = se;
                    }
                }
                VarCorr {
                    label: re.label.clone(),
                    group: re.group.clone(),
                    zi: re.zi,
                    structure: re.structure,
                    columns: re.columns.clone(),
                    sd,
                    corr,
                    log_sd_se,
                    sd_se,
                    corr_se,
                }
            })
            .collect()
    }

    /// Delta-method standard error g' V g of a quantity of one term, with
    /// g its gradient in the term's theta and V that block of the
    /// parameter covariance.
    fn delta_se(&self, re: &ReBlock, quantity: Quantity) -> f64 {
        let Some(cov) = self.covariance.as_ref().filter(|_| self.se_reliable) else {
            return f64::NAN;
        };
        let range = re.theta_range();
        let f = TermQuantity {
            structure: re.structure,
            dim: re.dim,
            quantity,
        };
        let (_, g) = ad::gradient(&f, &self.parameters.values[range.clone()]);
        let mut var = 0.0;
        for (a, ia) in range.clone().enumerate() {
            for (c, ic) in range.clone().enumerate() {
                var += g[a] * cov.get(ia, ic) * g[c];
            }
        }
        var.sqrt()
    }

    /// Conditional modes by term and level.
    pub fn ranef(&self) -> Vec<Ranef> {
        let terms = self
            .spec
            .cond
            .re_terms
            .iter()
            .chain(self.spec.zi.iter().flat_map(|z| z.re_terms.iter()));
        self.parameters
            .layout
            .re
            .iter()
            .zip(terms)
            .map(|(re, term)| Ranef {
                label: re.label.clone(),
                group: re.group.clone(),
                zi: re.zi,
                columns: re.columns.clone(),
                levels: term.levels.clone(),
                values: (0..re.n_levels).map(|l| self.b[re.level_range(l)].to_vec()).collect(),
            })
            .collect()
    }

    /// Response-scale fitted values for the fitting data.
    pub fn fitted(&self) -> FitResult<Vec<f64>> {
        Ok(predict(self, None, PredictType::Response, ReForm::Conditional, false)?.fit)
    }

    pub fn residuals(&self, kind: ResidualKind) -> FitResult<Vec<f64>> {
        let rows = row_components(self, None, ReForm::Conditional)?;
        let spec = &self.spec;
        Ok(rows
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let (mean, var) = spec.family.moments(
                    r.mu(spec.link),
                    r.phi(),
                    r.power(),
                    spec.weights[i],
                    r.pz(),
                    spec.zero_inflated(),
                );
                match kind {
                    ResidualKind::Response => spec.y[i] - mean,
                    ResidualKind::Pearson => (spec.y[i] - mean) / var.sqrt(),
                }
            })
            .collect())
    }

    /// Refit with a modified spec, warm-started from this fit.
    pub fn update(&self, spec: ModelSpec, control: &FitControl) -> FitResult<FittedModel> {
        fit_with_start(&spec, control, Some(&self.parameters))
    }

    /// Printable summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let spec = &self.spec;
        let _ = writeln!(out, "Family: {} ({} link)", spec.family.name(), spec.link.name());
        if let Some(enc) = &spec.encodings {
            let _ = writeln!(out, "Formula:          {}", enc.formulas.conditional);
            if let Some(zi) = &enc.formulas.zero_inflation {
                let _ = writeln!(out, "Zero inflation:   {}", zi);
            }
            if let Some(d) = &enc.formulas.dispersion {
                let _ = writeln!(out, "Dispersion:       {}", d);
            }
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "{:>12} {:>12} {:>12} {:>10}", "AIC", "BIC", "logLik", "df.resid");
        let _ = writeln!(
            out,
            "{:>12.2} {:>12.2} {:>12.2} {:>10}",
            self.aic,
            self.bic,
            self.log_lik,
            self.nobs.saturating_sub(self.df)
        );
        if self.penalty != 0.0 {
            let _ = writeln!(out, "Penalized objective: {:.4} (prior penalty {:.4})", self.objective, self.penalty);
        }

        let vc = self.var_corr();
        if !vc.is_empty() {
            let _ = writeln!(out, "\nRandom effects:");
            for zi in [false, true] {
                let terms: Vec<&VarCorr> = vc.iter().filter(|v| v.zi == zi).collect();
                if terms.is_empty() {
                    continue;
                }
                let _ = writeln!(out, "{}:", if zi { "Zero-inflation model" } else { "Conditional model" });
                let _ = writeln!(
                    out,
                    " {:<16} {:<16} {:>10} {:>10}  Corr (Std. Error)",
                    "Groups", "Name", "Std.Dev.", "Std. Error"
                );
                for v in terms {
                    let d = v.columns.len();
                    for j in 0..d {
                        let group = if j == 0 { v.group.as_str() } else { "" };
                        let corr: Vec<String> = (0..j)
                            .map(|k| format!("{:.3} ({:.3})", v.corr[j * d + k], v.corr_se[j * d + k]))
                            .collect();
                        let _ = writeln!(
                            out,
                            " {:<16} {:<16} {:>10.4} {:>10.4}  {}",
                            group,
                            v.columns[j],
                            v.sd[j],
                            v.sd_se[j],
                            corr.join(" ")
                        );
                    }
                }
            }
            let levels: Vec<String> = self
                .parameters
                .layout
                .re
                .iter()
                .map(|r| format!("{}, {}", r.group, r.n_levels))
                .collect();
            let _ = writeln!(out, "Number of obs: {}; groups: {}", self.nobs, levels.join("; "));
        }

        for (block, title) in [
            (Block::Beta, "Conditional model"),
            (Block::BetaZi, "Zero-inflation model"),
            (Block::BetaDisp, "Dispersion model"),
            (Block::Psi, "Tweedie power parameter"),
        ] {
            let rows = self.coef_table(block);
            if rows.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n{}:", title);
            let _ = writeln!(
                out,
                "{:<20} {:>10} {:>10} {:>8} {:>10}",
                "", "Estimate", "Std. Error", "z value", "Pr(>|z|)"
            );
            for r in rows {
                let _ = writeln!(
                    out,
                    "{:<20} {:>10.5} {:>10.5} {:>8.3} {:>10.4e}",
                    r.name, r.estimate, r.se, r.z, r.p
                );
            }
        }
        if !self.warnings.is_empty() {
            let _ = writeln!(out, "\nWarnings:");
            for w in &self.warnings {
                let _ = writeln!(out, "  - {}", w);
            }
        }
        out
    }
}

/// Comparison rows sorted by AIC, with differences to the best model.
pub fn aic_table(models: &[(&str, &FittedModel)]) -> Vec<AicRow> {
    let best = models.iter().map(|(_, m)| m.aic).fold(f64::INFINITY, f64::min);
    let mut rows: Vec<AicRow> = models
        .iter()
        .map(|(name, m)| AicRow {
            name: name.to_string(),
            df: m.df,
            log_lik: m.log_lik,
            aic: m.aic,
            delta_aic: m.aic - best,
            converged: m.converged,
        })
        .collect();
    rows.sort_by(|a, b| a.aic.total_cmp(&b.aic));
    rows
}

/// Render comparison rows, followed by fits that failed.
pub fn format_aic_table(rows: &[AicRow], failed: &[(String, String)]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:>4} {:>12} {:>12} {:>10} {:>10}",
        "model", "df", "logLik", "AIC", "dAIC", "converged"
    );
    for r in rows {
        let _ = writeln!(
            out,
            "{:<20} {:>4} {:>12.3} {:>12.3} {:>10.3} {:>10}",
            r.name, r.df, r.log_lik, r.aic, r.delta_aic, r.converged
        );
    }
    for (name, err) in failed {
        let _ = writeln!(out, "{:<20} failed: {}", name, err);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glmm::family::Family;
    use crate::glmm::fit::fit;
    use crate::model::spec::{LinearPredictor, ModelFormulas, ReTerm};
    use glmm_data::DataTable;

    fn grouped_poisson() -> ModelSpec {
        let y = vec![2.0, 3.0, 1.0, 2.0, 7.0, 5.0, 6.0, 8.0, 0.0, 1.0, 1.0, 0.0, 4.0, 3.0, 5.0, 4.0];
        let n = y.len();
        let groups: Vec<String> = (0..n).map(|i| format!("s{}", i / 4)).collect();
        let cond = LinearPredictor::intercept(n).with_re_term(ReTerm::intercept("site", &groups));
        ModelSpec::builder()
            .response(y)
            .family(Family::Poisson)
            .conditional(cond)
            .build()
            .unwrap()
    }

    #[test]
    fn test_fitted_model_tables() {
        let model = fit(&grouped_poisson(), &FitControl::default()).unwrap();
        assert!(model.is_valid());
        assert_eq!(model.df, 2);
        assert!((model.aic - (-2.0 * model.log_lik + 4.0)).abs() < 1e-10);

        let coef = model.coef_table(Block::Beta);
        assert_eq!(coef.len(), 1);
        assert_eq!(coef[0].name, "(Intercept)");
        assert!(coef[0].se > 0.0);

        let vc = model.var_corr();
        assert_eq!(vc.len(), 1);
        assert!(vc[0].sd[0] > 0.1, "sd = {}", vc[0].sd[0]);

        let re = model.ranef();
        assert_eq!(re[0].levels, vec!["s0", "s1", "s2", "s3"]);
        // Site s1 has the largest counts, s2 the smallest.
        assert!(re[0].values[1][0] > 0.0 && re[0].values[2][0] < 0.0);

        let fitted = model.fitted().unwrap();
        let resid = model.residuals(ResidualKind::Response).unwrap();
        for i in 0..model.nobs {
            assert!((fitted[i] + resid[i] - model.spec.y[i]).abs() < 1e-10);
        }
        assert!(model.summary().contains("Random effects:"));
    }

    fn random_slope_model() -> FittedModel {
        let intercepts = [0.4, -0.3, 0.1, 0.6, -0.5, -0.2];
        let slopes = [0.2, -0.1, 0.3, 0.0, -0.25, 0.1];
        let noise = [0.05, -0.08, 0.02, 0.07, -0.04];
        let (mut y, mut x, mut g) = (Vec::new(), Vec::new(), Vec::new());
        for l in 0..6 {
            for r in 0..5 {
                let xv = -1.0 + 0.5 * r as f64;
                y.push(1.0 + intercepts[l] + (0.5 + slopes[l]) * xv + noise[(r + l) % 5]);
                x.push(xv);
                g.push(format!("g{}", l));
            }
        }
        let table = DataTable::new()
            .with_numeric("y", y)
            .with_numeric("x", x)
            .with_categorical("g", &g);
        let spec = ModelSpec::from_table(
            &table,
            &ModelFormulas::new("y ~ x + (x | g)"),
            Family::Gaussian,
            None,
            None,
            Vec::new(),
        )
        .unwrap();
        fit(&spec, &FitControl::default()).unwrap()
    }

    #[test]
    fn test_var_corr_standard_errors_match_finite_differences() {
        let mut model = random_slope_model();
        assert_eq!(model.parameters.layout.re[0].dim, 2);
        let range = model.parameters.layout.re[0].theta_range();
        let theta = [0.2, -0.4, 0.3];
        model.parameters.values[range.clone()].copy_from_slice(&theta);
        let v = |a: usize, b: usize| if a == b { 0.04 } else { 0.01 };
        let p = model.parameters.values.len();
        model.covariance = Some(DenseMatrix::from_fn(p, p, |i, j| {
            if range.contains(&i) && range.contains(&j) {
                v(i, j)
            } else if i == j {
                1.0
            } else {
                0.0
            }
        }));
        model.se_reliable = true;

        let fd_se = |f: &dyn Fn(&[f64]) -> f64| {
            let h = 1e-6;
            let g: Vec<f64> = (0..3)
                .map(|k| {
                    let mut up = theta.to_vec();
                    let mut dn = theta.to_vec();
                    up[k] += h;
                    dn[k] -= h;
                    (f(&up) - f(&dn)) / (2.0 * h)
                })
                .collect();
            let mut var = 0.0;
            for a in 0..3 {
                for b in 0..3 {
                    var += g[a] * v(a, b) * g[b];
                }
            }
            var.sqrt()
        };
        let corr = |t: &[f64]| {
            let s = CovStructure::Unstructured.covariance(2, t);
            s[2] / (s[0] * s[3]).sqrt()
        };
        let slope_sd = |t: &[f64]| CovStructure::Unstructured.covariance(2, t)[3].sqrt();

        let vc = &model.var_corr()[0];
        let expected = fd_se(&corr);
        assert!(expected > 0.0);
        assert!((vc.corr_se[2] - expected).abs() < 1e-6, "{} vs {}", vc.corr_se[2], expected);
        assert_eq!(vc.corr_se[1], vc.corr_se[2]);
        assert_eq!(vc.corr_se[0], 0.0);
        let expected = fd_se(&slope_sd);
        assert!((vc.sd_se[1] - expected).abs() < 1e-6, "{} vs {}", vc.sd_se[1], expected);
        assert!((vc.log_sd_se[1] - expected / vc.sd[1]).abs() < 1e-6);

        let row = format!("{:.3} ({:.3})", vc.corr[2], vc.corr_se[2]);
        assert!(model.summary().contains(&row));
    }

    #[test]
    fn test_aic_table_sorted_with_deltas() {
        let spec = grouped_poisson();
        let full = fit(&spec, &FitControl::default()).unwrap();
        let mut null_spec = spec.clone();
        null_spec.cond.re_terms.clear();
        let null = fit(&null_spec, &FitControl::default()).unwrap();
        let rows = aic_table(&[("null", &null), ("site", &full)]);
        assert_eq!(rows[0].name, "site");
        assert_eq!(rows[0].delta_aic, 0.0);
        assert!(rows[1].delta_aic > 0.0);
        let text = format_aic_table(&rows, &[("broken".into(), "bad".into())]);
        assert!(text.contains("broken"));
    }
}
