//! Priors as an additive penalty on the outer objective (MAP fitting).
//!
//! A prior row names a distribution, a parameter class and optionally a
//! coefficient. Rows are resolved against the parameter layout once per
//! fit into a [`PriorPenalty`], a differentiable function of the full
//! outer vector returning `-sum log prior`.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use glmm_data::PriorRow;

use crate::error::{FitError, FitResult};
use crate::glmm::covariance::CovStructure;
use crate::model::parameters::{Block, ParameterLayout};
use crate::util::ad::{Real, ScalarFn};
use crate::util::math::{ln_gamma, normal_logpdf, student_t_logpdf};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PriorDist {
    Normal { mean: f64, sd: f64 },
    StudentT { mean: f64, sd: f64, df: f64 },
    Cauchy { location: f64, scale: f64 },
    Gamma { shape: f64, scale: f64 },
    Lkj { eta: f64 },
}

impl PriorDist {
    /// Parse `normal(0, 3)`, `t(0, 2.5, 3)`, `cauchy(0, 1)`,
    /// `gamma(2, 0.5)` or `lkj(2)`.
    pub fn parse(text: &str) -> FitResult<PriorDist> {
        let text = text.trim();
        let bad = || FitError::Prior(format!("cannot parse prior '{}'", text));
        let (name, rest) = text.split_once('(').ok_or_else(bad)?;
        let args = rest.trim_end().strip_suffix(')').ok_or_else(bad)?;
        let args: Vec<f64> = args
            .split(',')
            .map(|a| a.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| bad())?;
        let arity = |n: usize| {
            if args.len() == n {
                Ok(())
            } else {
                Err(FitError::Prior(format!(
                    "prior '{}' takes {} arguments, got {}",
                    name.trim(),
                    n,
                    args.len()
                )))
            }
        };
        let dist = match name.trim().to_ascii_lowercase().as_str() {
            "normal" => {
                arity(2)?;
                PriorDist::Normal { mean: args[0], sd: args[1] }
            }
            "t" | "student_t" => {
                arity(3)?;
                PriorDist::StudentT { mean: args[0], sd: args[1], df: args[2] }
            }
            "cauchy" => {
                arity(2)?;
                PriorDist::Cauchy { location: args[0], scale: args[1] }
            }
            "gamma" => {
                arity(2)?;
                PriorDist::Gamma { shape: args[0], scale: args[1] }
            }
            "lkj" => {
                arity(1)?;
                PriorDist::Lkj { eta: args[0] }
            }
            other => return Err(FitError::Prior(format!("unknown prior distribution '{}'", other))),
        };
        let positive = match dist {
            PriorDist::Normal { sd, .. } => sd > 0.0,
            PriorDist::StudentT { sd, df, .. } => sd > 0.0 && df > 0.0,
            PriorDist::Cauchy { scale, .. } => scale > 0.0,
            PriorDist::Gamma { shape, scale } => shape > 0.0 && scale > 0.0,
            PriorDist::Lkj { eta } => eta > 0.0,
        };
        if !positive {
            return Err(FitError::Prior(format!("prior '{}' needs positive scale parameters", text)));
        }
        Ok(dist)
    }

    /// Log density at x. Not defined for `lkj`, which is a matrix prior.
    fn log_density<T: Real>(&self, x: T) -> T {
        match *self {
            PriorDist::Normal { mean, sd } => normal_logpdf(x, T::cst(mean), T::cst(sd)),
            PriorDist::StudentT { mean, sd, df } => student_t_logpdf(x, mean, sd, df),
            PriorDist::Cauchy { location, scale } => student_t_logpdf(x, location, scale, 1.0),
            PriorDist::Gamma { shape, scale } => {
                T::cst(shape - 1.0) * x.ln() - x / T::cst(scale)
                    - T::cst(ln_gamma(shape) + shape * scale.ln())
            }
            PriorDist::Lkj { .. } => T::zero(),
        }
    }
}

impl fmt::Display for PriorDist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorDist::Normal { mean, sd } => write!(f, "normal({}, {})", mean, sd),
            PriorDist::StudentT { mean, sd, df } => write!(f, "t({}, {}, {})", mean, sd, df),
            PriorDist::Cauchy { location, scale } => write!(f, "cauchy({}, {})", location, scale),
            PriorDist::Gamma { shape, scale } => write!(f, "gamma({}, {})", shape, scale),
            PriorDist::Lkj { eta } => write!(f, "lkj({})", eta),
        }
    }
}

/// Parameter class a prior applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamClass {
    Fixef,
    FixefZi,
    FixefDisp,
    Theta,
    ThetaZi,
    Psi,
}

impl ParamClass {
    pub fn parse(name: &str) -> FitResult<ParamClass> {
        match name.trim() {
            "fixef" | "beta" => Ok(ParamClass::Fixef),
            "fixef_zi" | "betazi" => Ok(ParamClass::FixefZi),
            "fixef_disp" | "betadisp" | "betad" => Ok(ParamClass::FixefDisp),
            "theta" => Ok(ParamClass::Theta),
            "theta_zi" | "thetazi" => Ok(ParamClass::ThetaZi),
            "psi" => Ok(ParamClass::Psi),
            other => Err(FitError::Prior(format!("unknown parameter class '{}'", other))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ParamClass::Fixef => "fixef",
            ParamClass::FixefZi => "fixef_zi",
            ParamClass::FixefDisp => "fixef_disp",
            ParamClass::Theta => "theta",
            ParamClass::ThetaZi => "theta_zi",
            ParamClass::Psi => "psi",
        }
    }

    pub fn block(self) -> Block {
        match self {
            ParamClass::Fixef => Block::Beta,
            ParamClass::FixefZi => Block::BetaZi,
            ParamClass::FixefDisp => Block::BetaDisp,
            ParamClass::Theta => Block::Theta,
            ParamClass::ThetaZi => Block::ThetaZi,
            ParamClass::Psi => Block::Psi,
        }
    }

    fn is_covariance(self) -> bool {
        matches!(self, ParamClass::Theta | ParamClass::ThetaZi)
    }
}

/// One parsed prior row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorSpec {
    pub dist: PriorDist,
    pub class: ParamClass,
    /// Coefficient name, random-term label or 1-based term index; `None`
    /// covers the whole class.
    pub coef: Option<String>,
}

impl PriorSpec {
    pub fn new(dist: PriorDist, class: ParamClass, coef: Option<&str>) -> Self {
        PriorSpec {
            dist,
            class,
            coef: coef.map(str::to_string),
        }
    }

    pub fn from_row(row: &PriorRow) -> FitResult<PriorSpec> {
        let dist = PriorDist::parse(&row.prior)?;
        let class = ParamClass::parse(&row.class)?;
        let coef = row.coef.trim();
        Ok(PriorSpec {
            dist,
            class,
            coef: (!coef.is_empty()).then(|| coef.to_string()),
        })
    }
}

impl fmt::Display for PriorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.coef {
            Some(c) => write!(f, "{} on {}[{}]", self.dist, self.class.name(), c),
            None => write!(f, "{} on {}", self.dist, self.class.name()),
        }
    }
}

pub fn priors_from_rows(rows: &[PriorRow]) -> FitResult<Vec<PriorSpec>> {
    rows.iter().map(PriorSpec::from_row).collect()
}

/// A prior resolved to positions in the outer vector.
#[derive(Debug, Clone, PartialEq)]
enum PenaltyTerm {
    /// Prior on one parameter on its own scale.
    Coef { index: usize, dist: PriorDist },
    /// Prior on standard deviation `column` of a covariance term.
    Sd {
        theta: Range<usize>,
        structure: CovStructure,
        dim: usize,
        column: usize,
        dist: PriorDist,
    },
    /// LKJ prior on a term's correlation matrix.
    Lkj {
        theta: Range<usize>,
        structure: CovStructure,
        dim: usize,
        eta: f64,
    },
}

/// `-sum log prior` as a function of the outer parameter vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorPenalty {
    terms: Vec<PenaltyTerm>,
}

impl PriorPenalty {
    /// Resolve prior rows against `layout`. Selectors that match nothing
    /// are an error.
    pub fn resolve(priors: &[PriorSpec], layout: &ParameterLayout) -> FitResult<PriorPenalty> {
        let mut terms = Vec::new();
        for prior in priors {
            let before = terms.len();
            if prior.class.is_covariance() {
                resolve_covariance(prior, layout, &mut terms)?;
            } else {
                if matches!(prior.dist, PriorDist::Gamma { .. } | PriorDist::Lkj { .. }) {
                    return Err(FitError::Prior(format!(
                        "{} is only available for covariance parameters",
                        prior
                    )));
                }
                let block = prior.class.block();
                for index in layout.range(block) {
                    let selected = match &prior.coef {
                        Some(c) => &layout.names[index] == c,
                        None => true,
                    };
                    if selected {
                        terms.push(PenaltyTerm::Coef { index, dist: prior.dist });
                    }
                }
            }
            if terms.len() == before {
                return Err(FitError::Prior(format!("prior {} matches no parameter", prior)));
            }
        }
        Ok(PriorPenalty { terms })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

fn resolve_covariance(
    prior: &PriorSpec,
    layout: &ParameterLayout,
    terms: &mut Vec<PenaltyTerm>,
) -> FitResult<()> {
    let zi = prior.class == ParamClass::ThetaZi;
    let blocks: Vec<_> = layout.re.iter().filter(|r| r.zi == zi).collect();
    for (k, re) in blocks.iter().enumerate() {
        let selected = match &prior.coef {
            None => true,
            Some(c) => {
                c == &re.label
                    || c == &re.group
                    || c.parse::<usize>().is_ok_and(|idx| idx == k + 1)
            }
        };
        if !selected {
            continue;
        }
        match prior.dist {
            PriorDist::Lkj { eta } => {
                if re.structure.has_correlation(re.dim) {
                    terms.push(PenaltyTerm::Lkj {
                        theta: re.theta_range(),
                        structure: re.structure,
                        dim: re.dim,
                        eta,
                    });
                }
            }
            dist => {
                for column in 0..re.dim {
                    terms.push(PenaltyTerm::Sd {
                        theta: re.theta_range(),
                        structure: re.structure,
                        dim: re.dim,
                        column,
                        dist,
                    });
                }
            }
        }
    }
    Ok(())
}

impl ScalarFn for PriorPenalty {
    fn eval<T: Real>(&self, x: &[T]) -> T {
        let mut total = T::zero();
        for term in &self.terms {
            match term {
                PenaltyTerm::Coef { index, dist } => total -= dist.log_density(x[*index]),
                PenaltyTerm::Sd {
                    theta,
                    structure,
                    dim,
                    column,
                    dist,
                } => {
                    let (sds, _) = structure.sd_and_correlation(*dim, &x[theta.clone()]);
                    total -= dist.log_density(sds[*column]);
                }
                PenaltyTerm::Lkj {
                    theta,
                    structure,
                    dim,
                    eta,
                } => {
                    let th = &x[theta.clone()];
                    let Some((_, logdet)) = structure.precision_and_logdet(*dim, th) else {
                        return T::cst(f64::INFINITY);
                    };
                    let (sds, _) = structure.sd_and_correlation(*dim, th);
                    // log|R| = log|Sigma| - 2 sum log sd
                    let mut log_r = logdet;
                    for s in sds {
                        log_r -= T::cst(2.0) * s.ln();
                    }
                    total -= T::cst(eta - 1.0) * log_r;
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glmm::family::Family;
    use crate::model::spec::{LinearPredictor, ModelSpec, ReTerm};
    use crate::util::ad;
    use glmm_linalg::DenseMatrix;

    fn layout() -> ParameterLayout {
        let n = 6;
        let x = DenseMatrix::from_columns(n, &[vec![1.0; n], vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0]]);
        let cond = LinearPredictor::new(x, vec!["(Intercept)".into(), "trtB".into()])
            .with_re_term(ReTerm::intercept("site", &["a", "a", "b", "b", "c", "c"]));
        ModelSpec::builder()
            .response(vec![0.0, 1.0, 2.0, 0.0, 3.0, 1.0])
            .family(Family::Poisson)
            .conditional(cond)
            .build()
            .unwrap()
            .layout()
    }

    #[test]
    fn test_parse_distributions() {
        assert_eq!(
            PriorDist::parse("normal(0, 3)").unwrap(),
            PriorDist::Normal { mean: 0.0, sd: 3.0 }
        );
        assert_eq!(PriorDist::parse(" lkj(2) ").unwrap(), PriorDist::Lkj { eta: 2.0 });
        assert!(PriorDist::parse("normal(0)").is_err());
        assert!(PriorDist::parse("normal(0, -1)").is_err());
        assert!(PriorDist::parse("laplace(0, 1)").is_err());
        assert!(PriorDist::parse("normal 0 1").is_err());
    }

    #[test]
    fn test_ridge_penalty_value_and_gradient() {
        let layout = layout();
        let priors = vec![PriorSpec::new(
            PriorDist::Normal { mean: 0.0, sd: 2.0 },
            ParamClass::Fixef,
            Some("trtB"),
        )];
        let penalty = PriorPenalty::resolve(&priors, &layout).unwrap();
        let x = vec![0.3, 1.5, 0.0];
        let (val, grad) = ad::gradient(&penalty, &x);
        let expected = 0.5 * (1.5f64 / 2.0).powi(2) + (2.0f64).ln() + 0.5 * (2.0 * std::f64::consts::PI).ln();
        assert!((val - expected).abs() < 1e-10);
        assert_eq!(grad[0], 0.0);
        assert!((grad[1] - 1.5 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_gamma_prior_on_sd_scale() {
        let layout = layout();
        let priors = vec![PriorSpec::new(
            PriorDist::Gamma { shape: 2.0, scale: 1.0 },
            ParamClass::Theta,
            Some("1"),
        )];
        let penalty = PriorPenalty::resolve(&priors, &layout).unwrap();
        // sd = exp(theta); -log p(sd) = -log(sd) + sd for gamma(2, 1)
        let theta: f64 = -0.4;
        let val = ad::value(&penalty, &[0.0, 0.0, theta]);
        assert!((val - (-theta + theta.exp())).abs() < 1e-12);
    }

    #[test]
    fn test_unmatched_and_misplaced_priors() {
        let layout = layout();
        let missing = PriorSpec::new(PriorDist::Normal { mean: 0.0, sd: 1.0 }, ParamClass::Fixef, Some("x"));
        assert!(PriorPenalty::resolve(&[missing], &layout).is_err());
        let gamma_on_beta = PriorSpec::new(PriorDist::Gamma { shape: 2.0, scale: 1.0 }, ParamClass::Fixef, None);
        assert!(PriorPenalty::resolve(&[gamma_on_beta], &layout).is_err());
    }

    #[test]
    fn test_from_rows() {
        let rows = vec![PriorRow {
            prior: "t(0, 2.5, 3)".into(),
            class: "fixef".into(),
            coef: "".into(),
        }];
        let priors = priors_from_rows(&rows).unwrap();
        assert_eq!(priors[0].coef, None);
        assert_eq!(priors[0].to_string(), "t(0, 2.5, 3) on fixef");
    }
}
