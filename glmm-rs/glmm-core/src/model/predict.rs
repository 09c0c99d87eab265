//! Predictions from a fitted model.
//!
//! Each row's four linear predictors (conditional, zero-inflation,
//! log-dispersion, Tweedie psi) are rebuilt from the stored spec or, for
//! new data, from the stored formula encodings. Random effects enter at
//! their conditional modes; grouping levels not seen during fitting get
//! zero. Standard errors use the delta method with the AD gradient of the
//! requested quantity with respect to the outer parameters, so only the
//! fixed-effect uncertainty is propagated.

use serde::{Deserialize, Serialize};
use tracing::debug;

use glmm_data::DataTable;

use super::fitted::FittedModel;
use super::parameters::{Block, ReBlock};
use super::spec::LinearPredictor;
use crate::error::{FitError, FitResult};
use crate::glmm::family::Family;
use crate::glmm::link::Link;
use crate::util::ad::{self, Real, ScalarFn};
use crate::util::math::{log1mexp, logistic};

/// Quantity to predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictType {
    /// Conditional linear predictor.
    Link,
    /// Expected response, including zero inflation and truncation.
    Response,
    /// Conditional mean of the count/continuous component.
    Conditional,
    /// Zero-inflation probability.
    ZiProb,
    /// Zero-inflation linear predictor.
    ZiLink,
    /// Log dispersion.
    DispLink,
    /// Dispersion.
    Disp,
}

impl PredictType {
    pub fn parse(name: &str) -> Option<PredictType> {
        match name.to_ascii_lowercase().as_str() {
            "link" => Some(PredictType::Link),
            "response" => Some(PredictType::Response),
            "conditional" => Some(PredictType::Conditional),
            "zprob" | "ziprob" => Some(PredictType::ZiProb),
            "zlink" | "zilink" => Some(PredictType::ZiLink),
            "disp-link" | "displink" => Some(PredictType::DispLink),
            "disp" => Some(PredictType::Disp),
            _ => None,
        }
    }
}

/// Which random effects to include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReForm {
    /// Condition on the estimated modes.
    Conditional,
    /// Population level: all random effects at zero.
    Population,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub fit: Vec<f64>,
    pub se: Option<Vec<f64>>,
}

/// Linear predictors of one row.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RowComponents {
    pub eta: [f64; 4],
    pub zero_inflated: bool,
}

impl RowComponents {
    pub fn mu(&self, link: Link) -> f64 {
        link.inverse(self.eta[0])
    }

    pub fn pz(&self) -> f64 {
        if self.zero_inflated {
            logistic(self.eta[1])
        } else {
            0.0
        }
    }

    pub fn phi(&self) -> f64 {
        self.eta[2].exp()
    }

    pub fn power(&self) -> f64 {
        Family::tweedie_power(self.eta[3])
    }
}

/// Requested quantity as a function of the linear predictors.
fn output_value<T: Real>(family: Family, link: Link, zero_inflated: bool, w: f64, kind: PredictType, eta: &[T; 4]) -> T {
    let [eta_c, eta_zi, log_phi, psi] = *eta;
    match kind {
        PredictType::Link => eta_c,
        PredictType::Conditional => link.inverse(eta_c),
        PredictType::Response => {
            let mut mean = link.inverse(eta_c);
            if family.is_truncated() {
                let lp0 = family.log_prob_zero(link, w, eta_c, log_phi, psi);
                mean = mean * (-log1mexp(lp0)).exp();
            }
            if zero_inflated {
                mean = mean * logistic(-eta_zi);
            }
            mean
        }
        PredictType::ZiProb if zero_inflated => logistic(eta_zi),
        PredictType::ZiProb => T::zero(),
        PredictType::ZiLink if zero_inflated => eta_zi,
        PredictType::ZiLink => T::cst(f64::NEG_INFINITY),
        PredictType::DispLink => log_phi,
        PredictType::Disp => log_phi.exp(),
    }
}

/// Design rows of the three predictors for one observation.
struct RowDesign {
    x: [Vec<f64>; 3],
    /// Offsets plus random-effect contributions.
    base: [f64; 3],
}

/// One row's prediction as a function of the full outer vector.
struct RowOutput<'a> {
    model: &'a FittedModel,
    design: &'a RowDesign,
    w: f64,
    kind: PredictType,
}

impl ScalarFn for RowOutput<'_> {
    fn eval<T: Real>(&self, phi: &[T]) -> T {
        let layout = &self.model.parameters.layout;
        let linear = |k: usize, block: Block| {
            let mut s = T::cst(self.design.base[k]);
            for (j, idx) in layout.range(block).enumerate() {
                s += T::cst(self.design.x[k][j]) * phi[idx];
            }
            s
        };
        let psi = layout.psi_index().map_or(T::zero(), |k| phi[k]);
        let eta = [
            linear(0, Block::Beta),
            linear(1, Block::BetaZi),
            linear(2, Block::BetaDisp),
            psi,
        ];
        let spec = &self.model.spec;
        output_value(spec.family, spec.link, spec.zero_inflated(), self.w, self.kind, &eta)
    }
}

/// The three linear predictors for the prediction rows.
struct PredictionFrame {
    cond: LinearPredictor,
    zi: Option<LinearPredictor>,
    disp: LinearPredictor,
    weights: Vec<f64>,
    /// Row of the output each frame row fills.
    rows: Vec<usize>,
    n_out: usize,
}

fn prediction_frame(model: &FittedModel, data: Option<&DataTable>) -> FitResult<PredictionFrame> {
    let spec = &model.spec;
    let Some(table) = data else {
        let n = spec.nobs();
        return Ok(PredictionFrame {
            cond: spec.cond.clone(),
            zi: spec.zi.clone(),
            disp: spec.disp.clone(),
            weights: spec.weights.clone(),
            rows: (0..n).collect(),
            n_out: n,
        });
    };
    let enc = spec.encodings.as_ref().ok_or_else(|| {
        FitError::MalformedSpec("model was built from design matrices; new data cannot be encoded".into())
    })?;

    let mut used = enc.cond.columns();
    if let Some(zi) = &enc.zi {
        used.extend(zi.columns());
    }
    used.extend(enc.disp.columns());
    if let Some(w) = &enc.weights {
        if table.column(w).is_some() {
            used.push(w.clone());
        }
    }
    used.sort();
    used.dedup();
    for c in &used {
        if table.column(c).is_none() {
            return Err(FitError::UnknownColumn(c.clone()));
        }
    }
    let refs: Vec<&str> = used.iter().map(String::as_str).collect();
    let rows = table
        .complete_rows(&refs)
        .map_err(|e| FitError::MalformedSpec(e.to_string()))?;
    let sub = table.select_rows(&rows);
    let weights = match enc.weights.as_deref().and_then(|w| sub.numeric(w)) {
        Some(w) => w.to_vec(),
        None => vec![1.0; sub.nrows()],
    };
    Ok(PredictionFrame {
        cond: enc.cond.build(&sub)?,
        zi: enc.zi.as_ref().map(|z| z.build(&sub)).transpose()?,
        disp: enc.disp.build(&sub)?,
        weights,
        rows,
        n_out: table.nrows(),
    })
}

/// Offset plus random-effect contribution of row `i`.
fn base_value(model: &FittedModel, lp: &LinearPredictor, blocks: &[&ReBlock], i: usize, re_form: ReForm) -> f64 {
    let mut base = lp.offset[i];
    if re_form == ReForm::Conditional {
        for (term, re) in lp.re_terms.iter().zip(blocks) {
            let (cols, vals) = term.z.row(i);
            for (c, v) in cols.iter().zip(vals) {
                base += v * model.b[re.b_start + c];
            }
        }
    }
    base
}

fn row_designs(model: &FittedModel, frame: &PredictionFrame, re_form: ReForm) -> Vec<RowDesign> {
    let layout = &model.parameters.layout;
    let cond_blocks: Vec<&ReBlock> = layout.re.iter().filter(|r| !r.zi).collect();
    let zi_blocks: Vec<&ReBlock> = layout.re.iter().filter(|r| r.zi).collect();
    (0..frame.rows.len())
        .map(|i| {
            let (x_zi, base_zi) = match &frame.zi {
                Some(zi) => (zi.x.row(i), base_value(model, zi, &zi_blocks, i, re_form)),
                None => (Vec::new(), 0.0),
            };
            RowDesign {
                x: [frame.cond.x.row(i), x_zi, frame.disp.x.row(i)],
                base: [
                    base_value(model, &frame.cond, &cond_blocks, i, re_form),
                    base_zi,
                    frame.disp.offset[i],
                ],
            }
        })
        .collect()
}

/// Linear predictors of every row of the fitting data (or of `data`).
/// Rows of `data` with missing predictors are skipped.
pub(crate) fn row_components(
    model: &FittedModel,
    data: Option<&DataTable>,
    re_form: ReForm,
) -> FitResult<Vec<RowComponents>> {
    let frame = prediction_frame(model, data)?;
    let zero_inflated = model.spec.zero_inflated();
    Ok(row_designs(model, &frame, re_form)
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let f = RowOutput {
                model,
                design: d,
                w: frame.weights[i],
                kind: PredictType::Link,
            };
            let eta = eta_at(&f, &model.parameters.values);
            RowComponents { eta, zero_inflated }
        })
        .collect())
}

fn eta_at(f: &RowOutput<'_>, phi: &[f64]) -> [f64; 4] {
    let mut eta = [0.0; 4];
    for (k, kind) in [PredictType::Link, PredictType::ZiLink, PredictType::DispLink]
        .into_iter()
        .enumerate()
    {
        let g = RowOutput { kind, ..*f };
        eta[k] = ad::value(&g, phi);
    }
    let layout = &f.model.parameters.layout;
    eta[3] = layout.psi_index().map_or(0.0, |k| phi[k]);
    eta
}

/// Predict `kind` for the fitting data (`data = None`) or for new data.
/// Output rows follow the input rows; rows with missing predictors are NaN.
pub fn predict(
    model: &FittedModel,
    data: Option<&DataTable>,
    kind: PredictType,
    re_form: ReForm,
    se: bool,
) -> FitResult<Prediction> {
    let frame = prediction_frame(model, data)?;
    let designs = row_designs(model, &frame, re_form);
    let phi = &model.parameters.values;
    let cov = model.covariance.as_ref().filter(|_| model.se_reliable);
    if se && cov.is_none() {
        debug!("Prediction standard errors requested but the parameter covariance is unavailable");
    }

    let mut fit = vec![f64::NAN; frame.n_out];
    let mut ses = vec![f64::NAN; frame.n_out];
    for (i, design) in designs.iter().enumerate() {
        let f = RowOutput {
            model,
            design,
            w: frame.weights[i],
            kind,
        };
        let out = frame.rows[i];
        if se {
            let (value, grad) = ad::gradient(&f, phi);
            fit[out] = value;
            if let Some(cov) = cov {
                let g: Vec<f64> = grad
                    .iter()
                    .enumerate()
                    .map(|(k, v)| {
                        if model.parameters.layout.block_of(k).is_fixed_effect() {
                            *v
                        } else {
                            0.0
                        }
                    })
                    .collect();
                ses[out] = cov.quad_form(&g, &g).max(0.0).sqrt();
            }
        } else {
            fit[out] = ad::value(&f, phi);
        }
    }
    Ok(Prediction {
        fit,
        se: se.then_some(ses),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glmm::fit::{fit, FitControl};
    use crate::model::spec::{LinearPredictor, ModelSpec};
    use glmm_linalg::DenseMatrix;

    fn zip_model() -> FittedModel {
        let y = vec![0.0, 0.0, 3.0, 0.0, 2.0, 4.0, 0.0, 1.0, 5.0, 0.0, 0.0, 3.0, 2.0, 0.0, 6.0, 0.0];
        let n = y.len();
        let x1: Vec<f64> = (0..n).map(|i| (i % 4) as f64 / 3.0).collect();
        let spec = ModelSpec::builder()
            .response(y)
            .family(Family::Poisson)
            .conditional(LinearPredictor::new(
                DenseMatrix::from_columns(n, &[vec![1.0; n], x1]),
                vec!["(Intercept)".into(), "x".into()],
            ))
            .zero_inflation(LinearPredictor::intercept(n))
            .build()
            .unwrap();
        fit(&spec, &FitControl::default()).unwrap()
    }

    #[test]
    fn test_response_is_conditional_times_one_minus_pz() {
        let model = zip_model();
        let cond = predict(&model, None, PredictType::Conditional, ReForm::Conditional, false).unwrap();
        let pz = predict(&model, None, PredictType::ZiProb, ReForm::Conditional, false).unwrap();
        let resp = predict(&model, None, PredictType::Response, ReForm::Conditional, false).unwrap();
        for i in 0..model.nobs {
            assert!((resp.fit[i] - cond.fit[i] * (1.0 - pz.fit[i])).abs() < 1e-12);
            assert!(pz.fit[i] > 0.0 && pz.fit[i] < 1.0);
        }
    }

    #[test]
    fn test_link_se_matches_delta_method() {
        let model = zip_model();
        let pred = predict(&model, None, PredictType::Link, ReForm::Population, true).unwrap();
        let se = pred.se.unwrap();
        let cov = model.covariance.as_ref().unwrap();
        // Row 0 has x = 0, so the SE is that of the intercept.
        assert!((se[0] - cov.get(0, 0).sqrt()).abs() < 1e-10);
        // Row 3 has x = 1: var(b0) + var(b1) + 2 cov(b0, b1).
        let v = cov.get(0, 0) + cov.get(1, 1) + 2.0 * cov.get(0, 1);
        assert!((se[3] - v.sqrt()).abs() < 1e-10);
    }

    #[test]
    fn test_matrix_built_model_rejects_new_data() {
        let model = zip_model();
        let table = DataTable::new().with_numeric("x", vec![0.5]);
        let err = predict(&model, Some(&table), PredictType::Link, ReForm::Conditional, false).unwrap_err();
        assert!(matches!(err, FitError::MalformedSpec(_)));
    }

    #[test]
    fn test_predict_type_parse() {
        assert_eq!(PredictType::parse("zprob"), Some(PredictType::ZiProb));
        assert_eq!(PredictType::parse("Response"), Some(PredictType::Response));
        assert_eq!(PredictType::parse("mean"), None);
    }
}
