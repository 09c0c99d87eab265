//! ModelSpec: the immutable design bundle one fit works from.
//!
//! Holds the response, prior weights, family and link, and three linear
//! predictors: conditional mean, zero-inflation (optional) and
//! dispersion. Each linear predictor has a dense fixed-effect design, an
//! offset and, for the first two, sparse random-effect designs.
//!
//! A spec is built either from a data table and formulas
//! ([`ModelSpec::from_table`]) or directly from matrices
//! ([`ModelSpec::builder`]). Both paths end in the same validation, so
//! an ill-posed design fails here, before any optimization.

use serde::{Deserialize, Serialize};
use tracing::info;

use glmm_data::{Column, DataTable};
use glmm_linalg::decomposition::QrDecomp;
use glmm_linalg::{DenseMatrix, LinalgError, SparseMatrix};

use super::formula::parse_formula;
use super::frame::PredictorEncoding;
use super::parameters::ParameterLayout;
use crate::error::{FitError, FitResult};
use crate::glmm::covariance::CovStructure;
use crate::glmm::family::Family;
use crate::glmm::link::Link;
use crate::glmm::prior::{PriorPenalty, PriorSpec};

/// One random-effect term of a linear predictor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReTerm {
    /// Term label, e.g. `1 | site`.
    pub label: String,
    /// Grouping factor name, e.g. `site` or `site:plot`.
    pub group: String,
    pub structure: CovStructure,
    /// Names of the term's columns, e.g. `(Intercept)`, `x`.
    pub columns: Vec<String>,
    pub levels: Vec<String>,
    /// n x (levels * dim) design; column `l * dim + j` is column j of level l.
    pub z: SparseMatrix,
}

impl ReTerm {
    /// Random intercept per level of `groups` (one label per row).
    pub fn intercept<S: AsRef<str>>(group: &str, groups: &[S]) -> Self {
        let mut levels: Vec<String> = groups.iter().map(|g| g.as_ref().to_string()).collect();
        levels.sort();
        levels.dedup();
        let cols: Vec<usize> = groups
            .iter()
            .map(|g| levels.iter().position(|l| l == g.as_ref()).unwrap_or(0))
            .collect();
        let rows: Vec<usize> = (0..groups.len()).collect();
        let vals = vec![1.0; groups.len()];
        ReTerm {
            label: format!("1 | {}", group),
            group: group.to_string(),
            structure: CovStructure::Unstructured,
            columns: vec!["(Intercept)".to_string()],
            z: SparseMatrix::from_triplets(groups.len(), levels.len(), &rows, &cols, &vals),
            levels,
        }
    }

    pub fn dim(&self) -> usize {
        self.columns.len()
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }
}

/// One linear predictor: `X beta + offset + sum_k Z_k b_k`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearPredictor {
    pub x: DenseMatrix,
    pub names: Vec<String>,
    pub offset: Vec<f64>,
    pub re_terms: Vec<ReTerm>,
}

impl LinearPredictor {
    pub fn new(x: DenseMatrix, names: Vec<String>) -> Self {
        let n = x.nrows();
        LinearPredictor {
            x,
            names,
            offset: vec![0.0; n],
            re_terms: Vec::new(),
        }
    }

    /// Intercept-only predictor for n rows.
    pub fn intercept(n: usize) -> Self {
        Self::new(DenseMatrix::from_columns(n, &[vec![1.0; n]]), vec!["(Intercept)".into()])
    }

    /// Predictor with no columns at all (eta = offset = 0).
    pub fn empty(n: usize) -> Self {
        Self::new(DenseMatrix::zeros(n, 0), Vec::new())
    }

    pub fn with_offset(mut self, offset: Vec<f64>) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_re_term(mut self, term: ReTerm) -> Self {
        self.re_terms.push(term);
        self
    }

    pub fn nrows(&self) -> usize {
        self.x.nrows()
    }

    pub fn n_fixed(&self) -> usize {
        self.x.ncols()
    }

    /// Fixed part of the predictor for row i: `x_i' beta + offset_i`.
    pub fn fixed_eta(&self, i: usize, beta: &[f64]) -> f64 {
        self.x.row_dot(i, beta) + self.offset[i]
    }

    fn check_rows(&self, n: usize, what: &str) -> FitResult<()> {
        if self.x.nrows() != n || self.offset.len() != n {
            return Err(FitError::MalformedSpec(format!(
                "{} design has {} rows, response has {}",
                what,
                self.x.nrows(),
                n
            )));
        }
        if self.names.len() != self.x.ncols() {
            return Err(FitError::MalformedSpec(format!(
                "{} design has {} columns but {} names",
                what,
                self.x.ncols(),
                self.names.len()
            )));
        }
        for term in &self.re_terms {
            if term.z.nrows() != n || term.z.ncols() != term.n_levels() * term.dim() {
                return Err(FitError::MalformedSpec(format!(
                    "random-effect design of '{}' has the wrong shape",
                    term.label
                )));
            }
            if term.n_levels() < 2 {
                return Err(FitError::MalformedSpec(format!(
                    "grouping factor '{}' has fewer than 2 levels",
                    term.group
                )));
            }
        }
        Ok(())
    }

    fn check_rank(&self, what: &str) -> FitResult<()> {
        if self.x.ncols() == 0 {
            return Ok(());
        }
        if self.x.nrows() < self.x.ncols() {
            return Err(FitError::MalformedSpec(format!(
                "{} design has more columns ({}) than rows ({})",
                what,
                self.x.ncols(),
                self.x.nrows()
            )));
        }
        match QrDecomp::new(&self.x) {
            Ok(_) => Ok(()),
            Err(LinalgError::SingularMatrix { column }) => Err(FitError::MalformedSpec(format!(
                "{} design is rank deficient (column '{}')",
                what, self.names[column]
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

/// Formulas of the three sub-models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFormulas {
    pub conditional: String,
    pub zero_inflation: Option<String>,
    pub dispersion: Option<String>,
}

impl ModelFormulas {
    pub fn new(conditional: &str) -> Self {
        ModelFormulas {
            conditional: conditional.to_string(),
            zero_inflation: None,
            dispersion: None,
        }
    }

    pub fn zero_inflation(mut self, formula: &str) -> Self {
        self.zero_inflation = Some(formula.to_string());
        self
    }

    pub fn dispersion(mut self, formula: &str) -> Self {
        self.dispersion = Some(formula.to_string());
        self
    }
}

/// Column encodings kept so new data can be coded like the fitting data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecEncodings {
    pub formulas: ModelFormulas,
    pub response: String,
    pub weights: Option<String>,
    pub cond: PredictorEncoding,
    pub zi: Option<PredictorEncoding>,
    pub disp: PredictorEncoding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub y: Vec<f64>,
    /// Prior weights; the number of trials for binomial-type families.
    pub weights: Vec<f64>,
    pub family: Family,
    pub link: Link,
    pub cond: LinearPredictor,
    /// Zero-inflation model; `None` switches zero-inflation off.
    pub zi: Option<LinearPredictor>,
    pub disp: LinearPredictor,
    pub priors: Vec<PriorSpec>,
    pub encodings: Option<SpecEncodings>,
}

impl ModelSpec {
    pub fn builder() -> ModelSpecBuilder {
        ModelSpecBuilder::default()
    }

    /// Build a spec from formulas evaluated on `table`. Rows with a
    /// missing value in any model column are dropped.
    pub fn from_table(
        table: &DataTable,
        formulas: &ModelFormulas,
        family: Family,
        link: Option<Link>,
        weights: Option<&str>,
        priors: Vec<PriorSpec>,
    ) -> FitResult<ModelSpec> {
        let cond_f = parse_formula(&formulas.conditional)?;
        let response = cond_f
            .response
            .clone()
            .ok_or_else(|| FitError::Formula("conditional formula needs a response".into()))?;
        let zi_f = match &formulas.zero_inflation {
            Some(text) => {
                let f = parse_formula(text)?;
                (!f.is_empty()).then_some(f)
            }
            None => None,
        };
        let disp_f = match &formulas.dispersion {
            Some(text) => {
                let f = parse_formula(text)?;
                if !f.random.is_empty() {
                    return Err(FitError::Formula(
                        "the dispersion model cannot have random effects".into(),
                    ));
                }
                Some(f)
            }
            None => None,
        };
        if !family.has_dispersion() {
            if let Some(f) = &disp_f {
                if !f.terms.is_empty() || !f.offsets.is_empty() {
                    return Err(FitError::MalformedSpec(format!(
                        "family {} has no dispersion parameter",
                        family.name()
                    )));
                }
            }
        }

        let mut used = cond_f.columns();
        for f in zi_f.iter().chain(disp_f.iter()) {
            used.extend(f.columns());
        }
        if let Some(w) = weights {
            used.push(w.to_string());
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
        if rows.len() < table.nrows() {
            info!(
                "Dropped {} of {} rows with missing values in model columns",
                table.nrows() - rows.len(),
                table.nrows()
            );
        }
        let data = table.select_rows(&rows);
        if data.nrows() == 0 {
            return Err(FitError::MalformedSpec("no complete rows in data".into()));
        }

        let y = response_values(&data, &response, family)?;
        let w = match weights {
            Some(name) => data
                .numeric(name)
                .ok_or_else(|| FitError::MalformedSpec(format!("weights column '{}' must be numeric", name)))?
                .to_vec(),
            None => vec![1.0; data.nrows()],
        };

        let cond_enc = PredictorEncoding::from_formula(&cond_f, &data)?;
        let zi_enc = zi_f
            .as_ref()
            .map(|f| PredictorEncoding::from_formula(f, &data))
            .transpose()?;
        let disp_enc = if !family.has_dispersion() {
            PredictorEncoding {
                fixed: Vec::new(),
                ..PredictorEncoding::intercept_only()
            }
        } else {
            match &disp_f {
                Some(f) => PredictorEncoding::from_formula(f, &data)?,
                None => PredictorEncoding::intercept_only(),
            }
        };

        let mut builder = ModelSpec::builder()
            .response(y)
            .weights(w)
            .family(family)
            .conditional(cond_enc.build(&data)?)
            .dispersion(disp_enc.build(&data)?)
            .priors(priors);
        if let Some(l) = link {
            builder = builder.link(l);
        }
        if let Some(enc) = &zi_enc {
            builder = builder.zero_inflation(enc.build(&data)?);
        }
        let mut spec = builder.build()?;
        spec.encodings = Some(SpecEncodings {
            formulas: formulas.clone(),
            response,
            weights: weights.map(str::to_string),
            cond: cond_enc,
            zi: zi_enc,
            disp: disp_enc,
        });
        Ok(spec)
    }

    pub fn nobs(&self) -> usize {
        self.y.len()
    }

    pub fn zero_inflated(&self) -> bool {
        self.zi.is_some()
    }

    pub fn layout(&self) -> ParameterLayout {
        ParameterLayout::from_spec(self)
    }

    /// Same design with a different prior set.
    pub fn with_priors(mut self, priors: Vec<PriorSpec>) -> FitResult<ModelSpec> {
        self.priors = priors;
        PriorPenalty::resolve(&self.priors, &self.layout())?;
        Ok(self)
    }

    /// Check the design before any optimization.
    pub fn validate(&self) -> FitResult<()> {
        let n = self.y.len();
        if n == 0 {
            return Err(FitError::MalformedSpec("empty response".into()));
        }
        if self.weights.len() != n {
            return Err(FitError::MalformedSpec(format!(
                "{} weights for {} observations",
                self.weights.len(),
                n
            )));
        }
        if !self.family.allows_link(self.link) {
            return Err(FitError::MalformedSpec(format!(
                "link {} is not available for family {}",
                self.link.name(),
                self.family.name()
            )));
        }
        if self.zi.is_some() && !self.family.allows_zero_inflation() {
            return Err(FitError::MalformedSpec(format!(
                "family {} cannot have a zero-inflation model",
                self.family.name()
            )));
        }
        if !self.family.has_dispersion() && self.disp.n_fixed() > 0 {
            return Err(FitError::MalformedSpec(format!(
                "family {} has no dispersion parameter",
                self.family.name()
            )));
        }
        if !self.disp.re_terms.is_empty() {
            return Err(FitError::MalformedSpec(
                "the dispersion model cannot have random effects".into(),
            ));
        }
        for (i, (&y, &w)) in self.y.iter().zip(&self.weights).enumerate() {
            self.family
                .check_response(y, w, self.zero_inflated())
                .map_err(|e| FitError::MalformedSpec(format!("observation {}: {}", i + 1, e)))?;
        }

        self.cond.check_rows(n, "conditional")?;
        self.disp.check_rows(n, "dispersion")?;
        if let Some(zi) = &self.zi {
            zi.check_rows(n, "zero-inflation")?;
        }
        self.cond.check_rank("conditional")?;
        self.disp.check_rank("dispersion")?;
        if let Some(zi) = &self.zi {
            zi.check_rank("zero-inflation")?;
        }
        PriorPenalty::resolve(&self.priors, &self.layout())?;
        Ok(())
    }
}

/// Response column as numbers. A two-level categorical response is coded
/// 0/1 (second level = 1) for binomial-type families.
fn response_values(data: &DataTable, name: &str, family: Family) -> FitResult<Vec<f64>> {
    match data.column(name) {
        Some(Column::Numeric(v)) => Ok(v.clone()),
        Some(Column::Categorical { codes, levels }) if family.weights_are_trials() && levels.len() == 2 => {
            Ok(codes
                .iter()
                .map(|c| match c {
                    Some(1) => 1.0,
                    Some(_) => 0.0,
                    None => f64::NAN,
                })
                .collect())
        }
        Some(_) => Err(FitError::MalformedSpec(format!(
            "response '{}' must be numeric",
            name
        ))),
        None => Err(FitError::UnknownColumn(name.to_string())),
    }
}

/// Builder for specs assembled from matrices.
#[derive(Debug, Default)]
pub struct ModelSpecBuilder {
    y: Vec<f64>,
    weights: Option<Vec<f64>>,
    family: Option<Family>,
    link: Option<Link>,
    cond: Option<LinearPredictor>,
    zi: Option<LinearPredictor>,
    disp: Option<LinearPredictor>,
    priors: Vec<PriorSpec>,
}

impl ModelSpecBuilder {
    pub fn response(mut self, y: Vec<f64>) -> Self {
        self.y = y;
        self
    }

    pub fn weights(mut self, w: Vec<f64>) -> Self {
        self.weights = Some(w);
        self
    }

    pub fn family(mut self, family: Family) -> Self {
        self.family = Some(family);
        self
    }

    pub fn link(mut self, link: Link) -> Self {
        self.link = Some(link);
        self
    }

    pub fn conditional(mut self, lp: LinearPredictor) -> Self {
        self.cond = Some(lp);
        self
    }

    pub fn zero_inflation(mut self, lp: LinearPredictor) -> Self {
        self.zi = Some(lp);
        self
    }

    pub fn dispersion(mut self, lp: LinearPredictor) -> Self {
        self.disp = Some(lp);
        self
    }

    pub fn prior(mut self, prior: PriorSpec) -> Self {
        self.priors.push(prior);
        self
    }

    pub fn priors(mut self, priors: Vec<PriorSpec>) -> Self {
        self.priors.extend(priors);
        self
    }

    /// Assemble and validate. The dispersion model defaults to an
    /// intercept for families that have one.
    pub fn build(self) -> FitResult<ModelSpec> {
        let n = self.y.len();
        let family = self
            .family
            .ok_or_else(|| FitError::MalformedSpec("no family given".into()))?;
        let cond = self
            .cond
            .ok_or_else(|| FitError::MalformedSpec("no conditional design given".into()))?;
        let disp = match self.disp {
            Some(d) => d,
            None if family.has_dispersion() => LinearPredictor::intercept(n),
            None => LinearPredictor::empty(n),
        };
        let spec = ModelSpec {
            weights: self.weights.unwrap_or_else(|| vec![1.0; n]),
            y: self.y,
            family,
            link: self.link.unwrap_or_else(|| family.default_link()),
            cond,
            zi: self.zi,
            disp,
            priors: self.priors,
            encodings: None,
        };
        spec.validate()?;
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parameters::Block;

    fn toy_table() -> DataTable {
        DataTable::new()
            .with_numeric("count", vec![0.0, 2.0, 1.0, f64::NAN, 5.0, 0.0])
            .with_numeric("x", vec![0.1, 0.4, -0.3, 0.8, 1.2, -0.5])
            .with_categorical("site", &["a", "a", "b", "b", "c", "c"])
    }

    #[test]
    fn test_from_table_drops_missing_rows() {
        let formulas = ModelFormulas::new("count ~ x + (1 | site)").zero_inflation("~1");
        let spec = ModelSpec::from_table(&toy_table(), &formulas, Family::Poisson, None, None, Vec::new())
            .unwrap();
        assert_eq!(spec.nobs(), 5);
        assert!(spec.zero_inflated());
        assert_eq!(spec.link, Link::Log);
        assert_eq!(spec.disp.n_fixed(), 0);
        let layout = spec.layout();
        assert_eq!(layout.block_names(Block::Beta), ["(Intercept)", "x"]);
        assert_eq!(layout.block_names(Block::BetaZi), ["(Intercept)"]);
        assert_eq!(layout.block_names(Block::Theta), ["sd.(Intercept)|site"]);
        assert_eq!(layout.n_b, 3);
        assert_eq!(layout.display_name(2), "zi~(Intercept)");
    }

    #[test]
    fn test_zero_formula_disables_zero_inflation() {
        let formulas = ModelFormulas::new("count ~ x").zero_inflation("~0");
        let spec = ModelSpec::from_table(&toy_table(), &formulas, Family::Poisson, None, None, Vec::new())
            .unwrap();
        assert!(!spec.zero_inflated());
    }

    #[test]
    fn test_truncated_family_rejects_zeros() {
        let formulas = ModelFormulas::new("count ~ x");
        let err = ModelSpec::from_table(
            &toy_table(),
            &formulas,
            Family::TruncatedPoisson,
            None,
            None,
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, FitError::MalformedSpec(_)));
        // A hurdle model admits them.
        let hurdle = formulas.zero_inflation("~1");
        assert!(ModelSpec::from_table(&toy_table(), &hurdle, Family::TruncatedPoisson, None, None, Vec::new()).is_ok());
    }

    #[test]
    fn test_rank_deficient_design() {
        let x = DenseMatrix::from_columns(4, &[vec![1.0; 4], vec![2.0; 4]]);
        let err = ModelSpec::builder()
            .response(vec![1.0, 2.0, 3.0, 4.0])
            .family(Family::Gaussian)
            .conditional(LinearPredictor::new(x, vec!["a".into(), "b".into()]))
            .build()
            .unwrap_err();
        assert!(matches!(err, FitError::MalformedSpec(ref m) if m.contains("rank deficient")));
    }

    #[test]
    fn test_single_level_group_rejected() {
        let lp = LinearPredictor::intercept(3).with_re_term(ReTerm::intercept("g", &["a", "a", "a"]));
        let err = ModelSpec::builder()
            .response(vec![1.0, 0.0, 2.0])
            .family(Family::Poisson)
            .conditional(lp)
            .build()
            .unwrap_err();
        assert!(matches!(err, FitError::MalformedSpec(_)));
    }

    #[test]
    fn test_link_must_suit_family() {
        let err = ModelSpec::builder()
            .response(vec![1.0, 0.0])
            .family(Family::Poisson)
            .link(Link::Logit)
            .conditional(LinearPredictor::intercept(2))
            .build()
            .unwrap_err();
        assert!(matches!(err, FitError::MalformedSpec(_)));
    }

    #[test]
    fn test_offset_enters_fixed_part() {
        let lp = LinearPredictor::intercept(3).with_offset(vec![0.5, 1.0, -1.0]);
        assert_eq!(lp.fixed_eta(2, &[2.0]), 1.0);

        let short = LinearPredictor::intercept(3).with_offset(vec![0.0; 2]);
        let err = ModelSpec::builder()
            .response(vec![1.0, 0.0, 2.0])
            .family(Family::Poisson)
            .conditional(short)
            .build()
            .unwrap_err();
        assert!(matches!(err, FitError::MalformedSpec(_)));
    }
}
