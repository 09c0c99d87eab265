//! Model frame: turns a parsed formula plus a data table into design
//! matrices.
//!
//! The column encodings (which levels became which indicator columns,
//! which levels a grouping factor has) are fixed when the model is built
//! and kept in the ModelSpec, so new data for prediction is coded exactly like
//! the fitting data.
//!
//! Categorical columns use treatment contrasts: the first (sorted) level
//! is the reference. Only a single-factor categorical term that is the
//! first term of an intercept-free model is coded with all its levels.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use glmm_data::{Column, DataTable};
use glmm_linalg::{DenseMatrix, SparseMatrix};

use super::formula::{FixedTerm, Formula, RandomTerm};
use super::spec::{LinearPredictor, ReTerm};
use crate::error::{FitError, FitResult};
use crate::glmm::covariance::CovStructure;

/// One factor of a design column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Factor {
    Numeric(String),
    Level { column: String, level: String },
}

/// A design column: the product of its factors (the intercept has none).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignColumn {
    pub name: String,
    pub factors: Vec<Factor>,
}

/// Encoding of one random-effect term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomEncoding {
    pub label: String,
    pub structure: CovStructure,
    pub columns: Vec<DesignColumn>,
    pub group: Vec<String>,
    pub levels: Vec<String>,
}

/// Encoding of one linear predictor (conditional, zero-inflation or
/// dispersion).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorEncoding {
    pub fixed: Vec<DesignColumn>,
    pub offsets: Vec<String>,
    pub random: Vec<RandomEncoding>,
    /// Known levels of every categorical column used by fixed effects.
    pub factor_levels: BTreeMap<String, Vec<String>>,
}

impl PredictorEncoding {
    /// Derive the encoding of `formula` from the fitting data.
    pub fn from_formula(formula: &Formula, table: &DataTable) -> FitResult<Self> {
        let mut factor_levels = BTreeMap::new();
        let fixed = encode_terms(formula.intercept, &formula.terms, table, &mut factor_levels)?;
        let mut random = Vec::with_capacity(formula.random.len());
        for term in &formula.random {
            random.push(encode_random(term, table)?);
        }
        for off in &formula.offsets {
            numeric_column(table, off)?;
        }
        Ok(PredictorEncoding {
            fixed,
            offsets: formula.offsets.clone(),
            random,
            factor_levels,
        })
    }

    /// Fixed-effect intercept only, for the default dispersion model.
    pub fn intercept_only() -> Self {
        PredictorEncoding {
            fixed: vec![DesignColumn {
                name: "(Intercept)".to_string(),
                factors: Vec::new(),
            }],
            offsets: Vec::new(),
            random: Vec::new(),
            factor_levels: BTreeMap::new(),
        }
    }

    /// Every data column this encoding reads.
    pub fn columns(&self) -> Vec<String> {
        let mut cols: Vec<String> = Vec::new();
        let mut add = |c: &str| {
            if !cols.iter().any(|x| x == c) {
                cols.push(c.to_string());
            }
        };
        let design = self.fixed.iter().chain(self.random.iter().flat_map(|r| r.columns.iter()));
        for col in design {
            for f in &col.factors {
                match f {
                    Factor::Numeric(c) | Factor::Level { column: c, .. } => add(c),
                }
            }
        }
        self.offsets.iter().for_each(|c| add(c));
        for r in &self.random {
            r.group.iter().for_each(|c| add(c));
        }
        cols
    }

    /// Build the linear predictor for `table`. Grouping levels unknown to
    /// the encoding get an empty random-effect row; unknown levels of
    /// fixed-effect factors are an error.
    pub fn build(&self, table: &DataTable) -> FitResult<LinearPredictor> {
        let n = table.nrows();
        for (col, levels) in &self.factor_levels {
            if let Some(Column::Categorical { codes, levels: table_levels }) = table.column(col) {
                for code in codes.iter().flatten() {
                    if !levels.contains(&table_levels[*code]) {
                        return Err(FitError::MalformedSpec(format!(
                            "level '{}' of column '{}' was not present when the model was built",
                            table_levels[*code], col
                        )));
                    }
                }
            }
        }
        let columns = self
            .fixed
            .iter()
            .map(|c| evaluate_column(c, table))
            .collect::<FitResult<Vec<_>>>()?;
        let x = DenseMatrix::from_columns(n, &columns);
        let names = self.fixed.iter().map(|c| c.name.clone()).collect();

        let mut offset = vec![0.0; n];
        for off in &self.offsets {
            let values = numeric_column(table, off)?;
            for (o, v) in offset.iter_mut().zip(values) {
                *o += v;
            }
        }

        let re_terms = self
            .random
            .iter()
            .map(|r| build_random(r, table))
            .collect::<FitResult<Vec<_>>>()?;

        Ok(LinearPredictor {
            x,
            names,
            offset,
            re_terms,
        })
    }
}

fn numeric_column<'a>(table: &'a DataTable, name: &str) -> FitResult<&'a [f64]> {
    match table.column(name) {
        Some(Column::Numeric(v)) => Ok(v),
        Some(Column::Categorical { .. }) => Err(FitError::MalformedSpec(format!(
            "column '{}' must be numeric",
            name
        ))),
        None => Err(FitError::UnknownColumn(name.to_string())),
    }
}

fn encode_terms(
    intercept: bool,
    terms: &[FixedTerm],
    table: &DataTable,
    factor_levels: &mut BTreeMap<String, Vec<String>>,
) -> FitResult<Vec<DesignColumn>> {
    let mut columns = Vec::new();
    if intercept {
        columns.push(DesignColumn {
            name: "(Intercept)".to_string(),
            factors: Vec::new(),
        });
    }
    for (t, term) in terms.iter().enumerate() {
        let full_coding = !intercept && t == 0 && term.factors.len() == 1;
        // Cartesian product of the per-factor codings.
        let mut product: Vec<(String, Vec<Factor>)> = vec![(String::new(), Vec::new())];
        for name in &term.factors {
            let coding: Vec<(String, Factor)> = match table.column(name) {
                Some(Column::Numeric(_)) => vec![(name.clone(), Factor::Numeric(name.clone()))],
                Some(Column::Categorical { codes, levels }) => {
                    let present = present_levels(codes, levels);
                    factor_levels.insert(name.clone(), present.clone());
                    let skip = if full_coding { 0 } else { 1 };
                    present
                        .iter()
                        .skip(skip)
                        .map(|l| {
                            (
                                format!("{}{}", name, l),
                                Factor::Level {
                                    column: name.clone(),
                                    level: l.clone(),
                                },
                            )
                        })
                        .collect()
                }
                None => return Err(FitError::UnknownColumn(name.clone())),
            };
            let mut next = Vec::with_capacity(product.len() * coding.len());
            for (prefix, factors) in &product {
                for (label, factor) in &coding {
                    let name = if prefix.is_empty() {
                        label.clone()
                    } else {
                        format!("{}:{}", prefix, label)
                    };
                    let mut f = factors.clone();
                    f.push(factor.clone());
                    next.push((name, f));
                }
            }
            product = next;
        }
        columns.extend(
            product
                .into_iter()
                .map(|(name, factors)| DesignColumn { name, factors }),
        );
    }
    Ok(columns)
}

/// Levels that actually occur, in level order.
fn present_levels(codes: &[Option<usize>], levels: &[String]) -> Vec<String> {
    let mut used = vec![false; levels.len()];
    for code in codes.iter().flatten() {
        used[*code] = true;
    }
    levels
        .iter()
        .zip(used)
        .filter(|(_, u)| *u)
        .map(|(l, _)| l.clone())
        .collect()
}

fn encode_random(term: &RandomTerm, table: &DataTable) -> FitResult<RandomEncoding> {
    let mut unused = BTreeMap::new();
    let columns = encode_terms(term.intercept, &term.terms, table, &mut unused)?;
    let mut levels: Vec<String> = Vec::new();
    let labels = group_labels(&term.group, table)?;
    let mut seen = std::collections::BTreeSet::new();
    for label in labels.into_iter().flatten() {
        seen.insert(label);
    }
    levels.extend(seen);
    Ok(RandomEncoding {
        label: term.label(),
        structure: term.structure,
        columns,
        group: term.group.clone(),
        levels,
    })
}

/// Per-row level label of a (possibly interacted) grouping factor.
fn group_labels(group: &[String], table: &DataTable) -> FitResult<Vec<Option<String>>> {
    let cols = group
        .iter()
        .map(|g| table.column(g).ok_or_else(|| FitError::UnknownColumn(g.clone())))
        .collect::<FitResult<Vec<_>>>()?;
    Ok((0..table.nrows())
        .map(|i| {
            let parts: Option<Vec<String>> = cols.iter().map(|c| c.label(i)).collect();
            parts.map(|p| p.join(":"))
        })
        .collect())
}

fn evaluate_column(column: &DesignColumn, table: &DataTable) -> FitResult<Vec<f64>> {
    let mut values = vec![1.0; table.nrows()];
    for factor in &column.factors {
        match factor {
            Factor::Numeric(name) => {
                let v = numeric_column(table, name)?;
                for (out, x) in values.iter_mut().zip(v) {
                    *out *= x;
                }
            }
            Factor::Level { column: name, level } => match table.column(name) {
                Some(Column::Categorical { codes, levels }) => {
                    let target = levels.iter().position(|l| l == level);
                    for (out, code) in values.iter_mut().zip(codes) {
                        if target.is_none() || *code != target {
                            *out = 0.0;
                        }
                    }
                }
                Some(Column::Numeric(_)) => {
                    return Err(FitError::MalformedSpec(format!(
                        "column '{}' must be categorical",
                        name
                    )))
                }
                None => return Err(FitError::UnknownColumn(name.clone())),
            },
        }
    }
    Ok(values)
}

fn build_random(enc: &RandomEncoding, table: &DataTable) -> FitResult<ReTerm> {
    let n = table.nrows();
    let d = enc.columns.len();
    let index: HashMap<&str, usize> = enc
        .levels
        .iter()
        .enumerate()
        .map(|(i, l)| (l.as_str(), i))
        .collect();
    let values = enc
        .columns
        .iter()
        .map(|c| evaluate_column(c, table))
        .collect::<FitResult<Vec<_>>>()?;
    let labels = group_labels(&enc.group, table)?;
    let (mut rows, mut cols, mut vals) = (Vec::new(), Vec::new(), Vec::new());
    for (i, label) in labels.iter().enumerate() {
        let Some(level) = label.as_deref().and_then(|l| index.get(l)) else {
            continue;
        };
        for (j, col) in values.iter().enumerate() {
            if col[i] != 0.0 {
                rows.push(i);
                cols.push(level * d + j);
                vals.push(col[i]);
            }
        }
    }
    Ok(ReTerm {
        label: enc.label.clone(),
        group: enc.group.join(":"),
        structure: enc.structure,
        columns: enc.columns.iter().map(|c| c.name.clone()).collect(),
        levels: enc.levels.clone(),
        z: SparseMatrix::from_triplets(n, enc.levels.len() * d, &rows, &cols, &vals),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::formula::parse_formula;

    fn table() -> DataTable {
        DataTable::new()
            .with_numeric("y", vec![1.0, 2.0, 0.0, 4.0])
            .with_numeric("x", vec![0.5, 1.5, -1.0, 2.0])
            .with_categorical("trt", &["A", "B", "C", "B"])
            .with_categorical("site", &["s1", "s1", "s2", "s2"])
    }

    #[test]
    fn test_treatment_contrasts() {
        let f = parse_formula("y ~ x + trt").unwrap();
        let enc = PredictorEncoding::from_formula(&f, &table()).unwrap();
        let names: Vec<&str> = enc.fixed.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["(Intercept)", "x", "trtB", "trtC"]);
        let lp = enc.build(&table()).unwrap();
        assert_eq!(lp.x.col(2), vec![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_full_coding_without_intercept() {
        let f = parse_formula("y ~ 0 + trt").unwrap();
        let enc = PredictorEncoding::from_formula(&f, &table()).unwrap();
        assert_eq!(enc.fixed.len(), 3);
        assert_eq!(enc.fixed[0].name, "trtA");
    }

    #[test]
    fn test_interaction_columns() {
        let f = parse_formula("y ~ x:trt").unwrap();
        let enc = PredictorEncoding::from_formula(&f, &table()).unwrap();
        let lp = enc.build(&table()).unwrap();
        assert_eq!(lp.names, vec!["(Intercept)", "x:trtB", "x:trtC"]);
        assert_eq!(lp.x.col(1), vec![0.0, 1.5, 0.0, 2.0]);
    }

    #[test]
    fn test_random_design() {
        let f = parse_formula("y ~ 1 + (1 + x | site)").unwrap();
        let enc = PredictorEncoding::from_formula(&f, &table()).unwrap();
        let lp = enc.build(&table()).unwrap();
        let term = &lp.re_terms[0];
        assert_eq!(term.levels, vec!["s1", "s2"]);
        assert_eq!(term.z.ncols(), 4);
        assert_eq!(term.z.get(2, 2), 1.0);
        assert_eq!(term.z.get(2, 3), -1.0);
        assert_eq!(term.z.get(0, 2), 0.0);
    }

    #[test]
    fn test_new_data_unknown_levels() {
        let f = parse_formula("y ~ trt + (1 | site)").unwrap();
        let enc = PredictorEncoding::from_formula(&f, &table()).unwrap();
        let new_site = DataTable::new()
            .with_categorical("trt", &["A"])
            .with_categorical("site", &["s9"]);
        let lp = enc.build(&new_site).unwrap();
        assert_eq!(lp.re_terms[0].z.nnz(), 0);
        let new_trt = DataTable::new()
            .with_categorical("trt", &["Z"])
            .with_categorical("site", &["s1"]);
        assert!(enc.build(&new_trt).is_err());
    }

    #[test]
    fn test_missing_column() {
        let f = parse_formula("y ~ nope").unwrap();
        assert_eq!(
            PredictorEncoding::from_formula(&f, &table()).unwrap_err(),
            FitError::UnknownColumn("nope".into())
        );
    }
}
