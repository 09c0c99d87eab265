//! Mixed-model formula subset.
//!
//! Grammar:
//! ```text
//! formula  := [response] '~' rhs
//! rhs      := term (('+' | '-') term)*
//! term     := '0' | '1' | 'offset(' col ')' | col (':' col)*
//!           | [struct] '(' rhs '|' col (':' col)* ')'
//! struct   := 'us' | 'diag' | 'cs' | 'ar1' | 'homdiag'
//! ```
//! `-1` and `0` drop the intercept. Random-effect terms cannot nest
//! further random-effect terms.

use serde::{Deserialize, Serialize};

use crate::error::{FitError, FitResult};
use crate::glmm::covariance::CovStructure;

/// A fixed-effect term: one column or an interaction of columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTerm {
    pub factors: Vec<String>,
}

impl FixedTerm {
    pub fn label(&self) -> String {
        self.factors.join(":")
    }
}

/// A random-effect term `struct(expr | group)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomTerm {
    pub structure: CovStructure,
    pub intercept: bool,
    pub terms: Vec<FixedTerm>,
    pub group: Vec<String>,
}

impl RandomTerm {
    /// Label in the form `x | site`, used for reporting and prior selection.
    pub fn label(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.intercept {
            parts.push("1".to_string());
        } else {
            parts.push("0".to_string());
        }
        parts.extend(self.terms.iter().map(FixedTerm::label));
        if self.intercept && parts.len() > 1 {
            parts.remove(0);
        }
        format!("{} | {}", parts.join(" + "), self.group_label())
    }

    pub fn group_label(&self) -> String {
        self.group.join(":")
    }
}

/// A parsed formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub response: Option<String>,
    pub intercept: bool,
    pub terms: Vec<FixedTerm>,
    pub offsets: Vec<String>,
    pub random: Vec<RandomTerm>,
}

impl Formula {
    /// Every data column the formula reads, response included.
    pub fn columns(&self) -> Vec<String> {
        let mut cols: Vec<String> = Vec::new();
        let mut add = |c: &String| {
            if !cols.contains(c) {
                cols.push(c.clone());
            }
        };
        if let Some(r) = &self.response {
            add(r);
        }
        for t in &self.terms {
            t.factors.iter().for_each(&mut add);
        }
        self.offsets.iter().for_each(&mut add);
        for r in &self.random {
            for t in &r.terms {
                t.factors.iter().for_each(&mut add);
            }
            r.group.iter().for_each(&mut add);
        }
        cols
    }

    /// True for `~0`: no model at all (used to switch zero-inflation off).
    pub fn is_empty(&self) -> bool {
        !self.intercept && self.terms.is_empty() && self.random.is_empty()
    }
}

/// Parse a formula string.
pub fn parse_formula(text: &str) -> FitResult<Formula> {
    let (lhs, rhs) = match text.split_once('~') {
        Some((l, r)) => (l.trim(), r),
        None => return Err(FitError::Formula(format!("missing '~' in '{}'", text))),
    };
    let response = if lhs.is_empty() {
        None
    } else {
        check_name(lhs)?;
        Some(lhs.to_string())
    };
    let mut formula = Formula {
        response,
        intercept: true,
        terms: Vec::new(),
        offsets: Vec::new(),
        random: Vec::new(),
    };
    parse_rhs(rhs, &mut formula, true)?;
    Ok(formula)
}

fn parse_rhs(rhs: &str, formula: &mut Formula, allow_random: bool) -> FitResult<()> {
    let rhs = rhs.trim();
    if rhs.is_empty() {
        return Err(FitError::Formula("empty right-hand side".into()));
    }
    for (negative, term) in split_terms(rhs)? {
        match term.as_str() {
            "1" => formula.intercept = !negative,
            "0" => formula.intercept = false,
            _ if negative => {
                return Err(FitError::Formula(format!("cannot remove term '{}'", term)))
            }
            _ => {
                if let Some(col) = strip_call(&term, "offset") {
                    check_name(col)?;
                    formula.offsets.push(col.to_string());
                } else if let Some(random) = parse_random(&term)? {
                    if !allow_random {
                        return Err(FitError::Formula(format!(
                            "nested random-effect term '{}'",
                            term
                        )));
                    }
                    formula.random.push(random);
                } else {
                    let fixed = parse_fixed(&term)?;
                    if !formula.terms.contains(&fixed) {
                        formula.terms.push(fixed);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Split at top-level `+` and `-`, returning (negated, term) pairs.
fn split_terms(rhs: &str) -> FitResult<Vec<(bool, String)>> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    let mut negative = false;
    for ch in rhs.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(FitError::Formula(format!("unbalanced ')' in '{}'", rhs)));
                }
                current.push(ch);
            }
            '+' | '-' if depth == 0 => {
                let term = current.trim().to_string();
                if !term.is_empty() {
                    out.push((negative, term));
                } else if !out.is_empty() || ch == '+' {
                    return Err(FitError::Formula(format!("empty term in '{}'", rhs)));
                }
                negative = ch == '-';
                current.clear();
            }
            c => current.push(c),
        }
    }
    if depth != 0 {
        return Err(FitError::Formula(format!("unbalanced '(' in '{}'", rhs)));
    }
    let term = current.trim().to_string();
    if term.is_empty() {
        return Err(FitError::Formula(format!("trailing operator in '{}'", rhs)));
    }
    out.push((negative, term));
    Ok(out)
}

fn strip_call<'a>(term: &'a str, name: &str) -> Option<&'a str> {
    let rest = term.strip_prefix(name)?.trim_start();
    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
    Some(inner.trim())
}

fn parse_random(term: &str) -> FitResult<Option<RandomTerm>> {
    let (structure, body) = match term.find('(') {
        Some(0) => (CovStructure::Unstructured, term),
        Some(pos) => match CovStructure::parse(&term[..pos]) {
            Some(s) => (s, &term[pos..]),
            None => return Ok(None),
        },
        None => return Ok(None),
    };
    let Some(inner) = body.trim().strip_prefix('(').and_then(|b| b.strip_suffix(')')) else {
        return Ok(None);
    };
    let Some((expr, group)) = inner.split_once('|') else {
        return Err(FitError::Formula(format!(
            "random-effect term '{}' lacks a '|'",
            term
        )));
    };
    let group: Vec<String> = group.split(':').map(|g| g.trim().to_string()).collect();
    for g in &group {
        check_name(g)?;
    }
    let mut inner_formula = Formula {
        response: None,
        intercept: true,
        terms: Vec::new(),
        offsets: Vec::new(),
        random: Vec::new(),
    };
    parse_rhs(expr, &mut inner_formula, false)?;
    if !inner_formula.offsets.is_empty() {
        return Err(FitError::Formula(format!("offset inside random term '{}'", term)));
    }
    if !inner_formula.intercept && inner_formula.terms.is_empty() {
        return Err(FitError::Formula(format!("random term '{}' has no columns", term)));
    }
    Ok(Some(RandomTerm {
        structure,
        intercept: inner_formula.intercept,
        terms: inner_formula.terms,
        group,
    }))
}

fn parse_fixed(term: &str) -> FitResult<FixedTerm> {
    let factors: Vec<String> = term.split(':').map(|f| f.trim().to_string()).collect();
    for f in &factors {
        check_name(f)?;
    }
    Ok(FixedTerm { factors })
}

fn check_name(name: &str) -> FitResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(FitError::Formula(format!("invalid column name '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_and_random_terms() {
        let f = parse_formula("count ~ trt + x:trt + (1 | site) + diag(1 + x | site:plot)").unwrap();
        assert_eq!(f.response.as_deref(), Some("count"));
        assert!(f.intercept);
        assert_eq!(f.terms.len(), 2);
        assert_eq!(f.terms[1].factors, vec!["x", "trt"]);
        assert_eq!(f.random.len(), 2);
        assert_eq!(f.random[0].structure, CovStructure::Unstructured);
        assert_eq!(f.random[1].structure, CovStructure::Diagonal);
        assert_eq!(f.random[1].group, vec!["site", "plot"]);
        assert_eq!(f.random[1].label(), "x | site:plot");
    }

    #[test]
    fn test_intercept_removal_and_offset() {
        let f = parse_formula("y ~ x - 1 + offset(logt)").unwrap();
        assert!(!f.intercept);
        assert_eq!(f.offsets, vec!["logt"]);
        let f = parse_formula("~0").unwrap();
        assert!(f.is_empty());
        assert!(f.response.is_none());
    }

    #[test]
    fn test_columns_listed_once() {
        let f = parse_formula("y ~ a + a:b + (a | g)").unwrap();
        assert_eq!(f.columns(), vec!["y", "a", "b", "g"]);
    }

    #[test]
    fn test_malformed_formulas() {
        assert!(parse_formula("y x").is_err());
        assert!(parse_formula("y ~ (1 | g").is_err());
        assert!(parse_formula("y ~ x +").is_err());
        assert!(parse_formula("y ~ (1 + (1|h) | g)").is_err());
        assert!(parse_formula("y ~ (x g)").is_err());
        assert!(parse_formula("y ~ 2x").is_err());
    }
}
