//! Prior table reader.
//!
//! A prior table has a header naming the columns `prior`, `class` and
//! (optionally) `coef`, one prior per line:
//! ```text
//! prior           class     coef
//! normal(0, 3)    fixef     treatmentB
//! gamma(2, 0.5)   theta
//! ```
//! Fields are separated by tabs or commas; delimiters inside parentheses
//! are part of the field, so `normal(0, 3)` survives comma separation.
//! The distribution strings are interpreted by glmm-core.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// One raw row of a prior table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorRow {
    /// Distribution string, e.g. `normal(0, 3)`.
    pub prior: String,
    /// Parameter class, e.g. `fixef` or `theta`.
    pub class: String,
    /// Coefficient selector; empty selects the whole class.
    pub coef: String,
}

/// Read a prior table from disk.
pub fn read_prior_table(path: &Path) -> Result<Vec<PriorRow>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read prior file: {}", path.display()))?;
    parse_prior_table(&contents)
        .with_context(|| format!("Failed to parse prior file: {}", path.display()))
}

/// Parse prior-table text.
pub fn parse_prior_table(contents: &str) -> Result<Vec<PriorRow>> {
    let mut lines = contents
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'));
    let header = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty prior file"))?;
    let delim = if header.contains('\t') { '\t' } else { ',' };
    let headers = split_outside_parens(header, delim);

    let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let prior_idx = find("prior").ok_or_else(|| anyhow::anyhow!("Prior file lacks a 'prior' column"))?;
    let class_idx = find("class").ok_or_else(|| anyhow::anyhow!("Prior file lacks a 'class' column"))?;
    let coef_idx = find("coef");

    let mut rows = Vec::new();
    for (line_num, line) in lines.enumerate() {
        let fields = split_outside_parens(line, delim);
        let get = |idx: usize| fields.get(idx).cloned().unwrap_or_default();
        let prior = get(prior_idx);
        let class = get(class_idx);
        if prior.is_empty() || class.is_empty() {
            bail!("Line {}: prior and class must both be given", line_num + 2);
        }
        rows.push(PriorRow {
            prior,
            class,
            coef: coef_idx.map(get).unwrap_or_default(),
        });
    }
    Ok(rows)
}

/// Split `line` on `delim`, ignoring delimiters nested in parentheses.
pub fn split_outside_parens(line: &str, delim: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for ch in line.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                current.push(ch);
            }
            c if c == delim && depth == 0 => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            c => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_respects_parentheses() {
        let f = split_outside_parens("normal(0, 3),fixef,x", ',');
        assert_eq!(f, vec!["normal(0, 3)", "fixef", "x"]);
    }

    #[test]
    fn test_parse_with_blank_coef() {
        let text = "prior\tclass\tcoef\nnormal(0,3)\tfixef\ttrtB\ngamma(2, 0.5)\ttheta\t\n";
        let rows = parse_prior_table(text).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].coef, "trtB");
        assert_eq!(rows[1].prior, "gamma(2, 0.5)");
        assert_eq!(rows[1].coef, "");
    }

    #[test]
    fn test_missing_class_column() {
        assert!(parse_prior_table("prior,coef\nnormal(0,1),x\n").is_err());
    }

    #[test]
    fn test_comment_lines_skipped() {
        let rows = parse_prior_table("prior,class\n# ridge\nnormal(0,1),fixef\n").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].coef, "");
    }
}
