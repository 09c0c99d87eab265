//! Delimited data-table reader.
//!
//! Reads tab-, comma- or whitespace-delimited files with a header row.
//! A column is numeric when every non-missing cell parses as a number,
//! otherwise it is categorical with its levels kept in sorted order.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One column of a data table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    /// Numeric values; NaN marks a missing cell.
    Numeric(Vec<f64>),
    /// Categorical codes into `levels`; `None` marks a missing cell.
    Categorical {
        codes: Vec<Option<usize>>,
        levels: Vec<String>,
    },
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Categorical { codes, .. } => codes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_missing(&self, row: usize) -> bool {
        match self {
            Column::Numeric(v) => v[row].is_nan(),
            Column::Categorical { codes, .. } => codes[row].is_none(),
        }
    }

    /// Label of a categorical cell, or the formatted number for numeric cells.
    pub fn label(&self, row: usize) -> Option<String> {
        match self {
            Column::Numeric(v) if !v[row].is_nan() => Some(format!("{}", v[row])),
            Column::Numeric(_) => None,
            Column::Categorical { codes, levels } => codes[row].map(|c| levels[c].clone()),
        }
    }

    fn select(&self, rows: &[usize]) -> Column {
        match self {
            Column::Numeric(v) => Column::Numeric(rows.iter().map(|&i| v[i]).collect()),
            Column::Categorical { codes, levels } => Column::Categorical {
                codes: rows.iter().map(|&i| codes[i]).collect(),
                levels: levels.clone(),
            },
        }
    }
}

/// A rectangular table of named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    names: Vec<String>,
    columns: Vec<Column>,
    nrows: usize,
}

impl DataTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a numeric column. Panics if its length disagrees with earlier columns.
    pub fn with_numeric(mut self, name: &str, values: Vec<f64>) -> Self {
        self.push(name, Column::Numeric(values));
        self
    }

    /// Add a categorical column from string labels.
    pub fn with_categorical<S: AsRef<str>>(mut self, name: &str, labels: &[S]) -> Self {
        let column = categorical_from_labels(labels.iter().map(|s| Some(s.as_ref())));
        self.push(name, column);
        self
    }

    fn push(&mut self, name: &str, column: Column) {
        if self.columns.is_empty() {
            self.nrows = column.len();
        }
        assert_eq!(column.len(), self.nrows, "column '{}' has the wrong length", name);
        if let Some(pos) = self.names.iter().position(|n| n == name) {
            self.columns[pos] = column;
        } else {
            self.names.push(name.to_string());
            self.columns.push(column);
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.names.iter().position(|n| n == name).map(|i| &self.columns[i])
    }

    /// Numeric values of a column, if it exists and is numeric.
    pub fn numeric(&self, name: &str) -> Option<&[f64]> {
        match self.column(name)? {
            Column::Numeric(v) => Some(v),
            Column::Categorical { .. } => None,
        }
    }

    /// Indices of rows with no missing value in any of `columns`.
    pub fn complete_rows(&self, columns: &[&str]) -> Result<Vec<usize>> {
        let cols = columns
            .iter()
            .map(|name| {
                self.column(name)
                    .ok_or_else(|| anyhow::anyhow!("Column '{}' not found in data", name))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((0..self.nrows)
            .filter(|&i| cols.iter().all(|c| !c.is_missing(i)))
            .collect())
    }

    /// New table holding the listed rows, in order. Level sets are kept.
    pub fn select_rows(&self, rows: &[usize]) -> DataTable {
        DataTable {
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c.select(rows)).collect(),
            nrows: rows.len(),
        }
    }
}

/// Read a delimited table. The delimiter is detected from the header line:
/// tab, then comma, then runs of whitespace.
pub fn read_table(path: &Path) -> Result<DataTable> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read data file: {}", path.display()))?;
    parse_table(&contents).with_context(|| format!("Failed to parse data file: {}", path.display()))
}

/// Parse table text (see [`read_table`]).
pub fn parse_table(contents: &str) -> Result<DataTable> {
    let mut lines = contents.lines().filter(|l| !l.trim().is_empty());
    let header_line = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty data file"))?;
    let delim = Delimiter::detect(header_line);
    let headers: Vec<String> = delim.split(header_line).into_iter().map(str::to_string).collect();
    if headers.iter().any(|h| h.is_empty()) {
        bail!("Header contains an empty column name");
    }

    let mut cells: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
    for (line_num, line) in lines.enumerate() {
        let fields = delim.split(line);
        if fields.len() != headers.len() {
            bail!(
                "Line {} has {} fields, header has {}",
                line_num + 2,
                fields.len(),
                headers.len()
            );
        }
        for (j, f) in fields.into_iter().enumerate() {
            cells[j].push(f.to_string());
        }
    }

    let mut table = DataTable::new();
    for (name, raw) in headers.iter().zip(cells) {
        let column = infer_column(&raw);
        debug!(
            "Column '{}': {}",
            name,
            match &column {
                Column::Numeric(_) => "numeric".to_string(),
                Column::Categorical { levels, .. } => format!("categorical, {} levels", levels.len()),
            }
        );
        table.push(name, column);
    }
    Ok(table)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Delimiter {
    Tab,
    Comma,
    Whitespace,
}

impl Delimiter {
    fn detect(header: &str) -> Self {
        if header.contains('\t') {
            Delimiter::Tab
        } else if header.contains(',') {
            Delimiter::Comma
        } else {
            Delimiter::Whitespace
        }
    }

    fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        match self {
            Delimiter::Tab => line.split('\t').map(str::trim).collect(),
            Delimiter::Comma => line.split(',').map(str::trim).collect(),
            Delimiter::Whitespace => line.split_whitespace().collect(),
        }
    }
}

/// Missing-value markers.
pub fn is_missing_token(s: &str) -> bool {
    matches!(s, "NA" | "na" | "Na" | "." | "" | "NaN" | "nan")
}

fn infer_column(raw: &[String]) -> Column {
    let numeric: Option<Vec<f64>> = raw
        .iter()
        .map(|s| {
            if is_missing_token(s) {
                Some(f64::NAN)
            } else {
                s.parse::<f64>().ok()
            }
        })
        .collect();
    match numeric {
        Some(v) => Column::Numeric(v),
        None => categorical_from_labels(
            raw.iter()
                .map(|s| if is_missing_token(s) { None } else { Some(s.as_str()) }),
        ),
    }
}

fn categorical_from_labels<'a, I: Iterator<Item = Option<&'a str>> + Clone>(labels: I) -> Column {
    let levels: Vec<String> = labels
        .clone()
        .flatten()
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let codes = labels
        .map(|l| l.and_then(|s| levels.binary_search_by(|lv| lv.as_str().cmp(s)).ok()))
        .collect();
    Column::Categorical { codes, levels }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_tab_table_with_types() {
        let text = "count\ttrt\tx\n3\tB\t0.5\n0\tA\tNA\n7\tB\t1.5\n";
        let t = parse_table(text).unwrap();
        assert_eq!(t.nrows(), 3);
        assert_eq!(t.numeric("count").unwrap(), &[3.0, 0.0, 7.0]);
        match t.column("trt").unwrap() {
            Column::Categorical { codes, levels } => {
                assert_eq!(levels, &vec!["A".to_string(), "B".to_string()]);
                assert_eq!(codes, &vec![Some(1), Some(0), Some(1)]);
            }
            _ => panic!("trt should be categorical"),
        }
        assert!(t.column("x").unwrap().is_missing(1));
        assert_eq!(t.complete_rows(&["count", "x"]).unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_comma_and_whitespace_delimiters() {
        let t = parse_table("a,b\n1,2\n3,4\n").unwrap();
        assert_eq!(t.numeric("b").unwrap(), &[2.0, 4.0]);
        let t = parse_table("a   b\n1 2\n").unwrap();
        assert_eq!(t.numeric("a").unwrap(), &[1.0]);
    }

    #[test]
    fn test_ragged_line_is_an_error() {
        assert!(parse_table("a\tb\n1\t2\n3\n").is_err());
    }

    #[test]
    fn test_unknown_column_in_complete_rows() {
        let t = DataTable::new().with_numeric("y", vec![1.0]);
        assert!(t.complete_rows(&["z"]).is_err());
    }

    #[test]
    fn test_select_rows_keeps_levels() {
        let t = DataTable::new().with_categorical("g", &["b", "a", "c"]);
        let s = t.select_rows(&[2]);
        match s.column("g").unwrap() {
            Column::Categorical { codes, levels } => {
                assert_eq!(levels.len(), 3);
                assert_eq!(codes, &vec![Some(2)]);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn test_read_table_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.tsv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "y\tgroup").unwrap();
        writeln!(f, "1\tg1").unwrap();
        writeln!(f, "2\tg2").unwrap();
        let t = read_table(&path).unwrap();
        assert_eq!(t.names(), &["y".to_string(), "group".to_string()]);
        assert_eq!(t.column("group").unwrap().label(1).as_deref(), Some("g2"));
    }
}
