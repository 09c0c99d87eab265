//! Fit candidate models in parallel and rank them by AIC.
//!
//! glmm compare --data ... --family poisson \
//!     --model "pois=count ~ trt + (1 | site)" --model "zip=count ~ trt + (1 | site); ~ trt"

use std::path::Path;

use anyhow::{bail, Result};
use clap::Args;
use tracing::info;

use glmm_core::glmm::family::Family;
use glmm_core::glmm::link::Link;
use glmm_core::model::fitted::{aic_table, format_aic_table};
use glmm_core::{fit_many, ModelFormulas, ModelSpec};
use glmm_data::{read_table, DataTable};

use super::{fit_control, parse_family, parse_link};

#[derive(Args)]
pub struct CompareArgs {
    /// Data table (tab, comma or whitespace separated, with header)
    #[arg(long)]
    data: String,

    /// Response family shared by all candidates
    #[arg(long)]
    family: String,

    /// Link function (default: the family's canonical link)
    #[arg(long)]
    link: Option<String>,

    /// Prior-weight (or binomial trials) column
    #[arg(long)]
    weights: Option<String>,

    /// Candidate as name=formula, optionally followed by ";zi-formula"
    #[arg(long = "model", required = true)]
    models: Vec<String>,

    /// Maximum outer iterations
    #[arg(long, default_value = "300")]
    max_iter: usize,

    /// Outer gradient tolerance
    #[arg(long, default_value = "1e-6")]
    grad_tol: f64,

    /// Line search: more-thuente or hager-zhang
    #[arg(long, default_value = "more-thuente")]
    line_search: String,
}

/// Split `name=formula[;zi]`.
fn parse_candidate(text: &str) -> Result<(String, ModelFormulas)> {
    let Some((name, rest)) = text.split_once('=') else {
        bail!("Model '{}' must look like name=formula", text);
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("Model '{}' has an empty name", text);
    }
    let mut parts = rest.splitn(2, ';');
    let cond = parts.next().unwrap_or_default().trim();
    let mut formulas = ModelFormulas::new(cond);
    if let Some(zi) = parts.next() {
        formulas = formulas.zero_inflation(zi.trim());
    }
    Ok((name.to_string(), formulas))
}

fn build_candidates(
    table: &DataTable,
    candidates: &[String],
    family: Family,
    link: Option<Link>,
    weights: Option<&str>,
) -> Result<Vec<(String, ModelSpec)>> {
    candidates
        .iter()
        .map(|c| {
            let (name, formulas) = parse_candidate(c)?;
            let spec = ModelSpec::from_table(table, &formulas, family, link, weights, Vec::new())?;
            Ok((name, spec))
        })
        .collect()
}

pub fn run(args: CompareArgs) -> Result<()> {
    let family = parse_family(&args.family)?;
    let link = parse_link(args.link.as_deref())?;
    let control = fit_control(args.max_iter, args.grad_tol, &args.line_search)?;
    let table = read_table(Path::new(&args.data))?;

    let (names, specs): (Vec<String>, Vec<ModelSpec>) =
        build_candidates(&table, &args.models, family, link, args.weights.as_deref())?
            .into_iter()
            .unzip();
    info!("Fitting {} candidate models", specs.len());
    let named: Vec<(&str, ModelSpec)> = names.iter().map(String::as_str).zip(specs).collect();
    let results = fit_many(&named, &control);

    let mut fitted = Vec::new();
    let mut failed = Vec::new();
    for (name, result) in &results {
        match result {
            Ok(model) => fitted.push((name.as_str(), model)),
            Err(e) => failed.push((name.clone(), e.to_string())),
        }
    }
    let rows = aic_table(&fitted);
    print!("{}", format_aic_table(&rows, &failed));
    Ok(())
}
