//! Fit one model and save it.
//!
//! glmm fit --data ... --formula "count ~ trt + (1 | site)" --zi-formula "~ trt" --family poisson --output-prefix ...

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use glmm_core::glmm::prior::priors_from_rows;
use glmm_core::model::serialization;
use glmm_core::{fit, ModelFormulas, ModelSpec};
use glmm_data::{read_prior_table, read_table};

use super::{fit_control, parse_family, parse_link};

#[derive(Args)]
pub struct FitArgs {
    /// Data table (tab, comma or whitespace separated, with header)
    #[arg(long)]
    data: String,

    /// Conditional formula, e.g. "count ~ trt + (1 | site)"
    #[arg(long)]
    formula: String,

    /// Zero-inflation formula, e.g. "~ trt"
    #[arg(long)]
    zi_formula: Option<String>,

    /// Dispersion formula (default "~ 1")
    #[arg(long)]
    disp_formula: Option<String>,

    /// Response family, e.g. poisson, nbinom2, truncated_poisson
    #[arg(long)]
    family: String,

    /// Link function (default: the family's canonical link)
    #[arg(long)]
    link: Option<String>,

    /// Prior-weight (or binomial trials) column
    #[arg(long)]
    weights: Option<String>,

    /// Prior table with columns prior, class, coef
    #[arg(long)]
    priors: Option<String>,

    /// Output file prefix
    #[arg(long)]
    output_prefix: String,

    /// Maximum outer iterations
    #[arg(long, default_value = "300")]
    max_iter: usize,

    /// Outer gradient tolerance
    #[arg(long, default_value = "1e-6")]
    grad_tol: f64,

    /// Line search: more-thuente or hager-zhang
    #[arg(long, default_value = "more-thuente")]
    line_search: String,

    /// Also save JSON sidecar for debugging
    #[arg(long, default_value = "false")]
    save_json: bool,
}

pub(crate) fn model_path(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{}.glmm.model", prefix))
}

pub fn run(args: FitArgs) -> Result<()> {
    let family = parse_family(&args.family)?;
    let link = parse_link(args.link.as_deref())?;
    let control = fit_control(args.max_iter, args.grad_tol, &args.line_search)?;

    info!("=== GLMM fit ===");
    info!("Data: {}", args.data);
    info!("Formula: {}", args.formula);

    let table = read_table(Path::new(&args.data))?;
    info!("Loaded {} rows x {} columns", table.nrows(), table.names().len());

    let priors = match &args.priors {
        Some(path) => {
            let rows = read_prior_table(Path::new(path))?;
            priors_from_rows(&rows).with_context(|| format!("Invalid prior table {}", path))?
        }
        None => Vec::new(),
    };
    info!("{} priors", priors.len());

    let mut formulas = ModelFormulas::new(&args.formula);
    if let Some(zi) = &args.zi_formula {
        formulas = formulas.zero_inflation(zi);
    }
    if let Some(d) = &args.disp_formula {
        formulas = formulas.dispersion(d);
    }
    let spec = ModelSpec::from_table(&table, &formulas, family, link, args.weights.as_deref(), priors)?;
    let model = fit(&spec, &control)?;

    let path = model_path(&args.output_prefix);
    serialization::save_model(&model, &path)?;
    info!("Model saved to {}", path.display());

    if args.save_json {
        let json_path = PathBuf::from(format!("{}.glmm.model.json", args.output_prefix));
        serialization::save_model_json(&model, &json_path)?;
        info!("JSON sidecar saved to {}", json_path.display());
    }

    println!("{}", model.summary());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glmm_core::model::serialization::load_model;

    #[test]
    fn test_fit_writes_loadable_model() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("counts.tsv");
        let mut text = String::from("count\tx\tsite\n");
        for i in 0..24 {
            let x = (i % 4) as f64 / 3.0;
            let y = [0, 2, 3, 5, 1, 1, 4, 6][i % 8];
            text.push_str(&format!("{}\t{}\ts{}\n", y, x, i / 6));
        }
        std::fs::write(&data, text).unwrap();
        let prefix = dir.path().join("out").to_string_lossy().into_owned();

        run(FitArgs {
            data: data.to_string_lossy().into_owned(),
            formula: "count ~ x + (1 | site)".into(),
            zi_formula: None,
            disp_formula: None,
            family: "poisson".into(),
            link: None,
            weights: None,
            priors: None,
            output_prefix: prefix.clone(),
            max_iter: 300,
            grad_tol: 1e-6,
            line_search: "more-thuente".into(),
            save_json: true,
        })
        .unwrap();

        let model = load_model(&model_path(&prefix)).unwrap();
        assert_eq!(model.nobs, 24);
        assert_eq!(model.parameters.layout.re.len(), 1);
        assert!(Path::new(&format!("{}.glmm.model.json", prefix)).exists());
    }

    #[test]
    fn test_unknown_family_is_rejected() {
        assert!(parse_family("lognormal").is_err());
    }
}
