//! Predict from a saved model.
//!
//! glmm predict --model-file ... [--newdata ...] --type response [--population] [--se] --output-file ...

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use tracing::info;

use glmm_core::model::serialization::load_model;
use glmm_core::{predict, PredictType, ReForm};
use glmm_data::read_table;

#[derive(Args)]
pub struct PredictArgs {
    /// Model file from `glmm fit` (.glmm.model)
    #[arg(long)]
    model_file: String,

    /// New data table (default: the fitting data)
    #[arg(long)]
    newdata: Option<String>,

    /// link, response, conditional, zprob, zlink, disp-link or disp
    #[arg(long = "type", default_value = "response")]
    kind: String,

    /// Set all random effects to zero
    #[arg(long, default_value = "false")]
    population: bool,

    /// Also write delta-method standard errors
    #[arg(long, default_value = "false")]
    se: bool,

    /// Output TSV path
    #[arg(long)]
    output_file: String,
}

pub fn run(args: PredictArgs) -> Result<()> {
    let kind = PredictType::parse(&args.kind).ok_or_else(|| anyhow!("Unknown prediction type: {}", args.kind))?;
    let re_form = if args.population {
        ReForm::Population
    } else {
        ReForm::Conditional
    };
    let model = load_model(Path::new(&args.model_file))?;
    let table = args.newdata.as_deref().map(|p| read_table(Path::new(p))).transpose()?;

    let pred = predict(&model, table.as_ref(), kind, re_form, args.se)?;
    info!("Predicted {} rows ({:?}, {:?})", pred.fit.len(), kind, re_form);

    let mut out = String::from(if args.se { "fit\tse\n" } else { "fit\n" });
    for (i, f) in pred.fit.iter().enumerate() {
        match &pred.se {
            Some(se) => writeln!(out, "{}\t{}", f, se[i])?,
            None => writeln!(out, "{}", f)?,
        }
    }
    std::fs::write(&args.output_file, out).with_context(|| format!("Failed to write {}", args.output_file))?;
    info!("Predictions written to {}", args.output_file);
    Ok(())
}
