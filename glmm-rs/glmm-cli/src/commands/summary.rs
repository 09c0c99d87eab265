//! Print the summary of a saved model.
//!
//! glmm summary --model-file ...

use anyhow::Result;
use clap::Args;

use glmm_core::model::serialization::load_model;

#[derive(Args)]
pub struct SummaryArgs {
    /// Model file from `glmm fit` (.glmm.model)
    #[arg(long)]
    model_file: String,
}

pub fn run(args: SummaryArgs) -> Result<()> {
    let model = load_model(std::path::Path::new(&args.model_file))?;

    println!("Model: {}", args.model_file);
    println!(
        "Optimizer: {} iterations, {} evaluations, max |gradient| {:.3e}{}",
        model.iterations,
        model.evaluations,
        model.max_grad,
        if model.converged { "" } else { " (not converged)" }
    );
    println!();
    println!("{}", model.summary());

    Ok(())
}
