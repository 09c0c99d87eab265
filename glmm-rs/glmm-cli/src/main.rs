//! glmm: fit, inspect, predict from and simulate generalized linear mixed
//! models from the command line.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "glmm",
    version,
    about = "GLMM-RS: Laplace-approximation mixed models with zero inflation",
    long_about = "Fits generalized linear mixed models by maximum likelihood under the Laplace\n\
                  approximation, with optional zero-inflation, hurdle and dispersion models."
)]
struct Cli {
    /// Number of threads to use
    #[arg(long, default_value = "1", global = true)]
    threads: usize,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model and save it
    Fit(commands::fit::FitArgs),

    /// Print the summary of a saved model
    Summary(commands::summary::SummaryArgs),

    /// Predict from a saved model
    Predict(commands::predict::PredictArgs),

    /// Simulate responses from a saved model
    Simulate(commands::simulate::SimulateArgs),

    /// Fit several candidate models in parallel and compare them by AIC
    Compare(commands::compare::CompareArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    rayon::ThreadPoolBuilder::new()
        .num_threads(cli.threads)
        .build_global()
        .ok();

    tracing::info!("GLMM-RS v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Using {} threads", cli.threads);

    match cli.command {
        Commands::Fit(args) => commands::fit::run(args),
        Commands::Summary(args) => commands::summary::run(args),
        Commands::Predict(args) => commands::predict::run(args),
        Commands::Simulate(args) => commands::simulate::run(args),
        Commands::Compare(args) => commands::compare::run(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_fit_with_global_flags() {
        let cli = Cli::try_parse_from([
            "glmm",
            "-vv",
            "--threads",
            "4",
            "fit",
            "--data",
            "d.tsv",
            "--formula",
            "y ~ x",
            "--family",
            "poisson",
            "--output-prefix",
            "out",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.threads, 4);
        assert!(matches!(cli.command, Commands::Fit(_)));
    }

    #[test]
    fn test_cli_rejects_missing_subcommand() {
        assert!(Cli::try_parse_from(["glmm"]).is_err());
    }
}
