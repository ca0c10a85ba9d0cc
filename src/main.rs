use std::error::Error;

use clap::{Parser, Subcommand};

use contexture::{context, fit, signal, Logger};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit per-row skew-t distributions, output a parameter table
    Fit(fit::FitArgs),
    /// Compute per-row context indices and summaries
    Context(context::ContextArgs),
    /// Combine row- and column-wise context matrices into a signal matrix
    Signal(signal::SignalArgs),
}

fn open_logger(log: &Option<String>, default_name: &str) -> Result<Logger, Box<dyn Error>> {
    let log_file = if let Some(log_path) = log {
        std::fs::File::create(log_path)?
    } else {
        std::fs::File::create(default_name)?
    };
    Ok(Logger::new(log_file))
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Fit(args) => {
            rayon::ThreadPoolBuilder::new()
                .num_threads(args.threads)
                .build_global()?;
            let mut logger = open_logger(&args.log, "fit.log")?;
            fit::fit_matrix_tsv(&args, &mut logger)
        }
        Commands::Context(args) => {
            rayon::ThreadPoolBuilder::new()
                .num_threads(args.threads)
                .build_global()?;
            let mut logger = open_logger(&args.log, "context.log")?;
            context::context_matrix_tsv(&args, &mut logger)
        }
        Commands::Signal(args) => {
            let mut logger = open_logger(&args.log, "signal.log")?;
            signal::signal_matrix_tsv(&args, &mut logger)
        }
    }
}
