#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::io::{self, BufWriter, IsTerminal, Write};
use std::path::PathBuf;
use std::process;

use ngme::FitConfig;
use ngme::progress::{FitProgressObserver, FitProgressStage};
use ngme::random::rgig;

#[derive(Parser)]
#[command(
    name = "ngme",
    version,
    about = "Stochastic-gradient estimation of latent non-Gaussian models"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fit the model described by a TOML configuration file
    #[command(about = "Fit a latent model (outputs: fit.toml)")]
    Fit {
        /// Path to the TOML model and optimizer configuration
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Where to write the fit report
        #[arg(long, value_name = "PATH", default_value = "fit.toml")]
        output: PathBuf,
    },

    /// Draw generalized inverse Gaussian variates, one per line
    #[command(about = "Sample GIG(p, a, b) variates")]
    Rgig {
        /// Order parameter p
        #[arg(long, allow_hyphen_values = true)]
        p: f64,

        /// Rate a of the x term
        #[arg(long)]
        a: f64,

        /// Rate b of the 1/x term
        #[arg(long)]
        b: f64,

        /// Number of draws
        #[arg(long, default_value = "1")]
        n: usize,

        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template("\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    pb.set_message(message.to_string());
    pb
}

#[derive(Default)]
struct BarProgress {
    bar: Option<ProgressBar>,
}

impl FitProgressObserver for BarProgress {
    fn on_stage_start(&mut self, stage: FitProgressStage, total_steps: usize) {
        self.bar = Some(create_progress_bar(total_steps as u64, stage.describe()));
    }

    fn on_iteration(&mut self, iteration: usize, gradient_norm: f64) {
        if let Some(pb) = &self.bar {
            pb.set_position(iteration as u64);
            pb.set_message(format!("|g| = {gradient_norm:.3e}"));
        }
    }

    fn on_stage_finish(&mut self, stage: FitProgressStage) {
        if let Some(pb) = self.bar.take() {
            pb.finish_with_message(format!("{stage} finished"));
        }
    }
}

fn run_fit(config: PathBuf, output: PathBuf) -> Result<(), Box<dyn Error>> {
    let config = FitConfig::load(&config)?;
    let mut progress = BarProgress::default();
    let report = ngme::fit(&config, &mut progress)?;
    report.save(&output)?;
    println!(
        "Fit {} after {} iterations; report written to {}",
        if report.status.converged { "converged" } else { "stopped" },
        report.status.iterations,
        output.display()
    );
    Ok(())
}

fn run_rgig(p: f64, a: f64, b: f64, n: usize, seed: u64) -> Result<(), Box<dyn Error>> {
    let draws = rgig(&vec![p; n], &vec![a; n], &vec![b; n], seed)?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for x in draws {
        writeln!(out, "{x}")?;
    }
    out.flush()?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Fit { config, output }) => run_fit(config, output),
        Some(Commands::Rgig { p, a, b, n, seed }) => run_rgig(p, a, b, n, seed),
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
