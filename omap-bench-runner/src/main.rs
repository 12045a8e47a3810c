use clap::Parser;
use clap::ValueEnum;
use omap_bench_runner::build::BuildError;
use omap_bench_runner::build::MakeBuilder;
use omap_bench_runner::driver::ExperimentDriver;
use omap_bench_runner::driver::RunError;
use omap_bench_runner::trial::Invocation;
use omap_bench_runner::trial::ProcessExecutor;
use omap_bench_runner::trial::TrialError;
use omap_bench_runner::trial::TrialRunner;
use omap_bench_types::Config;
use omap_bench_types::SweepMode;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use tracing::info;

/*

# OMAP size sweep

Runs the measured program once per repetition for every size in the sweep, and appends the median of each reported metric to a CSV file, one row per size. Trials never overlap: the program runs inside an enclave and concurrent runs would skew each other's timings.

A failed trial stops the sweep. Rows for the sizes before it stay in the results file, so a later `--mode resume` run picks up where this one stopped.

*/

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
enum Mode {
  Fresh,
  Resume,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
  /// Path to the configuration file.
  #[arg(long, default_value = "cfg.yaml")]
  config: PathBuf,

  /// Trials per size (overrides config).
  #[arg(short, long)]
  reps: Option<usize>,

  /// Start a new results file or append to the existing one (overrides config).
  #[arg(long)]
  mode: Option<Mode>,

  /// Results file (overrides config).
  #[arg(long)]
  results: Option<PathBuf>,

  /// Skips rebuilding the program even if the config has a `build` section.
  #[arg(long)]
  skip_build: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt::init();

  let cli = Cli::parse();

  let cfg = match Config::load(&cli.config) {
    Ok(cfg) => cfg,
    Err(err) => {
      error!(config = %cli.config.display(), %err, "invalid configuration");
      return ExitCode::FAILURE;
    }
  };

  // CLI overrides config.
  let repetitions = cli.reps.or(cfg.repetitions).unwrap_or(1);
  let mode = match cli.mode {
    Some(Mode::Fresh) => SweepMode::FreshRun,
    Some(Mode::Resume) => SweepMode::ResumeRun,
    None => cfg.mode.unwrap_or_default(),
  };
  let results = cli.results.unwrap_or(cfg.results);

  let sizes = match cfg.sweep.resolve() {
    Ok(sizes) => sizes,
    Err(err) => {
      error!(%err, "invalid sweep");
      return ExitCode::FAILURE;
    }
  };

  let invocation = Invocation {
    program: cfg.program,
    args: cfg.args,
    cwd: cfg.cwd,
    env: cfg
      .env
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect(),
  };
  let timeout = cfg.trial_timeout_secs.map(Duration::from_secs);
  let runner = TrialRunner::new(
    Arc::new(ProcessExecutor::new(invocation, timeout)),
    cfg.metrics,
  );

  info!(
    sizes = ?sizes,
    repetitions,
    ?mode,
    results = %results.display(),
    "starting sweep"
  );
  let mut driver = match ExperimentDriver::new(sizes, repetitions, mode, runner, results) {
    Ok(driver) => driver,
    Err(err) => {
      error!(%err, "invalid configuration");
      return ExitCode::FAILURE;
    }
  };
  match cfg.build {
    Some(spec) if !cli.skip_build => {
      driver = driver.with_build(Arc::new(MakeBuilder::new()), spec);
    }
    Some(_) => info!("skipping build"),
    None => {}
  };

  match driver.run().await {
    Ok(report) => {
      info!(
        persisted = report.persisted.len(),
        skipped = report.skipped.len(),
        parse_failures = report.parse_failures,
        "all done"
      );
      ExitCode::SUCCESS
    }
    Err(err) => {
      match &err.cause {
        RunError::Trial(TrialError::Failed { stdout, stderr, .. }) => {
          error!(size = ?err.size, %stdout, %stderr, "measured program output");
        }
        RunError::Build(BuildError::Failed { stderr, .. }) => {
          error!(%stderr, "build output");
        }
        _ => {}
      };
      error!(%err, "sweep failed");
      ExitCode::FAILURE
    }
  }
}
