use crate::aggregate::AggregateError;
use crate::aggregate::SampleSet;
use crate::build::BuildError;
use crate::build::Builder;
use crate::store::ResultStore;
use crate::store::StoreError;
use crate::trial::TrialError;
use crate::trial::TrialRunner;
use ahash::HashSet;
use ahash::HashSetExt;
use omap_bench_types::validate_metrics;
use omap_bench_types::validate_sweep;
use omap_bench_types::AggregatedRow;
use omap_bench_types::BuildSpec;
use omap_bench_types::ConfigError;
use omap_bench_types::SweepMode;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;
use tracing::info;

#[derive(Debug)]
pub enum RunError {
  Aggregate(AggregateError),
  Build(BuildError),
  Store(StoreError),
  Trial(TrialError),
}

impl Display for RunError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RunError::Aggregate(e) => Display::fmt(e, f),
      RunError::Build(e) => write!(f, "build failed: {e}"),
      RunError::Store(e) => Display::fmt(e, f),
      RunError::Trial(e) => Display::fmt(e, f),
    }
  }
}

impl Error for RunError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      RunError::Aggregate(e) => Some(e),
      RunError::Build(e) => Some(e),
      RunError::Store(e) => Some(e),
      RunError::Trial(e) => Some(e),
    }
  }
}

impl From<AggregateError> for RunError {
  fn from(e: AggregateError) -> Self {
    RunError::Aggregate(e)
  }
}

impl From<BuildError> for RunError {
  fn from(e: BuildError) -> Self {
    RunError::Build(e)
  }
}

impl From<StoreError> for RunError {
  fn from(e: StoreError) -> Self {
    RunError::Store(e)
  }
}

impl From<TrialError> for RunError {
  fn from(e: TrialError) -> Self {
    RunError::Trial(e)
  }
}

/// A sweep that stopped early. Rows for sizes before `size` are already persisted.
#[derive(Debug)]
pub struct SweepError {
  /// `None` if the sweep failed before reaching its first size (build or results file setup).
  pub size: Option<u64>,
  pub cause: RunError,
}

impl Display for SweepError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.size {
      Some(size) => write!(f, "sweep halted at size {size}: {}", self.cause),
      None => write!(f, "sweep could not start: {}", self.cause),
    }
  }
}

impl Error for SweepError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    Some(&self.cause)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepState {
  NotStarted,
  Running { size: u64, repetition: usize },
  Aggregating { size: u64 },
  Persisted { size: u64 },
  Complete,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SweepReport {
  /// Sizes whose rows were appended by this run, in order.
  pub persisted: Vec<u64>,
  /// Sizes already present in a resumed results file.
  pub skipped: Vec<u64>,
  pub parse_failures: usize,
  pub elapsed: Duration,
}

pub struct ExperimentDriver {
  sizes: Vec<u64>,
  repetitions: usize,
  mode: SweepMode,
  runner: TrialRunner,
  results: PathBuf,
  build: Option<(Arc<dyn Builder>, BuildSpec)>,
  state: SweepState,
}

impl ExperimentDriver {
  pub fn new(
    sizes: Vec<u64>,
    repetitions: usize,
    mode: SweepMode,
    runner: TrialRunner,
    results: impl Into<PathBuf>,
  ) -> Result<Self, ConfigError> {
    validate_sweep(&sizes)?;
    validate_metrics(runner.metrics())?;
    if repetitions == 0 {
      return Err(ConfigError::ZeroRepetitions);
    };
    Ok(Self {
      sizes,
      repetitions,
      mode,
      runner,
      results: results.into(),
      build: None,
      state: SweepState::NotStarted,
    })
  }

  /// Rebuilds the program with `spec` before the first trial.
  pub fn with_build(mut self, builder: Arc<dyn Builder>, spec: BuildSpec) -> Self {
    self.build = Some((builder, spec));
    self
  }

  pub fn state(&self) -> SweepState {
    self.state
  }

  fn transition(&mut self, state: SweepState) {
    debug!(?state, "sweep state");
    self.state = state;
  }

  pub async fn run(&mut self) -> Result<SweepReport, SweepError> {
    let started = Instant::now();
    let not_started = |cause: RunError| SweepError { size: None, cause };

    if let Some((builder, spec)) = &self.build {
      builder
        .build(spec)
        .await
        .map_err(|e| not_started(e.into()))?;
      info!("build complete");
    };

    let metrics = self.runner.metrics().to_vec();
    let (store, skip) = match self.mode {
      SweepMode::FreshRun => (
        ResultStore::fresh(&self.results, &metrics).map_err(|e| not_started(e.into()))?,
        HashSet::new(),
      ),
      SweepMode::ResumeRun => {
        let (store, sizes) =
          ResultStore::resume(&self.results, &metrics).map_err(|e| not_started(e.into()))?;
        (store, sizes.into_iter().collect::<HashSet<u64>>())
      }
    };

    let mut report = SweepReport {
      persisted: Vec::new(),
      skipped: Vec::new(),
      parse_failures: 0,
      elapsed: Duration::ZERO,
    };
    for size in self.sizes.clone() {
      if skip.contains(&size) {
        info!(size, "size already recorded, skipping");
        report.skipped.push(size);
        continue;
      };
      let row = self
        .run_size(size, &mut report)
        .await
        .map_err(|cause| SweepError {
          size: Some(size),
          cause,
        })?;
      store
        .append(&row)
        .map_err(|e| SweepError {
          size: Some(size),
          cause: e.into(),
        })?;
      self.transition(SweepState::Persisted { size });
      info!(size, values = ?row.values, "persisted results");
      report.persisted.push(size);
    }

    self.transition(SweepState::Complete);
    report.elapsed = started.elapsed();
    info!(
      elapsed_secs = report.elapsed.as_secs_f64(),
      persisted = report.persisted.len(),
      skipped = report.skipped.len(),
      path = %store.path().display(),
      "sweep complete",
    );
    Ok(report)
  }

  async fn run_size(
    &mut self,
    size: u64,
    report: &mut SweepReport,
  ) -> Result<AggregatedRow, RunError> {
    info!(size, repetitions = self.repetitions, "running size");
    let mut samples = SampleSet::new(self.runner.metrics());
    for repetition in 0..self.repetitions {
      self.transition(SweepState::Running { size, repetition });
      let trial = self.runner.run(size).await?;
      report.parse_failures += trial.parse_failures;
      samples.merge(trial);
    }
    self.transition(SweepState::Aggregating { size });
    Ok(samples.aggregate(size)?)
  }
}
