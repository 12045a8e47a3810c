use crate::extract::extract;
use async_trait::async_trait;
use omap_bench_types::MetricSpec;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

pub const SIZE_PLACEHOLDER: &str = "{size}";

#[derive(Debug)]
pub enum TrialError {
  /// The program exited unsuccessfully. Its captured output is kept for diagnosis.
  Failed {
    size: u64,
    status: ExitStatus,
    stdout: String,
    stderr: String,
  },
  Spawn {
    program: PathBuf,
    source: io::Error,
  },
  Timeout {
    size: u64,
    timeout: Duration,
  },
}

impl Display for TrialError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TrialError::Failed { size, status, .. } => {
        write!(f, "measured program failed for size {size} ({status})")
      }
      TrialError::Spawn { program, source } => {
        write!(f, "failed to run {}: {source}", program.display())
      }
      TrialError::Timeout { size, timeout } => write!(
        f,
        "measured program did not finish within {}s for size {size}",
        timeout.as_secs_f64()
      ),
    }
  }
}

impl Error for TrialError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      TrialError::Spawn { source, .. } => Some(source),
      _ => None,
    }
  }
}

/// How to launch the measured program for one size.
#[derive(Clone, Debug)]
pub struct Invocation {
  pub program: PathBuf,
  pub args: Vec<String>,
  pub cwd: Option<PathBuf>,
  pub env: Vec<(String, String)>,
}

impl Invocation {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
      args: Vec::new(),
      cwd: None,
      env: Vec::new(),
    }
  }

  pub fn args_for(&self, size: u64) -> Vec<String> {
    let size = size.to_string();
    let mut args: Vec<String> = self
      .args
      .iter()
      .map(|a| a.replace(SIZE_PLACEHOLDER, &size))
      .collect();
    if !self.args.iter().any(|a| a.contains(SIZE_PLACEHOLDER)) {
      args.push(size);
    };
    args
  }
}

/// Runs the measured program once for a size and returns everything it wrote to stdout.
#[async_trait]
pub trait Executor: Send + Sync {
  async fn execute(&self, size: u64) -> Result<String, TrialError>;
}

pub struct ProcessExecutor {
  invocation: Invocation,
  timeout: Option<Duration>,
}

impl ProcessExecutor {
  pub fn new(invocation: Invocation, timeout: Option<Duration>) -> Self {
    Self {
      invocation,
      timeout,
    }
  }
}

#[async_trait]
impl Executor for ProcessExecutor {
  async fn execute(&self, size: u64) -> Result<String, TrialError> {
    let inv = &self.invocation;
    let mut cmd = Command::new(&inv.program);
    cmd
      .args(inv.args_for(size))
      .envs(inv.env.iter().map(|(k, v)| (k, v)))
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      // Dropping the output future on timeout must not leave the child running.
      .kill_on_drop(true);
    if let Some(cwd) = &inv.cwd {
      cmd.current_dir(cwd);
    };

    let child = cmd.spawn().map_err(|source| TrialError::Spawn {
      program: inv.program.clone(),
      source,
    })?;
    let output = match self.timeout {
      None => child.wait_with_output().await,
      Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| TrialError::Timeout { size, timeout })?,
    }
    .map_err(|source| TrialError::Spawn {
      program: inv.program.clone(),
      source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
      return Err(TrialError::Failed {
        size,
        status: output.status,
        stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
      });
    };
    Ok(stdout)
  }
}

/// Samples collected from one run of the program.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrialResult {
  /// One list per tracked metric, in schema order.
  pub samples: Vec<Vec<f64>>,
  /// Lines that named a metric but whose value couldn't be parsed.
  pub parse_failures: usize,
}

pub fn collect_samples(size: u64, output: &str, metrics: &[MetricSpec]) -> TrialResult {
  let lines: Vec<&str> = output.lines().collect();
  let mut res = TrialResult {
    samples: vec![Vec::new(); metrics.len()],
    parse_failures: 0,
  };
  for (metric, samples) in metrics.iter().zip(res.samples.iter_mut()) {
    for line in &lines {
      match extract(line, &metric.label) {
        None => {}
        Some(Ok(v)) => samples.push(v),
        Some(Err(err)) => {
          res.parse_failures += 1;
          warn!(size, metric = %metric.column, %err, "skipping unparseable sample");
        }
      };
    }
  }
  res
}

pub struct TrialRunner {
  executor: Arc<dyn Executor>,
  metrics: Vec<MetricSpec>,
}

impl TrialRunner {
  pub fn new(executor: Arc<dyn Executor>, metrics: Vec<MetricSpec>) -> Self {
    Self { executor, metrics }
  }

  pub fn metrics(&self) -> &[MetricSpec] {
    &self.metrics
  }

  pub async fn run(&self, size: u64) -> Result<TrialResult, TrialError> {
    let output = self.executor.execute(size).await?;
    debug!(size, output = %output, "trial output");
    Ok(collect_samples(size, &output, &self.metrics))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use omap_bench_types::default_metrics;
  use tracing_test::traced_test;

  #[test]
  fn test_args_for() {
    let mut inv = Invocation::new("./app");
    assert_eq!(inv.args_for(256), vec!["256"]);

    inv.args = vec!["--verbose".to_string()];
    assert_eq!(inv.args_for(512), vec!["--verbose", "512"]);

    inv.args = vec!["{size}".to_string(), "2".to_string()];
    assert_eq!(inv.args_for(1024), vec!["1024", "2"]);

    inv.args = vec!["--size={size}".to_string()];
    assert_eq!(inv.args_for(8), vec!["--size=8"]);
  }

  #[test]
  fn test_collect_samples() {
    let output = "\
maxSize = 256
Creating BST of 256 Nodes
ORAM Initialization Time: \x1b[32m100.5\x1b[0m
Average OMAP Read Time: 12.5
Average OMAP Write Time: 13.5
Average OMAP Read Time: 14.5
Average OMAP Delete Time: 9
";
    let res = collect_samples(256, output, &default_metrics());
    assert_eq!(res.samples, vec![
      vec![100.5],
      vec![12.5, 14.5],
      vec![13.5],
      vec![9.0],
    ]);
    assert_eq!(res.parse_failures, 0);
  }

  #[test]
  fn test_collect_samples_missing_metric() {
    let res = collect_samples(256, "Average OMAP Read Time: 1.0\n", &default_metrics());
    assert_eq!(res.samples, vec![vec![], vec![1.0], vec![], vec![]]);
  }

  #[traced_test]
  #[test]
  fn test_collect_samples_skips_bad_lines() {
    let output = "Average OMAP Read Time: oops\nAverage OMAP Read Time: 2.0\n";
    let res = collect_samples(512, output, &default_metrics());
    assert_eq!(res.samples[1], vec![2.0]);
    assert_eq!(res.parse_failures, 1);
    assert!(logs_contain("skipping unparseable sample"));
  }

  #[test]
  fn test_overlapping_labels_match_independently() {
    let metrics = vec![
      omap_bench_types::MetricSpec::new("read", "Read Time"),
      omap_bench_types::MetricSpec::new("avgRead", "Average OMAP Read Time"),
    ];
    let res = collect_samples(1, "Average OMAP Read Time: 3.0\n", &metrics);
    assert_eq!(res.samples, vec![vec![3.0], vec![3.0]]);
  }

  struct FixedOutput(&'static str);

  #[async_trait]
  impl Executor for FixedOutput {
    async fn execute(&self, _size: u64) -> Result<String, TrialError> {
      Ok(self.0.to_string())
    }
  }

  #[tokio::test]
  async fn test_runner_uses_executor_output() {
    let runner = TrialRunner::new(
      Arc::new(FixedOutput("Average OMAP Delete Time: 4.5\n")),
      default_metrics(),
    );
    let res = runner.run(64).await.unwrap();
    assert_eq!(res.samples[3], vec![4.5]);
  }
}
