use ahash::HashMap;
use ahash::HashSet;
use ahash::HashSetExt;
use serde::Deserialize;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

pub mod results;

/// Name of the leading column of every results file.
pub const SIZE_COLUMN: &str = "size";

/// A metric the measured program reports on its own line, e.g. `Average OMAP Read Time: 12.5`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MetricSpec {
  /// Header name in the results file.
  pub column: String,
  /// Substring identifying the output line that reports this metric.
  pub label: String,
}

impl MetricSpec {
  pub fn new(column: impl Into<String>, label: impl Into<String>) -> Self {
    Self {
      column: column.into(),
      label: label.into(),
    }
  }
}

pub fn default_metrics() -> Vec<MetricSpec> {
  vec![
    MetricSpec::new("initTime", "ORAM Initialization Time"),
    MetricSpec::new("readTime", "Average OMAP Read Time"),
    MetricSpec::new("writeTime", "Average OMAP Write Time"),
    MetricSpec::new("deleteTime", "Average OMAP Delete Time"),
  ]
}

/// Full header of a results file for the given metrics, starting with `size`.
pub fn header(metrics: &[MetricSpec]) -> Vec<String> {
  let mut cols = vec![SIZE_COLUMN.to_string()];
  cols.extend(metrics.iter().map(|m| m.column.clone()));
  cols
}

pub fn validate_metrics(metrics: &[MetricSpec]) -> Result<(), ConfigError> {
  if metrics.is_empty() {
    return Err(ConfigError::NoMetrics);
  };
  let mut seen = HashSet::new();
  for m in metrics {
    if m.column.is_empty() || m.column == SIZE_COLUMN || m.column.contains(',') {
      return Err(ConfigError::InvalidColumn(m.column.clone()));
    };
    if m.label.is_empty() {
      return Err(ConfigError::EmptyLabel(m.column.clone()));
    };
    if !seen.insert(m.column.as_str()) {
      return Err(ConfigError::DuplicateColumn(m.column.clone()));
    };
  }
  Ok(())
}

/// One persisted record: a sweep size plus one aggregated value per metric, in schema order.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatedRow {
  pub size: u64,
  pub values: Vec<f64>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Deserialize, Serialize)]
pub enum SweepMode {
  /// Discard any existing results file and start with a fresh header.
  #[default]
  #[serde(rename = "fresh")]
  FreshRun,
  /// Keep the existing results file and append to it, skipping sizes it already contains.
  #[serde(rename = "resume")]
  ResumeRun,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
  AmbiguousSweep,
  DuplicateColumn(String),
  EmptyLabel(String),
  EmptySweep,
  InvalidColumn(String),
  MissingSweep,
  NoMetrics,
  NotIncreasing { prev: u64, next: u64 },
  SweepOverflow { base: u64, step: u32 },
  ZeroRepetitions,
  ZeroSize,
}

impl Display for ConfigError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ConfigError::AmbiguousSweep => {
        write!(f, "sweep must use either `sizes` or `base`/`steps`, not both")
      }
      ConfigError::DuplicateColumn(c) => write!(f, "metric column `{c}` is defined twice"),
      ConfigError::EmptyLabel(c) => write!(f, "metric column `{c}` has an empty label"),
      ConfigError::EmptySweep => write!(f, "sweep contains no sizes"),
      ConfigError::InvalidColumn(c) => write!(f, "`{c}` is not a valid metric column name"),
      ConfigError::MissingSweep => write!(f, "sweep requires `sizes` or both `base` and `steps`"),
      ConfigError::NoMetrics => write!(f, "at least one metric must be tracked"),
      ConfigError::NotIncreasing { prev, next } => {
        write!(f, "sweep sizes must strictly increase, but {next} follows {prev}")
      }
      ConfigError::SweepOverflow { base, step } => {
        write!(f, "sweep size {base} * 2^{step} does not fit in 64 bits")
      }
      ConfigError::ZeroRepetitions => write!(f, "repetitions must be at least 1"),
      ConfigError::ZeroSize => write!(f, "sweep sizes must be positive"),
    }
  }
}

impl Error for ConfigError {}

/// Generates `base * 2^k` for `k` in `0..steps`.
pub fn geometric_sweep(base: u64, steps: u32) -> Result<Vec<u64>, ConfigError> {
  if base == 0 {
    return Err(ConfigError::ZeroSize);
  };
  (0..steps)
    .map(|step| {
      1u64
        .checked_shl(step)
        .and_then(|factor| base.checked_mul(factor))
        .ok_or(ConfigError::SweepOverflow { base, step })
    })
    .collect()
}

pub fn validate_sweep(sizes: &[u64]) -> Result<(), ConfigError> {
  if sizes.is_empty() {
    return Err(ConfigError::EmptySweep);
  };
  if sizes.contains(&0) {
    return Err(ConfigError::ZeroSize);
  };
  for w in sizes.windows(2) {
    if w[1] <= w[0] {
      return Err(ConfigError::NotIncreasing {
        prev: w[0],
        next: w[1],
      });
    };
  }
  Ok(())
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SweepCfg {
  /// Explicit sizes, in ascending order.
  #[serde(default)]
  pub sizes: Vec<u64>,
  /// First size of a geometric sweep.
  pub base: Option<u64>,
  /// Number of doublings of a geometric sweep, including `base` itself.
  pub steps: Option<u32>,
}

impl SweepCfg {
  pub fn resolve(&self) -> Result<Vec<u64>, ConfigError> {
    let sizes = match (self.sizes.is_empty(), self.base, self.steps) {
      (false, None, None) => self.sizes.clone(),
      (false, _, _) => return Err(ConfigError::AmbiguousSweep),
      (true, Some(base), Some(steps)) => geometric_sweep(base, steps)?,
      (true, _, _) => return Err(ConfigError::MissingSweep),
    };
    validate_sweep(&sizes)?;
    Ok(sizes)
  }
}

fn default_build_config() -> String {
  "Enclave/Enclave.config.xml".to_string()
}

/// How to rebuild the measured program before a sweep.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSpec {
  /// Enclave configuration file passed as `CONFIG=`. Defaults to `Enclave/Enclave.config.xml`.
  #[serde(default = "default_build_config")]
  pub config: String,
  /// Preprocessor flags, each passed as `-D<flag>` in `CFLAGS`.
  #[serde(default)]
  pub flags: Vec<String>,
  #[serde(default)]
  pub debug: bool,
  /// Extra `VAR=value` arguments appended to the make invocation.
  #[serde(default)]
  pub additional_vars: Vec<String>,
  /// Directory to run make in. Defaults to the current directory.
  pub dir: Option<PathBuf>,
}

impl Default for BuildSpec {
  fn default() -> Self {
    Self {
      config: default_build_config(),
      flags: Vec::new(),
      debug: false,
      additional_vars: Vec::new(),
      dir: None,
    }
  }
}

fn default_results() -> PathBuf {
  PathBuf::from("experiment.csv")
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  /// Path to the measured program.
  pub program: PathBuf,

  /// Arguments for the program. `{size}` is replaced by the sweep size; if no argument contains it, the size is appended as the last argument.
  #[serde(default)]
  pub args: Vec<String>,

  /// Working directory of the program. Defaults to the current directory.
  pub cwd: Option<PathBuf>,

  /// Extra environment variables for the program.
  #[serde(default)]
  pub env: HashMap<String, String>,

  /// Results file. Defaults to `experiment.csv`.
  #[serde(default = "default_results")]
  pub results: PathBuf,

  /// Trials per size. Can be overridden via CLI. Defaults to 1.
  pub repetitions: Option<usize>,

  /// Can be overridden via CLI. Defaults to a fresh run.
  pub mode: Option<SweepMode>,

  pub sweep: SweepCfg,

  /// Kill and fail a trial that runs longer than this. No limit if unset.
  pub trial_timeout_secs: Option<u64>,

  #[serde(default = "default_metrics")]
  pub metrics: Vec<MetricSpec>,

  /// Rebuild the program with these settings before the sweep starts.
  pub build: Option<BuildSpec>,
}

#[derive(Debug)]
pub enum LoadConfigError {
  Io(std::io::Error),
  Parse(serde_yaml::Error),
}

impl Display for LoadConfigError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LoadConfigError::Io(e) => write!(f, "failed to read config file: {e}"),
      LoadConfigError::Parse(e) => write!(f, "failed to parse config file: {e}"),
    }
  }
}

impl Error for LoadConfigError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      LoadConfigError::Io(e) => Some(e),
      LoadConfigError::Parse(e) => Some(e),
    }
  }
}

impl Config {
  pub fn from_yaml(raw: &str) -> Result<Self, LoadConfigError> {
    serde_yaml::from_str(raw).map_err(LoadConfigError::Parse)
  }

  pub fn load(path: &Path) -> Result<Self, LoadConfigError> {
    let raw = fs::read_to_string(path).map_err(LoadConfigError::Io)?;
    Self::from_yaml(&raw)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_geometric_sweep() {
    assert_eq!(geometric_sweep(256, 4), Ok(vec![256, 512, 1024, 2048]));
    assert_eq!(geometric_sweep(3, 1), Ok(vec![3]));
    assert_eq!(geometric_sweep(256, 0), Ok(vec![]));
    assert_eq!(geometric_sweep(0, 3), Err(ConfigError::ZeroSize));
    assert_eq!(
      geometric_sweep(1 << 62, 3),
      Err(ConfigError::SweepOverflow {
        base: 1 << 62,
        step: 2
      })
    );
    assert_eq!(
      geometric_sweep(1, 65),
      Err(ConfigError::SweepOverflow { base: 1, step: 64 })
    );
  }

  #[test]
  fn test_validate_sweep() {
    assert_eq!(validate_sweep(&[1, 2, 8]), Ok(()));
    assert_eq!(validate_sweep(&[]), Err(ConfigError::EmptySweep));
    assert_eq!(validate_sweep(&[0, 2]), Err(ConfigError::ZeroSize));
    assert_eq!(
      validate_sweep(&[4, 4]),
      Err(ConfigError::NotIncreasing { prev: 4, next: 4 })
    );
    assert_eq!(
      validate_sweep(&[8, 2]),
      Err(ConfigError::NotIncreasing { prev: 8, next: 2 })
    );
  }

  #[test]
  fn test_sweep_cfg_resolve() {
    let explicit = SweepCfg {
      sizes: vec![10, 20],
      ..Default::default()
    };
    assert_eq!(explicit.resolve(), Ok(vec![10, 20]));

    let geometric = SweepCfg {
      sizes: vec![],
      base: Some(256),
      steps: Some(2),
    };
    assert_eq!(geometric.resolve(), Ok(vec![256, 512]));

    let both = SweepCfg {
      sizes: vec![1],
      base: Some(256),
      steps: None,
    };
    assert_eq!(both.resolve(), Err(ConfigError::AmbiguousSweep));

    let missing = SweepCfg {
      sizes: vec![],
      base: Some(256),
      steps: None,
    };
    assert_eq!(missing.resolve(), Err(ConfigError::MissingSweep));
  }

  #[test]
  fn test_validate_metrics() {
    assert_eq!(validate_metrics(&default_metrics()), Ok(()));
    assert_eq!(validate_metrics(&[]), Err(ConfigError::NoMetrics));
    assert_eq!(
      validate_metrics(&[MetricSpec::new("size", "x")]),
      Err(ConfigError::InvalidColumn("size".to_string()))
    );
    assert_eq!(
      validate_metrics(&[MetricSpec::new("a", "")]),
      Err(ConfigError::EmptyLabel("a".to_string()))
    );
    assert_eq!(
      validate_metrics(&[MetricSpec::new("a", "x"), MetricSpec::new("a", "y")]),
      Err(ConfigError::DuplicateColumn("a".to_string()))
    );
  }

  #[test]
  fn test_header() {
    assert_eq!(
      header(&default_metrics()).join(","),
      "size,initTime,readTime,writeTime,deleteTime"
    );
  }

  #[test]
  fn test_config_defaults() {
    let cfg = Config::from_yaml(
      r#"
program: ./app
sweep:
  base: 256
  steps: 20
"#,
    )
    .unwrap();
    assert_eq!(cfg.program, PathBuf::from("./app"));
    assert!(cfg.args.is_empty());
    assert_eq!(cfg.results, PathBuf::from("experiment.csv"));
    assert_eq!(cfg.repetitions, None);
    assert_eq!(cfg.mode, None);
    assert_eq!(cfg.metrics, default_metrics());
    assert!(cfg.build.is_none());
    assert_eq!(cfg.sweep.resolve().unwrap().len(), 20);
  }

  #[test]
  fn test_config_full() {
    let cfg = Config::from_yaml(
      r#"
program: ./app
args: ["{size}", "1"]
cwd: /opt/omap
env:
  SGX_MODE: HW
results: out.csv
repetitions: 5
mode: resume
sweep:
  sizes: [100, 200]
trial_timeout_secs: 600
metrics:
  - column: readTime
    label: Average OMAP Read Time
build:
  flags: [SGXV2]
  debug: true
"#,
    )
    .unwrap();
    assert_eq!(cfg.args, vec!["{size}".to_string(), "1".to_string()]);
    assert_eq!(cfg.env.get("SGX_MODE").map(String::as_str), Some("HW"));
    assert_eq!(cfg.repetitions, Some(5));
    assert_eq!(cfg.mode, Some(SweepMode::ResumeRun));
    assert_eq!(cfg.trial_timeout_secs, Some(600));
    assert_eq!(cfg.metrics.len(), 1);
    let build = cfg.build.unwrap();
    assert_eq!(build.config, "Enclave/Enclave.config.xml");
    assert_eq!(build.flags, vec!["SGXV2".to_string()]);
    assert!(build.debug);
  }

  #[test]
  fn test_config_rejects_unknown_fields() {
    let res = Config::from_yaml(
      r#"
program: ./app
sweep:
  sizes: [1]
reps: 3
"#,
    );
    assert!(matches!(res, Err(LoadConfigError::Parse(_))));
  }
}
