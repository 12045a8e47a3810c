use crate::trial::TrialResult;
use omap_bench_types::AggregatedRow;
use omap_bench_types::MetricSpec;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AggregateError {
  /// No trial produced a usable sample for this metric.
  EmptySample { metric: String },
}

impl Display for AggregateError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AggregateError::EmptySample { metric } => {
        write!(f, "no samples were collected for metric `{metric}`")
      }
    }
  }
}

impl Error for AggregateError {}

/// Middle value of the sorted samples, or the mean of the two middle values for an even count.
pub fn median(samples: &[f64]) -> Option<f64> {
  if samples.is_empty() {
    return None;
  };
  let mut sorted = samples.to_vec();
  sorted.sort_by(f64::total_cmp);
  let mid = sorted.len() / 2;
  Some(if sorted.len() % 2 == 0 {
    // Halve before adding so two values near `f64::MAX` don't overflow.
    sorted[mid - 1] / 2.0 + sorted[mid] / 2.0
  } else {
    sorted[mid]
  })
}

/// Accumulates samples for one size across all of its repetitions.
#[derive(Clone, Debug)]
pub struct SampleSet {
  columns: Vec<String>,
  samples: Vec<Vec<f64>>,
}

impl SampleSet {
  pub fn new(metrics: &[MetricSpec]) -> Self {
    Self {
      columns: metrics.iter().map(|m| m.column.clone()).collect(),
      samples: vec![Vec::new(); metrics.len()],
    }
  }

  pub fn merge(&mut self, trial: TrialResult) {
    for (acc, samples) in self.samples.iter_mut().zip(trial.samples) {
      acc.extend(samples);
    }
  }

  pub fn samples(&self, column: &str) -> Option<&[f64]> {
    let idx = self.columns.iter().position(|c| c == column)?;
    Some(&self.samples[idx])
  }

  pub fn aggregate(&self, size: u64) -> Result<AggregatedRow, AggregateError> {
    let values = self
      .columns
      .iter()
      .zip(&self.samples)
      .map(|(column, samples)| {
        median(samples).ok_or_else(|| AggregateError::EmptySample {
          metric: column.clone(),
        })
      })
      .collect::<Result<Vec<_>, _>>()?;
    Ok(AggregatedRow { size, values })
  }
}
