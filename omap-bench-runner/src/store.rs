use omap_bench_types::header;
use omap_bench_types::results::ResultTable;
use omap_bench_types::results::ResultsError;
use omap_bench_types::AggregatedRow;
use omap_bench_types::MetricSpec;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug)]
pub enum StoreError {
  Csv { path: PathBuf, source: csv::Error },
  Io { path: PathBuf, source: io::Error },
  Read { path: PathBuf, source: ResultsError },
  RowWidth { expected: usize, found: usize },
  SchemaMismatch {
    path: PathBuf,
    expected: String,
    found: String,
  },
}

impl Display for StoreError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StoreError::Csv { path, source } => {
        write!(f, "failed to write results to {}: {source}", path.display())
      }
      StoreError::Io { path, source } => {
        write!(f, "failed to write results to {}: {source}", path.display())
      }
      StoreError::Read { path, source } => {
        write!(f, "failed to read existing results {}: {source}", path.display())
      }
      StoreError::RowWidth { expected, found } => write!(
        f,
        "row has {found} metric values but the results file tracks {expected}"
      ),
      StoreError::SchemaMismatch {
        path,
        expected,
        found,
      } => write!(
        f,
        "{} has header `{found}` but this sweep writes `{expected}`",
        path.display()
      ),
    }
  }
}

impl Error for StoreError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      StoreError::Csv { source, .. } => Some(source),
      StoreError::Io { source, .. } => Some(source),
      StoreError::Read { source, .. } => Some(source),
      _ => None,
    }
  }
}

/// Formats like Python's `str(float)` for ordinary values: always a fractional part or exponent.
fn format_value(v: f64) -> String {
  format!("{v:?}")
}

/// Append-only CSV of aggregated rows behind a fixed `size,<metric>...` header.
pub struct ResultStore {
  path: PathBuf,
  header: Vec<String>,
}

impl ResultStore {
  /// Discards any existing file and writes a new header.
  pub fn fresh(path: impl Into<PathBuf>, metrics: &[MetricSpec]) -> Result<Self, StoreError> {
    let store = Self {
      path: path.into(),
      header: header(metrics),
    };
    match fs::remove_file(&store.path) {
      Ok(()) => info!(path = %store.path.display(), "removed previous results"),
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(source) => return Err(store.io_err(source)),
    };
    store.write_record(&store.header, false)?;
    info!(path = %store.path.display(), header = %store.header.join(","), "initialised results");
    Ok(store)
  }

  /// Keeps an existing file after checking its header, or starts a fresh one if there is none. Also returns the sizes already recorded.
  pub fn resume(
    path: impl Into<PathBuf>,
    metrics: &[MetricSpec],
  ) -> Result<(Self, Vec<u64>), StoreError> {
    let path = path.into();
    let raw = match fs::read(&path) {
      Ok(raw) => raw,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        return Ok((Self::fresh(path, metrics)?, Vec::new()));
      }
      Err(source) => return Err(StoreError::Io { path, source }),
    };
    // A fresh run interrupted before writing its header leaves an empty file.
    if raw.is_empty() {
      info!(path = %path.display(), "results file is empty, starting fresh");
      return Ok((Self::fresh(path, metrics)?, Vec::new()));
    };
    let table = ResultTable::read(&path).map_err(|source| StoreError::Read {
      path: path.clone(),
      source,
    })?;
    let store = Self {
      path,
      header: header(metrics),
    };
    let mut found = vec![omap_bench_types::SIZE_COLUMN.to_string()];
    found.extend(table.columns.iter().cloned());
    if found != store.header {
      return Err(StoreError::SchemaMismatch {
        path: store.path.clone(),
        expected: store.header.join(","),
        found: found.join(","),
      });
    };
    // Appended rows must start on their own line.
    if raw.last() != Some(&b'\n') {
      let mut file = OpenOptions::new()
        .append(true)
        .open(&store.path)
        .map_err(|e| store.io_err(e))?;
      file.write_all(b"\n").map_err(|e| store.io_err(e))?;
      info!(path = %store.path.display(), "terminated last row of resumed results");
    };
    let sizes = table.sizes().collect();
    Ok((store, sizes))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn append(&self, row: &AggregatedRow) -> Result<(), StoreError> {
    let expected = self.header.len() - 1;
    if row.values.len() != expected {
      return Err(StoreError::RowWidth {
        expected,
        found: row.values.len(),
      });
    };
    let mut record = Vec::with_capacity(self.header.len());
    record.push(row.size.to_string());
    record.extend(row.values.iter().map(|v| format_value(*v)));
    self.write_record(&record, true)
  }

  fn io_err(&self, source: io::Error) -> StoreError {
    StoreError::Io {
      path: self.path.clone(),
      source,
    }
  }

  fn write_record(&self, record: &[String], append: bool) -> Result<(), StoreError> {
    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .append(append)
      .truncate(!append)
      .open(&self.path)
      .map_err(|e| self.io_err(e))?;
    let mut wtr = csv::WriterBuilder::new()
      .quote_style(csv::QuoteStyle::Never)
      .from_writer(file);
    wtr.write_record(record).map_err(|source| StoreError::Csv {
      path: self.path.clone(),
      source,
    })?;
    wtr.flush().map_err(|e| self.io_err(e))
  }
}
