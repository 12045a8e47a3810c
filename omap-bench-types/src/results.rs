use crate::AggregatedRow;
use crate::SIZE_COLUMN;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::path::Path;

#[derive(Debug)]
pub enum ResultsError {
  Csv(csv::Error),
  InvalidField {
    line: u64,
    column: String,
    value: String,
  },
  MissingSizeColumn,
}

impl Display for ResultsError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ResultsError::Csv(e) => write!(f, "failed to read results: {e}"),
      ResultsError::InvalidField {
        line,
        column,
        value,
      } => write!(f, "line {line}: invalid value `{value}` in column `{column}`"),
      ResultsError::MissingSizeColumn => {
        write!(f, "results header does not start with `{SIZE_COLUMN}`")
      }
    }
  }
}

impl Error for ResultsError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      ResultsError::Csv(e) => Some(e),
      _ => None,
    }
  }
}

impl From<csv::Error> for ResultsError {
  fn from(e: csv::Error) -> Self {
    ResultsError::Csv(e)
  }
}

/// A results file read back into memory.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultTable {
  /// Metric columns, excluding the leading `size` column.
  pub columns: Vec<String>,
  /// Rows in file order.
  pub rows: Vec<AggregatedRow>,
}

impl ResultTable {
  pub fn read(path: &Path) -> Result<Self, ResultsError> {
    let rdr = csv::ReaderBuilder::new()
      .trim(csv::Trim::All)
      .from_path(path)?;
    Self::from_reader(rdr)
  }

  pub fn parse(raw: &str) -> Result<Self, ResultsError> {
    let rdr = csv::ReaderBuilder::new()
      .trim(csv::Trim::All)
      .from_reader(raw.as_bytes());
    Self::from_reader(rdr)
  }

  fn from_reader<R: std::io::Read>(mut rdr: csv::Reader<R>) -> Result<Self, ResultsError> {
    let headers = rdr.headers()?.clone();
    if headers.get(0) != Some(SIZE_COLUMN) {
      return Err(ResultsError::MissingSizeColumn);
    };
    let columns: Vec<String> = headers.iter().skip(1).map(|h| h.to_string()).collect();

    let mut rows = Vec::new();
    for record in rdr.records() {
      let record = record?;
      let line = record.position().map(|p| p.line()).unwrap_or(0);
      let invalid = |column: &str, value: &str| ResultsError::InvalidField {
        line,
        column: column.to_string(),
        value: value.to_string(),
      };
      let raw_size = record.get(0).unwrap_or_default();
      let size = raw_size
        .parse::<u64>()
        .map_err(|_| invalid(SIZE_COLUMN, raw_size))?;
      let values = columns
        .iter()
        .zip(record.iter().skip(1))
        .map(|(column, raw)| raw.parse::<f64>().map_err(|_| invalid(column.as_str(), raw)))
        .collect::<Result<Vec<_>, _>>()?;
      rows.push(AggregatedRow { size, values });
    }

    Ok(Self { columns, rows })
  }

  pub fn column_index(&self, column: &str) -> Option<usize> {
    self.columns.iter().position(|c| c == column)
  }

  /// Value of `column` at `size`. The last row for a size wins if a size was recorded more than once.
  pub fn value(&self, size: u64, column: &str) -> Option<f64> {
    let idx = self.column_index(column)?;
    self
      .rows
      .iter()
      .rev()
      .find(|r| r.size == size)
      .and_then(|r| r.values.get(idx).copied())
  }

  pub fn sizes(&self) -> impl Iterator<Item = u64> + '_ {
    self.rows.iter().map(|r| r.size)
  }
}
