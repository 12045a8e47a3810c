use ahash::HashMap;
use ahash::HashMapExt;
use charts_rs::Box as ChartBox;
use charts_rs::Color;
use charts_rs::LegendCategory;
use charts_rs::LineChart;
use charts_rs::Series;
use clap::Parser;
use omap_bench_types::results::ResultTable;
use omap_bench_types::results::ResultsError;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing::info;
use tracing::warn;

/*

# Sweep plots

Draws one line per results file for every metric the files have in common: once with the raw values, and once relative to a baseline series (the baseline is the flat line at 1.0). Only sizes recorded in every file are plotted.

*/

/// Series label → hex colour, e.g. `sgxv2: "#ee6666"`.
type Styles = HashMap<String, String>;

#[derive(Clone, Debug, PartialEq)]
struct SeriesArg {
  label: String,
  path: PathBuf,
}

fn parse_series(raw: &str) -> Result<SeriesArg, String> {
  let (label, path) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected LABEL=PATH, got `{raw}`"))?;
  if label.is_empty() || path.is_empty() {
    return Err(format!("expected LABEL=PATH, got `{raw}`"));
  };
  Ok(SeriesArg {
    label: label.to_string(),
    path: PathBuf::from(path),
  })
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
  /// A results file to plot, as LABEL=PATH. Repeat for each series.
  #[arg(long = "series", value_parser = parse_series, required = true)]
  series: Vec<SeriesArg>,

  /// Label of the series the relative charts divide by.
  #[arg(long)]
  baseline: String,

  /// Directory to write the SVG charts to.
  #[arg(long, default_value = "graphs")]
  out: PathBuf,

  /// YAML file mapping series labels to hex colours.
  #[arg(long)]
  styles: Option<PathBuf>,
}

#[derive(Debug)]
enum PlotError {
  DuplicateLabel(String),
  NoSharedSizes,
  Read {
    label: String,
    source: ResultsError,
  },
  Render {
    chart: String,
    message: String,
  },
  Styles(serde_yaml::Error),
  UnknownBaseline(String),
  Io(io::Error),
}

impl Display for PlotError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PlotError::DuplicateLabel(label) => write!(f, "series `{label}` given more than once"),
      PlotError::NoSharedSizes => write!(f, "no size is recorded in every series"),
      PlotError::Read { label, source } => write!(f, "series `{label}`: {source}"),
      PlotError::Render { chart, message } => write!(f, "failed to render {chart}: {message}"),
      PlotError::Styles(e) => write!(f, "invalid style file: {e}"),
      PlotError::UnknownBaseline(label) => write!(f, "baseline `{label}` is not one of the series"),
      PlotError::Io(e) => write!(f, "I/O error: {e}"),
    }
  }
}

impl Error for PlotError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      PlotError::Read { source, .. } => Some(source),
      PlotError::Styles(e) => Some(e),
      PlotError::Io(e) => Some(e),
      _ => None,
    }
  }
}

struct Dataset {
  label: String,
  table: ResultTable,
}

/// Data for one chart: the x axis is the sizes, one line per series.
#[derive(Debug, PartialEq)]
struct ChartData {
  name: String,
  title: String,
  sizes: Vec<u64>,
  lines: Vec<(String, Vec<f64>)>,
}

fn load_datasets(series: &[SeriesArg]) -> Result<Vec<Dataset>, PlotError> {
  let mut datasets: Vec<Dataset> = Vec::new();
  for s in series {
    if datasets.iter().any(|d| d.label == s.label) {
      return Err(PlotError::DuplicateLabel(s.label.clone()));
    };
    let table = ResultTable::read(&s.path).map_err(|source| PlotError::Read {
      label: s.label.clone(),
      source,
    })?;
    info!(
      label = %s.label,
      path = %s.path.display(),
      rows = table.rows.len(),
      "loaded series"
    );
    datasets.push(Dataset {
      label: s.label.clone(),
      table,
    });
  }
  Ok(datasets)
}

fn load_styles(path: &Path) -> Result<Styles, PlotError> {
  let raw = fs::read_to_string(path).map_err(PlotError::Io)?;
  serde_yaml::from_str(&raw).map_err(PlotError::Styles)
}

/// Metric columns present in every dataset, in the first dataset's order.
fn shared_columns(datasets: &[Dataset]) -> Vec<String> {
  let Some(first) = datasets.first() else {
    return Vec::new();
  };
  first
    .table
    .columns
    .iter()
    .filter(|c| datasets.iter().all(|d| d.table.column_index(c).is_some()))
    .cloned()
    .collect()
}

/// Sizes recorded in every dataset, ascending.
fn shared_sizes(datasets: &[Dataset]) -> Vec<u64> {
  let Some(first) = datasets.first() else {
    return Vec::new();
  };
  let mut sizes: Vec<u64> = first
    .table
    .sizes()
    .filter(|&size| datasets.iter().all(|d| d.table.sizes().any(|s| s == size)))
    .collect();
  sizes.sort_unstable();
  sizes.dedup();
  sizes
}

fn absolute_chart(datasets: &[Dataset], column: &str, sizes: &[u64]) -> ChartData {
  let lines = datasets
    .iter()
    .map(|d| {
      let values = sizes
        .iter()
        .map(|&size| d.table.value(size, column).unwrap_or(f64::NAN))
        .collect();
      (d.label.clone(), values)
    })
    .collect();
  ChartData {
    name: column.to_string(),
    title: column.to_string(),
    sizes: sizes.to_vec(),
    lines,
  }
}

/// Each series divided by the baseline at the same size. Sizes where the baseline is zero are left out.
fn relative_chart(
  datasets: &[Dataset],
  baseline: &Dataset,
  column: &str,
  sizes: &[u64],
) -> ChartData {
  let mut kept = Vec::new();
  let mut divisors = Vec::new();
  for &size in sizes {
    match baseline.table.value(size, column) {
      Some(v) if v != 0.0 => {
        kept.push(size);
        divisors.push(v);
      }
      _ => warn!(
        column,
        size,
        baseline = %baseline.label,
        "baseline is zero, skipping size in relative chart"
      ),
    };
  }
  let lines = datasets
    .iter()
    .map(|d| {
      let values = kept
        .iter()
        .zip(&divisors)
        .map(|(&size, div)| d.table.value(size, column).unwrap_or(f64::NAN) / div)
        .collect();
      (d.label.clone(), values)
    })
    .collect();
  ChartData {
    name: format!("{column}_relative"),
    title: format!("{column} relative to {}", baseline.label),
    sizes: kept,
    lines,
  }
}

/// One colour per line: the configured one, otherwise the theme palette, cycled when there are more lines than palette entries.
fn line_colors<C: Clone>(
  palette: &[C],
  labels: &[&str],
  styles: &Styles,
  parse: impl Fn(&str) -> C,
) -> Vec<C> {
  if palette.is_empty() {
    warn!("theme has no colour palette, ignoring series styles");
    return Vec::new();
  };
  labels
    .iter()
    .enumerate()
    .map(|(i, label)| match styles.get(*label) {
      Some(hex) => parse(hex),
      None => palette[i % palette.len()].clone(),
    })
    .collect()
}

fn render(chart: &ChartData, styles: &Styles, out_dir: &Path) -> Result<PathBuf, PlotError> {
  let series = chart
    .lines
    .iter()
    .map(|(label, values)| Series::new(label.clone(), values.iter().map(|v| *v as f32).collect()))
    .collect();
  let x_axis = chart.sizes.iter().map(|s| s.to_string()).collect();

  let mut line_chart = LineChart::new_with_theme(series, x_axis, "light");
  line_chart.title_text = chart.title.clone();
  line_chart.width = 1200.0;
  line_chart.height = 800.0;
  line_chart.legend_category = LegendCategory::Normal;
  line_chart.legend_margin = Some(ChartBox {
    top: line_chart.title_height + 10.0,
    bottom: 5.0,
    ..Default::default()
  });
  let labels: Vec<&str> = chart.lines.iter().map(|(label, _)| label.as_str()).collect();
  line_chart.series_colors = line_colors(&line_chart.series_colors, &labels, styles, |hex| {
    Color::from(hex)
  });

  let svg = line_chart.svg().map_err(|e| PlotError::Render {
    chart: chart.name.clone(),
    message: e.to_string(),
  })?;
  let path = out_dir.join(format!("{}.svg", chart.name));
  fs::write(&path, svg).map_err(PlotError::Io)?;
  Ok(path)
}

fn plot(cli: &Cli) -> Result<usize, PlotError> {
  let datasets = load_datasets(&cli.series)?;
  let baseline = datasets
    .iter()
    .find(|d| d.label == cli.baseline)
    .ok_or_else(|| PlotError::UnknownBaseline(cli.baseline.clone()))?;
  let styles = match &cli.styles {
    Some(path) => load_styles(path)?,
    None => Styles::new(),
  };

  let sizes = shared_sizes(&datasets);
  if sizes.is_empty() {
    return Err(PlotError::NoSharedSizes);
  };
  let columns = shared_columns(&datasets);

  fs::create_dir_all(&cli.out).map_err(PlotError::Io)?;
  let mut written = 0;
  for column in &columns {
    for chart in [
      absolute_chart(&datasets, column, &sizes),
      relative_chart(&datasets, baseline, column, &sizes),
    ] {
      let path = render(&chart, &styles, &cli.out)?;
      info!(path = %path.display(), "wrote chart");
      written += 1;
    }
  }
  Ok(written)
}

fn main() -> ExitCode {
  tracing_subscriber::fmt::init();

  let cli = Cli::parse();
  match plot(&cli) {
    Ok(charts) => {
      info!(charts, out = %cli.out.display(), "all charts generated");
      ExitCode::SUCCESS
    }
    Err(err) => {
      error!(%err, "plotting failed");
      ExitCode::FAILURE
    }
  }
}
