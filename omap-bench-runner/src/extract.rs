use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

// CSI (ESC `[` or the single-byte 0x9B form), then parameter bytes, intermediate bytes, and a final byte.
static ANSI_ESCAPE_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"(?:\x{9B}|\x1B\[)[0-?]*[ -/]*[@-~]").unwrap());

const VALUE_DELIMITER: &str = ": ";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
  /// The line mentions the metric but has no `": "` before the value.
  MissingDelimiter { label: String, line: String },
  InvalidNumber { label: String, raw: String },
  NonFinite { label: String, raw: String },
}

impl Display for ParseError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ParseError::MissingDelimiter { label, line } => {
        write!(f, "line reporting `{label}` has no value: {line:?}")
      }
      ParseError::InvalidNumber { label, raw } => {
        write!(f, "value {raw:?} reported for `{label}` is not a number")
      }
      ParseError::NonFinite { label, raw } => {
        write!(f, "value {raw:?} reported for `{label}` is not finite")
      }
    }
  }
}

impl Error for ParseError {}

pub fn strip_ansi(text: &str) -> Cow<'_, str> {
  ANSI_ESCAPE_RE.replace_all(text, "")
}

/// Returns `None` if `line` doesn't report `label`, otherwise the parsed value.
pub fn extract(line: &str, label: &str) -> Option<Result<f64, ParseError>> {
  if !line.contains(label) {
    return None;
  };
  let Some((_, value)) = line.split_once(VALUE_DELIMITER) else {
    return Some(Err(ParseError::MissingDelimiter {
      label: label.to_string(),
      line: line.to_string(),
    }));
  };
  let cleaned = strip_ansi(value);
  let raw = cleaned.trim();
  Some(match raw.parse::<f64>() {
    Ok(v) if v.is_finite() => Ok(v),
    Ok(_) => Err(ParseError::NonFinite {
      label: label.to_string(),
      raw: raw.to_string(),
    }),
    Err(_) => Err(ParseError::InvalidNumber {
      label: label.to_string(),
      raw: raw.to_string(),
    }),
  })
}

#[cfg(test)]
mod tests {
  use super::extract;
  use super::strip_ansi;
  use super::ParseError;
  use proptest::prelude::*;

  const READ: &str = "Average OMAP Read Time";

  #[test]
  fn test_plain_value() {
    assert_eq!(extract("Average OMAP Read Time: 12.5", READ), Some(Ok(12.5)));
    assert_eq!(
      extract("ORAM Initialization Time: 1042", "ORAM Initialization Time"),
      Some(Ok(1042.0))
    );
  }

  #[test]
  fn test_unrelated_line() {
    assert_eq!(extract("maxSize = 256", READ), None);
    assert_eq!(extract("Average OMAP Write Time: 3.0", READ), None);
  }

  #[test]
  fn test_colored_value() {
    assert_eq!(
      extract("\x1b[1;32mAverage OMAP Read Time\x1b[0m: \x1b[33m7.25\x1b[0m", READ),
      Some(Ok(7.25))
    );
    assert_eq!(
      extract("Average OMAP Read Time: 7.25\u{9b}0m", READ),
      Some(Ok(7.25))
    );
    assert_eq!(
      extract("Average OMAP Read Time: 0.5 \x1b[K\r", READ),
      Some(Ok(0.5))
    );
  }

  #[test]
  fn test_only_first_delimiter_splits() {
    assert_eq!(
      extract("Average OMAP Read Time: 1.5: extra", READ),
      Some(Err(ParseError::InvalidNumber {
        label: READ.to_string(),
        raw: "1.5: extra".to_string(),
      }))
    );
  }

  #[test]
  fn test_malformed_values() {
    assert_eq!(
      extract("Average OMAP Read Time", READ),
      Some(Err(ParseError::MissingDelimiter {
        label: READ.to_string(),
        line: "Average OMAP Read Time".to_string(),
      }))
    );
    assert!(matches!(
      extract("Average OMAP Read Time: ", READ),
      Some(Err(ParseError::InvalidNumber { .. }))
    ));
    assert!(matches!(
      extract("Average OMAP Read Time: 12ms", READ),
      Some(Err(ParseError::InvalidNumber { .. }))
    ));
    assert!(matches!(
      extract("Average OMAP Read Time: NaN", READ),
      Some(Err(ParseError::NonFinite { .. }))
    ));
    assert!(matches!(
      extract("Average OMAP Read Time: inf", READ),
      Some(Err(ParseError::NonFinite { .. }))
    ));
  }

  #[test]
  fn test_strip_ansi() {
    assert_eq!(strip_ansi("plain"), "plain");
    assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
    assert_eq!(strip_ansi("\x1b[38;5;208morange\x1b[m"), "orange");
    assert_eq!(strip_ansi("a\x1b[2Kb\x1b[1Ac"), "abc");
  }

  fn escape_sequence() -> impl Strategy<Value = String> {
    prop_oneof![
      Just("\x1b[0m".to_string()),
      Just("\x1b[K".to_string()),
      Just("\u{9b}1m".to_string()),
      (0u8..108).prop_map(|n| format!("\x1b[{n}m")),
      (0u8..=255, 0u8..=255).prop_map(|(a, b)| format!("\x1b[38;5;{a};{b}m")),
    ]
  }

  proptest! {
    #[test]
    fn prop_value_survives_escapes(value in 0.0f64..1e9, prefix in escape_sequence(), suffix in escape_sequence()) {
      let line = format!("{READ}: {prefix}{value}{suffix}");
      prop_assert_eq!(extract(&line, READ), Some(Ok(value)));
    }

    #[test]
    fn prop_garbage_is_rejected(garbage in "[a-zA-Z][a-zA-Z ]{0,12}") {
      let line = format!("{READ}: {garbage}");
      let is_err = matches!(extract(&line, READ), Some(Err(_)));
      prop_assert!(is_err);
    }
  }
}
