//! libsvm text format.
//!
//! One instance per line: `label idx:val idx:val ...`. Anything after `#` is
//! a comment; blank lines are skipped. Indices are taken as-is (no 1-based
//! shift), and may appear in any order.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{CpmError, Result};
use crate::linalg::sparse_vector::SparseVector;

/// Read buffer for dataset files.
const READ_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Parse the label field. Integral floats such as `1.0` are accepted.
fn parse_label(token: &str, line: usize) -> Result<i32> {
    if let Ok(label) = token.parse::<i32>() {
        return Ok(label);
    }
    match token.parse::<f64>() {
        Ok(v) if v.fract() == 0.0 && v.abs() <= i32::MAX as f64 => Ok(v as i32),
        _ => Err(CpmError::parse(line, format!("invalid label '{}'", token))),
    }
}

/// Parse the feature part of a line (everything after the label).
pub fn parse_features<'a, I>(tokens: I, line: usize) -> Result<SparseVector>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut pairs = Vec::new();
    for token in tokens {
        let Some((idx, val)) = token.split_once(':') else {
            return Err(CpmError::parse(line, format!("expected 'index:value', got '{}'", token)));
        };
        let index: i64 = idx
            .parse()
            .map_err(|_| CpmError::parse(line, format!("invalid index '{}'", idx)))?;
        let value: f64 = val
            .parse()
            .map_err(|_| CpmError::parse(line, format!("invalid value '{}'", val)))?;
        pairs.push((index, value));
    }
    SparseVector::from_pairs(pairs)
}

/// Parse one line. Returns `None` for blank and comment-only lines.
pub fn parse_line(text: &str, line: usize) -> Result<Option<(i32, SparseVector)>> {
    let content = text.split('#').next().unwrap_or("").trim();
    if content.is_empty() {
        return Ok(None);
    }
    let mut tokens = content.split_whitespace();
    let label = match tokens.next() {
        Some(t) => parse_label(t, line)?,
        None => return Ok(None),
    };
    let features = parse_features(tokens, line)?;
    Ok(Some((label, features)))
}

/// Parse every instance from a reader. Line numbers in errors are 1-based.
pub fn read_instances<R: BufRead>(reader: R) -> Result<Vec<(i32, SparseVector)>> {
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if let Some(instance) = parse_line(&line, i + 1)? {
            out.push(instance);
        }
    }
    Ok(out)
}

/// Parse every instance from a file.
pub fn read_file(path: &Path) -> Result<Vec<(i32, SparseVector)>> {
    let file = File::open(path)?;
    read_instances(BufReader::with_capacity(READ_BUFFER_BYTES, file))
}

/// Format one instance as a libsvm line (no trailing newline).
pub fn format_line(label: i32, features: &SparseVector) -> String {
    if features.is_empty() {
        label.to_string()
    } else {
        format!("{} {}", label, features.to_libsvm())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_line() {
        let (label, x) = parse_line("+1 3:0.5 1:2 # trailing", 1).unwrap().unwrap();
        assert_eq!(label, 1);
        assert_eq!(x.indices(), &[1, 3]);
        assert_eq!(x.values(), &[2.0, 0.5]);
    }

    #[test]
    fn test_blank_and_comment_lines() {
        assert!(parse_line("", 1).unwrap().is_none());
        assert!(parse_line("   ", 1).unwrap().is_none());
        assert!(parse_line("# header", 1).unwrap().is_none());
    }

    #[test]
    fn test_label_only_line() {
        let (label, x) = parse_line("-1", 1).unwrap().unwrap();
        assert_eq!(label, -1);
        assert!(x.is_empty());
    }

    #[test]
    fn test_float_label() {
        let (label, _) = parse_line("2.0 0:1", 1).unwrap().unwrap();
        assert_eq!(label, 2);
        assert!(parse_line("0.5 0:1", 3).is_err());
    }

    #[test]
    fn test_malformed_feature_reports_line() {
        let text = "1 0:1\n-1 0:1 2\n";
        let err = read_instances(Cursor::new(text)).unwrap_err();
        assert!(matches!(err, CpmError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_negative_index_is_invalid_index() {
        let err = parse_line("1 -4:1.0", 1).unwrap_err();
        assert!(matches!(err, CpmError::InvalidIndex { index: -4, .. }));
    }

    #[test]
    fn test_format_line_roundtrip() {
        let (label, x) = parse_line("3 7:1.25 2:-3", 1).unwrap().unwrap();
        let text = format_line(label, &x);
        assert_eq!(text, "3 2:-3 7:1.25");
        let (label2, x2) = parse_line(&text, 1).unwrap().unwrap();
        assert_eq!(label, label2);
        assert_eq!(x, x2);
    }
}
