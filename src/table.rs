//! Labelled numeric tables and parsing of whitespace-delimited text data.

use crate::error::{FileRejection, IngestError};
use crate::header::COMMENT_MARKER;
use crate::models::VarDef;

use ndarray::{Array2, ArrayView1, Axis};

/// A set of named `f64` columns with one row per sample.
#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    /// Column names, in order
    names: Vec<String>,
    /// Row-major data, shape (rows, columns)
    data: Array2<f64>,
}

impl Table {
    /// Create a table from column names and row-major data.
    pub fn new(names: Vec<String>, data: Array2<f64>) -> Result<Self, IngestError> {
        if names.len() != data.ncols() {
            return Err(IngestError::ShapeInvalid(ndarray::ShapeError::from_kind(
                ndarray::ErrorKind::IncompatibleShape,
            )));
        }
        Ok(Self { names, data })
    }

    /// Create a table from named columns of equal length.
    pub fn from_columns(columns: Vec<(String, Vec<f64>)>) -> Result<Self, IngestError> {
        let nrows = columns.first().map_or(0, |(_, values)| values.len());
        let ncols = columns.len();
        let mut data = Array2::zeros((nrows, ncols));
        let mut names = Vec::with_capacity(ncols);
        for (j, (name, values)) in columns.into_iter().enumerate() {
            if values.len() != nrows {
                return Err(IngestError::ShapeInvalid(ndarray::ShapeError::from_kind(
                    ndarray::ErrorKind::IncompatibleShape,
                )));
            }
            data.column_mut(j).assign(&ArrayView1::from(&values[..]));
            names.push(name);
        }
        Ok(Self { names, data })
    }

    /// Returns the column names.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Returns the row-major data.
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }

    /// Returns the index of a column, compared case-insensitively.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name))
    }

    /// Returns a view of a column, compared case-insensitively.
    pub fn column(&self, name: &str) -> Option<ArrayView1<f64>> {
        self.column_index(name)
            .map(|index| self.data.index_axis(Axis(1), index))
    }

    /// Append a column.
    pub fn push_column(&mut self, name: &str, values: &[f64]) -> Result<(), IngestError> {
        self.data.push_column(ArrayView1::from(values))?;
        self.names.push(name.to_string());
        Ok(())
    }
}

/// Canonical form of a column name used for comparison.
fn canonical(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Parse whitespace-delimited text into a table and check its columns against the template.
///
/// Comment and blank lines are ignored. The first remaining line names the columns, which must
/// equal the variable names in `var_list` (case-insensitively, in order). The returned table uses
/// the variable names' spelling.
pub fn parse_and_validate(text: &str, var_list: &[VarDef]) -> Result<Table, FileRejection> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with(COMMENT_MARKER));

    let (_, header) = lines.next().ok_or(FileRejection::MissingHeader)?;
    let found: Vec<String> = header.split_whitespace().map(canonical).collect();
    let expected: Vec<String> = var_list.iter().map(|var| canonical(&var.name)).collect();
    if found != expected {
        return Err(FileRejection::ColumnMismatch { expected, found });
    }

    let ncols = expected.len();
    let mut values = Vec::new();
    for (line_number, line) in lines {
        let start = values.len();
        for token in line.split_whitespace() {
            let value = parse_value(token).ok_or_else(|| FileRejection::MalformedRow {
                line: line_number,
                reason: format!("invalid number {token:?}"),
            })?;
            if !value.is_finite() {
                return Err(FileRejection::MalformedRow {
                    line: line_number,
                    reason: format!("non-finite value {token:?}"),
                });
            }
            values.push(value);
        }
        let fields = values.len() - start;
        if fields != ncols {
            return Err(FileRejection::MalformedRow {
                line: line_number,
                reason: format!("expected {ncols} fields, found {fields}"),
            });
        }
    }

    let nrows = values.len() / ncols;
    let data = Array2::from_shape_vec((nrows, ncols), values).map_err(|err| {
        FileRejection::MalformedRow {
            line: 0,
            reason: err.to_string(),
        }
    })?;
    Ok(Table {
        names: var_list.iter().map(|var| var.name.clone()).collect(),
        data,
    })
}

/// Parse a numeric token, accepting Fortran-style `D` exponents.
fn parse_value(token: &str) -> Option<f64> {
    token
        .parse::<f64>()
        .ok()
        .or_else(|| token.replace(['D', 'd'], "e").parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(names: &[&str]) -> Vec<VarDef> {
        names.iter().map(|name| VarDef::new(name)).collect()
    }

    #[test]
    fn parse() {
        let text = "# header\n# mu = 0.6\nT Slip slip_rate\n0.0 1.0 -2.5e-9\n\n1.0\t2.0   3.0D-1\n# trailing comment\n";
        let table = parse_and_validate(text, &vars(&["t", "slip", "slip_rate"])).unwrap();
        assert_eq!(&["t", "slip", "slip_rate"], table.names());
        assert_eq!(2, table.nrows());
        assert_eq!(vec![1.0, 2.0], table.column("SLIP").unwrap().to_vec());
        assert_eq!(vec![-2.5e-9, 0.3], table.column("slip_rate").unwrap().to_vec());
    }

    #[test]
    fn header_only() {
        let table = parse_and_validate("x y value\n", &vars(&["x", "y", "value"])).unwrap();
        assert_eq!(0, table.nrows());
        assert_eq!(3, table.ncols());
    }

    #[test]
    fn column_mismatch() {
        let text = "a b c\n1 2 3\n";
        let err = parse_and_validate(text, &vars(&["x", "y", "value"])).unwrap_err();
        assert_eq!(
            FileRejection::ColumnMismatch {
                expected: vec!["x".to_string(), "y".to_string(), "value".to_string()],
                found: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            },
            err
        );
    }

    #[test]
    fn column_order_matters() {
        let err = parse_and_validate("y x value\n", &vars(&["x", "y", "value"])).unwrap_err();
        assert!(matches!(err, FileRejection::ColumnMismatch { .. }));
    }

    #[test]
    fn non_finite_rejected() {
        for token in ["nan", "NaN", "inf", "-infinity", "1e400"] {
            let text = format!("x y value\n0 0 1.0\n{token} 0 1.0\n");
            let err = parse_and_validate(&text, &vars(&["x", "y", "value"])).unwrap_err();
            assert_eq!(
                FileRejection::MalformedRow {
                    line: 3,
                    reason: format!("non-finite value {token:?}"),
                },
                err
            );
        }
    }

    #[test]
    fn missing_header() {
        let err = parse_and_validate("# only comments\n\n", &vars(&["t"])).unwrap_err();
        assert_eq!(FileRejection::MissingHeader, err);
    }

    #[test]
    fn wrong_field_count() {
        let err = parse_and_validate("t slip\n0 1\n2\n", &vars(&["t", "slip"])).unwrap_err();
        assert_eq!(
            FileRejection::MalformedRow {
                line: 3,
                reason: "expected 2 fields, found 1".to_string()
            },
            err
        );
    }

    #[test]
    fn non_numeric() {
        let err = parse_and_validate("t slip\n0 abc\n", &vars(&["t", "slip"])).unwrap_err();
        assert!(matches!(err, FileRejection::MalformedRow { line: 2, .. }));
    }

    #[test]
    fn from_columns_and_push() {
        let mut table = Table::from_columns(vec![
            ("a".to_string(), vec![1.0, 2.0]),
            ("b".to_string(), vec![3.0, 4.0]),
        ])
        .unwrap();
        table.push_column("c", &[5.0, 6.0]).unwrap();
        assert_eq!(vec![5.0, 6.0], table.column("c").unwrap().to_vec());
        assert_eq!(Some(1), table.column_index("B"));
        assert!(table.push_column("d", &[1.0]).is_err());
    }

    #[test]
    fn from_columns_ragged() {
        let result = Table::from_columns(vec![
            ("a".to_string(), vec![1.0, 2.0]),
            ("b".to_string(), vec![3.0]),
        ]);
        assert!(matches!(result, Err(IngestError::ShapeInvalid(_))));
    }
}
