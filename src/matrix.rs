use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::ContextError;

/// A real-valued matrix with labeled rows and columns, stored row-major.
/// Cells may be NaN (bad values); the TSV form writes them as `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMatrix {
    pub row_names: Vec<String>,
    pub column_names: Vec<String>,
    pub values: Vec<Vec<f64>>,
    /// Name of the row-label column in the TSV header (e.g. "Feature")
    pub index_name: String,
}

impl DataMatrix {
    pub fn new(
        row_names: Vec<String>,
        column_names: Vec<String>,
        values: Vec<Vec<f64>>,
    ) -> Result<Self, ContextError> {
        if values.len() != row_names.len() {
            return Err(ContextError::Configuration(format!(
                "Row count mismatch: {} labels, {} rows",
                row_names.len(),
                values.len()
            )));
        }
        for (name, row) in row_names.iter().zip(&values) {
            if row.len() != column_names.len() {
                return Err(ContextError::Configuration(format!(
                    "Row {} has {} values but there are {} columns",
                    name,
                    row.len(),
                    column_names.len()
                )));
            }
        }
        Ok(Self {
            row_names,
            column_names,
            values,
            index_name: "Feature".to_string(),
        })
    }

    pub fn n_rows(&self) -> usize {
        self.row_names.len()
    }

    pub fn n_columns(&self) -> usize {
        self.column_names.len()
    }

    pub fn row(&self, label: &str) -> Option<&[f64]> {
        self.row_index(label).map(|i| self.values[i].as_slice())
    }

    pub fn row_index(&self, label: &str) -> Option<usize> {
        self.row_names.iter().position(|name| name == label)
    }

    pub fn transpose(&self) -> DataMatrix {
        let mut transposed = vec![vec![f64::NAN; self.n_rows()]; self.n_columns()];
        for (i, row) in self.values.iter().enumerate() {
            for (j, &value) in row.iter().enumerate() {
                transposed[j][i] = value;
            }
        }
        DataMatrix {
            row_names: self.column_names.clone(),
            column_names: self.row_names.clone(),
            values: transposed,
            index_name: self.index_name.clone(),
        }
    }

    /// Sub-matrix with the given row and column labels, in the given order.
    /// Unknown labels error instead of silently dropping.
    pub fn select(
        &self,
        row_labels: &[String],
        column_labels: &[String],
    ) -> Result<DataMatrix, ContextError> {
        let row_indices: Vec<usize> = row_labels
            .iter()
            .map(|label| {
                self.row_index(label)
                    .ok_or_else(|| ContextError::UnknownLabel(label.clone()))
            })
            .collect::<Result<_, _>>()?;
        let column_indices: Vec<usize> = column_labels
            .iter()
            .map(|label| {
                self.column_names
                    .iter()
                    .position(|name| name == label)
                    .ok_or_else(|| ContextError::UnknownLabel(label.clone()))
            })
            .collect::<Result<_, _>>()?;

        let values = row_indices
            .iter()
            .map(|&i| column_indices.iter().map(|&j| self.values[i][j]).collect())
            .collect();

        DataMatrix::new(row_labels.to_vec(), column_labels.to_vec(), values)
    }

    /// All finite cell values, flattened row-major.
    pub fn finite_values(&self) -> Vec<f64> {
        self.values
            .iter()
            .flat_map(|row| row.iter().copied())
            .filter(|value| value.is_finite())
            .collect()
    }

    pub fn read_tsv(path: &Path) -> Result<DataMatrix, ContextError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header = lines.next().ok_or_else(|| ContextError::Parse {
            what: "TSV header",
            value: format!("{} is empty", path.display()),
        })??;
        let mut header_fields = header.split('\t');
        let index_name = header_fields.next().unwrap_or("").to_string();
        let column_names: Vec<String> = header_fields.map(|s| s.to_string()).collect();

        let mut row_names = Vec::new();
        let mut values = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let label = fields.next().unwrap_or("").to_string();
            let row: Vec<f64> = fields.map(parse_cell).collect::<Result<_, _>>()?;
            if row.len() != column_names.len() {
                return Err(ContextError::Parse {
                    what: "TSV row",
                    value: format!(
                        "{}: row {} has {} values, expected {}",
                        path.display(),
                        label,
                        row.len(),
                        column_names.len()
                    ),
                });
            }
            row_names.push(label);
            values.push(row);
        }

        let mut matrix = DataMatrix::new(row_names, column_names, values)?;
        if !index_name.is_empty() {
            matrix.index_name = index_name;
        }
        Ok(matrix)
    }

    pub fn write_tsv(&self, path: &Path) -> Result<(), ContextError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut out = BufWriter::new(File::create(path)?);
        write!(out, "{}", self.index_name)?;
        for name in &self.column_names {
            write!(out, "\t{}", name)?;
        }
        writeln!(out)?;
        for (label, row) in self.row_names.iter().zip(&self.values) {
            write!(out, "{}", label)?;
            for &value in row {
                write!(out, "\t{}", format_cell(value))?;
            }
            writeln!(out)?;
        }
        out.flush()?;
        Ok(())
    }
}

pub(crate) fn parse_cell(field: &str) -> Result<f64, ContextError> {
    let trimmed = field.trim();
    if trimmed.eq_ignore_ascii_case("nan") || trimmed.is_empty() {
        return Ok(f64::NAN);
    }
    trimmed.parse::<f64>().map_err(|_| ContextError::Parse {
        what: "numeric cell",
        value: trimmed.to_string(),
    })
}

pub(crate) fn format_cell(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else {
        format!("{:.6}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> DataMatrix {
        DataMatrix::new(
            vec!["g1".into(), "g2".into()],
            vec!["s1".into(), "s2".into(), "s3".into()],
            vec![vec![1.0, 2.0, 3.0], vec![4.0, f64::NAN, 6.0]],
        )
        .unwrap()
    }

    #[test]
    fn transpose_round_trip() {
        let m = small();
        let t = m.transpose();
        assert_eq!(t.n_rows(), 3);
        assert_eq!(t.column_names, m.row_names);
        assert_eq!(t.values[2], vec![3.0, 6.0]);
        let back = t.transpose();
        assert_eq!(back.values[0], m.values[0]);
        assert!(back.values[1][1].is_nan());
    }

    #[test]
    fn select_preserves_order() {
        let m = small();
        let sub = m
            .select(&["g2".into(), "g1".into()], &["s3".into(), "s1".into()])
            .unwrap();
        assert_eq!(sub.values, vec![vec![6.0, 4.0], vec![3.0, 1.0]]);
    }

    #[test]
    fn select_unknown_label_errors() {
        let m = small();
        assert!(m.select(&["absent".into()], &["s1".into()]).is_err());
    }

    #[test]
    fn parse_cell_handles_nan() {
        assert!(parse_cell("NaN").unwrap().is_nan());
        assert!(parse_cell("nan").unwrap().is_nan());
        assert_eq!(parse_cell("1.5").unwrap(), 1.5);
        assert!(parse_cell("abc").is_err());
    }
}
