use crate::errors::DatasetError;
use crate::model::{DatasetRef, InputData};
use crate::template::value_text;
use std::path::Path;

pub type Row = serde_json::Map<String, serde_json::Value>;

/// Labeled rows with one column holding the expected output.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub filename: String,
    pub columns: Vec<String>,
    pub expected_column: String,
    pub rows: Vec<Row>,
}

impl Dataset {
    pub fn new(
        filename: impl Into<String>,
        columns: Vec<String>,
        expected_column: impl Into<String>,
        rows: Vec<Row>,
    ) -> Result<Self, DatasetError> {
        let ds = Self {
            filename: filename.into(),
            columns,
            expected_column: expected_column.into(),
            rows,
        };
        ds.validate()?;
        Ok(ds)
    }

    /// One JSON object per line; blank lines are skipped. Columns are the union
    /// of keys in first-seen order.
    pub fn from_jsonl(path: &Path, expected_column: &str) -> Result<Self, DatasetError> {
        let raw = std::fs::read_to_string(path).map_err(|e| DatasetError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows = Vec::new();
        for (i, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let v: serde_json::Value =
                serde_json::from_str(line).map_err(|e| DatasetError::BadRow {
                    line: i + 1,
                    reason: e.to_string(),
                })?;
            let serde_json::Value::Object(obj) = v else {
                return Err(DatasetError::BadRow {
                    line: i + 1,
                    reason: "expected a JSON object".into(),
                });
            };
            for k in obj.keys() {
                if !columns.contains(k) {
                    columns.push(k.clone());
                }
            }
            rows.push(obj);
        }

        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self::new(filename, columns, expected_column, rows)
    }

    pub fn validate(&self) -> Result<(), DatasetError> {
        if self.rows.is_empty() {
            return Err(DatasetError::Empty);
        }
        if self.columns.is_empty() {
            return Err(DatasetError::NoColumns);
        }
        if !self.columns.contains(&self.expected_column) {
            return Err(DatasetError::MissingExpectedColumn {
                column: self.expected_column.clone(),
                available: self.columns.clone(),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn input_columns(&self) -> Vec<String> {
        self.reference().input_columns()
    }

    /// Every column except the expected one, in column order. Absent cells are
    /// omitted.
    pub fn input_data(&self, idx: usize) -> InputData {
        let mut out = InputData::new();
        let Some(row) = self.rows.get(idx) else {
            return out;
        };
        for c in &self.columns {
            if *c == self.expected_column {
                continue;
            }
            if let Some(v) = row.get(c) {
                out.insert(c.clone(), v.clone());
            }
        }
        out
    }

    pub fn expected(&self, idx: usize) -> String {
        self.rows
            .get(idx)
            .and_then(|r| r.get(&self.expected_column))
            .map(value_text)
            .unwrap_or_default()
    }

    pub fn reference(&self) -> DatasetRef {
        DatasetRef {
            filename: self.filename.clone(),
            columns: self.columns.clone(),
            expected_column: self.expected_column.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_jsonl_loader_collects_columns_in_order() -> anyhow::Result<()> {
        let mut f = tempfile::NamedTempFile::new()?;
        writeln!(f, r#"{{"question": "2+2", "answer": "4"}}"#)?;
        writeln!(f)?;
        writeln!(f, r#"{{"question": "3+3", "hint": "six", "answer": "6"}}"#)?;

        let ds = Dataset::from_jsonl(f.path(), "answer")?;
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.columns, vec!["question", "answer", "hint"]);
        assert_eq!(ds.input_columns(), vec!["question", "hint"]);
        assert_eq!(ds.expected(1), "6");

        let input = ds.input_data(1);
        let keys: Vec<&String> = input.keys().collect();
        assert_eq!(keys, vec!["question", "hint"]);
        Ok(())
    }

    #[test]
    fn test_missing_expected_column() {
        let mut row = Row::new();
        row.insert("q".into(), "x".into());
        let err = Dataset::new("d.jsonl", vec!["q".into()], "answer", vec![row]).unwrap_err();
        assert!(matches!(err, DatasetError::MissingExpectedColumn { .. }));
    }

    #[test]
    fn test_zero_rows_is_an_error() {
        let err = Dataset::new("d.jsonl", vec!["q".into(), "a".into()], "a", vec![]).unwrap_err();
        assert_eq!(err, DatasetError::Empty);
    }

    #[test]
    fn test_non_object_line_rejected() -> anyhow::Result<()> {
        let mut f = tempfile::NamedTempFile::new()?;
        writeln!(f, "[1, 2]")?;
        let err = Dataset::from_jsonl(f.path(), "a").unwrap_err();
        assert!(matches!(err, DatasetError::BadRow { line: 1, .. }));
        Ok(())
    }
}
