//! Loading recipient rows from CSV, JSON or piped input.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BatchError;
use crate::model::RecipientRow;

/// Where the recipient list comes from. The CLI may set several fields; exactly
/// one must be present for the load to succeed.
#[derive(Debug, Clone, Default)]
pub struct RecipientSource {
    pub csv_path: Option<PathBuf>,
    pub json_path: Option<PathBuf>,
    pub stdin_data: Option<String>,
}

impl RecipientSource {
    pub fn csv(path: impl Into<PathBuf>) -> Self {
        Self {
            csv_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn json(path: impl Into<PathBuf>) -> Self {
        Self {
            json_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn stdin(data: impl Into<String>) -> Self {
        Self {
            stdin_data: Some(data.into()),
            ..Default::default()
        }
    }
}

pub fn load_recipients(source: &RecipientSource) -> Result<Vec<RecipientRow>, BatchError> {
    let selected = [
        source.csv_path.is_some(),
        source.json_path.is_some(),
        source.stdin_data.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if selected != 1 {
        return Err(BatchError::Input(
            "exactly one input source must be provided (csv/json/stdin)".into(),
        ));
    }

    if let Some(path) = &source.csv_path {
        return load_csv(path);
    }

    let raw = match &source.json_path {
        Some(path) => fs::read_to_string(path)
            .map_err(|e| BatchError::Input(format!("cannot read {}: {e}", path.display())))?,
        None => source.stdin_data.clone().unwrap_or_default(),
    };
    parse_json_rows(&raw)
}

fn load_csv(path: &Path) -> Result<Vec<RecipientRow>, BatchError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| BatchError::Input(format!("cannot read {}: {e}", path.display())))?;
    let headers = reader
        .headers()
        .map_err(|e| BatchError::Input(format!("invalid CSV header: {e}")))?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| BatchError::Input(format!("invalid CSV row: {e}")))?;
        let row: RecipientRow = headers
            .iter()
            .zip(record.iter())
            .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

fn parse_json_rows(raw: &str) -> Result<Vec<RecipientRow>, BatchError> {
    let payload: Value = serde_json::from_str(raw)
        .map_err(|e| BatchError::Input(format!("invalid JSON input: {e}")))?;
    let Value::Array(items) = payload else {
        return Err(BatchError::Input(
            "JSON input must be an array of recipient objects".into(),
        ));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(row) => Ok(row),
            _ => Err(BatchError::Input(
                "each JSON array item must be an object".into(),
            )),
        })
        .collect()
}
